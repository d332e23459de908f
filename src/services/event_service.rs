// src/services/event_service.rs
//! Topic-based event publication.
//!
//! The ride store is the source of truth: events are published after the state
//! change commits, with at-least-once delivery. A failed publication never undoes
//! the transition; the envelope is parked and retried by [`EventFanout::retry_pending`].
use async_trait::async_trait;
use rand::Rng;
use redis::Client;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::events::{EventEnvelope, RideEvent, Topic};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> DispatchResult<()>;
}

/// A received envelope plus the token needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    pub receipt: String,
}

/// Consumer side of a bus. Deliveries not acknowledged are handed out again.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn next(&self, topic: Topic, wait: Duration) -> DispatchResult<Option<Delivery>>;
    async fn ack(&self, topic: Topic, delivery: &Delivery) -> DispatchResult<()>;
    /// Hands a failed delivery back to the end of the topic queue.
    async fn nack(&self, topic: Topic, delivery: &Delivery) -> DispatchResult<()>;
    /// Moves in-flight deliveries back onto the topic queue.
    async fn requeue_unacked(&self, topic: Topic) -> DispatchResult<usize>;
}

#[derive(Default)]
struct TopicQueue {
    ready: VecDeque<EventEnvelope>,
    in_flight: HashMap<String, EventEnvelope>,
}

/// In-process bus for development and tests.
#[derive(Default)]
pub struct InMemoryEventBus {
    queues: Mutex<HashMap<Topic, TopicQueue>>,
    #[cfg(test)]
    log: Mutex<Vec<EventEnvelope>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every envelope ever published, in order.
    #[cfg(test)]
    pub async fn published(&self) -> Vec<EventEnvelope> {
        self.log.lock().await.clone()
    }

    #[cfg(test)]
    pub async fn published_names(&self) -> Vec<&'static str> {
        self.log.lock().await.iter().map(|e| e.event.name()).collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> DispatchResult<()> {
        self.queues
            .lock()
            .await
            .entry(envelope.topic)
            .or_default()
            .ready
            .push_back(envelope.clone());
        #[cfg(test)]
        self.log.lock().await.push(envelope.clone());
        Ok(())
    }
}

#[async_trait]
impl EventSource for InMemoryEventBus {
    async fn next(&self, topic: Topic, _wait: Duration) -> DispatchResult<Option<Delivery>> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(topic).or_default();
        Ok(queue.ready.pop_front().map(|envelope| {
            let receipt = envelope.event_id.clone();
            queue.in_flight.insert(receipt.clone(), envelope.clone());
            Delivery { envelope, receipt }
        }))
    }

    async fn ack(&self, topic: Topic, delivery: &Delivery) -> DispatchResult<()> {
        if let Some(queue) = self.queues.lock().await.get_mut(&topic) {
            queue.in_flight.remove(&delivery.receipt);
        }
        Ok(())
    }

    async fn nack(&self, topic: Topic, delivery: &Delivery) -> DispatchResult<()> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(topic).or_default();
        if let Some(envelope) = queue.in_flight.remove(&delivery.receipt) {
            queue.ready.push_back(envelope);
        }
        Ok(())
    }

    async fn requeue_unacked(&self, topic: Topic) -> DispatchResult<usize> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(topic).or_default();
        let unacked: Vec<EventEnvelope> = queue.in_flight.drain().map(|(_, e)| e).collect();
        let count = unacked.len();
        queue.ready.extend(unacked);
        Ok(count)
    }
}

/// Reliable-queue pattern on Redis lists: producers LPUSH, consumers BRPOPLPUSH into a
/// processing list and LREM on ack.
pub struct RedisEventBus {
    client: Client,
}

impl RedisEventBus {
    pub fn new(redis_url: &str) -> DispatchResult<Self> {
        Ok(Self { client: Client::open(redis_url)? })
    }

    fn queue_key(topic: Topic) -> String {
        format!("events:{}", topic.as_str())
    }

    fn processing_key(topic: Topic) -> String {
        format!("events:{}:processing", topic.as_str())
    }
}

#[async_trait]
impl EventPublisher for RedisEventBus {
    async fn publish(&self, envelope: &EventEnvelope) -> DispatchResult<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| DispatchError::PublicationFailed(e.to_string()))?;

        let _: i64 = redis::cmd("LPUSH")
            .arg(Self::queue_key(envelope.topic))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::PublicationFailed(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventSource for RedisEventBus {
    async fn next(&self, topic: Topic, wait: Duration) -> DispatchResult<Option<Delivery>> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(Self::queue_key(topic))
            .arg(Self::processing_key(topic))
            .arg(wait.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(Some(Delivery {
                envelope: serde_json::from_str(&raw)?,
                receipt: raw,
            })),
            None => Ok(None),
        }
    }

    async fn ack(&self, topic: Topic, delivery: &Delivery) -> DispatchResult<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: i64 = redis::cmd("LREM")
            .arg(Self::processing_key(topic))
            .arg(1)
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, topic: Topic, delivery: &Delivery) -> DispatchResult<()> {
        let mut conn = self.client.get_async_connection().await?;
        redis::pipe()
            .atomic()
            .cmd("LREM").arg(Self::processing_key(topic)).arg(1).arg(&delivery.receipt).ignore()
            .cmd("LPUSH").arg(Self::queue_key(topic)).arg(&delivery.receipt).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_unacked(&self, topic: Topic) -> DispatchResult<usize> {
        let mut conn = self.client.get_async_connection().await?;
        let mut moved = 0;
        loop {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(Self::processing_key(topic))
                .arg(Self::queue_key(topic))
                .query_async(&mut conn)
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }
}

/// Exponential backoff for out-of-band publication retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-based), capped, with up to 10% jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base_ms.min(self.max_delay.as_millis() as f64);
        let jitter = rand::rng().random_range(0.0..=0.1) * capped;
        Duration::from_millis((capped + jitter).min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Publishes committed transitions; parks envelopes that fail to publish.
pub struct EventFanout {
    publisher: std::sync::Arc<dyn EventPublisher>,
    pending: Mutex<VecDeque<EventEnvelope>>,
    retry: RetryPolicy,
}

impl EventFanout {
    pub fn new(publisher: std::sync::Arc<dyn EventPublisher>, retry: RetryPolicy) -> Self {
        Self {
            publisher,
            pending: Mutex::new(VecDeque::new()),
            retry,
        }
    }

    /// Never fails: publication errors are logged and queued for retry.
    pub async fn publish_all(&self, events: Vec<RideEvent>) {
        for event in events {
            let envelope = EventEnvelope::new(event);
            match self.publisher.publish(&envelope).await {
                Ok(()) => tracing::debug!(
                    "Published {} for ride {} to {}",
                    envelope.event.name(), envelope.ride_id, envelope.topic
                ),
                Err(e) => {
                    tracing::error!(
                        "Failed to publish {} for ride {}: {}; queued for retry",
                        envelope.event.name(), envelope.ride_id, e
                    );
                    self.pending.lock().await.push_back(envelope);
                }
            }
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Retries every parked envelope with backoff. Returns how many are still parked.
    pub async fn retry_pending(&self) -> usize {
        let parked: Vec<EventEnvelope> = self.pending.lock().await.drain(..).collect();
        if parked.is_empty() {
            return 0;
        }
        tracing::info!("Retrying {} unpublished events", parked.len());

        let mut still_failing = Vec::new();
        for envelope in parked {
            let mut delivered = false;
            for attempt in 0..=self.retry.max_retries {
                match self.publisher.publish(&envelope).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) if attempt < self.retry.max_retries => {
                        tracing::debug!("Retry {} for event {} failed: {}", attempt + 1, envelope.event_id, e);
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                    Err(e) => tracing::warn!("Event {} still unpublished: {}", envelope.event_id, e),
                }
            }
            if !delivered {
                still_failing.push(envelope);
            }
        }

        let remaining = still_failing.len();
        // Parked envelopes keep their event id so consumers can deduplicate
        self.pending.lock().await.extend(still_failing);
        remaining
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` publishes, then forwards to an in-memory bus.
    pub(crate) struct FlakyPublisher {
        pub failures: AtomicUsize,
        pub inner: InMemoryEventBus,
    }

    impl FlakyPublisher {
        pub(crate) fn new(failures: usize) -> Self {
            Self { failures: AtomicUsize::new(failures), inner: InMemoryEventBus::new() }
        }
    }

    #[async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, envelope: &EventEnvelope) -> DispatchResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(DispatchError::PublicationFailed("broker down".to_string()));
            }
            self.inner.publish(envelope).await
        }
    }

    fn started(ride_id: &str) -> RideEvent {
        RideEvent::RideStarted {
            ride_id: ride_id.to_string(),
            client_id: "cli-251017-aaaaa".to_string(),
            driver_id: "drv-251017-aaaaa".to_string(),
            occurred_at: Utc::now(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_failed_publication_is_parked_then_retried() {
        let publisher = Arc::new(FlakyPublisher::new(1));
        let fanout = EventFanout::new(publisher.clone(), fast_retry());

        fanout.publish_all(vec![started("rid-251017-aaaaa")]).await;
        assert_eq!(fanout.pending_len().await, 1);
        assert!(publisher.inner.published().await.is_empty());

        assert_eq!(fanout.retry_pending().await, 0);
        assert_eq!(publisher.inner.published_names().await, vec!["ride_started"]);
    }

    #[tokio::test]
    async fn test_retry_keeps_envelopes_that_still_fail() {
        let publisher = Arc::new(FlakyPublisher::new(100));
        let fanout = EventFanout::new(publisher.clone(), fast_retry());

        fanout.publish_all(vec![started("rid-251017-aaaaa"), started("rid-251017-bbbbb")]).await;
        assert_eq!(fanout.retry_pending().await, 2);
        assert_eq!(fanout.pending_len().await, 2);
    }

    #[tokio::test]
    async fn test_unacked_deliveries_are_redelivered() {
        let bus = InMemoryEventBus::new();
        bus.publish(&EventEnvelope::new(started("rid-251017-aaaaa"))).await.unwrap();

        let first = bus.next(Topic::RideLifecycle, Duration::ZERO).await.unwrap().unwrap();
        assert!(bus.next(Topic::RideLifecycle, Duration::ZERO).await.unwrap().is_none());

        assert_eq!(bus.requeue_unacked(Topic::RideLifecycle).await.unwrap(), 1);
        let again = bus.next(Topic::RideLifecycle, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.envelope.event_id, again.envelope.event_id);

        bus.ack(Topic::RideLifecycle, &again).await.unwrap();
        assert_eq!(bus.requeue_unacked(Topic::RideLifecycle).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nack_returns_delivery_behind_waiting_events() {
        let bus = InMemoryEventBus::new();
        bus.publish(&EventEnvelope::new(started("rid-251017-aaaaa"))).await.unwrap();
        bus.publish(&EventEnvelope::new(started("rid-251017-bbbbb"))).await.unwrap();

        let first = bus.next(Topic::RideLifecycle, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.envelope.ride_id, "rid-251017-aaaaa");
        bus.nack(Topic::RideLifecycle, &first).await.unwrap();

        let second = bus.next(Topic::RideLifecycle, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.envelope.ride_id, "rid-251017-bbbbb");
        let retried = bus.next(Topic::RideLifecycle, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(retried.envelope.event_id, first.envelope.event_id);

        bus.ack(Topic::RideLifecycle, &second).await.unwrap();
        bus.ack(Topic::RideLifecycle, &retried).await.unwrap();
        assert_eq!(bus.requeue_unacked(Topic::RideLifecycle).await.unwrap(), 0);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for_attempt(0) >= Duration::from_millis(100));
        assert!(policy.delay_for_attempt(20) <= policy.max_delay);
    }
}
