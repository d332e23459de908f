// src/services/consumers.rs
//! Downstream subscribers. Delivery is at-least-once, so every handler
//! deduplicates through a [`ProcessedLedger`] before acting.
use async_trait::async_trait;
use redis::Client;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing;
use uuid::Uuid;

use crate::errors::DispatchResult;
use crate::models::events::{EventEnvelope, RideEvent, Topic};
use crate::models::messages::{Recipient, RideNotice};
use crate::models::ride::PaymentMethod;
use crate::services::event_service::{EventPublisher, EventSource};
use crate::services::messaging_service::{NotificationMessage, NotificationService};
use crate::utils::id_generator::{IdGenerator, IdType};

/// Remembers which keys have been handled.
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    /// Records `key`; false when it was already recorded.
    async fn mark_if_new(&self, key: &str) -> DispatchResult<bool>;
    /// Forgets `key` so a failed attempt can be redone.
    async fn forget(&self, key: &str) -> DispatchResult<()>;
}

#[derive(Default)]
pub struct MemoryLedger {
    seen: Mutex<HashSet<String>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedLedger for MemoryLedger {
    async fn mark_if_new(&self, key: &str) -> DispatchResult<bool> {
        Ok(self.seen.lock().await.insert(key.to_string()))
    }

    async fn forget(&self, key: &str) -> DispatchResult<()> {
        self.seen.lock().await.remove(key);
        Ok(())
    }
}

pub struct RedisLedger {
    client: Client,
    namespace: String,
    ttl_seconds: u64,
}

impl RedisLedger {
    pub fn new(redis_url: &str, namespace: impl Into<String>) -> DispatchResult<Self> {
        Ok(Self {
            client: Client::open(redis_url)?,
            namespace: namespace.into(),
            ttl_seconds: 86400 * 30,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("processed:{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl ProcessedLedger for RedisLedger {
    async fn mark_if_new(&self, key: &str) -> DispatchResult<bool> {
        let mut conn = self.client.get_async_connection().await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn forget(&self, key: &str) -> DispatchResult<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: i64 = redis::cmd("DEL").arg(self.key(key)).query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, envelope: &EventEnvelope) -> DispatchResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub payment_id: String,
    pub idempotency_key: String,
    pub ride_id: String,
    pub client_id: String,
    pub driver_id: String,
    pub amount: i64,
    pub currency: String,
    pub payment_method: Option<PaymentMethod>,
}

/// Payment provider boundary.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Returns the provider's reference for the settlement.
    async fn settle(&self, settlement: &Settlement) -> DispatchResult<String>;
}

/// Records settlements in memory; stands in for a real provider.
#[derive(Default)]
pub struct RecordingPaymentGateway {
    settled: Mutex<Vec<Settlement>>,
}

impl RecordingPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn settled(&self) -> Vec<Settlement> {
        self.settled.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingPaymentGateway {
    async fn settle(&self, settlement: &Settlement) -> DispatchResult<String> {
        let reference = Uuid::new_v4().to_string();
        tracing::info!(
            "Settled {} {} for ride {} to driver {} ({})",
            settlement.amount, settlement.currency, settlement.ride_id, settlement.driver_id, reference
        );
        self.settled.lock().await.push(settlement.clone());
        Ok(reference)
    }
}

pub struct PaymentConsumer {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn ProcessedLedger>,
}

impl PaymentConsumer {
    pub fn new(gateway: Arc<dyn PaymentGateway>, ledger: Arc<dyn ProcessedLedger>) -> Self {
        Self { gateway, ledger }
    }

    fn settlement_for(event: &RideEvent) -> Option<Settlement> {
        match event {
            RideEvent::PaymentRequested {
                ride_id, client_id, driver_id, amount, currency, payment_method, idempotency_key, ..
            } => Some(Settlement {
                payment_id: IdGenerator::generate(IdType::Payment),
                idempotency_key: idempotency_key.clone(),
                ride_id: ride_id.clone(),
                client_id: client_id.clone(),
                driver_id: driver_id.clone(),
                amount: *amount,
                currency: currency.clone(),
                payment_method: Some(*payment_method),
            }),
            RideEvent::TipAdded { ride_id, client_id, driver_id, amount, currency, idempotency_key, .. } => {
                Some(Settlement {
                    payment_id: IdGenerator::generate(IdType::Payment),
                    idempotency_key: idempotency_key.clone(),
                    ride_id: ride_id.clone(),
                    client_id: client_id.clone(),
                    driver_id: driver_id.clone(),
                    amount: *amount,
                    currency: currency.clone(),
                    payment_method: None,
                })
            }
            _ => None,
        }
    }
}

#[async_trait]
impl EventHandler for PaymentConsumer {
    fn name(&self) -> &'static str {
        "payment"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> DispatchResult<()> {
        let Some(settlement) = Self::settlement_for(&envelope.event) else {
            return Ok(());
        };

        // Keyed by business key, not event id: a re-published envelope must not pay twice
        if !self.ledger.mark_if_new(&settlement.idempotency_key).await? {
            tracing::debug!("Skipping duplicate settlement {}", settlement.idempotency_key);
            return Ok(());
        }

        match self.gateway.settle(&settlement).await {
            Ok(reference) => {
                tracing::debug!("Payment {} settled as {}", settlement.payment_id, reference);
                Ok(())
            }
            Err(e) => {
                self.ledger.forget(&settlement.idempotency_key).await?;
                Err(e)
            }
        }
    }
}

pub struct NotificationConsumer {
    notifier: Arc<dyn NotificationService>,
    ledger: Arc<dyn ProcessedLedger>,
}

impl NotificationConsumer {
    pub fn new(notifier: Arc<dyn NotificationService>, ledger: Arc<dyn ProcessedLedger>) -> Self {
        Self { notifier, ledger }
    }

    fn recipient_id(event: &RideEvent, recipient: Recipient) -> Option<String> {
        match (event, recipient) {
            (
                RideEvent::RideRequested { client_id, .. }
                | RideEvent::RideAccepted { client_id, .. }
                | RideEvent::DriverArriving { client_id, .. }
                | RideEvent::DriverArrived { client_id, .. }
                | RideEvent::RideStarted { client_id, .. }
                | RideEvent::RideCompleted { client_id, .. }
                | RideEvent::RideCancelled { client_id, .. },
                Recipient::Client,
            ) => Some(client_id.clone()),
            (RideEvent::RideCancelled { driver_id, .. }, Recipient::Driver) => driver_id.clone(),
            _ => None,
        }
    }
}

#[async_trait]
impl EventHandler for NotificationConsumer {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> DispatchResult<()> {
        let Some(notice) = RideNotice::for_event(&envelope.event) else {
            return Ok(());
        };
        let Some(recipient_id) = Self::recipient_id(&envelope.event, notice.recipient) else {
            return Ok(());
        };

        if !self.ledger.mark_if_new(&envelope.event_id).await? {
            return Ok(());
        }

        let recipient = notice.recipient;
        let message = NotificationMessage::from_notice(notice, &envelope.ride_id);
        if let Err(e) = self.notifier.send(recipient, &recipient_id, message).await {
            self.ledger.forget(&envelope.event_id).await?;
            return Err(e);
        }
        Ok(())
    }
}

/// Forwards events that carry a push notice onto the notification topic. The
/// envelope keeps its event id, so the notification consumer's ledger absorbs
/// duplicate forwards.
pub struct NotificationRouter {
    publisher: Arc<dyn EventPublisher>,
}

impl NotificationRouter {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl EventHandler for NotificationRouter {
    fn name(&self) -> &'static str {
        "notification-router"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> DispatchResult<()> {
        if envelope.topic == Topic::Notification || RideNotice::for_event(&envelope.event).is_none() {
            return Ok(());
        }
        self.publisher.publish(&envelope.rerouted(Topic::Notification)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Empty,
    Acked,
    /// A handler failed; the delivery went back on the queue.
    Redelivering,
}

/// Drains one topic and hands each delivery to every handler. A delivery is acked
/// only when all handlers succeed, otherwise it is nacked for another attempt.
pub struct EventWorker {
    source: Arc<dyn EventSource>,
    topic: Topic,
    handlers: Vec<Arc<dyn EventHandler>>,
    wait: Duration,
    redelivery_delay: Duration,
}

impl EventWorker {
    pub fn new(source: Arc<dyn EventSource>, topic: Topic, handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self {
            source,
            topic,
            handlers,
            wait: Duration::from_secs(5),
            redelivery_delay: Duration::from_secs(2),
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Processes at most one delivery.
    pub async fn poll_once(&self) -> DispatchResult<PollOutcome> {
        let Some(delivery) = self.source.next(self.topic, self.wait).await? else {
            return Ok(PollOutcome::Empty);
        };

        let mut failed = false;
        for handler in &self.handlers {
            if let Err(e) = handler.handle(&delivery.envelope).await {
                failed = true;
                tracing::error!(
                    "{} handler failed on event {}: {}",
                    handler.name(), delivery.envelope.event_id, e
                );
            }
        }

        if failed {
            self.source.nack(self.topic, &delivery).await?;
            return Ok(PollOutcome::Redelivering);
        }
        self.source.ack(self.topic, &delivery).await?;
        Ok(PollOutcome::Acked)
    }

    pub async fn run(self) {
        match self.source.requeue_unacked(self.topic).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Requeued {} unacked {} events", n, self.topic),
            Err(e) => tracing::warn!("Could not requeue {} events: {}", self.topic, e),
        }

        tracing::info!("Event worker started for {}", self.topic);
        loop {
            match self.poll_once().await {
                Ok(PollOutcome::Acked) => {}
                Ok(PollOutcome::Empty) => tokio::time::sleep(Duration::from_millis(200)).await,
                Ok(PollOutcome::Redelivering) => tokio::time::sleep(self.redelivery_delay).await,
                Err(e) => {
                    tracing::warn!("Event worker for {} error: {}", self.topic, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DispatchError;
    use crate::services::event_service::{EventPublisher, InMemoryEventBus};
    use crate::services::messaging_service::MockNotificationService;
    use chrono::Utc;

    fn payment_requested(ride_id: &str) -> RideEvent {
        RideEvent::PaymentRequested {
            ride_id: ride_id.to_string(),
            client_id: "cli-251017-aaaaa".to_string(),
            driver_id: "drv-251017-aaaaa".to_string(),
            amount: 159,
            currency: "USD".to_string(),
            payment_method: PaymentMethod::Cash,
            idempotency_key: RideEvent::payment_key(ride_id),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_payment_delivery_settles_once() {
        let gateway = Arc::new(RecordingPaymentGateway::new());
        let consumer = PaymentConsumer::new(gateway.clone(), Arc::new(MemoryLedger::new()));

        let envelope = EventEnvelope::new(payment_requested("rid-251017-aaaaa"));
        consumer.handle(&envelope).await.unwrap();
        consumer.handle(&envelope).await.unwrap();

        // Same business event re-published under a new envelope
        let republished = EventEnvelope::new(payment_requested("rid-251017-aaaaa"));
        consumer.handle(&republished).await.unwrap();

        let settled = gateway.settled().await;
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].amount, 159);
        assert_eq!(settled[0].idempotency_key, "rid-251017-aaaaa:fare");
        assert!(settled[0].payment_id.starts_with("pay-"));
    }

    struct DownGateway;

    #[async_trait]
    impl PaymentGateway for DownGateway {
        async fn settle(&self, _: &Settlement) -> DispatchResult<String> {
            Err(DispatchError::NetworkTimeout)
        }
    }

    #[tokio::test]
    async fn test_failed_settlement_can_be_retried() {
        let ledger = Arc::new(MemoryLedger::new());
        let envelope = EventEnvelope::new(payment_requested("rid-251017-aaaaa"));

        let failing = PaymentConsumer::new(Arc::new(DownGateway), ledger.clone());
        assert!(failing.handle(&envelope).await.is_err());

        let gateway = Arc::new(RecordingPaymentGateway::new());
        let working = PaymentConsumer::new(gateway.clone(), ledger);
        working.handle(&envelope).await.unwrap();
        assert_eq!(gateway.settled().await.len(), 1);
    }

    #[tokio::test]
    async fn test_notification_consumer_targets_other_party() {
        let notifier = Arc::new(MockNotificationService::new());
        let consumer = NotificationConsumer::new(notifier.clone(), Arc::new(MemoryLedger::new()));

        let cancelled = EventEnvelope::new(RideEvent::RideCancelled {
            ride_id: "rid-251017-aaaaa".to_string(),
            client_id: "cli-251017-aaaaa".to_string(),
            driver_id: Some("drv-251017-aaaaa".to_string()),
            cancelled_by: crate::models::ride::Party::Client,
            reason: None,
            occurred_at: Utc::now(),
        });
        consumer.handle(&cancelled).await.unwrap();
        consumer.handle(&cancelled).await.unwrap();

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Recipient::Driver);
        assert_eq!(sent[0].1, "drv-251017-aaaaa");
        assert_eq!(sent[0].2.title.en, "Ride cancelled");
    }

    #[tokio::test]
    async fn test_worker_acks_only_on_success() {
        let bus = Arc::new(InMemoryEventBus::new());
        bus.publish(&EventEnvelope::new(payment_requested("rid-251017-aaaaa"))).await.unwrap();

        let failing = EventWorker::new(
            bus.clone(),
            Topic::Payment,
            vec![Arc::new(PaymentConsumer::new(Arc::new(DownGateway), Arc::new(MemoryLedger::new())))],
        );
        assert_eq!(failing.poll_once().await.unwrap(), PollOutcome::Redelivering);
        assert_eq!(bus.requeue_unacked(Topic::Payment).await.unwrap(), 0);

        let gateway = Arc::new(RecordingPaymentGateway::new());
        let worker = EventWorker::new(
            bus.clone(),
            Topic::Payment,
            vec![Arc::new(PaymentConsumer::new(gateway.clone(), Arc::new(MemoryLedger::new())))],
        );
        assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Acked);
        assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Empty);
        assert_eq!(bus.requeue_unacked(Topic::Payment).await.unwrap(), 0);
        assert_eq!(gateway.settled().await.len(), 1);
    }

    /// Fails the first `failures` settlements, then records.
    struct FlakyGateway {
        failures: Mutex<usize>,
        inner: RecordingPaymentGateway,
    }

    #[async_trait]
    impl PaymentGateway for FlakyGateway {
        async fn settle(&self, settlement: &Settlement) -> DispatchResult<String> {
            {
                let mut failures = self.failures.lock().await;
                if *failures > 0 {
                    *failures -= 1;
                    return Err(DispatchError::NetworkTimeout);
                }
            }
            self.inner.settle(settlement).await
        }
    }

    #[tokio::test]
    async fn test_running_worker_settles_after_transient_failure() {
        let bus = Arc::new(InMemoryEventBus::new());
        bus.publish(&EventEnvelope::new(payment_requested("rid-251017-aaaaa"))).await.unwrap();

        let gateway = Arc::new(FlakyGateway { failures: Mutex::new(1), inner: RecordingPaymentGateway::new() });
        let worker = EventWorker::new(
            bus.clone(),
            Topic::Payment,
            vec![Arc::new(PaymentConsumer::new(gateway.clone(), Arc::new(MemoryLedger::new())))],
        );

        assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Redelivering);
        assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Acked);
        assert_eq!(worker.poll_once().await.unwrap(), PollOutcome::Empty);
        assert_eq!(gateway.inner.settled().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_events_reach_clients_through_notification_topic() {
        let bus = Arc::new(InMemoryEventBus::new());
        let notifier = Arc::new(MockNotificationService::new());
        let router: Arc<dyn EventHandler> = Arc::new(NotificationRouter::new(bus.clone()));
        let lifecycle = EventWorker::new(bus.clone(), Topic::RideLifecycle, vec![router]);
        let notifications = EventWorker::new(
            bus.clone(),
            Topic::Notification,
            vec![Arc::new(NotificationConsumer::new(notifier.clone(), Arc::new(MemoryLedger::new())))],
        );

        let accepted = EventEnvelope::new(RideEvent::RideAccepted {
            ride_id: "rid-251017-aaaaa".to_string(),
            client_id: "cli-251017-aaaaa".to_string(),
            driver_id: "drv-251017-aaaaa".to_string(),
            occurred_at: Utc::now(),
        });
        let rated = EventEnvelope::new(RideEvent::RideRated {
            ride_id: "rid-251017-aaaaa".to_string(),
            rated_by: crate::models::ride::Party::Client,
            rating: 5,
            occurred_at: Utc::now(),
        });
        bus.publish(&accepted).await.unwrap();
        bus.publish(&rated).await.unwrap();
        // Redelivered copy of the same event
        bus.publish(&accepted).await.unwrap();

        while lifecycle.poll_once().await.unwrap() != PollOutcome::Empty {}
        while notifications.poll_once().await.unwrap() != PollOutcome::Empty {}

        let forwarded = bus.published().await;
        assert_eq!(forwarded.iter().filter(|e| e.topic == Topic::Notification).count(), 2);
        assert!(forwarded.iter().filter(|e| e.topic == Topic::Notification).all(|e| e.event_id == accepted.event_id));

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Recipient::Client);
        assert_eq!(sent[0].1, "cli-251017-aaaaa");
    }
}
