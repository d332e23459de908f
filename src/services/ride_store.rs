// src/services/ride_store.rs
use async_trait::async_trait;
use redis::Client;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::ride::{Ride, RideStatus};

/// Mutation run against the current record inside a conditional update. May be
/// invoked more than once when an optimistic store retries.
pub type RideMutation<'a> = &'a (dyn Fn(&mut Ride) -> DispatchResult<()> + Send + Sync);

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The mutation committed; carries the stored record.
    Applied(Ride),
    /// The record's status was outside the expected set; carries it unchanged.
    Rejected(Ride),
}

#[async_trait]
pub trait RideStore: Send + Sync {
    async fn get(&self, ride_id: &str) -> DispatchResult<Option<Ride>>;

    /// Stores a new ride. Fails if the id is already taken.
    async fn put(&self, ride: &Ride) -> DispatchResult<()>;

    /// Atomically: read the ride, check its status is in `expected`, run `mutation`,
    /// write it back. Errors returned by the mutation abort without writing.
    async fn conditional_update(
        &self,
        ride_id: &str,
        expected: &[RideStatus],
        mutation: RideMutation<'_>,
    ) -> DispatchResult<UpdateOutcome>;

    async fn rides_for_client(&self, client_id: &str) -> DispatchResult<Vec<Ride>>;
    async fn rides_for_driver(&self, driver_id: &str) -> DispatchResult<Vec<Ride>>;
    async fn rides_in_status(&self, status: RideStatus) -> DispatchResult<Vec<Ride>>;
}

// Store key generators
pub struct RideKeys;

impl RideKeys {
    pub fn ride(ride_id: &str) -> String {
        format!("ride:id:{}", ride_id)
    }

    pub fn by_client(client_id: &str) -> String {
        format!("rides:client:{}", client_id)
    }

    pub fn by_driver(driver_id: &str) -> String {
        format!("rides:driver:{}", driver_id)
    }

    pub fn by_status(status: RideStatus) -> String {
        format!("rides:status:{}", status.as_str())
    }
}

fn newest_first(mut rides: Vec<Ride>) -> Vec<Ride> {
    rides.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    rides
}

// Memory store for development/testing
#[derive(Default)]
pub struct MemoryRideStore {
    rides: RwLock<HashMap<String, Ride>>,
}

impl MemoryRideStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn filtered(&self, keep: impl Fn(&Ride) -> bool + Send) -> Vec<Ride> {
        let rides = self.rides.read().await;
        newest_first(rides.values().filter(|r| keep(r)).cloned().collect())
    }
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn get(&self, ride_id: &str) -> DispatchResult<Option<Ride>> {
        Ok(self.rides.read().await.get(ride_id).cloned())
    }

    async fn put(&self, ride: &Ride) -> DispatchResult<()> {
        let mut rides = self.rides.write().await;
        if rides.contains_key(&ride.id) {
            return Err(DispatchError::DuplicateRide(ride.id.clone()));
        }
        rides.insert(ride.id.clone(), ride.clone());
        Ok(())
    }

    async fn conditional_update(
        &self,
        ride_id: &str,
        expected: &[RideStatus],
        mutation: RideMutation<'_>,
    ) -> DispatchResult<UpdateOutcome> {
        // The write guard spans read, check and write.
        let mut rides = self.rides.write().await;
        let current = rides
            .get(ride_id)
            .ok_or_else(|| DispatchError::ride_not_found(ride_id))?;

        if !expected.contains(&current.status) {
            return Ok(UpdateOutcome::Rejected(current.clone()));
        }

        let mut next = current.clone();
        mutation(&mut next)?;
        next.version = current.version + 1;
        rides.insert(ride_id.to_string(), next.clone());

        Ok(UpdateOutcome::Applied(next))
    }

    async fn rides_for_client(&self, client_id: &str) -> DispatchResult<Vec<Ride>> {
        Ok(self.filtered(|r| r.client_id == client_id).await)
    }

    async fn rides_for_driver(&self, driver_id: &str) -> DispatchResult<Vec<Ride>> {
        Ok(self.filtered(|r| r.driver_id.as_deref() == Some(driver_id)).await)
    }

    async fn rides_in_status(&self, status: RideStatus) -> DispatchResult<Vec<Ride>> {
        Ok(self.filtered(|r| r.status == status).await)
    }
}

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub redis_url: String,
    /// Optimistic transaction attempts before reporting contention.
    pub max_attempts: usize,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_attempts: 8,
        }
    }
}

/// Redis-backed store. Conditional updates use WATCH/MULTI/EXEC on the ride key.
pub struct RedisRideStore {
    client: Client,
    config: RedisStoreConfig,
}

impl RedisRideStore {
    pub async fn new(config: RedisStoreConfig) -> DispatchResult<Self> {
        let client = Client::open(config.redis_url.clone())?;

        // Fail fast on an unreachable server
        let mut conn = client.get_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self { client, config })
    }

    // WATCH state is per connection, so every call gets its own.
    async fn get_connection(&self) -> DispatchResult<redis::aio::Connection> {
        Ok(self.client.get_async_connection().await?)
    }

    async fn load(&self, conn: &mut redis::aio::Connection, ride_id: &str) -> DispatchResult<Option<Ride>> {
        let data: Option<String> = redis::cmd("GET")
            .arg(RideKeys::ride(ride_id))
            .query_async(conn)
            .await?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn load_many(&self, index_key: String) -> DispatchResult<Vec<Ride>> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&index_key)
            .query_async(&mut conn)
            .await?;

        let mut rides = Vec::with_capacity(ids.len());
        for ride_id in ids {
            if let Some(ride) = self.load(&mut conn, &ride_id).await? {
                rides.push(ride);
            }
        }
        Ok(newest_first(rides))
    }
}

#[async_trait]
impl RideStore for RedisRideStore {
    async fn get(&self, ride_id: &str) -> DispatchResult<Option<Ride>> {
        let mut conn = self.get_connection().await?;
        self.load(&mut conn, ride_id).await
    }

    async fn put(&self, ride: &Ride) -> DispatchResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(ride)?;

        let created: bool = redis::cmd("SET")
            .arg(RideKeys::ride(&ride.id))
            .arg(json)
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();

        if !created {
            return Err(DispatchError::DuplicateRide(ride.id.clone()));
        }

        redis::pipe()
            .cmd("SADD").arg(RideKeys::by_client(&ride.client_id)).arg(&ride.id).ignore()
            .cmd("SADD").arg(RideKeys::by_status(ride.status)).arg(&ride.id).ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        tracing::debug!("Stored ride {}", ride.id);
        Ok(())
    }

    async fn conditional_update(
        &self,
        ride_id: &str,
        expected: &[RideStatus],
        mutation: RideMutation<'_>,
    ) -> DispatchResult<UpdateOutcome> {
        let key = RideKeys::ride(ride_id);
        let mut conn = self.get_connection().await?;

        for attempt in 1..=self.config.max_attempts {
            let _: () = redis::cmd("WATCH").arg(&key).query_async(&mut conn).await?;

            let current = match self.load(&mut conn, ride_id).await? {
                Some(ride) => ride,
                None => {
                    let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                    return Err(DispatchError::ride_not_found(ride_id));
                }
            };

            if !expected.contains(&current.status) {
                let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                return Ok(UpdateOutcome::Rejected(current));
            }

            let mut next = current.clone();
            if let Err(err) = mutation(&mut next) {
                let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await?;
                return Err(err);
            }
            next.version = current.version + 1;
            let json = serde_json::to_string(&next)?;

            let mut pipe = redis::pipe();
            pipe.atomic().cmd("SET").arg(&key).arg(json).ignore();
            if next.status != current.status {
                pipe.cmd("SREM").arg(RideKeys::by_status(current.status)).arg(ride_id).ignore();
                pipe.cmd("SADD").arg(RideKeys::by_status(next.status)).arg(ride_id).ignore();
            }
            if let (None, Some(driver_id)) = (&current.driver_id, &next.driver_id) {
                pipe.cmd("SADD").arg(RideKeys::by_driver(driver_id)).arg(ride_id).ignore();
            }

            // EXEC returns nil when the watched key changed underneath us
            let committed: Option<()> = pipe.query_async(&mut conn).await?;
            if committed.is_some() {
                return Ok(UpdateOutcome::Applied(next));
            }

            tracing::debug!("Ride {} changed during update, retrying (attempt {})", ride_id, attempt);
        }

        tracing::warn!("Giving up on ride {} after {} contended attempts", ride_id, self.config.max_attempts);
        Err(DispatchError::StoreConflict(format!(
            "ride {} is being updated concurrently",
            ride_id
        )))
    }

    async fn rides_for_client(&self, client_id: &str) -> DispatchResult<Vec<Ride>> {
        self.load_many(RideKeys::by_client(client_id)).await
    }

    async fn rides_for_driver(&self, driver_id: &str) -> DispatchResult<Vec<Ride>> {
        self.load_many(RideKeys::by_driver(driver_id)).await
    }

    async fn rides_in_status(&self, status: RideStatus) -> DispatchResult<Vec<Ride>> {
        self.load_many(RideKeys::by_status(status)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ride_service::tests::sample_ride;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_rejects_duplicate_ids() {
        let store = MemoryRideStore::new();
        let ride = sample_ride();
        store.put(&ride).await.unwrap();
        assert!(matches!(store.put(&ride).await, Err(DispatchError::DuplicateRide(_))));
    }

    #[tokio::test]
    async fn test_conditional_update_checks_status() {
        let store = MemoryRideStore::new();
        let ride = sample_ride();
        store.put(&ride).await.unwrap();

        let outcome = store
            .conditional_update(&ride.id, &[RideStatus::Searching], &|r: &mut Ride| -> DispatchResult<()> {
                r.status = RideStatus::Accepted;
                Ok(())
            })
            .await
            .unwrap();
        match outcome {
            UpdateOutcome::Rejected(current) => assert_eq!(current.status, RideStatus::Pending),
            UpdateOutcome::Applied(_) => panic!("pending ride should not match searching"),
        }

        let outcome = store
            .conditional_update(&ride.id, &[RideStatus::Pending], &|r: &mut Ride| -> DispatchResult<()> {
                r.status = RideStatus::Searching;
                Ok(())
            })
            .await
            .unwrap();
        match outcome {
            UpdateOutcome::Applied(updated) => {
                assert_eq!(updated.status, RideStatus::Searching);
                assert_eq!(updated.version, ride.version + 1);
            }
            UpdateOutcome::Rejected(_) => panic!("expected update to apply"),
        }
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_record_untouched() {
        let store = MemoryRideStore::new();
        let ride = sample_ride();
        store.put(&ride).await.unwrap();

        let result = store
            .conditional_update(&ride.id, &[RideStatus::Pending], &|r: &mut Ride| -> DispatchResult<()> {
                r.status = RideStatus::Cancelled;
                Err(DispatchError::forbidden("nope"))
            })
            .await;
        assert!(matches!(result, Err(DispatchError::Forbidden(_))));

        let stored = store.get(&ride.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Pending);
        assert_eq!(stored.version, ride.version);
    }

    #[tokio::test]
    async fn test_unknown_ride() {
        let store = MemoryRideStore::new();
        let result = store.conditional_update("rid-251017-nope0", &[RideStatus::Pending], &|_: &mut Ride| -> DispatchResult<()> { Ok(()) }).await;
        assert!(matches!(result, Err(DispatchError::RideNotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_commit_once() {
        let store = Arc::new(MemoryRideStore::new());
        let ride = sample_ride();
        store.put(&ride).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let ride_id = ride.id.clone();
            handles.push(tokio::spawn(async move {
                let driver = format!("drv-251017-{:05}", i);
                let accept = move |r: &mut Ride| -> DispatchResult<()> {
                    r.driver_id = Some(driver.clone());
                    r.status = RideStatus::Accepted;
                    Ok(())
                };
                let expected = [RideStatus::Pending];
                let outcome = store.conditional_update(&ride_id, &expected, &accept).await.unwrap();
                outcome
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), UpdateOutcome::Applied(_)) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(store.rides_in_status(RideStatus::Accepted).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_indices() {
        let store = MemoryRideStore::new();
        let mut first = sample_ride();
        first.created_at = first.created_at - chrono::Duration::minutes(5);
        let second = sample_ride();
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        let rides = store.rides_for_client(&first.client_id).await.unwrap();
        assert_eq!(rides.len(), 2);
        assert_eq!(rides[0].id, second.id);
        assert!(store.rides_for_driver("drv-251017-aaaaa").await.unwrap().is_empty());
    }
}
