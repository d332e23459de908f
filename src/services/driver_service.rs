// src/services/driver_service.rs
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use redis::Client;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::driver::{Candidate, Driver, DriverRegistration, DriverStatus, GeoPoint, PresenceUpdate},
    models::messages::{Recipient, RideNotice},
    models::ride::{Ride, VehicleClass},
    services::messaging_service::{NotificationMessage, NotificationService},
    utils::geo::haversine_km,
    utils::id_generator::{IdGenerator, IdType},
};

#[async_trait]
pub trait DriverDirectory: Send + Sync {
    async fn get(&self, driver_id: &str) -> DispatchResult<Option<Driver>>;
    async fn save(&self, driver: &Driver) -> DispatchResult<()>;

    /// Drivers of `class` within `radius_km` of the point, nearest first. Availability
    /// is not filtered here.
    async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        class: VehicleClass,
        radius_km: f64,
    ) -> DispatchResult<Vec<(Driver, f64)>>;
}

#[derive(Default)]
pub struct MemoryDriverDirectory {
    drivers: RwLock<HashMap<String, Driver>>,
}

impl MemoryDriverDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DriverDirectory for MemoryDriverDirectory {
    async fn get(&self, driver_id: &str) -> DispatchResult<Option<Driver>> {
        Ok(self.drivers.read().await.get(driver_id).cloned())
    }

    async fn save(&self, driver: &Driver) -> DispatchResult<()> {
        self.drivers.write().await.insert(driver.id.clone(), driver.clone());
        Ok(())
    }

    async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        class: VehicleClass,
        radius_km: f64,
    ) -> DispatchResult<Vec<(Driver, f64)>> {
        let drivers = self.drivers.read().await;
        let mut found: Vec<(Driver, f64)> = drivers
            .values()
            .filter(|d| d.vehicle_class == class)
            .filter_map(|d| {
                let at = d.location.as_ref()?;
                let km = haversine_km(latitude, longitude, at.latitude, at.longitude);
                (km <= radius_km).then(|| (d.clone(), km))
            })
            .collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(found)
    }
}

/// Driver records as JSON plus one GEO set per vehicle class.
pub struct RedisDriverDirectory {
    client: Client,
}

impl RedisDriverDirectory {
    pub fn new(redis_url: &str) -> DispatchResult<Self> {
        Ok(Self { client: Client::open(redis_url)? })
    }

    fn driver_key(driver_id: &str) -> String {
        format!("driver:id:{}", driver_id)
    }

    fn geo_key(class: VehicleClass) -> String {
        format!("drivers:geo:{}", class.as_str())
    }
}

#[async_trait]
impl DriverDirectory for RedisDriverDirectory {
    async fn get(&self, driver_id: &str) -> DispatchResult<Option<Driver>> {
        let mut conn = self.client.get_async_connection().await?;
        let data: Option<String> = redis::cmd("GET")
            .arg(Self::driver_key(driver_id))
            .query_async(&mut conn)
            .await?;
        Ok(match data {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    async fn save(&self, driver: &Driver) -> DispatchResult<()> {
        let mut conn = self.client.get_async_connection().await?;
        let json = serde_json::to_string(driver)?;

        let mut pipe = redis::pipe();
        pipe.cmd("SET").arg(Self::driver_key(&driver.id)).arg(json).ignore();
        for class in VehicleClass::ALL {
            if class != driver.vehicle_class {
                pipe.cmd("ZREM").arg(Self::geo_key(class)).arg(&driver.id).ignore();
            }
        }
        match &driver.location {
            Some(at) => {
                pipe.cmd("GEOADD")
                    .arg(Self::geo_key(driver.vehicle_class))
                    .arg(at.longitude)
                    .arg(at.latitude)
                    .arg(&driver.id)
                    .ignore();
            }
            None => {
                pipe.cmd("ZREM").arg(Self::geo_key(driver.vehicle_class)).arg(&driver.id).ignore();
            }
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn nearby(
        &self,
        latitude: f64,
        longitude: f64,
        class: VehicleClass,
        radius_km: f64,
    ) -> DispatchResult<Vec<(Driver, f64)>> {
        let mut conn = self.client.get_async_connection().await?;
        let hits: Vec<(String, f64)> = redis::cmd("GEORADIUS")
            .arg(Self::geo_key(class))
            .arg(longitude)
            .arg(latitude)
            .arg(radius_km)
            .arg("km")
            .arg("WITHDIST")
            .arg("ASC")
            .query_async(&mut conn)
            .await?;

        let mut found = Vec::with_capacity(hits.len());
        for (driver_id, km) in hits {
            let data: Option<String> = redis::cmd("GET")
                .arg(Self::driver_key(&driver_id))
                .query_async(&mut conn)
                .await?;
            if let Some(json) = data {
                found.push((serde_json::from_str::<Driver>(&json)?, km));
            }
        }
        Ok(found)
    }
}

pub struct DriverService {
    directory: Arc<dyn DriverDirectory>,
}

impl DriverService {
    pub fn new(directory: Arc<dyn DriverDirectory>) -> Self {
        Self { directory }
    }

    pub async fn register_driver(&self, registration: DriverRegistration) -> DispatchResult<Driver> {
        if registration.display_name.trim().is_empty() {
            return Err(DispatchError::validation_error("display_name", "Display name is required"));
        }

        let now = Utc::now();
        let driver = Driver {
            id: IdGenerator::generate(IdType::Driver),
            display_name: registration.display_name,
            status: DriverStatus::Offline,
            is_verified: registration.is_verified,
            vehicle_class: registration.vehicle_class,
            location: None,
            current_ride_id: None,
            created_at: now,
            updated_at: now,
        };

        self.directory.save(&driver).await?;
        tracing::info!("Driver registered: {} ({})", driver.id, driver.vehicle_class);
        Ok(driver)
    }

    pub async fn get_driver(&self, driver_id: &str) -> DispatchResult<Driver> {
        self.directory
            .get(driver_id)
            .await?
            .ok_or_else(|| DispatchError::DriverNotFound(driver_id.to_string()))
    }

    pub async fn update_presence(&self, driver_id: &str, update: PresenceUpdate) -> DispatchResult<Driver> {
        let mut driver = self.get_driver(driver_id).await?;

        match (update.latitude, update.longitude) {
            (Some(latitude), Some(longitude)) => {
                if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                    return Err(DispatchError::validation_error("location", "Latitude/longitude out of range"));
                }
                driver.location = Some(GeoPoint { latitude, longitude, updated_at: Utc::now() });
            }
            (None, None) => {}
            _ => return Err(DispatchError::validation_error("location", "Both latitude and longitude are required")),
        }

        // On-ride status is owned by the ride lifecycle
        let holds_ride = driver.current_ride_id.is_some();
        driver.status = match (driver.status, update.status) {
            (_, DriverStatus::Online) if holds_ride => DriverStatus::OnRide,
            (_, DriverStatus::OnRide) => {
                return Err(DispatchError::validation_error("status", "Drivers cannot set on_ride directly"));
            }
            (_, requested) => requested,
        };
        driver.updated_at = Utc::now();

        self.directory.save(&driver).await?;
        tracing::debug!("Driver {} is {:?}", driver.id, driver.status);
        Ok(driver)
    }

    pub async fn mark_on_ride(&self, driver_id: &str, ride_id: &str) -> DispatchResult<()> {
        let mut driver = self.get_driver(driver_id).await?;
        driver.status = DriverStatus::OnRide;
        driver.current_ride_id = Some(ride_id.to_string());
        driver.updated_at = Utc::now();
        self.directory.save(&driver).await
    }

    pub async fn mark_available(&self, driver_id: &str, ride_id: &str) -> DispatchResult<()> {
        let mut driver = self.get_driver(driver_id).await?;
        if driver.current_ride_id.as_deref() != Some(ride_id) {
            return Ok(());
        }
        // A driver who signed off mid-ride stays offline
        if driver.status == DriverStatus::OnRide {
            driver.status = DriverStatus::Online;
        }
        driver.current_ride_id = None;
        driver.updated_at = Utc::now();
        self.directory.save(&driver).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    pub radius_km: f64,
    pub max_candidates: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { radius_km: 5.0, max_candidates: 10 }
    }
}

/// Best-effort ride-request fan-out to nearby drivers. Being notified reserves nothing.
pub struct DriverBroadcast {
    directory: Arc<dyn DriverDirectory>,
    notifier: Arc<dyn NotificationService>,
    config: BroadcastConfig,
}

impl DriverBroadcast {
    pub fn new(
        directory: Arc<dyn DriverDirectory>,
        notifier: Arc<dyn NotificationService>,
        config: BroadcastConfig,
    ) -> Self {
        Self { directory, notifier, config }
    }

    pub async fn candidates(&self, ride: &Ride) -> DispatchResult<Vec<Candidate>> {
        let nearby = self
            .directory
            .nearby(ride.pickup.latitude, ride.pickup.longitude, ride.vehicle_class, self.config.radius_km)
            .await?;

        Ok(nearby
            .into_iter()
            .filter(|(driver, _)| driver.is_dispatchable() && driver.vehicle_class == ride.vehicle_class)
            .take(self.config.max_candidates)
            .map(|(driver, distance_km)| Candidate { driver_id: driver.id, distance_km })
            .collect())
    }

    /// Notifies candidates for a searching ride and returns who was reached.
    pub async fn broadcast(&self, ride: &Ride) -> DispatchResult<Vec<String>> {
        let candidates = self.candidates(ride).await?;
        if candidates.is_empty() {
            tracing::info!("No drivers available for ride {}, staying in searching", ride.id);
            return Ok(Vec::new());
        }

        let notice = || {
            let notice = RideNotice::ride_request(&ride.pickup.address, ride.estimated_fare, &ride.currency);
            NotificationMessage::from_notice(notice, &ride.id)
        };

        let sends = candidates.iter().map(|c| {
            let message = notice();
            async move {
                let result = self.notifier.send(Recipient::Driver, &c.driver_id, message).await;
                (c.driver_id.clone(), result)
            }
        });

        let mut notified = Vec::with_capacity(candidates.len());
        for (driver_id, result) in join_all(sends).await {
            match result {
                Ok(()) => notified.push(driver_id),
                Err(e) => tracing::warn!("Ride request to driver {} failed: {}", driver_id, e),
            }
        }

        tracing::info!("Ride {} broadcast to {}/{} drivers", ride.id, notified.len(), candidates.len());
        Ok(notified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::messaging_service::MockNotificationService;
    use crate::services::ride_service::tests::sample_ride;

    async fn online_driver(
        service: &DriverService,
        class: VehicleClass,
        verified: bool,
        latitude: f64,
        longitude: f64,
    ) -> Driver {
        let driver = service
            .register_driver(DriverRegistration {
                display_name: "Test".to_string(),
                vehicle_class: class,
                is_verified: verified,
            })
            .await
            .unwrap();
        service
            .update_presence(
                &driver.id,
                PresenceUpdate { status: DriverStatus::Online, latitude: Some(latitude), longitude: Some(longitude) },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_filters_and_orders_candidates() {
        let directory: Arc<dyn DriverDirectory> = Arc::new(MemoryDriverDirectory::new());
        let drivers = DriverService::new(directory.clone());
        let ride = sample_ride();
        let (lat, lng) = (ride.pickup.latitude, ride.pickup.longitude);

        let far = online_driver(&drivers, VehicleClass::Economy, true, lat + 0.02, lng).await;
        let near = online_driver(&drivers, VehicleClass::Economy, true, lat + 0.001, lng).await;
        let _unverified = online_driver(&drivers, VehicleClass::Economy, false, lat, lng).await;
        let _premium = online_driver(&drivers, VehicleClass::Premium, true, lat, lng).await;
        let _out_of_range = online_driver(&drivers, VehicleClass::Economy, true, lat + 1.0, lng).await;
        let busy = online_driver(&drivers, VehicleClass::Economy, true, lat, lng).await;
        drivers.mark_on_ride(&busy.id, "rid-251017-other").await.unwrap();

        let notifier = Arc::new(MockNotificationService::new());
        let broadcast = DriverBroadcast::new(directory, notifier.clone(), BroadcastConfig::default());

        let notified = broadcast.broadcast(&ride).await.unwrap();
        assert_eq!(notified, vec![near.id.clone(), far.id.clone()]);
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_is_capped() {
        let directory: Arc<dyn DriverDirectory> = Arc::new(MemoryDriverDirectory::new());
        let drivers = DriverService::new(directory.clone());
        let ride = sample_ride();
        for i in 0..5 {
            online_driver(&drivers, VehicleClass::Economy, true, ride.pickup.latitude + 0.001 * i as f64, ride.pickup.longitude).await;
        }

        let notifier = Arc::new(MockNotificationService::new());
        let broadcast = DriverBroadcast::new(directory, notifier.clone(), BroadcastConfig { radius_km: 5.0, max_candidates: 3 });
        assert_eq!(broadcast.broadcast(&ride).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_no_candidates_is_not_an_error() {
        let directory: Arc<dyn DriverDirectory> = Arc::new(MemoryDriverDirectory::new());
        let broadcast = DriverBroadcast::new(directory, Arc::new(MockNotificationService::new()), BroadcastConfig::default());
        assert!(broadcast.broadcast(&sample_ride()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presence_rules() {
        let drivers = DriverService::new(Arc::new(MemoryDriverDirectory::new()));
        let driver = online_driver(&drivers, VehicleClass::Comfort, true, 30.0, 31.0).await;

        drivers.mark_on_ride(&driver.id, "rid-251017-aaaaa").await.unwrap();
        let still_busy = drivers
            .update_presence(&driver.id, PresenceUpdate { status: DriverStatus::Online, latitude: None, longitude: None })
            .await
            .unwrap();
        assert_eq!(still_busy.status, DriverStatus::OnRide);

        // Releasing for a different ride is a no-op
        drivers.mark_available(&driver.id, "rid-251017-bbbbb").await.unwrap();
        assert_eq!(drivers.get_driver(&driver.id).await.unwrap().status, DriverStatus::OnRide);

        drivers.mark_available(&driver.id, "rid-251017-aaaaa").await.unwrap();
        let released = drivers.get_driver(&driver.id).await.unwrap();
        assert_eq!(released.status, DriverStatus::Online);
        assert!(released.current_ride_id.is_none());

        let err = drivers
            .update_presence(&driver.id, PresenceUpdate { status: DriverStatus::Online, latitude: Some(10.0), longitude: None })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_driver_offline_during_ride_is_not_broadcast_after_release() {
        let directory: Arc<dyn DriverDirectory> = Arc::new(MemoryDriverDirectory::new());
        let drivers = DriverService::new(directory.clone());
        let ride = sample_ride();
        let driver = online_driver(&drivers, VehicleClass::Economy, true, ride.pickup.latitude, ride.pickup.longitude).await;

        drivers.mark_on_ride(&driver.id, "rid-251017-aaaaa").await.unwrap();
        let offline = drivers
            .update_presence(&driver.id, PresenceUpdate { status: DriverStatus::Offline, latitude: None, longitude: None })
            .await
            .unwrap();
        assert_eq!(offline.status, DriverStatus::Offline);
        assert_eq!(offline.current_ride_id.as_deref(), Some("rid-251017-aaaaa"));

        // Coming back while the ride is still open puts the driver back on it
        let back = drivers
            .update_presence(&driver.id, PresenceUpdate { status: DriverStatus::Online, latitude: None, longitude: None })
            .await
            .unwrap();
        assert_eq!(back.status, DriverStatus::OnRide);
        drivers
            .update_presence(&driver.id, PresenceUpdate { status: DriverStatus::Offline, latitude: None, longitude: None })
            .await
            .unwrap();

        drivers.mark_available(&driver.id, "rid-251017-aaaaa").await.unwrap();
        let released = drivers.get_driver(&driver.id).await.unwrap();
        assert_eq!(released.status, DriverStatus::Offline);
        assert!(released.current_ride_id.is_none());

        let notifier = Arc::new(MockNotificationService::new());
        let broadcast = DriverBroadcast::new(directory, notifier.clone(), BroadcastConfig::default());
        assert!(broadcast.candidates(&ride).await.unwrap().is_empty());
        assert!(broadcast.broadcast(&ride).await.unwrap().is_empty());
        assert!(notifier.sent().is_empty());
    }
}
