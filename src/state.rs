// src/state.rs
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::events::Topic;
use crate::services::{
    consumers::{
        EventHandler, EventWorker, MemoryLedger, NotificationConsumer, NotificationRouter, PaymentConsumer, PaymentGateway,
        ProcessedLedger, RecordingPaymentGateway, RedisLedger,
    },
    driver_service::{BroadcastConfig, DriverBroadcast, DriverDirectory, DriverService, MemoryDriverDirectory, RedisDriverDirectory},
    event_service::{EventFanout, EventPublisher, EventSource, InMemoryEventBus, RedisEventBus, RetryPolicy},
    fare_service::PricingConfig,
    messaging_service::{FcmConfig, FcmNotificationService, MockNotificationService, NotificationService},
    ride_service::RideService,
    ride_store::{MemoryRideStore, RedisRideStore, RedisStoreConfig, RideStore},
    route_service::{DirectionsConfig, FallbackRouteResolver, GoogleDirectionsResolver, RouteResolver, StraightLineResolver},
};

pub struct AppState {
    pub ride_service: Arc<RideService>,
    pub driver_service: Arc<DriverService>,
    pub fanout: Arc<EventFanout>,
    event_publisher: Arc<dyn EventPublisher>,
    pub event_source: Arc<dyn EventSource>,
    pub notification_service: Arc<dyn NotificationService>,
    pub payment_gateway: Arc<dyn PaymentGateway>,
    payment_ledger: Arc<dyn ProcessedLedger>,
    notification_ledger: Arc<dyn ProcessedLedger>,
    pub config: AppConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub redis_url: Option<String>,
    pub fcm_server_key: Option<String>,
    pub maps_api_key: Option<String>,
    pub pricing_config_path: Option<String>,
    pub broadcast: BroadcastConfig,
    pub publish_retry_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            redis_url: None,
            fcm_server_key: None,
            maps_api_key: None,
            pricing_config_path: None,
            broadcast: BroadcastConfig::default(),
            publish_retry_interval: Duration::from_secs(15),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>, default: T) -> DispatchResult<T> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| DispatchError::InvalidConfiguration(format!("{} has an invalid value: {}", name, value))),
    }
}

impl AppConfig {
    pub fn from_env() -> DispatchResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DispatchResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let radius_km: f64 = parse_var("BROADCAST_RADIUS_KM", get("BROADCAST_RADIUS_KM"), defaults.broadcast.radius_km)?;
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(DispatchError::InvalidConfiguration("BROADCAST_RADIUS_KM must be positive".to_string()));
        }
        let max_candidates: usize = parse_var("BROADCAST_LIMIT", get("BROADCAST_LIMIT"), defaults.broadcast.max_candidates)?;
        let retry_secs: u64 = parse_var(
            "PUBLISH_RETRY_INTERVAL_SECS",
            get("PUBLISH_RETRY_INTERVAL_SECS"),
            defaults.publish_retry_interval.as_secs(),
        )?;

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            redis_url: get("REDIS_URL"),
            fcm_server_key: get("FCM_SERVER_KEY"),
            maps_api_key: get("MAPS_API_KEY"),
            pricing_config_path: get("PRICING_CONFIG_PATH"),
            broadcast: BroadcastConfig { radius_km, max_candidates },
            publish_retry_interval: Duration::from_secs(retry_secs.max(1)),
        })
    }
}

impl AppState {
    pub async fn new(config: AppConfig) -> DispatchResult<Self> {
        let pricing = match &config.pricing_config_path {
            Some(path) => PricingConfig::from_file(path)?,
            None => PricingConfig::default(),
        };
        tracing::info!("Pricing table v{} in {}", pricing.version, pricing.currency);

        let store: Arc<dyn RideStore>;
        let directory: Arc<dyn DriverDirectory>;
        let publisher: Arc<dyn EventPublisher>;
        let event_source: Arc<dyn EventSource>;
        let payment_ledger: Arc<dyn ProcessedLedger>;
        let notification_ledger: Arc<dyn ProcessedLedger>;

        match &config.redis_url {
            Some(redis_url) => {
                store = Arc::new(
                    RedisRideStore::new(RedisStoreConfig { redis_url: redis_url.clone(), ..Default::default() }).await?,
                );
                directory = Arc::new(RedisDriverDirectory::new(redis_url)?);
                let bus = Arc::new(RedisEventBus::new(redis_url)?);
                publisher = bus.clone();
                event_source = bus;
                payment_ledger = Arc::new(RedisLedger::new(redis_url, "payment")?);
                notification_ledger = Arc::new(RedisLedger::new(redis_url, "notification")?);
            }
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory store and event bus");
                store = Arc::new(MemoryRideStore::new());
                directory = Arc::new(MemoryDriverDirectory::new());
                let bus = Arc::new(InMemoryEventBus::new());
                publisher = bus.clone();
                event_source = bus;
                payment_ledger = Arc::new(MemoryLedger::new());
                notification_ledger = Arc::new(MemoryLedger::new());
            }
        }

        let notification_service: Arc<dyn NotificationService> = match &config.fcm_server_key {
            Some(key) => Arc::new(FcmNotificationService::new(FcmConfig::with_server_key(key.clone()))),
            None => {
                tracing::warn!("FCM_SERVER_KEY not set, using mock notification service");
                Arc::new(MockNotificationService::new())
            }
        };

        let routes: Arc<dyn RouteResolver> = match &config.maps_api_key {
            Some(key) => {
                let google = GoogleDirectionsResolver::new(DirectionsConfig::new(key.clone()))
                    .map_err(|e| DispatchError::InvalidConfiguration(e.to_string()))?;
                Arc::new(FallbackRouteResolver::new(Arc::new(google)))
            }
            None => {
                tracing::warn!("MAPS_API_KEY not set, routes are straight-line estimates");
                Arc::new(StraightLineResolver::default())
            }
        };

        let driver_service = Arc::new(DriverService::new(directory.clone()));
        let broadcast = Arc::new(DriverBroadcast::new(directory, notification_service.clone(), config.broadcast));
        let fanout = Arc::new(EventFanout::new(publisher.clone(), RetryPolicy::default()));

        let ride_service = Arc::new(RideService::new(
            store,
            routes,
            Arc::new(pricing),
            driver_service.clone(),
            broadcast,
            fanout.clone(),
        ));

        Ok(Self {
            ride_service,
            driver_service,
            fanout,
            event_publisher: publisher,
            event_source,
            notification_service,
            payment_gateway: Arc::new(RecordingPaymentGateway::new()),
            payment_ledger,
            notification_ledger,
            config,
        })
    }

    /// One worker per topic. Ride events pass through the router onto the
    /// notification topic before anything is pushed.
    pub fn event_workers(&self) -> Vec<EventWorker> {
        let payments: Arc<dyn EventHandler> =
            Arc::new(PaymentConsumer::new(self.payment_gateway.clone(), self.payment_ledger.clone()));
        let notifications: Arc<dyn EventHandler> =
            Arc::new(NotificationConsumer::new(self.notification_service.clone(), self.notification_ledger.clone()));
        let router: Arc<dyn EventHandler> = Arc::new(NotificationRouter::new(self.event_publisher.clone()));

        vec![
            EventWorker::new(self.event_source.clone(), Topic::RideRequest, vec![router.clone()]),
            EventWorker::new(self.event_source.clone(), Topic::RideLifecycle, vec![router]),
            EventWorker::new(self.event_source.clone(), Topic::Payment, vec![payments]),
            EventWorker::new(self.event_source.clone(), Topic::Notification, vec![notifications]),
        ]
    }
}
