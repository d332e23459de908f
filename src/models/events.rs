// src/models/events.rs
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;

use crate::models::ride::{Location, Party, PaymentMethod, Ride, VehicleClass};
use crate::utils::id_generator::{IdGenerator, IdType};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    RideRequest,
    RideLifecycle,
    Payment,
    Notification,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::RideRequest => "ride-request",
            Topic::RideLifecycle => "ride-lifecycle",
            Topic::Payment => "payment",
            Topic::Notification => "notification",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain events published by the dispatch engine. The serialized shape is a
/// public contract for downstream consumers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RideEvent {
    RideRequested {
        ride_id: String,
        client_id: String,
        vehicle_class: VehicleClass,
        pickup: Location,
        dropoff: Location,
        estimated_fare: i64,
        currency: String,
        occurred_at: DateTime<Utc>,
    },
    RideAccepted {
        ride_id: String,
        client_id: String,
        driver_id: String,
        occurred_at: DateTime<Utc>,
    },
    DriverArriving {
        ride_id: String,
        client_id: String,
        driver_id: String,
        occurred_at: DateTime<Utc>,
    },
    DriverArrived {
        ride_id: String,
        client_id: String,
        driver_id: String,
        occurred_at: DateTime<Utc>,
    },
    RideStarted {
        ride_id: String,
        client_id: String,
        driver_id: String,
        occurred_at: DateTime<Utc>,
    },
    RideCompleted {
        ride_id: String,
        client_id: String,
        driver_id: String,
        actual_fare: i64,
        currency: String,
        actual_distance_m: u64,
        actual_duration_s: u64,
        occurred_at: DateTime<Utc>,
    },
    PaymentRequested {
        ride_id: String,
        client_id: String,
        driver_id: String,
        amount: i64,
        currency: String,
        payment_method: PaymentMethod,
        idempotency_key: String,
        occurred_at: DateTime<Utc>,
    },
    RideCancelled {
        ride_id: String,
        client_id: String,
        driver_id: Option<String>,
        cancelled_by: Party,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    RideRated {
        ride_id: String,
        rated_by: Party,
        rating: u8,
        occurred_at: DateTime<Utc>,
    },
    TipAdded {
        ride_id: String,
        client_id: String,
        driver_id: String,
        amount: i64,
        currency: String,
        idempotency_key: String,
        occurred_at: DateTime<Utc>,
    },
}

impl RideEvent {
    pub fn topic(&self) -> Topic {
        match self {
            RideEvent::RideRequested { .. } => Topic::RideRequest,
            RideEvent::PaymentRequested { .. } | RideEvent::TipAdded { .. } => Topic::Payment,
            RideEvent::RideAccepted { .. }
            | RideEvent::DriverArriving { .. }
            | RideEvent::DriverArrived { .. }
            | RideEvent::RideStarted { .. }
            | RideEvent::RideCompleted { .. }
            | RideEvent::RideCancelled { .. }
            | RideEvent::RideRated { .. } => Topic::RideLifecycle,
        }
    }

    pub fn ride_id(&self) -> &str {
        match self {
            RideEvent::RideRequested { ride_id, .. }
            | RideEvent::RideAccepted { ride_id, .. }
            | RideEvent::DriverArriving { ride_id, .. }
            | RideEvent::DriverArrived { ride_id, .. }
            | RideEvent::RideStarted { ride_id, .. }
            | RideEvent::RideCompleted { ride_id, .. }
            | RideEvent::PaymentRequested { ride_id, .. }
            | RideEvent::RideCancelled { ride_id, .. }
            | RideEvent::RideRated { ride_id, .. }
            | RideEvent::TipAdded { ride_id, .. } => ride_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RideEvent::RideRequested { .. } => "ride_requested",
            RideEvent::RideAccepted { .. } => "ride_accepted",
            RideEvent::DriverArriving { .. } => "driver_arriving",
            RideEvent::DriverArrived { .. } => "driver_arrived",
            RideEvent::RideStarted { .. } => "ride_started",
            RideEvent::RideCompleted { .. } => "ride_completed",
            RideEvent::PaymentRequested { .. } => "payment_requested",
            RideEvent::RideCancelled { .. } => "ride_cancelled",
            RideEvent::RideRated { .. } => "ride_rated",
            RideEvent::TipAdded { .. } => "tip_added",
        }
    }

    pub fn ride_requested(ride: &Ride, occurred_at: DateTime<Utc>) -> Self {
        RideEvent::RideRequested {
            ride_id: ride.id.clone(),
            client_id: ride.client_id.clone(),
            vehicle_class: ride.vehicle_class,
            pickup: ride.pickup.clone(),
            dropoff: ride.dropoff.clone(),
            estimated_fare: ride.estimated_fare,
            currency: ride.currency.clone(),
            occurred_at,
        }
    }

    pub fn payment_key(ride_id: &str) -> String {
        format!("{}:fare", ride_id)
    }

    pub fn tip_key(ride_id: &str) -> String {
        format!("{}:tip", ride_id)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_id: String,
    pub topic: Topic,
    pub ride_id: String,
    pub published_at: DateTime<Utc>,
    pub event: RideEvent,
}

impl EventEnvelope {
    pub fn new(event: RideEvent) -> Self {
        Self {
            event_id: IdGenerator::generate(IdType::Event),
            topic: event.topic(),
            ride_id: event.ride_id().to_string(),
            published_at: Utc::now(),
            event,
        }
    }

    /// Same event under the same id, queued on another topic.
    pub fn rerouted(&self, topic: Topic) -> Self {
        Self { topic, ..self.clone() }
    }
}
