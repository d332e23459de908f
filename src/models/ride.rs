// src/models/ride.rs
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,     // Persisted, not yet opened for dispatch
    Searching,   // Waiting for a driver to accept
    Accepted,    // Driver assigned
    Arriving,    // Driver on the way to pickup
    Arrived,     // Driver waiting at pickup
    InProgress,  // Passenger on board
    Completed,
    Cancelled,
}

impl RideStatus {
    pub const ALL: [RideStatus; 8] = [
        RideStatus::Pending,
        RideStatus::Searching,
        RideStatus::Accepted,
        RideStatus::Arriving,
        RideStatus::Arrived,
        RideStatus::InProgress,
        RideStatus::Completed,
        RideStatus::Cancelled,
    ];

    /// Position in the lifecycle. Both terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            RideStatus::Pending => 0,
            RideStatus::Searching => 1,
            RideStatus::Accepted => 2,
            RideStatus::Arriving => 3,
            RideStatus::Arrived => 4,
            RideStatus::InProgress => 5,
            RideStatus::Completed | RideStatus::Cancelled => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Pending => "pending",
            RideStatus::Searching => "searching",
            RideStatus::Accepted => "accepted",
            RideStatus::Arriving => "arriving",
            RideStatus::Arrived => "arrived",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Economy,
    Comfort,
    Premium,
    Xl,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [
        VehicleClass::Economy,
        VehicleClass::Comfort,
        VehicleClass::Premium,
        VehicleClass::Xl,
    ];

    /// Lenient parse for client input: anything unrecognised is priced as the lowest class.
    pub fn parse_lossy(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "economy" => VehicleClass::Economy,
            "comfort" => VehicleClass::Comfort,
            "premium" => VehicleClass::Premium,
            "xl" => VehicleClass::Xl,
            other => {
                tracing::warn!("Unknown vehicle class '{}', falling back to economy", other);
                VehicleClass::Economy
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Economy => "economy",
            VehicleClass::Comfort => "comfort",
            VehicleClass::Premium => "premium",
            VehicleClass::Xl => "xl",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Wallet,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Client,
    Driver,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
}

impl Location {
    pub fn has_valid_coordinates(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Ride {
    pub id: String,
    pub client_id: String,
    pub driver_id: Option<String>,
    pub status: RideStatus,

    // Itinerary, fixed at creation
    pub pickup: Location,
    pub dropoff: Location,
    pub stops: Vec<Location>,
    pub route_polyline: Option<String>,

    // Commercial terms, fixed at creation
    pub vehicle_class: VehicleClass,
    pub payment_method: PaymentMethod,
    pub promo_code: Option<String>,
    pub discount: i64,
    pub surge_multiplier: f64,
    pub currency: String,
    pub pricing_version: u32,

    pub estimated_fare: i64,
    pub actual_fare: Option<i64>,

    pub estimated_distance_m: u64,
    pub estimated_duration_s: u64,
    pub actual_distance_m: Option<u64>,
    pub actual_duration_s: Option<u64>,

    pub created_at: DateTime<Utc>,
    pub searching_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub arriving_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub cancelled_by: Option<Party>,
    pub cancel_reason: Option<String>,

    // Post-ride, completed rides only
    pub rating: Option<u8>,
    pub review: Option<String>,
    pub client_rating: Option<u8>,
    pub client_review: Option<String>,
    pub tip: Option<i64>,

    /// Bumped by the store on every committed update.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

// Request/Response Models
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EstimateRequest {
    pub pickup: Location,
    pub dropoff: Location,
    #[serde(default)]
    pub stops: Vec<Location>,
    #[serde(default)]
    pub vehicle_classes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FareQuote {
    pub vehicle_class: VehicleClass,
    pub estimated_fare: i64,
    pub currency: String,
    pub distance_m: u64,
    pub duration_s: u64,
    pub surge_multiplier: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RideRequest {
    pub pickup: Location,
    pub dropoff: Location,
    #[serde(default)]
    pub stops: Vec<Location>,
    pub vehicle_class: String,
    pub payment_method: PaymentMethod,
    pub promo_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CompleteRequest {
    pub actual_distance_m: Option<i64>,
    pub actual_duration_s: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RatingRequest {
    pub rating: u8,
    pub review: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TipRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RebroadcastSummary {
    pub rides_considered: usize,
    pub drivers_notified: usize,
}
