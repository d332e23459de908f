// src/models/driver.rs
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::models::ride::VehicleClass;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Offline,  // Not taking rides
    Online,   // Available for ride requests
    OnRide,   // Holding an accepted ride
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Driver {
    pub id: String,
    pub display_name: String,
    pub status: DriverStatus,
    pub is_verified: bool,
    pub vehicle_class: VehicleClass,
    pub location: Option<GeoPoint>,
    pub current_ride_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    /// Online, verified and not already holding a ride.
    pub fn is_dispatchable(&self) -> bool {
        self.status == DriverStatus::Online && self.is_verified && self.current_ride_id.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DriverRegistration {
    pub display_name: String,
    pub vehicle_class: VehicleClass,
    #[serde(default)]
    pub is_verified: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PresenceUpdate {
    pub status: DriverStatus,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A driver selected for a ride-request broadcast.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Candidate {
    pub driver_id: String,
    pub distance_km: f64,
}
