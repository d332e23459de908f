// src/services/mod.rs
pub mod consumers;
pub mod driver_service;
pub mod event_service;
pub mod fare_service;
pub mod messaging_service;
pub mod policy;
pub mod ride_service;
pub mod ride_store;
pub mod route_service;
pub mod state_machine;
