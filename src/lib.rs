pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;


// Re-export commonly used types
pub use errors::{DispatchError, DispatchResult, ValidationError};
pub use services::policy::{Caller, Role};
pub use services::ride_service::{RideOperations, RideService};
