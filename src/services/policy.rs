// src/services/policy.rs
use serde::{Deserialize, Serialize};

use crate::errors::{DispatchError, DispatchResult};
use crate::models::ride::{Party, Ride};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Driver,
    System,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Some(Role::Client),
            "driver" => Some(Role::Driver),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// An authenticated principal acting on rides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn client(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: Role::Client }
    }

    pub fn driver(id: impl Into<String>) -> Self {
        Self { id: id.into(), role: Role::Driver }
    }

    pub fn system() -> Self {
        Self { id: "system".to_string(), role: Role::System }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Accept,
    Advance,
    Cancel,
    View,
    RateDriver,
    RateClient,
    Tip,
    Dispatch,
}

/// Checks a caller may perform `action` on `ride`. Creation and dispatch take no ride.
pub fn authorize(caller: &Caller, ride: Option<&Ride>, action: Action) -> DispatchResult<()> {
    let is_client = |ride: &Ride| caller.role == Role::Client && ride.client_id == caller.id;
    let is_driver = |ride: &Ride| {
        caller.role == Role::Driver && ride.driver_id.as_deref() == Some(caller.id.as_str())
    };

    let allowed = match (action, ride) {
        (Action::Create, _) => caller.role == Role::Client,
        (Action::Accept, _) => caller.role == Role::Driver,
        (Action::Dispatch, _) => caller.role == Role::System,
        (Action::Advance | Action::RateClient, Some(ride)) => is_driver(ride),
        (Action::Cancel, Some(ride)) => is_client(ride) || is_driver(ride),
        (Action::RateDriver | Action::Tip, Some(ride)) => is_client(ride),
        (Action::View, Some(ride)) => {
            caller.role == Role::System || is_client(ride) || is_driver(ride)
        }
        (_, None) => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(DispatchError::forbidden(format!(
            "{:?} {} may not {:?} this ride",
            caller.role, caller.id, action
        )))
    }
}

/// Which side of the ride a caller is on.
pub fn party_of(caller: &Caller) -> DispatchResult<Party> {
    match caller.role {
        Role::Client => Ok(Party::Client),
        Role::Driver => Ok(Party::Driver),
        Role::System => Err(DispatchError::forbidden("system callers are not a ride party")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ride_service::tests::sample_ride;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("Driver"), Some(Role::Driver));
        assert_eq!(Role::parse("admin"), None);
    }

    #[test]
    fn test_only_assigned_driver_advances() {
        let mut ride = sample_ride();
        ride.driver_id = Some("drv-251017-aaaaa".to_string());

        assert!(authorize(&Caller::driver("drv-251017-aaaaa"), Some(&ride), Action::Advance).is_ok());
        assert!(authorize(&Caller::driver("drv-251017-bbbbb"), Some(&ride), Action::Advance).is_err());
        assert!(authorize(&Caller::client(ride.client_id.clone()), Some(&ride), Action::Advance).is_err());
    }

    #[test]
    fn test_cancel_by_either_party() {
        let mut ride = sample_ride();
        assert!(authorize(&Caller::client(ride.client_id.clone()), Some(&ride), Action::Cancel).is_ok());
        assert!(authorize(&Caller::client("cli-251017-zzzzz"), Some(&ride), Action::Cancel).is_err());
        // No driver assigned yet
        assert!(authorize(&Caller::driver("drv-251017-aaaaa"), Some(&ride), Action::Cancel).is_err());

        ride.driver_id = Some("drv-251017-aaaaa".to_string());
        assert!(authorize(&Caller::driver("drv-251017-aaaaa"), Some(&ride), Action::Cancel).is_ok());
    }

    #[test]
    fn test_role_gates() {
        let ride = sample_ride();
        assert!(authorize(&Caller::client("c"), None, Action::Create).is_ok());
        assert!(authorize(&Caller::driver("d"), None, Action::Create).is_err());
        assert!(authorize(&Caller::driver("d"), Some(&ride), Action::Accept).is_ok());
        assert!(authorize(&Caller::client("c"), Some(&ride), Action::Accept).is_err());
        assert!(authorize(&Caller::system(), None, Action::Dispatch).is_ok());
        assert!(authorize(&Caller::system(), Some(&ride), Action::View).is_ok());
        assert!(party_of(&Caller::system()).is_err());
    }
}
