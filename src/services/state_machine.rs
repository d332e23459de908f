// src/services/state_machine.rs
//! Ride lifecycle transitions.
//!
//! ```text
//! pending -> searching -> accepted -> arriving -> arrived -> in_progress -> completed
//!    \___________\___________\___________\___________\
//!                                                     -> cancelled
//! ```
//!
//! `apply` is pure: it validates and mutates a ride record in place and is run by the
//! ride store inside its conditional update, so the guard is evaluated against the
//! committed state. `events_for` derives the published events from the committed ride.
use chrono::{DateTime, Utc};

use crate::errors::{DispatchError, DispatchResult};
use crate::models::events::RideEvent;
use crate::models::ride::{Party, Ride, RideStatus};
use crate::services::fare_service::{calculate_fare, FareInput, PricingConfig};
use crate::services::policy::{authorize, party_of, Action, Caller};

const PRE_DISPATCH: &[RideStatus] = &[RideStatus::Pending, RideStatus::Searching];
const CANCELLABLE: &[RideStatus] = &[
    RideStatus::Pending,
    RideStatus::Searching,
    RideStatus::Accepted,
    RideStatus::Arriving,
    RideStatus::Arrived,
];

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    OpenForDispatch,
    Accept,
    Arriving,
    Arrived,
    Start,
    Complete { actual_distance_m: Option<u64>, actual_duration_s: Option<u64> },
    Cancel { reason: Option<String> },
}

impl Transition {
    pub fn target(&self) -> RideStatus {
        match self {
            Transition::OpenForDispatch => RideStatus::Searching,
            Transition::Accept => RideStatus::Accepted,
            Transition::Arriving => RideStatus::Arriving,
            Transition::Arrived => RideStatus::Arrived,
            Transition::Start => RideStatus::InProgress,
            Transition::Complete { .. } => RideStatus::Completed,
            Transition::Cancel { .. } => RideStatus::Cancelled,
        }
    }

    pub fn allowed_from(&self) -> &'static [RideStatus] {
        match self {
            Transition::OpenForDispatch => &[RideStatus::Pending],
            Transition::Accept => PRE_DISPATCH,
            Transition::Arriving => &[RideStatus::Accepted],
            Transition::Arrived => &[RideStatus::Arriving],
            Transition::Start => &[RideStatus::Arrived],
            Transition::Complete { .. } => &[RideStatus::InProgress],
            Transition::Cancel { .. } => CANCELLABLE,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Transition::OpenForDispatch => Action::Dispatch,
            Transition::Accept => Action::Accept,
            Transition::Cancel { .. } => Action::Cancel,
            _ => Action::Advance,
        }
    }
}

/// True when some transition leads from `from` to `to`.
pub fn is_legal(from: RideStatus, to: RideStatus) -> bool {
    let candidates = [
        Transition::OpenForDispatch,
        Transition::Accept,
        Transition::Arriving,
        Transition::Arrived,
        Transition::Start,
        Transition::Complete { actual_distance_m: None, actual_duration_s: None },
        Transition::Cancel { reason: None },
    ];
    candidates
        .iter()
        .any(|t| t.target() == to && t.allowed_from().contains(&from))
}

/// The error a caller sees when the ride is not in a state the transition accepts.
pub fn rejection(transition: &Transition, ride: &Ride, caller: &Caller) -> DispatchError {
    if let Err(err) = authorize(caller, Some(ride), transition.action()) {
        return err;
    }
    if *transition == Transition::Accept && ride.driver_id.is_some() && !ride.status.is_terminal() {
        return DispatchError::AlreadyAccepted { ride_id: ride.id.clone() };
    }
    DispatchError::InvalidTransition {
        ride_id: ride.id.clone(),
        current: ride.status,
        attempted: transition.target(),
    }
}

pub fn apply(
    ride: &mut Ride,
    transition: &Transition,
    caller: &Caller,
    pricing: &PricingConfig,
    now: DateTime<Utc>,
) -> DispatchResult<()> {
    if !transition.allowed_from().contains(&ride.status) {
        return Err(rejection(transition, ride, caller));
    }
    authorize(caller, Some(ride), transition.action())?;

    match transition {
        Transition::OpenForDispatch => {
            ride.searching_at.get_or_insert(now);
        }
        Transition::Accept => {
            if ride.driver_id.is_some() {
                return Err(DispatchError::AlreadyAccepted { ride_id: ride.id.clone() });
            }
            ride.driver_id = Some(caller.id.clone());
            ride.accepted_at.get_or_insert(now);
        }
        Transition::Arriving => {
            ride.arriving_at.get_or_insert(now);
        }
        Transition::Arrived => {
            ride.arrived_at.get_or_insert(now);
        }
        Transition::Start => {
            ride.started_at.get_or_insert(now);
        }
        Transition::Complete { actual_distance_m, actual_duration_s } => {
            let distance_m = actual_distance_m.unwrap_or(ride.estimated_distance_m);
            let duration_s = actual_duration_s.unwrap_or(ride.estimated_duration_s);

            if pricing.version != ride.pricing_version {
                tracing::debug!(
                    "Ride {} priced with table v{}, completing with v{}",
                    ride.id, ride.pricing_version, pricing.version
                );
            }

            // Surge and discount stay as frozen at creation
            let fare = calculate_fare(
                pricing,
                FareInput {
                    distance_m,
                    duration_s,
                    vehicle_class: ride.vehicle_class,
                    surge_multiplier: ride.surge_multiplier,
                    discount: ride.discount,
                },
            );

            ride.actual_distance_m = Some(distance_m);
            ride.actual_duration_s = Some(duration_s);
            ride.actual_fare = Some(fare);
            ride.completed_at.get_or_insert(now);
        }
        Transition::Cancel { reason } => {
            ride.cancelled_by = Some(party_of(caller)?);
            ride.cancel_reason = reason.clone();
            ride.cancelled_at.get_or_insert(now);
        }
    }

    ride.status = transition.target();
    ride.updated_at = now;
    Ok(())
}

/// Events for a committed transition, in publication order.
pub fn events_for(transition: &Transition, ride: &Ride, now: DateTime<Utc>) -> Vec<RideEvent> {
    let driver_id = ride.driver_id.clone().unwrap_or_default();
    let client_id = ride.client_id.clone();
    let ride_id = ride.id.clone();

    match transition {
        Transition::OpenForDispatch => vec![RideEvent::ride_requested(ride, now)],
        Transition::Accept => vec![RideEvent::RideAccepted { ride_id, client_id, driver_id, occurred_at: now }],
        Transition::Arriving => vec![RideEvent::DriverArriving { ride_id, client_id, driver_id, occurred_at: now }],
        Transition::Arrived => vec![RideEvent::DriverArrived { ride_id, client_id, driver_id, occurred_at: now }],
        Transition::Start => vec![RideEvent::RideStarted { ride_id, client_id, driver_id, occurred_at: now }],
        Transition::Complete { .. } => {
            let amount = ride.actual_fare.unwrap_or(ride.estimated_fare);
            vec![
                RideEvent::RideCompleted {
                    ride_id: ride_id.clone(),
                    client_id: client_id.clone(),
                    driver_id: driver_id.clone(),
                    actual_fare: amount,
                    currency: ride.currency.clone(),
                    actual_distance_m: ride.actual_distance_m.unwrap_or(ride.estimated_distance_m),
                    actual_duration_s: ride.actual_duration_s.unwrap_or(ride.estimated_duration_s),
                    occurred_at: now,
                },
                RideEvent::PaymentRequested {
                    idempotency_key: RideEvent::payment_key(&ride_id),
                    ride_id,
                    client_id,
                    driver_id,
                    amount,
                    currency: ride.currency.clone(),
                    payment_method: ride.payment_method,
                    occurred_at: now,
                },
            ]
        }
        Transition::Cancel { .. } => vec![RideEvent::RideCancelled {
            ride_id,
            client_id,
            driver_id: ride.driver_id.clone(),
            cancelled_by: ride.cancelled_by.unwrap_or(Party::Client),
            reason: ride.cancel_reason.clone(),
            occurred_at: now,
        }],
    }
}
