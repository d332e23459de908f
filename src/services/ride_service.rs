// src/services/ride_service.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult, ValidationError},
    models::{
        events::RideEvent,
        ride::{
            CancelRequest, CompleteRequest, EstimateRequest, FareQuote, Location, Party, RatingRequest,
            RebroadcastSummary, Ride, RideRequest, RideStatus, TipRequest, VehicleClass,
        },
    },
    services::{
        driver_service::{DriverBroadcast, DriverService},
        event_service::EventFanout,
        fare_service::{calculate_fare, normalize_promo_code, FareInput, PricingConfig},
        policy::{authorize, party_of, Action, Caller},
        ride_store::{RideStore, UpdateOutcome},
        route_service::RouteResolver,
        state_machine::{self, Transition},
    },
    utils::id_generator::{IdGenerator, IdType},
};

const MAX_STOPS: usize = 5;
const MAX_REVIEW_CHARS: usize = 1000;

/// Pending rides older than this are assumed orphaned by a failed dispatch open.
const STALE_PENDING_SECS: i64 = 60;

#[async_trait]
pub trait RideOperations: Send + Sync {
    async fn estimate(&self, request: EstimateRequest) -> DispatchResult<Vec<FareQuote>>;
    async fn create(&self, caller: &Caller, request: RideRequest) -> DispatchResult<Ride>;
    async fn accept(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride>;
    async fn arriving(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride>;
    async fn arrived(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride>;
    async fn start(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride>;
    async fn complete(&self, caller: &Caller, ride_id: &str, request: CompleteRequest) -> DispatchResult<Ride>;
    async fn cancel(&self, caller: &Caller, ride_id: &str, request: CancelRequest) -> DispatchResult<Ride>;
    async fn rate(&self, caller: &Caller, ride_id: &str, request: RatingRequest) -> DispatchResult<Ride>;
    async fn rate_client(&self, caller: &Caller, ride_id: &str, request: RatingRequest) -> DispatchResult<Ride>;
    async fn tip(&self, caller: &Caller, ride_id: &str, request: TipRequest) -> DispatchResult<Ride>;
    async fn get(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride>;
    async fn list_mine(&self, caller: &Caller) -> DispatchResult<Vec<Ride>>;
    async fn rebroadcast_searching(&self, caller: &Caller) -> DispatchResult<RebroadcastSummary>;
}

pub struct RideService {
    store: Arc<dyn RideStore>,
    routes: Arc<dyn RouteResolver>,
    pricing: Arc<PricingConfig>,
    drivers: Arc<DriverService>,
    broadcast: Arc<DriverBroadcast>,
    fanout: Arc<EventFanout>,
}

/// Which post-ride field a write targets.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PostRide {
    DriverRating,
    ClientRating,
    Tip,
}

impl PostRide {
    fn action(&self) -> Action {
        match self {
            PostRide::DriverRating => Action::RateDriver,
            PostRide::ClientRating => Action::RateClient,
            PostRide::Tip => Action::Tip,
        }
    }

    fn field(&self) -> &'static str {
        match self {
            PostRide::DriverRating => "rating",
            PostRide::ClientRating => "client rating",
            PostRide::Tip => "tip",
        }
    }

    fn is_recorded(&self, ride: &Ride) -> bool {
        match self {
            PostRide::DriverRating => ride.rating.is_some(),
            PostRide::ClientRating => ride.client_rating.is_some(),
            PostRide::Tip => ride.tip.is_some(),
        }
    }
}

fn validate_ride_id(ride_id: &str) -> DispatchResult<()> {
    if IdGenerator::validate_id(ride_id, Some(IdType::Ride)) {
        Ok(())
    } else {
        Err(DispatchError::validation_error("ride_id", "Malformed ride id"))
    }
}

fn validate_itinerary(pickup: &Location, dropoff: &Location, stops: &[Location]) -> DispatchResult<()> {
    let mut errors = Vec::new();
    let mut check = |field: String, location: &Location| {
        if !location.has_valid_coordinates() {
            errors.push(ValidationError {
                field,
                message: "Latitude/longitude missing or out of range".to_string(),
            });
        }
    };

    check("pickup".to_string(), pickup);
    check("dropoff".to_string(), dropoff);
    for (i, stop) in stops.iter().enumerate() {
        check(format!("stops[{}]", i), stop);
    }

    if stops.len() > MAX_STOPS {
        errors.push(ValidationError {
            field: "stops".to_string(),
            message: format!("At most {} intermediate stops are allowed", MAX_STOPS),
        });
    }

    if errors.is_empty() { Ok(()) } else { Err(DispatchError::ValidationFailed(errors)) }
}

fn validate_rating(request: &RatingRequest) -> DispatchResult<()> {
    if !(1..=5).contains(&request.rating) {
        return Err(DispatchError::validation_error("rating", "Rating must be between 1 and 5"));
    }
    if request.review.as_ref().is_some_and(|r| r.chars().count() > MAX_REVIEW_CHARS) {
        return Err(DispatchError::validation_error("review", "Review is too long"));
    }
    Ok(())
}

fn non_negative(field: &str, value: Option<i64>) -> DispatchResult<Option<u64>> {
    match value {
        None => Ok(None),
        Some(v) if v >= 0 => Ok(Some(v as u64)),
        Some(_) => Err(DispatchError::validation_error(field, "Must not be negative")),
    }
}

impl RideService {
    pub fn new(
        store: Arc<dyn RideStore>,
        routes: Arc<dyn RouteResolver>,
        pricing: Arc<PricingConfig>,
        drivers: Arc<DriverService>,
        broadcast: Arc<DriverBroadcast>,
        fanout: Arc<EventFanout>,
    ) -> Self {
        Self { store, routes, pricing, drivers, broadcast, fanout }
    }

    pub fn pricing(&self) -> &PricingConfig {
        &self.pricing
    }

    /// Runs one lifecycle transition as a conditional update and publishes its events
    /// once committed.
    async fn transition(&self, caller: &Caller, ride_id: &str, transition: Transition) -> DispatchResult<Ride> {
        validate_ride_id(ride_id)?;

        let now = Utc::now();
        let pricing = self.pricing.as_ref();
        let mutation = |ride: &mut Ride| -> DispatchResult<()> {
            state_machine::apply(ride, &transition, caller, pricing, now)
        };

        let outcome = self
            .store
            .conditional_update(ride_id, transition.allowed_from(), &mutation)
            .await?;

        let ride = match outcome {
            UpdateOutcome::Applied(ride) => ride,
            UpdateOutcome::Rejected(current) => {
                let err = state_machine::rejection(&transition, &current, caller);
                tracing::info!("Rejected {:?} on ride {} ({}): {}", transition, ride_id, current.status, err);
                return Err(err);
            }
        };

        tracing::info!("Ride {} is now {} (by {:?} {})", ride.id, ride.status, caller.role, caller.id);
        self.fanout.publish_all(state_machine::events_for(&transition, &ride, now)).await;
        Ok(ride)
    }

    /// Moves a persisted pending ride to searching and broadcasts it.
    async fn open_for_dispatch(&self, ride_id: &str) -> DispatchResult<(Ride, usize)> {
        let ride = match self.transition(&Caller::system(), ride_id, Transition::OpenForDispatch).await {
            Ok(ride) => ride,
            // Someone else opened it first
            Err(DispatchError::InvalidTransition { .. }) => {
                return self
                    .store
                    .get(ride_id)
                    .await?
                    .map(|ride| (ride, 0))
                    .ok_or_else(|| DispatchError::ride_not_found(ride_id));
            }
            Err(e) => return Err(e),
        };
        let notified = self.broadcast_best_effort(&ride).await;
        Ok((ride, notified))
    }

    async fn broadcast_best_effort(&self, ride: &Ride) -> usize {
        match self.broadcast.broadcast(ride).await {
            Ok(notified) => notified.len(),
            Err(e) => {
                tracing::warn!("Broadcast for ride {} failed: {}", ride.id, e);
                0
            }
        }
    }

    /// Single-write post-ride update on a completed ride.
    async fn record_post_ride(
        &self,
        caller: &Caller,
        ride_id: &str,
        kind: PostRide,
        write: &(dyn Fn(&mut Ride) + Send + Sync),
    ) -> DispatchResult<Ride> {
        validate_ride_id(ride_id)?;

        let now = Utc::now();
        let mutation = |ride: &mut Ride| -> DispatchResult<()> {
            authorize(caller, Some(ride), kind.action())?;
            if kind.is_recorded(ride) {
                return Err(DispatchError::AlreadyRecorded {
                    ride_id: ride.id.clone(),
                    field: kind.field().to_string(),
                });
            }
            write(ride);
            ride.updated_at = now;
            Ok(())
        };

        match self
            .store
            .conditional_update(ride_id, &[RideStatus::Completed], &mutation)
            .await?
        {
            UpdateOutcome::Applied(ride) => {
                tracing::info!("Recorded {} on ride {}", kind.field(), ride.id);
                Ok(ride)
            }
            UpdateOutcome::Rejected(current) => {
                authorize(caller, Some(&current), kind.action())?;
                Err(DispatchError::InvalidTransition {
                    ride_id: current.id,
                    current: current.status,
                    attempted: RideStatus::Completed,
                })
            }
        }
    }

    async fn release_driver(&self, ride: &Ride) {
        if let Some(driver_id) = &ride.driver_id {
            if let Err(e) = self.drivers.mark_available(driver_id, &ride.id).await {
                tracing::warn!("Could not release driver {} from ride {}: {}", driver_id, ride.id, e);
            }
        }
    }

    fn quote(&self, class: VehicleClass, distance_m: u64, duration_s: u64) -> FareQuote {
        let surge_multiplier = self.pricing.surge_for(class);
        let estimated_fare = calculate_fare(
            &self.pricing,
            FareInput { distance_m, duration_s, vehicle_class: class, surge_multiplier, discount: 0 },
        );
        FareQuote {
            vehicle_class: class,
            estimated_fare,
            currency: self.pricing.currency.clone(),
            distance_m,
            duration_s,
            surge_multiplier,
        }
    }

    fn is_stale_pending(ride: &Ride, now: DateTime<Utc>) -> bool {
        ride.status == RideStatus::Pending && now - ride.created_at > Duration::seconds(STALE_PENDING_SECS)
    }
}

#[async_trait]
impl RideOperations for RideService {
    async fn estimate(&self, request: EstimateRequest) -> DispatchResult<Vec<FareQuote>> {
        validate_itinerary(&request.pickup, &request.dropoff, &request.stops)?;

        let classes: BTreeSet<VehicleClass> = if request.vehicle_classes.is_empty() {
            VehicleClass::ALL.into_iter().collect()
        } else {
            request.vehicle_classes.iter().map(|c| VehicleClass::parse_lossy(c)).collect()
        };

        let route = self
            .routes
            .resolve(&request.pickup, &request.dropoff, &request.stops)
            .await?;

        Ok(classes
            .into_iter()
            .map(|class| self.quote(class, route.distance_m, route.duration_s))
            .collect())
    }

    async fn create(&self, caller: &Caller, request: RideRequest) -> DispatchResult<Ride> {
        authorize(caller, None, Action::Create)?;
        validate_itinerary(&request.pickup, &request.dropoff, &request.stops)?;

        let promo_code = request
            .promo_code
            .as_deref()
            .map(normalize_promo_code)
            .filter(|c| !c.is_empty());
        let discount = match &promo_code {
            Some(code) => self
                .pricing
                .promo_discount(code)
                .ok_or_else(|| DispatchError::validation_error("promo_code", "Unknown promo code"))?,
            None => 0,
        };

        let vehicle_class = VehicleClass::parse_lossy(&request.vehicle_class);
        tracing::info!("Creating {} ride for client {}", vehicle_class, caller.id);

        // Nothing is stored until the route and fare are known
        let route = self
            .routes
            .resolve(&request.pickup, &request.dropoff, &request.stops)
            .await?;
        if route.approximate {
            tracing::debug!("Ride for client {} priced on an approximate route", caller.id);
        }

        let surge_multiplier = self.pricing.surge_for(vehicle_class);
        let estimated_fare = calculate_fare(
            &self.pricing,
            FareInput {
                distance_m: route.distance_m,
                duration_s: route.duration_s,
                vehicle_class,
                surge_multiplier,
                discount,
            },
        );

        let now = Utc::now();
        let ride = Ride {
            id: IdGenerator::generate_with_timestamp(IdType::Ride, now),
            client_id: caller.id.clone(),
            driver_id: None,
            status: RideStatus::Pending,
            pickup: request.pickup,
            dropoff: request.dropoff,
            stops: request.stops,
            route_polyline: route.polyline,
            vehicle_class,
            payment_method: request.payment_method,
            promo_code,
            discount,
            surge_multiplier,
            currency: self.pricing.currency.clone(),
            pricing_version: self.pricing.version,
            estimated_fare,
            actual_fare: None,
            estimated_distance_m: route.distance_m,
            estimated_duration_s: route.duration_s,
            actual_distance_m: None,
            actual_duration_s: None,
            created_at: now,
            searching_at: None,
            accepted_at: None,
            arriving_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancel_reason: None,
            rating: None,
            review: None,
            client_rating: None,
            client_review: None,
            tip: None,
            version: 0,
            updated_at: now,
        };

        self.store.put(&ride).await?;
        tracing::info!("Ride {} created with estimated fare {} {}", ride.id, ride.estimated_fare, ride.currency);

        // The ride is committed; a failed open is picked up by the next rebroadcast
        match self.open_for_dispatch(&ride.id).await {
            Ok((opened, _)) => Ok(opened),
            Err(e) => {
                tracing::warn!("Ride {} stored but not yet opened for dispatch: {}", ride.id, e);
                Ok(ride)
            }
        }
    }

    async fn accept(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride> {
        let ride = self.transition(caller, ride_id, Transition::Accept).await?;
        if let Err(e) = self.drivers.mark_on_ride(&caller.id, &ride.id).await {
            tracing::warn!("Could not mark driver {} on ride {}: {}", caller.id, ride.id, e);
        }
        Ok(ride)
    }

    async fn arriving(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride> {
        self.transition(caller, ride_id, Transition::Arriving).await
    }

    async fn arrived(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride> {
        self.transition(caller, ride_id, Transition::Arrived).await
    }

    async fn start(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride> {
        self.transition(caller, ride_id, Transition::Start).await
    }

    async fn complete(&self, caller: &Caller, ride_id: &str, request: CompleteRequest) -> DispatchResult<Ride> {
        let transition = Transition::Complete {
            actual_distance_m: non_negative("actual_distance_m", request.actual_distance_m)?,
            actual_duration_s: non_negative("actual_duration_s", request.actual_duration_s)?,
        };
        let ride = self.transition(caller, ride_id, transition).await?;
        self.release_driver(&ride).await;
        Ok(ride)
    }

    async fn cancel(&self, caller: &Caller, ride_id: &str, request: CancelRequest) -> DispatchResult<Ride> {
        let reason = request.reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        let ride = self.transition(caller, ride_id, Transition::Cancel { reason }).await?;
        self.release_driver(&ride).await;
        Ok(ride)
    }

    async fn rate(&self, caller: &Caller, ride_id: &str, request: RatingRequest) -> DispatchResult<Ride> {
        validate_rating(&request)?;
        let write = |ride: &mut Ride| {
            ride.rating = Some(request.rating);
            ride.review = request.review.clone();
        };
        let ride = self.record_post_ride(caller, ride_id, PostRide::DriverRating, &write).await?;

        self.fanout
            .publish_all(vec![RideEvent::RideRated {
                ride_id: ride.id.clone(),
                rated_by: Party::Client,
                rating: request.rating,
                occurred_at: ride.updated_at,
            }])
            .await;
        Ok(ride)
    }

    async fn rate_client(&self, caller: &Caller, ride_id: &str, request: RatingRequest) -> DispatchResult<Ride> {
        validate_rating(&request)?;
        let write = |ride: &mut Ride| {
            ride.client_rating = Some(request.rating);
            ride.client_review = request.review.clone();
        };
        let ride = self.record_post_ride(caller, ride_id, PostRide::ClientRating, &write).await?;

        self.fanout
            .publish_all(vec![RideEvent::RideRated {
                ride_id: ride.id.clone(),
                rated_by: Party::Driver,
                rating: request.rating,
                occurred_at: ride.updated_at,
            }])
            .await;
        Ok(ride)
    }

    async fn tip(&self, caller: &Caller, ride_id: &str, request: TipRequest) -> DispatchResult<Ride> {
        if request.amount <= 0 {
            return Err(DispatchError::validation_error("amount", "Tip must be a positive amount"));
        }
        let write = |ride: &mut Ride| {
            ride.tip = Some(request.amount);
        };
        let ride = self.record_post_ride(caller, ride_id, PostRide::Tip, &write).await?;

        self.fanout
            .publish_all(vec![RideEvent::TipAdded {
                ride_id: ride.id.clone(),
                client_id: ride.client_id.clone(),
                driver_id: ride.driver_id.clone().unwrap_or_default(),
                amount: request.amount,
                currency: ride.currency.clone(),
                idempotency_key: RideEvent::tip_key(&ride.id),
                occurred_at: ride.updated_at,
            }])
            .await;
        Ok(ride)
    }

    async fn get(&self, caller: &Caller, ride_id: &str) -> DispatchResult<Ride> {
        validate_ride_id(ride_id)?;
        let ride = self
            .store
            .get(ride_id)
            .await?
            .ok_or_else(|| DispatchError::ride_not_found(ride_id))?;
        authorize(caller, Some(&ride), Action::View)?;
        Ok(ride)
    }

    async fn list_mine(&self, caller: &Caller) -> DispatchResult<Vec<Ride>> {
        match party_of(caller)? {
            Party::Client => self.store.rides_for_client(&caller.id).await,
            Party::Driver => self.store.rides_for_driver(&caller.id).await,
        }
    }

    async fn rebroadcast_searching(&self, caller: &Caller) -> DispatchResult<RebroadcastSummary> {
        authorize(caller, None, Action::Dispatch)?;

        let now = Utc::now();
        let mut summary = RebroadcastSummary { rides_considered: 0, drivers_notified: 0 };
        // Listed first so rides opened below are not broadcast twice
        let searching = self.store.rides_in_status(RideStatus::Searching).await?;

        for ride in self.store.rides_in_status(RideStatus::Pending).await? {
            if !Self::is_stale_pending(&ride, now) {
                continue;
            }
            summary.rides_considered += 1;
            match self.open_for_dispatch(&ride.id).await {
                Ok((_, notified)) => summary.drivers_notified += notified,
                Err(e) => tracing::warn!("Could not open stale ride {}: {}", ride.id, e),
            }
        }

        for ride in searching {
            summary.rides_considered += 1;
            summary.drivers_notified += self.broadcast_best_effort(&ride).await;
        }

        tracing::info!(
            "Rebroadcast {} rides to {} drivers",
            summary.rides_considered, summary.drivers_notified
        );
        Ok(summary)
    }
}
