// src/handlers/ride_handler.rs
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::ride::{
        CancelRequest, CompleteRequest, EstimateRequest, FareQuote, RatingRequest, RebroadcastSummary, Ride,
        RideRequest, TipRequest,
    },
    services::{policy::Caller, ride_service::RideOperations},
    state::AppState,
};

type AppStateRef = State<Arc<AppState>>;

/// An empty body means defaults. Anything else must parse.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> DispatchResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| DispatchError::validation_error("body", e.to_string()))
}

pub async fn estimate(
    State(state): AppStateRef,
    _caller: Caller,
    Json(request): Json<EstimateRequest>,
) -> DispatchResult<Json<Vec<FareQuote>>> {
    Ok(Json(state.ride_service.estimate(request).await?))
}

pub async fn create_ride(
    State(state): AppStateRef,
    caller: Caller,
    Json(request): Json<RideRequest>,
) -> DispatchResult<(StatusCode, Json<Ride>)> {
    let ride = state.ride_service.create(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(ride)))
}

pub async fn list_mine(State(state): AppStateRef, caller: Caller) -> DispatchResult<Json<Vec<Ride>>> {
    Ok(Json(state.ride_service.list_mine(&caller).await?))
}

pub async fn get_ride(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<Ride>> {
    Ok(Json(state.ride_service.get(&caller, &ride_id).await?))
}

pub async fn accept(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<Ride>> {
    Ok(Json(state.ride_service.accept(&caller, &ride_id).await?))
}

pub async fn arriving(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<Ride>> {
    Ok(Json(state.ride_service.arriving(&caller, &ride_id).await?))
}

pub async fn arrived(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<Ride>> {
    Ok(Json(state.ride_service.arrived(&caller, &ride_id).await?))
}

pub async fn start(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
) -> DispatchResult<Json<Ride>> {
    Ok(Json(state.ride_service.start(&caller, &ride_id).await?))
}

// Body is optional: drivers without telemetry complete with the estimates
pub async fn complete(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
    body: Bytes,
) -> DispatchResult<Json<Ride>> {
    let request: CompleteRequest = optional_body(&body)?;
    Ok(Json(state.ride_service.complete(&caller, &ride_id, request).await?))
}

pub async fn cancel(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
    body: Bytes,
) -> DispatchResult<Json<Ride>> {
    let request: CancelRequest = optional_body(&body)?;
    Ok(Json(state.ride_service.cancel(&caller, &ride_id, request).await?))
}

pub async fn rate(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
    Json(request): Json<RatingRequest>,
) -> DispatchResult<Json<Ride>> {
    Ok(Json(state.ride_service.rate(&caller, &ride_id, request).await?))
}

pub async fn rate_client(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
    Json(request): Json<RatingRequest>,
) -> DispatchResult<Json<Ride>> {
    Ok(Json(state.ride_service.rate_client(&caller, &ride_id, request).await?))
}

pub async fn tip(
    State(state): AppStateRef,
    caller: Caller,
    Path(ride_id): Path<String>,
    Json(request): Json<TipRequest>,
) -> DispatchResult<Json<Ride>> {
    Ok(Json(state.ride_service.tip(&caller, &ride_id, request).await?))
}

pub async fn rebroadcast(State(state): AppStateRef, caller: Caller) -> DispatchResult<Json<RebroadcastSummary>> {
    Ok(Json(state.ride_service.rebroadcast_searching(&caller).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_uses_defaults() {
        let request: CompleteRequest = optional_body(&Bytes::new()).unwrap();
        assert!(request.actual_distance_m.is_none());

        let request: CancelRequest = optional_body(&Bytes::from_static(b" \n")).unwrap();
        assert!(request.reason.is_none());
    }

    #[test]
    fn test_malformed_body_is_rejected() {
        let bad_type = Bytes::from_static(br#"{"actual_distance_m":"52OO","actual_duration_s":920}"#);
        let result: DispatchResult<CompleteRequest> = optional_body(&bad_type);
        assert!(matches!(result, Err(DispatchError::ValidationFailed(_))));

        let bad_syntax = Bytes::from_static(br#"{"reason": "#);
        let result: DispatchResult<CancelRequest> = optional_body(&bad_syntax);
        assert!(matches!(result, Err(DispatchError::ValidationFailed(_))));

        let request: CancelRequest = optional_body(&Bytes::from_static(br#"{"reason":"changed plans"}"#)).unwrap();
        assert_eq!(request.reason.as_deref(), Some("changed plans"));
    }
}
