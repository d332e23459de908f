// src/handlers/driver_handler.rs
use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::driver::{Driver, DriverRegistration, PresenceUpdate},
    services::policy::{Caller, Role},
    state::AppState,
};

fn require(caller: &Caller, role: Role) -> DispatchResult<()> {
    if caller.role == role {
        Ok(())
    } else {
        Err(DispatchError::forbidden(format!("{:?} callers only", role)))
    }
}

pub async fn register_driver(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(registration): Json<DriverRegistration>,
) -> DispatchResult<(StatusCode, Json<Driver>)> {
    require(&caller, Role::System)?;
    let driver = state.driver_service.register_driver(registration).await?;
    Ok((StatusCode::CREATED, Json(driver)))
}

pub async fn get_me(State(state): State<Arc<AppState>>, caller: Caller) -> DispatchResult<Json<Driver>> {
    require(&caller, Role::Driver)?;
    Ok(Json(state.driver_service.get_driver(&caller.id).await?))
}

pub async fn update_presence(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(update): Json<PresenceUpdate>,
) -> DispatchResult<Json<Driver>> {
    require(&caller, Role::Driver)?;
    Ok(Json(state.driver_service.update_presence(&caller.id, update).await?))
}
