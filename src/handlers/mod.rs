// src/handlers/mod.rs
pub mod auth;
pub mod driver_handler;
pub mod ride_handler;

use axum::{
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "sparrow-dispatch" }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rides/estimate", post(ride_handler::estimate))
        .route("/rides", get(ride_handler::list_mine).post(ride_handler::create_ride))
        .route("/rides/:id", get(ride_handler::get_ride))
        .route("/rides/:id/accept", post(ride_handler::accept))
        .route("/rides/:id/arriving", post(ride_handler::arriving))
        .route("/rides/:id/arrived", post(ride_handler::arrived))
        .route("/rides/:id/start", post(ride_handler::start))
        .route("/rides/:id/complete", post(ride_handler::complete))
        .route("/rides/:id/cancel", post(ride_handler::cancel))
        .route("/rides/:id/rating", post(ride_handler::rate))
        .route("/rides/:id/tip", post(ride_handler::tip))
        .route("/rides/:id/client-rating", post(ride_handler::rate_client))
        .route("/drivers", post(driver_handler::register_driver))
        .route("/drivers/me", get(driver_handler::get_me))
        .route("/drivers/me/presence", put(driver_handler::update_presence))
        .route("/dispatch/rebroadcast", post(ride_handler::rebroadcast))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::auth::{CALLER_ID_HEADER, CALLER_ROLE_HEADER};
    use crate::state::AppConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    const CLIENT: &str = "cli-251017-a1b2c";

    async fn app() -> Router {
        let state = AppState::new(AppConfig::default()).await.unwrap();
        router(Arc::new(state))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        caller: Option<(&str, &str)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = caller {
            builder = builder.header(CALLER_ID_HEADER, id).header(CALLER_ROLE_HEADER, role);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, value)
    }

    fn ride_body() -> Value {
        json!({
            "pickup": { "latitude": 30.0444, "longitude": 31.2357, "address": "Tahrir Square" },
            "dropoff": { "latitude": 30.0626, "longitude": 31.2497, "address": "Ramses Station" },
            "vehicle_class": "economy",
            "payment_method": "cash"
        })
    }

    async fn register_driver(app: &Router) -> String {
        let (status, driver) = call(
            app,
            "POST",
            "/drivers",
            Some(("system", "system")),
            Some(json!({ "display_name": "Sami", "vehicle_class": "economy", "is_verified": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = driver["id"].as_str().unwrap().to_string();

        let (status, driver) = call(
            app,
            "PUT",
            "/drivers/me/presence",
            Some((id.as_str(), "driver")),
            Some(json!({ "status": "online", "latitude": 30.045, "longitude": 31.2357 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(driver["status"], "online");
        id
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app().await, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_caller_is_unauthorized_and_bilingual() {
        let (status, body) = call(&app().await, "POST", "/rides", None, Some(ride_body())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
        assert!(!body["message_ar"].as_str().unwrap().is_empty());
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_ride_flow_over_http() {
        let app = app().await;
        let first = register_driver(&app).await;
        let second = register_driver(&app).await;

        let (status, ride) = call(&app, "POST", "/rides", Some((CLIENT, "client")), Some(ride_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(ride["status"], "searching");
        let ride_id = ride["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, "GET", &format!("/rides/{}", ride_id), Some(("cli-251017-zzzzz", "client")), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let accept = format!("/rides/{}/accept", ride_id);
        let (status, accepted) = call(&app, "POST", &accept, Some((first.as_str(), "driver")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["driver_id"], first.as_str());

        let (status, body) = call(&app, "POST", &accept, Some((second.as_str(), "driver")), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "ride_already_accepted");

        let (status, body) = call(&app, "POST", &format!("/rides/{}/start", ride_id), Some((first.as_str(), "driver")), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_transition");
        assert_eq!(body["details"]["current_status"], "accepted");

        for step in ["arriving", "arrived", "start"] {
            let (status, _) = call(&app, "POST", &format!("/rides/{}/{}", ride_id, step), Some((first.as_str(), "driver")), None).await;
            assert_eq!(status, StatusCode::OK, "{}", step);
        }

        let (status, body) = call(
            &app,
            "POST",
            &format!("/rides/{}/complete", ride_id),
            Some((first.as_str(), "driver")),
            Some(json!({ "actual_distance_m": "52OO", "actual_duration_s": 920 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");
        let (_, still_riding) = call(&app, "GET", &format!("/rides/{}", ride_id), Some((CLIENT, "client")), None).await;
        assert_eq!(still_riding["status"], "in_progress");

        let (status, done) = call(
            &app,
            "POST",
            &format!("/rides/{}/complete", ride_id),
            Some((first.as_str(), "driver")),
            Some(json!({ "actual_distance_m": 5200, "actual_duration_s": 920 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["status"], "completed");
        assert_eq!(done["actual_distance_m"], 5200);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/rides/{}/tip", ride_id),
            Some((CLIENT, "client")),
            Some(json!({ "amount": 20 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, mine) = call(&app, "GET", "/rides", Some((CLIENT, "client")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(mine.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_input_is_rejected() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/rides/not-a-ride", Some((CLIENT, "client")), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation_failed");

        let (status, _) = call(&app, "POST", "/drivers", Some((CLIENT, "client")), Some(json!({ "display_name": "x", "vehicle_class": "xl" }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, summary) = call(&app, "POST", "/dispatch/rebroadcast", Some(("system", "system")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["rides_considered"], 0);
    }
}
