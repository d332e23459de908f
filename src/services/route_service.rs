// src/services/route_service.rs
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing;

use crate::errors::DispatchError;
use crate::models::ride::Location;
use crate::utils::geo::haversine_km;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid coordinates for {0}")]
    InvalidCoordinates(&'static str),

    #[error("no route found")]
    NoRoute,

    #[error("route provider returned {0}")]
    Provider(String),

    #[error("route request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<RouteError> for DispatchError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::InvalidCoordinates(field) => {
                DispatchError::validation_error(field, "Latitude/longitude missing or out of range")
            }
            other => DispatchError::RouteUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSummary {
    pub distance_m: u64,
    pub duration_s: u64,
    pub polyline: Option<String>,
    /// Set when the summary came from the straight-line approximation.
    pub approximate: bool,
}

#[async_trait]
pub trait RouteResolver: Send + Sync {
    async fn resolve(
        &self,
        origin: &Location,
        destination: &Location,
        stops: &[Location],
    ) -> Result<RouteSummary, RouteError>;
}

fn check_points(origin: &Location, destination: &Location, stops: &[Location]) -> Result<(), RouteError> {
    if !origin.has_valid_coordinates() {
        return Err(RouteError::InvalidCoordinates("pickup"));
    }
    if !destination.has_valid_coordinates() {
        return Err(RouteError::InvalidCoordinates("dropoff"));
    }
    if stops.iter().any(|s| !s.has_valid_coordinates()) {
        return Err(RouteError::InvalidCoordinates("stops"));
    }
    Ok(())
}

/// Haversine legs with a detour factor, at an average urban speed.
#[derive(Debug, Clone)]
pub struct StraightLineResolver {
    pub detour_factor: f64,
    pub average_speed_kmh: f64,
}

impl Default for StraightLineResolver {
    fn default() -> Self {
        Self {
            detour_factor: 1.3,
            average_speed_kmh: 30.0,
        }
    }
}

impl StraightLineResolver {
    pub fn summarize(&self, points: &[&Location]) -> RouteSummary {
        let km: f64 = points
            .windows(2)
            .map(|leg| haversine_km(leg[0].latitude, leg[0].longitude, leg[1].latitude, leg[1].longitude))
            .sum::<f64>()
            * self.detour_factor;

        RouteSummary {
            distance_m: (km * 1000.0).round() as u64,
            duration_s: (km / self.average_speed_kmh * 3600.0).round() as u64,
            polyline: None,
            approximate: true,
        }
    }
}

#[async_trait]
impl RouteResolver for StraightLineResolver {
    async fn resolve(
        &self,
        origin: &Location,
        destination: &Location,
        stops: &[Location],
    ) -> Result<RouteSummary, RouteError> {
        check_points(origin, destination, stops)?;
        let mut points = Vec::with_capacity(stops.len() + 2);
        points.push(origin);
        points.extend(stops.iter());
        points.push(destination);
        Ok(self.summarize(&points))
    }
}

#[derive(Debug, Clone)]
pub struct DirectionsConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl DirectionsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://maps.googleapis.com/maps/api/directions/json".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    legs: Vec<DirectionsLeg>,
    overview_polyline: Option<Polyline>,
}

#[derive(Debug, Deserialize)]
struct DirectionsLeg {
    distance: Measure,
    duration: Measure,
}

#[derive(Debug, Deserialize)]
struct Measure {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct Polyline {
    points: String,
}

/// Google Directions API client.
pub struct GoogleDirectionsResolver {
    config: DirectionsConfig,
    client: reqwest::Client,
}

impl GoogleDirectionsResolver {
    pub fn new(config: DirectionsConfig) -> Result<Self, RouteError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn coord(location: &Location) -> String {
        format!("{},{}", location.latitude, location.longitude)
    }
}

#[async_trait]
impl RouteResolver for GoogleDirectionsResolver {
    async fn resolve(
        &self,
        origin: &Location,
        destination: &Location,
        stops: &[Location],
    ) -> Result<RouteSummary, RouteError> {
        check_points(origin, destination, stops)?;

        let mut query = vec![
            ("origin", Self::coord(origin)),
            ("destination", Self::coord(destination)),
            ("key", self.config.api_key.clone()),
        ];
        if !stops.is_empty() {
            let waypoints = stops.iter().map(Self::coord).collect::<Vec<_>>().join("|");
            query.push(("waypoints", waypoints));
        }

        tracing::debug!("Resolving route with {} stops", stops.len());

        let response: DirectionsResponse = self
            .client
            .get(&self.config.base_url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" | "NOT_FOUND" => return Err(RouteError::NoRoute),
            other => return Err(RouteError::Provider(other.to_string())),
        }

        let route = response.routes.into_iter().next().ok_or(RouteError::NoRoute)?;
        Ok(RouteSummary {
            distance_m: route.legs.iter().map(|l| l.distance.value).sum(),
            duration_s: route.legs.iter().map(|l| l.duration.value).sum(),
            polyline: route.overview_polyline.map(|p| p.points),
            approximate: false,
        })
    }
}

/// Tries the primary resolver, degrading to straight-line estimates when it fails.
pub struct FallbackRouteResolver {
    primary: Arc<dyn RouteResolver>,
    fallback: StraightLineResolver,
}

impl FallbackRouteResolver {
    pub fn new(primary: Arc<dyn RouteResolver>) -> Self {
        Self {
            primary,
            fallback: StraightLineResolver::default(),
        }
    }
}

#[async_trait]
impl RouteResolver for FallbackRouteResolver {
    async fn resolve(
        &self,
        origin: &Location,
        destination: &Location,
        stops: &[Location],
    ) -> Result<RouteSummary, RouteError> {
        match self.primary.resolve(origin, destination, stops).await {
            Ok(summary) => Ok(summary),
            Err(RouteError::InvalidCoordinates(field)) => Err(RouteError::InvalidCoordinates(field)),
            Err(err) => {
                tracing::warn!("Route provider failed ({}), using straight-line estimate", err);
                self.fallback.resolve(origin, destination, stops).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(latitude: f64, longitude: f64) -> Location {
        Location { latitude, longitude, address: String::new() }
    }

    struct Unavailable;

    #[async_trait]
    impl RouteResolver for Unavailable {
        async fn resolve(&self, _: &Location, _: &Location, _: &[Location]) -> Result<RouteSummary, RouteError> {
            Err(RouteError::Provider("OVER_QUERY_LIMIT".to_string()))
        }
    }

    #[tokio::test]
    async fn test_straight_line_includes_stops() {
        let resolver = StraightLineResolver::default();
        let direct = resolver.resolve(&at(0.0, 0.0), &at(0.0, 0.02), &[]).await.unwrap();
        let via = resolver.resolve(&at(0.0, 0.0), &at(0.0, 0.02), &[at(0.01, 0.01)]).await.unwrap();
        assert!(via.distance_m > direct.distance_m);
        assert!(direct.approximate);
        // 0.02 deg of longitude at the equator ~ 2.22 km, times detour
        assert!((direct.distance_m as i64 - 2891).abs() < 10, "got {}", direct.distance_m);
    }

    #[tokio::test]
    async fn test_rejects_bad_coordinates() {
        let resolver = StraightLineResolver::default();
        let err = resolver.resolve(&at(91.0, 0.0), &at(0.0, 0.0), &[]).await.unwrap_err();
        assert!(matches!(err, RouteError::InvalidCoordinates("pickup")));
        assert!(matches!(DispatchError::from(err), DispatchError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_fallback_degrades_on_provider_error() {
        let resolver = FallbackRouteResolver::new(Arc::new(Unavailable));
        let summary = resolver.resolve(&at(0.0, 0.0), &at(0.0, 0.02), &[]).await.unwrap();
        assert!(summary.approximate);
        assert!(summary.distance_m > 0);
    }

    #[test]
    fn test_provider_failure_is_retryable() {
        let err: DispatchError = RouteError::NoRoute.into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_directions_payload_parses() {
        let raw = r#"{
            "status": "OK",
            "routes": [{
                "legs": [
                    { "distance": { "value": 3000, "text": "3 km" }, "duration": { "value": 500, "text": "8 mins" } },
                    { "distance": { "value": 2000, "text": "2 km" }, "duration": { "value": 400, "text": "7 mins" } }
                ],
                "overview_polyline": { "points": "abc" }
            }]
        }"#;
        let parsed: DirectionsResponse = serde_json::from_str(raw).unwrap();
        let legs = &parsed.routes[0].legs;
        assert_eq!(legs.iter().map(|l| l.distance.value).sum::<u64>(), 5000);
        assert_eq!(parsed.routes[0].overview_polyline.as_ref().unwrap().points, "abc");
    }
}
