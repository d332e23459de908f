// src/handlers/auth.rs
//! Callers are authenticated by the gateway in front of this service, which forwards
//! the principal in two headers.
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
};

use crate::errors::DispatchError;
use crate::services::policy::{Caller, Role};

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const CALLER_ROLE_HEADER: &str = "x-caller-role";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = DispatchError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, CALLER_ID_HEADER)
            .ok_or_else(|| DispatchError::unauthorized("missing caller id"))?
            .to_string();
        let role = header(parts, CALLER_ROLE_HEADER)
            .and_then(Role::parse)
            .ok_or_else(|| DispatchError::unauthorized("missing or unknown caller role"))?;

        Ok(Caller { id, role })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(headers: &[(&str, &str)]) -> Result<Caller, DispatchError> {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Caller::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_caller_from_headers() {
        let caller = extract(&[(CALLER_ID_HEADER, "drv-251017-aaaaa"), (CALLER_ROLE_HEADER, "Driver")])
            .await
            .unwrap();
        assert_eq!(caller, Caller::driver("drv-251017-aaaaa"));
    }

    #[tokio::test]
    async fn test_missing_or_unknown_role_is_unauthorized() {
        let missing = extract(&[(CALLER_ROLE_HEADER, "client")]).await;
        assert!(matches!(missing, Err(DispatchError::Unauthorized(_))));

        let unknown = extract(&[(CALLER_ID_HEADER, "x"), (CALLER_ROLE_HEADER, "admin")]).await;
        assert!(matches!(unknown, Err(DispatchError::Unauthorized(_))));
    }
}
