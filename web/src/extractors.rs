//! Custom Axum extractors.
//!
//! - `CorrelationId`: the request's correlation ID
//! - `BearerToken`: the `Authorization: Bearer` credential, forwarded as-is
//!   to downstream services
//!
//! # Examples
//!
//! ```ignore
//! async fn dashboard(
//!     correlation_id: CorrelationId,
//!     token: BearerToken,
//! ) -> Result<Json<Dashboard>, AppError> {
//!     tracing::info!(correlation_id = %correlation_id, "Building dashboard");
//!     // forward token.header_value() to the user service ...
//! }
//! ```

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use std::fmt;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::CORRELATION_ID_HEADER;

/// Correlation ID for request tracing.
///
/// Uses the ID stored by [`correlation_id_layer`](crate::correlation_id_layer)
/// when installed, then the `X-Correlation-ID` header, and generates a UUID
/// v4 otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = parts.extensions.get::<Self>() {
            return Ok(*id);
        }

        let correlation_id = parts
            .headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        Ok(Self(correlation_id))
    }
}

/// Bearer credential from the `Authorization` header.
///
/// Rejects with 401 `"Access token required"` when the header is missing or
/// not a bearer token. Use `Option<BearerToken>` where authentication is
/// optional.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

impl BearerToken {
    /// The token without the scheme.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }

    /// `Bearer <token>`, ready to forward.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer)
            .map(|token| Self(token.to_string()))
            .ok_or_else(|| AppError::unauthorized("Access token required"))
    }
}

fn parse_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
