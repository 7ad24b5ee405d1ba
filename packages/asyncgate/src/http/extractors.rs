//! Axum extractors for the two things every handler needs: the acting principal
//! (spec §4.6 `AuthResolver`) and the tenant it acts within (`TenantResolver`).
//!
//! Header names are the boundary's own convention — the core has no opinion on
//! how a caller authenticates (spec §1 Non-goal), so these are deliberately thin:
//! read a header, hand it to whichever resolver `AppState` was built with.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::contracts::AuthContext;

use super::AppState;

pub const PRINCIPAL_HEADER: &str = "x-asyncgate-principal";
pub const TENANT_HEADER: &str = "x-asyncgate-tenant";

/// The authenticated caller, resolved via `AppState::auth_resolver`.
pub struct Authenticated(pub AuthContext);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|v| v.to_str().ok());
        let ctx = state
            .auth_resolver
            .resolve(raw)
            .await
            .map_err(|e| super::error_response(&e))?;
        Ok(Authenticated(ctx))
    }
}

/// The tenant the request acts within, resolved via `AppState::tenant_resolver`.
pub struct ResolvedTenant(pub crate::common::entity_ids::TenantId);

impl FromRequestParts<AppState> for ResolvedTenant {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts.headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok());
        let tenant_id = state
            .tenant_resolver
            .resolve(raw)
            .await
            .map_err(|e| super::error_response(&e))?;
        Ok(ResolvedTenant(tenant_id))
    }
}

/// Malformed pagination query params (bad cursor, non-numeric limit) surface as a
/// plain 400 rather than the engine's error taxonomy, since they never reach the
/// engine.
pub fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": message.into() }))).into_response()
}
