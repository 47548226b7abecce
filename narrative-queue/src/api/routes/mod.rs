//! API route modules.
//!
//! Organizes routes by resource type.

pub mod batches;
pub mod checkup;
pub mod health;
pub mod logging;
pub mod progress;
pub mod providers;
pub mod queue;

use axum::Router;
use axum::http::{HeaderMap, header};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(queue::router())
        .merge(batches::router())
        .merge(providers::router())
        .merge(progress::router())
        .merge(checkup::router())
        .merge(logging::router())
        .merge(health::router())
        .with_state(state)
}

/// Check the `Authorization: Bearer <ADMIN_TOKEN>` header.
pub(crate) fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::forbidden("administrative routes are disabled"));
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match provided {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(ApiError::unauthorized("invalid admin token")),
        None => Err(ApiError::unauthorized("missing admin token")),
    }
}
