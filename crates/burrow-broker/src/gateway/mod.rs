//! Public HTTP ingress.
//!
//! Normally sits behind a reverse proxy that forwards every request for a
//! tunnelled domain to `POST /proxy` (or any other path, which falls through
//! to the same handler) with `X-Forwarded-Host` set.

mod admin;
mod proxy;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use crate::registry::TunnelRegistry;
use crate::routing::DomainRouter;

pub use proxy::{extract_domain, is_valid_hostname};

/// Header naming which component produced a synthetic error response.
pub const ERROR_SOURCE_HEADER: &str = "x-error-source";

/// Header carrying the admin shared secret.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Gateway knobs.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub request_timeout: Duration,
    pub max_body_bytes: usize,
    pub admin_token: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_bytes: burrow_core::config::DEFAULT_MAX_BODY_BYTES,
            admin_token: None,
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn TunnelRegistry>,
    pub routes: Arc<dyn DomainRouter>,
    pub settings: GatewaySettings,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/proxy", post(proxy::proxy))
        .route("/admin/reload-routes", post(admin::reload_routes))
        .fallback(proxy::proxy)
        .with_state(state)
}

/// `GET /health`
async fn health() -> &'static str {
    "Broker OK"
}

/// JSON error body produced by the broker itself.
fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    let mut resp = (status, body.to_string()).into_response();
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    headers.insert(ERROR_SOURCE_HEADER, HeaderValue::from_static("broker"));
    resp
}
