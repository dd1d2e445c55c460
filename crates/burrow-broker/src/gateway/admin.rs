//! Administrative endpoints, guarded by a shared secret.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use super::{ADMIN_TOKEN_HEADER, AppState, error_response};

/// `POST /admin/reload-routes`
pub(super) async fn reload_routes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(state.settings.admin_token.as_deref(), &headers) {
        warn!("Rejected admin request with missing or wrong token");
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    match state.routes.reload() {
        Ok(count) => {
            info!(routes = count, "Routes reloaded via admin endpoint");
            Json(serde_json::json!({ "message": "Routes reloaded", "routes": count }))
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Route reload failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Route reload failed")
        }
    }
}

// No configured token means the admin surface is closed.
fn authorized(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected.filter(|t| !t.is_empty()) else {
        return false;
    };
    headers
        .get(ADMIN_TOKEN_HEADER)
        .is_some_and(|got| got.as_bytes().ct_eq(expected.as_bytes()).into())
}
