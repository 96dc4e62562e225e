//! API route handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use hflow_proxy::{HeaderRule, InterceptId};
use tracing::{debug, info};

use crate::error::{ApiError, Result};
use crate::models::{CreatedResponse, InterceptsResponse};
use crate::state::AdminState;

/// GET /api/intercepts - List installed intercepts.
pub async fn list_intercepts(State(state): State<AdminState>) -> Json<InterceptsResponse> {
    Json(InterceptsResponse {
        intercepts: state.registry.list(),
    })
}

/// POST /api/intercepts - Install a header rule.
pub async fn add_intercept(
    State(state): State<AdminState>,
    body: std::result::Result<Json<HeaderRule>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedResponse>)> {
    let Json(rule) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let label = rule.label.clone();

    let id = state.registry.add(rule.into_intercept()?);
    info!("installed intercept [{}] as {}", label, id);

    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

/// DELETE /api/intercepts/{id} - Remove an intercept. Unknown ids are not an error.
pub async fn remove_intercept(
    State(state): State<AdminState>,
    Path(id): Path<InterceptId>,
) -> StatusCode {
    if state.registry.remove(id) {
        info!("removed intercept {}", id);
    } else {
        debug!("intercept {} was not installed", id);
    }
    StatusCode::NO_CONTENT
}

/// GET /api/ca - Download the root certificate.
pub async fn root_certificate(State(state): State<AdminState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        state.ca.root_pem().to_string(),
    )
}
