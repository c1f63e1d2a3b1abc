//! RPC handlers
//!
//! Both operations always answer 200 with a reply record; failures travel in
//! its `error` field. Only a body that is not a request at all is rejected at
//! the HTTP layer.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use eduseal::{DocumentService, SealReply, SealRequest, ValidateReply, ValidateRequest};
use tracing::debug;

pub type AppState = Arc<dyn DocumentService>;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn seal(State(service): State<AppState>, Json(request): Json<SealRequest>) -> Json<SealReply> {
    debug!("Seal request, transaction_id: {}", request.transaction_id);
    Json(service.seal(request).await)
}

pub async fn validate(
    State(service): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Json<ValidateReply> {
    debug!("Validate request");
    Json(service.validate(request).await)
}
