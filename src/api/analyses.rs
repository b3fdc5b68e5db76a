use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use tracing::error;

use crate::app::AppState;
use crate::models::AnalysisPayload;
use crate::pipeline::SubmitError;
use crate::store::{JobStore as _, StoreError};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub(crate) async fn submit(
    State(state): State<AppState>,
    Json(payload): Json<AnalysisPayload>,
) -> impl IntoResponse {
    match state.scheduler().submit(payload).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(error @ SubmitError::Store(_)) => {
            error!(error = %error, "submission failed to persist");
            let body = Json(ErrorResponse {
                error: "failed to persist job".to_string(),
            });
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
        Err(error) => {
            let body = Json(ErrorResponse {
                error: error.to_string(),
            });
            (StatusCode::BAD_REQUEST, body).into_response()
        }
    }
}

pub(crate) async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.store().get(&job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => {
            let body = Json(ErrorResponse {
                error: format!("job not found: {job_id}"),
            });
            (StatusCode::NOT_FOUND, body).into_response()
        }
        Err(error) => {
            let message = match &error {
                StoreError::NotFound(id) => format!("job not found: {id}"),
                _ => "failed to read job".to_string(),
            };
            error!(job_id, error = %error, "status read failed");
            let body = Json(ErrorResponse { error: message });
            (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
        }
    }
}
