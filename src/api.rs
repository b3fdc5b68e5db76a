pub(crate) mod analyses;
pub(crate) mod health;

use axum::{
    Router,
    routing::{get, post},
};

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/ready", get(health::ready))
        .route("/health/live", get(health::live))
        .route("/v1/analyses", post(analyses::submit))
        .route("/v1/analyses/{job_id}", get(analyses::get_status))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
