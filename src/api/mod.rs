pub mod error;
pub mod response;
pub mod v1;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::Config, controller::AppState};

pub fn router(state: AppState, cfg: &Config) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", v1::router(state))
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
                .layer(TimeoutLayer::new(Duration::from_secs(
                    cfg.server.request_timeout_secs,
                ))),
        )
        .layer(TraceLayer::new_for_http())
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
