use std::time::Duration;

use axum::{routing, Json, Router};
use common_kafka::Publisher;
use health::HealthRegistry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::rolldice;

#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    pub publish_timeout: Duration,
    pub liveness: HealthRegistry,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    let liveness = state.liveness.clone();
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .route("/health", routing::get(health))
        .route(
            "/rolldice",
            routing::post(rolldice::post_rolldice).with_state(state),
        )
}

pub async fn index() -> &'static str {
    "rolldice api"
}

pub async fn health() -> Json<HealthResponse> {
    debug!("health check");
    Json(HealthResponse {
        status: "OK".to_owned(),
    })
}
