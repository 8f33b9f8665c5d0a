use axum::{routing, Router};
use common_kafka::ReadinessGate;
use health::HealthRegistry;

/// Probes: ready once the consumer joined its group, live while rdkafka polls.
pub fn add_routes(router: Router, ready: ReadinessGate, liveness: HealthRegistry) -> Router {
    router
        .route("/", routing::get(index))
        .route(
            "/_readiness",
            routing::get(move || {
                let ready = ready.clone();
                async move { ready.check().await }
            }),
        )
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
}

pub async fn index() -> &'static str {
    "rolldice worker"
}
