use std::future::ready;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use health::HealthRegistry;

use crate::metrics::InvocationMetrics;

/// Liveness and metrics endpoints. Neither touches the dispatch path.
pub fn router(liveness: HealthRegistry, metrics: InvocationMetrics) -> Router {
    let registry = metrics.clone();

    Router::new()
        .route("/", get(index))
        .route("/healthz", get(move || ready(liveness.get_status())))
        .route("/metrics", get(move || ready(registry.render())))
        .layer(axum::middleware::from_fn_with_state(metrics, track_metrics))
}

pub async fn index() -> &'static str {
    "kafka-invoker"
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Middleware recording request counts and latencies into the invoker's registry.
pub async fn track_metrics(
    State(metrics): State<InvocationMetrics>,
    req: Request<Body>,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    metrics.record_http_request(
        method.as_str(),
        &path,
        response.status().as_u16(),
        start.elapsed(),
    );

    response
}
