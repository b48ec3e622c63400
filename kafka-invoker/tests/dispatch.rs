use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use health::HealthRegistry;
use http_body_util::BodyExt;
use rdkafka::error::KafkaError;
use tower::ServiceExt;

use kafka_invoker::consumer::{Message, MessageSource};
use kafka_invoker::dispatch::{Dispatcher, Outcome};
use kafka_invoker::error::{HandlerError, InvocationError, TransportError};
use kafka_invoker::handler::Handler;
use kafka_invoker::invocation::InvocationContext;
use kafka_invoker::metrics::InvocationMetrics;
use kafka_invoker::sandbox::Sandbox;
use kafka_invoker::server::router;

mod common;
use common::*;

fn dispatcher(
    messages: Vec<Message>,
    handler: impl Handler + 'static,
    timeout: Duration,
) -> (Dispatcher<MemorySource>, InvocationMetrics) {
    let metrics = InvocationMetrics::new().unwrap();
    let dispatcher = Dispatcher::new(
        MemorySource::new(messages),
        unit(handler),
        Sandbox::new(timeout),
        metrics.clone(),
    );
    (dispatcher, metrics)
}

#[tokio::test]
async fn successful_invocations_are_counted_and_timed() {
    let messages = (0..3).map(|i| message("orders", i, "{}")).collect();
    let (dispatcher, metrics) = dispatcher(
        messages,
        Sleeps(Duration::from_millis(10)),
        Duration::from_secs(3),
    );

    dispatcher.run().await.unwrap();

    let rendered = metrics.render();
    assert_eq!(metric(&rendered, r#"calls_total{topic="orders"}"#), Some(3.0));
    assert_eq!(metric(&rendered, r#"errors_total{topic="orders"}"#), Some(0.0));
    assert_eq!(
        metric(&rendered, r#"duration_seconds_count{topic="orders"}"#),
        Some(3.0)
    );
    assert_eq!(
        metric(&rendered, r#"duration_seconds_bucket{topic="orders",le="0.005"}"#),
        Some(0.0)
    );
    let sum = metric(&rendered, r#"duration_seconds_sum{topic="orders"}"#).unwrap();
    assert!((0.03..1.0).contains(&sum), "unexpected duration sum {sum}");

    assert_eq!(
        dispatcher.source().committed(),
        vec![
            ("orders".to_owned(), 0, 0),
            ("orders".to_owned(), 0, 1),
            ("orders".to_owned(), 0, 2),
        ]
    );
}

#[tokio::test]
async fn throwing_handler_is_counted_and_metrics_stay_available() {
    let (dispatcher, metrics) = dispatcher(vec![], Throws, Duration::from_secs(3));

    let outcome = dispatcher.dispatch(&message("orders", 0, "{}")).await;

    let error = match outcome {
        Outcome::Failed { error, .. } => error,
        other => panic!("expected a failure, got {other:?}"),
    };
    assert!(matches!(error, InvocationError::Runtime(_)));
    assert_eq!(error.trace(), Some(TYPE_ERROR_TRACE));

    let app = router(HealthRegistry::new("liveness"), metrics);
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let rendered = String::from_utf8(body.to_vec()).unwrap();
    assert_eq!(metric(&rendered, r#"calls_total{topic="orders"}"#), Some(1.0));
    assert_eq!(metric(&rendered, r#"errors_total{topic="orders"}"#), Some(1.0));
    assert_eq!(
        metric(&rendered, r#"duration_seconds_count{topic="orders"}"#),
        Some(1.0)
    );
}

#[tokio::test]
async fn hanging_handler_times_out_and_dispatch_moves_on() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (dispatcher, metrics) = dispatcher(
        vec![message("orders", 0, "hang"), message("orders", 1, "ok")],
        Scripted {
            calls: calls.clone(),
        },
        Duration::from_secs(1),
    );

    let start = Instant::now();
    dispatcher.run().await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let rendered = metrics.render();
    assert_eq!(metric(&rendered, r#"calls_total{topic="orders"}"#), Some(2.0));
    assert_eq!(metric(&rendered, r#"errors_total{topic="orders"}"#), Some(1.0));
    assert_eq!(
        metric(&rendered, r#"duration_seconds_count{topic="orders"}"#),
        Some(2.0)
    );
    assert_eq!(dispatcher.source().committed().len(), 2);
}

#[tokio::test]
async fn liveness_outlasts_its_deadline_during_long_invocations() {
    let liveness = HealthRegistry::new("liveness");
    let kafka = liveness.register("kafka", Duration::from_millis(300));
    kafka.report_healthy();

    let (dispatcher, metrics) = dispatcher(
        vec![message("orders", 0, "{}")],
        Sleeps(Duration::from_millis(1500)),
        Duration::from_secs(3),
    );
    let dispatcher = dispatcher.with_liveness(kafka);
    let app = router(liveness, metrics);

    let dispatching = tokio::spawn(async move { dispatcher.run().await });

    // three deadlines go by while the handler is still running
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(350)).await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert!(!dispatching.is_finished());

    dispatching.await.unwrap().unwrap();
}

#[tokio::test]
async fn liveness_expires_without_a_reporter() {
    let liveness = HealthRegistry::new("liveness");
    liveness
        .register("kafka", Duration::from_millis(300))
        .report_healthy();

    let (dispatcher, metrics) = dispatcher(
        vec![message("orders", 0, "{}")],
        Sleeps(Duration::from_millis(800)),
        Duration::from_secs(3),
    );
    let app = router(liveness, metrics);

    let dispatching = tokio::spawn(async move { dispatcher.run().await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    dispatching.await.unwrap().unwrap();
}

#[tokio::test]
async fn failures_are_logged_with_their_trace_and_timeouts_apart() {
    let logs = Logs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(logs.clone())
        .finish();
    let _subscriber = tracing::subscriber::set_default(subscriber);

    let (throwing, _metrics) = dispatcher(vec![], Throws, Duration::from_secs(1));
    throwing.dispatch(&message("orders", 0, "{}")).await;

    let logged = logs.take();
    assert!(logged.contains("Function failed to execute"), "{logged}");
    assert!(logged.contains(TYPE_ERROR_TRACE), "{logged}");
    assert!(!logged.contains("Function timed out"), "{logged}");

    let calls = Arc::new(AtomicUsize::new(0));
    let (hanging, _metrics) = dispatcher(vec![], Scripted { calls }, Duration::from_millis(200));
    hanging.dispatch(&message("orders", 1, "hang")).await;

    let logged = logs.take();
    assert!(logged.contains("Function timed out"), "{logged}");
    assert!(!logged.contains("Function failed to execute"), "{logged}");
}

#[tokio::test]
async fn every_failure_kind_is_contained() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (dispatcher, metrics) = dispatcher(
        vec![
            message("orders", 0, "ok"),
            message("orders", 1, "fail"),
            message("orders", 2, "panic"),
            message("orders", 3, "report"),
            message("orders", 4, "hang"),
            message("orders", 5, "ok"),
        ],
        Scripted {
            calls: calls.clone(),
        },
        Duration::from_secs(1),
    );

    dispatcher.run().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 6);
    let rendered = metrics.render();
    assert_eq!(metric(&rendered, r#"calls_total{topic="orders"}"#), Some(6.0));
    assert_eq!(metric(&rendered, r#"errors_total{topic="orders"}"#), Some(4.0));
    assert_eq!(
        metric(&rendered, r#"duration_seconds_count{topic="orders"}"#),
        Some(6.0)
    );
    let offsets: Vec<i64> = dispatcher
        .source()
        .committed()
        .into_iter()
        .map(|(_, _, offset)| offset)
        .collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn outcomes_are_independent_between_messages() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (dispatcher, _metrics) = dispatcher(
        vec![],
        Scripted { calls },
        Duration::from_secs(1),
    );

    let failed = dispatcher.dispatch(&message("orders", 0, "fail")).await;
    let panicked = dispatcher.dispatch(&message("orders", 1, "panic")).await;
    let succeeded = dispatcher.dispatch(&message("orders", 2, "ok")).await;
    let reported = dispatcher.dispatch(&message("orders", 3, "report")).await;

    assert!(!failed.is_success());
    assert!(matches!(
        panicked,
        Outcome::Failed {
            error: InvocationError::Panicked { .. },
            ..
        }
    ));
    assert!(succeeded.is_success());
    assert!(matches!(
        reported,
        Outcome::Failed {
            error: InvocationError::Runtime(_),
            ..
        }
    ));
}

/// Keeps its context alive in a detached task and uses it after the call returned.
struct Leaks;

#[async_trait]
impl Handler for Leaks {
    async fn call(&self, ctx: InvocationContext) -> Result<(), HandlerError> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.report_failure(HandlerError::new("reported after the call returned"));
            ctx.end();
        });
        Ok(())
    }
}

#[tokio::test]
async fn leaked_contexts_cannot_touch_later_metrics() {
    let (dispatcher, metrics) = dispatcher(
        vec![message("orders", 0, "{}"), message("orders", 1, "{}")],
        Leaks,
        Duration::from_secs(1),
    );

    dispatcher.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let rendered = metrics.render();
    assert_eq!(metric(&rendered, r#"calls_total{topic="orders"}"#), Some(2.0));
    assert_eq!(metric(&rendered, r#"errors_total{topic="orders"}"#), Some(0.0));
    assert_eq!(
        metric(&rendered, r#"duration_seconds_count{topic="orders"}"#),
        Some(2.0)
    );
}

#[tokio::test]
async fn metrics_are_attributed_per_topic() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (dispatcher, metrics) = dispatcher(
        vec![
            message("orders", 0, "ok"),
            message("payments", 0, "fail"),
            message("orders", 1, "ok"),
        ],
        Scripted { calls },
        Duration::from_secs(1),
    );

    dispatcher.run().await.unwrap();

    let rendered = metrics.render();
    assert_eq!(metric(&rendered, r#"calls_total{topic="orders"}"#), Some(2.0));
    assert_eq!(metric(&rendered, r#"errors_total{topic="orders"}"#), Some(0.0));
    assert_eq!(metric(&rendered, r#"calls_total{topic="payments"}"#), Some(1.0));
    assert_eq!(metric(&rendered, r#"errors_total{topic="payments"}"#), Some(1.0));
}

#[tokio::test]
async fn shutdown_stops_before_the_next_message() {
    let (dispatcher, metrics) = dispatcher(
        vec![message("orders", 0, "{}")],
        Sleeps(Duration::from_millis(10)),
        Duration::from_secs(1),
    );

    dispatcher.run_until(std::future::ready(())).await.unwrap();

    assert!(dispatcher.source().committed().is_empty());
    assert_eq!(metric(&metrics.render(), r#"calls_total{topic="orders"}"#), None);
}

struct Disconnected;

#[async_trait]
impl MessageSource for Disconnected {
    async fn recv(&self) -> Result<Option<Message>, TransportError> {
        Err(KafkaError::Subscription("all brokers are down".to_owned()).into())
    }

    fn commit(&self, _message: &Message) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn transport_errors_end_dispatch() {
    let dispatcher = Dispatcher::new(
        Disconnected,
        unit(Sleeps(Duration::from_millis(10))),
        Sandbox::new(Duration::from_secs(1)),
        InvocationMetrics::new().unwrap(),
    );

    let result = dispatcher.run().await;
    assert!(matches!(result, Err(TransportError::Kafka(_))));
}
