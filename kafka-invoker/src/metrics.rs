use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{
    BuildError, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};

pub const CALLS_TOTAL: &str = "calls_total";
pub const ERRORS_TOTAL: &str = "errors_total";
pub const DURATION_SECONDS: &str = "duration_seconds";
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUESTS_DURATION_SECONDS: &str = "http_requests_duration_seconds";
pub const KAFKA_CONSUMER_LAG: &str = "kafka_consumer_lag";

const EXPONENTIAL_SECONDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Per-topic invocation instruments, plus the HTTP and consumer instruments of the process.
///
/// The recorder is owned by this value rather than installed globally, so every clone
/// (dispatch loop, kafka context, HTTP server) records into, and renders from, the same
/// registry. Recording is infallible.
#[derive(Clone)]
pub struct InvocationMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl InvocationMetrics {
    pub fn new() -> Result<Self, BuildError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets(EXPONENTIAL_SECONDS)?
            .build_recorder();
        let handle = recorder.handle();

        let metrics = Self {
            inner: Arc::new(Inner { recorder, handle }),
        };
        metrics.with_recorder(|| {
            describe_counter!(CALLS_TOTAL, Unit::Count, "Number of function invocations");
            describe_counter!(
                ERRORS_TOTAL,
                Unit::Count,
                "Number of failed or timed out function invocations"
            );
            describe_histogram!(
                DURATION_SECONDS,
                Unit::Seconds,
                "Duration of function invocations"
            );
            describe_gauge!(
                KAFKA_CONSUMER_LAG,
                Unit::Count,
                "Number of messages behind the partition high watermark"
            );
        });
        Ok(metrics)
    }

    fn with_recorder<T>(&self, record: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(&self.inner.recorder, record)
    }

    /// Counts an invocation. The topic's error counter is registered at the same time
    /// so that it renders as zero until the first failure.
    pub fn record_call(&self, topic: &str) {
        self.with_recorder(|| {
            counter!(CALLS_TOTAL, "topic" => topic.to_owned()).increment(1);
            counter!(ERRORS_TOTAL, "topic" => topic.to_owned()).increment(0);
        })
    }

    pub fn record_error(&self, topic: &str) {
        self.with_recorder(|| counter!(ERRORS_TOTAL, "topic" => topic.to_owned()).increment(1))
    }

    pub fn record_duration(&self, topic: &str, elapsed: Duration) {
        self.with_recorder(|| {
            histogram!(DURATION_SECONDS, "topic" => topic.to_owned())
                .record(elapsed.as_secs_f64())
        })
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        let labels = [
            ("method", method.to_owned()),
            ("path", path.to_owned()),
            ("status", status.to_string()),
        ];
        self.with_recorder(|| {
            counter!(HTTP_REQUESTS_TOTAL, &labels).increment(1);
            histogram!(HTTP_REQUESTS_DURATION_SECONDS, &labels).record(elapsed.as_secs_f64());
        })
    }

    pub fn record_consumer_lag(&self, topic: &str, partition: i32, lag: i64) {
        self.with_recorder(|| {
            gauge!(KAFKA_CONSUMER_LAG,
                "topic" => topic.to_owned(),
                "partition" => partition.to_string(),
            )
            .set(lag as f64)
        })
    }

    /// Drains histogram samples into their buckets. Rendering does the same, so this only
    /// bounds memory between scrapes.
    pub fn run_upkeep(&self) {
        self.inner.handle.run_upkeep()
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render(&self) -> String {
        self.inner.handle.render()
    }
}
