use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::error;

use crate::consumer::Message;
use crate::error::{HandlerError, InvocationError};
use crate::metrics::InvocationMetrics;

/// Bookkeeping for one message: owns the latency timer and the error report.
///
/// The timer stops at most once and the error is counted at most once, whichever of the
/// handler hooks or the dispatch loop gets there first. Once `finish` ran the record is
/// sealed and every later hook call is ignored.
pub struct Invocation {
    topic: String,
    partition: i32,
    offset: i64,
    metrics: InvocationMetrics,
    started: Instant,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    elapsed: Option<Duration>,
    failure: Option<InvocationError>,
    sealed: bool,
}

/// What was recorded for a message once its invocation is finished.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub elapsed: Duration,
    pub failure: Option<InvocationError>,
}

impl Invocation {
    /// Counts the call and starts the timer.
    pub fn start(metrics: &InvocationMetrics, message: &Message) -> Arc<Self> {
        metrics.record_call(&message.topic);
        Arc::new(Self {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            metrics: metrics.clone(),
            started: Instant::now(),
            state: Mutex::default(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops the timer and records the duration. Returns false if it was already stopped
    /// or the invocation is sealed.
    pub fn end(&self) -> bool {
        let mut state = self.state();
        if state.sealed {
            return false;
        }
        self.stop_timer(&mut state)
    }

    fn stop_timer(&self, state: &mut State) -> bool {
        if state.elapsed.is_some() {
            return false;
        }
        let elapsed = self.started.elapsed();
        self.metrics.record_duration(&self.topic, elapsed);
        state.elapsed = Some(elapsed);
        true
    }

    /// Counts and logs a failure. Returns false if a failure was already reported or the
    /// invocation is sealed.
    pub fn fail(&self, failure: InvocationError) -> bool {
        let mut state = self.state();
        if state.sealed || state.failure.is_some() {
            return false;
        }

        self.metrics.record_error(&self.topic);
        match (&failure, failure.trace()) {
            (InvocationError::Timeout(_), _) => error!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                "Function timed out: {}",
                failure
            ),
            (_, Some(trace)) => error!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                "Function failed to execute: {}\n{}",
                failure,
                trace
            ),
            (_, None) => error!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                "Function failed to execute: {}",
                failure
            ),
        }

        state.failure = Some(failure);
        true
    }

    pub fn has_failed(&self) -> bool {
        self.state().failure.is_some()
    }

    /// Stops the timer if the handler did not, and seals the record.
    pub fn finish(&self) -> Completion {
        let mut state = self.state();
        self.stop_timer(&mut state);
        state.sealed = true;
        Completion {
            elapsed: state.elapsed.unwrap_or_default(),
            failure: state.failure.clone(),
        }
    }
}

/// Everything a handler gets to see for one message. Built fresh for every call.
#[derive(Clone)]
pub struct InvocationContext {
    message: Bytes,
    topic: String,
    key: Option<Bytes>,
    bindings: Arc<BTreeMap<String, String>>,
    invocation: Arc<Invocation>,
}

impl InvocationContext {
    pub fn new(
        message: &Message,
        bindings: Arc<BTreeMap<String, String>>,
        invocation: Arc<Invocation>,
    ) -> Self {
        Self {
            message: message.value.clone(),
            topic: message.topic.clone(),
            key: message.key.clone(),
            bindings,
            invocation,
        }
    }

    /// The raw message payload.
    pub fn message(&self) -> &Bytes {
        &self.message
    }

    pub fn message_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.message).ok()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn binding(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).map(String::as_str)
    }

    pub fn bindings(&self) -> &BTreeMap<String, String> {
        &self.bindings
    }

    /// Marks the invocation as done, stopping its latency timer.
    pub fn end(&self) {
        self.invocation.end();
    }

    /// Reports the invocation as failed without returning an error.
    pub fn report_failure(&self, error: HandlerError) {
        self.invocation.fail(InvocationError::Runtime(error));
    }
}
