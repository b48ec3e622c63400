use std::future::Future;
use std::time::Duration;

use health::HealthHandle;
use tracing::{debug, info, warn};

use crate::consumer::{Message, MessageSource};
use crate::error::{InvocationError, TransportError};
use crate::handler::HandlerUnit;
use crate::invocation::{Invocation, InvocationContext};
use crate::metrics::InvocationMetrics;
use crate::sandbox::Sandbox;

/// How one message ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded { elapsed: Duration },
    Failed { elapsed: Duration, error: InvocationError },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }
}

/// Feeds every message of a source through the sandboxed function, one at a time.
///
/// Invocation failures are counted, logged and otherwise ignored. Only transport errors
/// end the loop.
pub struct Dispatcher<S> {
    source: S,
    unit: HandlerUnit,
    sandbox: Sandbox,
    metrics: InvocationMetrics,
    liveness: Option<HealthHandle>,
}

impl<S: MessageSource> Dispatcher<S> {
    pub fn new(source: S, unit: HandlerUnit, sandbox: Sandbox, metrics: InvocationMetrics) -> Self {
        Self {
            source,
            unit,
            sandbox,
            metrics,
            liveness: None,
        }
    }

    /// Keeps `liveness` reported while a message is being processed. The consumer cannot
    /// serve its own callbacks until the loop is back to receiving.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs a single message through the function and records its metrics.
    pub async fn dispatch(&self, message: &Message) -> Outcome {
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            timestamp = ?message.timestamp,
            "invoking {}",
            self.unit.name()
        );

        let invocation = Invocation::start(&self.metrics, message);
        let ctx = InvocationContext::new(message, self.unit.bindings(), invocation.clone());

        match self.sandbox.execute(&self.unit, ctx).await {
            Ok(()) => {
                invocation.end();
            }
            Err(error) => {
                invocation.fail(error);
            }
        }

        // also covers a failure reported through the context before an Ok return
        let completion = invocation.finish();
        match completion.failure {
            None => Outcome::Succeeded {
                elapsed: completion.elapsed,
            },
            Some(error) => Outcome::Failed {
                elapsed: completion.elapsed,
                error,
            },
        }
    }

    async fn dispatch_reporting_liveness(&self, message: &Message) -> Outcome {
        let Some(liveness) = &self.liveness else {
            return self.dispatch(message).await;
        };

        let dispatching = self.dispatch(message);
        tokio::pin!(dispatching);

        // first tick is immediate
        let period = (liveness.deadline() / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        loop {
            tokio::select! {
                outcome = &mut dispatching => return outcome,
                _ = heartbeat.tick() => liveness.report_healthy(),
            }
        }
    }

    /// Dispatches messages until the source is exhausted or fails.
    pub async fn run(&self) -> Result<(), TransportError> {
        self.run_until(std::future::pending()).await
    }

    /// Dispatches messages until the source is exhausted or fails, or `shutdown` resolves.
    /// A message already received is always processed before shutting down.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), TransportError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            "dispatching messages to {} with a {}s timeout",
            self.unit.name(),
            self.sandbox.timeout().as_secs_f64()
        );

        loop {
            let message = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping dispatch");
                    return Ok(());
                }
                received = self.source.recv() => match received? {
                    Some(message) => message,
                    None => {
                        info!("message source exhausted, stopping dispatch");
                        return Ok(());
                    }
                },
            };

            self.dispatch_reporting_liveness(&message).await;

            if let Err(error) = self.source.commit(&message) {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "failed to store offset, message may be redelivered: {}",
                    error
                );
            }
        }
    }
}
