use std::fmt;
use std::time;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Broker-side failures. These are fatal to the process.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// A failure raised by the function itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
    trace: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        HandlerError::new(error.to_string()).with_trace(format!("{error:?}"))
    }
}

/// Enumeration of the ways a single invocation can fail. None of these stop the dispatch loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("function raised an error: {0}")]
    Runtime(HandlerError),
    #[error("function panicked: {message}")]
    Panicked {
        message: String,
        /// Where the panic was raised, when it could be captured.
        trace: Option<String>,
    },
    #[error("function timed out after {}s", .0.as_secs_f64())]
    Timeout(time::Duration),
    #[error("function task was cancelled")]
    Cancelled,
}

impl InvocationError {
    /// The diagnostic trace to log alongside the error, if any.
    pub fn trace(&self) -> Option<&str> {
        match self {
            InvocationError::Runtime(error) => error.trace(),
            InvocationError::Panicked { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, InvocationError::Timeout(_))
    }
}

impl From<HandlerError> for InvocationError {
    fn from(error: HandlerError) -> Self {
        InvocationError::Runtime(error)
    }
}

/// Errors raised while turning a module and entry point into a `HandlerUnit`.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("function {module}.{entrypoint} was not found")]
    NotFound { module: String, entrypoint: String },
    #[error("function {module}.{entrypoint} cannot be triggered by {kind}")]
    UnsupportedKind {
        module: String,
        entrypoint: String,
        kind: String,
    },
    #[error("{0} is not an executable file")]
    NotExecutable(String),
    #[error("failed to inspect function file: {0}")]
    Io(#[from] std::io::Error),
}
