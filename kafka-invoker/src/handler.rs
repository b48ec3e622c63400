use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{HandlerError, LoadError};
use crate::invocation::InvocationContext;

/// The event shape a function expects to be triggered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Message,
    Http,
    Schedule,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Message => write!(f, "message"),
            TriggerKind::Http => write!(f, "http"),
            TriggerKind::Schedule => write!(f, "schedule"),
        }
    }
}

/// A single-call capability: run the function once against one message.
///
/// Implementations receive their context by value and must not rely on state carried
/// over from previous calls.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: InvocationContext) -> Result<(), HandlerError>;
}

/// A loaded function, shared read-only by every invocation for the process lifetime.
#[derive(Clone)]
pub struct HandlerUnit {
    module: String,
    entrypoint: String,
    kind: TriggerKind,
    handler: Arc<dyn Handler>,
    bindings: Arc<BTreeMap<String, String>>,
}

impl HandlerUnit {
    pub fn new(
        module: &str,
        entrypoint: &str,
        kind: TriggerKind,
        handler: Arc<dyn Handler>,
        bindings: BTreeMap<String, String>,
    ) -> Self {
        Self {
            module: module.to_owned(),
            entrypoint: entrypoint.to_owned(),
            kind,
            handler,
            bindings: Arc::new(bindings),
        }
    }

    /// `module.entrypoint`, for logs.
    pub fn name(&self) -> String {
        format!("{}.{}", self.module, self.entrypoint)
    }

    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }

    pub fn bindings(&self) -> Arc<BTreeMap<String, String>> {
        self.bindings.clone()
    }
}

impl fmt::Debug for HandlerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerUnit")
            .field("module", &self.module)
            .field("entrypoint", &self.entrypoint)
            .field("kind", &self.kind)
            .field("bindings", &self.bindings)
            .finish()
    }
}

/// Produces a `HandlerUnit` from a module and entry point name.
pub trait HandlerLoader {
    fn load(
        &self,
        module: &str,
        entrypoint: &str,
        kind: TriggerKind,
    ) -> Result<HandlerUnit, LoadError>;
}
