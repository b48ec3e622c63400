use std::any::Any;
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;

use tokio::task::JoinError;
use tracing::warn;

use crate::error::InvocationError;
use crate::handler::HandlerUnit;
use crate::invocation::InvocationContext;

/// Runs one handler call at a time under a wall-clock budget.
///
/// The call runs on its own task, so a panic is caught at the task boundary and a timeout
/// only has to stop waiting and abort the task. Tokio can only abort at an await point:
/// a handler that blocks its thread keeps running detached after its timeout has been
/// declared, and the caller moves on regardless.
#[derive(Debug, Clone, Copy)]
pub struct Sandbox {
    timeout: Duration,
}

type PanicSlot = Arc<Mutex<Option<String>>>;

tokio::task_local! {
    static PANIC_LOCATION: PanicSlot;
}

/// Chains a panic hook that records where a sandboxed call panicked. Panics outside of a
/// sandboxed call go straight to the previous hook.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let location = format!("at {location}");
                PANIC_LOCATION
                    .try_with(|slot| {
                        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(location);
                    })
                    .ok();
            }
            previous(info)
        }));
    });
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        install_panic_hook();
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn execute(
        &self,
        unit: &HandlerUnit,
        ctx: InvocationContext,
    ) -> Result<(), InvocationError> {
        let handler = unit.handler();
        let location = PanicSlot::default();
        let mut task = tokio::spawn(
            PANIC_LOCATION.scope(location.clone(), async move { handler.call(ctx).await }),
        );

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result.map_err(InvocationError::Runtime),
            Ok(Err(error)) => {
                let location = location
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                Err(join_error(error, location))
            }
            Err(_elapsed) => {
                task.abort();
                warn!(
                    "abandoned {} after {}s, it may still be running until its next await point",
                    unit.name(),
                    self.timeout.as_secs_f64()
                );
                Err(InvocationError::Timeout(self.timeout))
            }
        }
    }
}

fn join_error(error: JoinError, location: Option<String>) -> InvocationError {
    match error.try_into_panic() {
        Ok(payload) => InvocationError::Panicked {
            message: panic_message(payload),
            trace: location,
        },
        Err(_) => InvocationError::Cancelled,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic payload is not a string".to_owned()
    }
}
