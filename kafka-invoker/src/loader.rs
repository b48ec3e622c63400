use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HandlerError, LoadError};
use crate::handler::{Handler, HandlerLoader, HandlerUnit, TriggerKind};
use crate::invocation::InvocationContext;

fn ensure_message_trigger(
    module: &str,
    entrypoint: &str,
    kind: TriggerKind,
) -> Result<(), LoadError> {
    match kind {
        TriggerKind::Message => Ok(()),
        other => Err(LoadError::UnsupportedKind {
            module: module.to_owned(),
            entrypoint: entrypoint.to_owned(),
            kind: other.to_string(),
        }),
    }
}

/// Handlers compiled into the process, looked up by module and entry point.
#[derive(Default)]
pub struct RegistryLoader {
    handlers: HashMap<(String, String), Arc<dyn Handler>>,
    bindings: BTreeMap<String, String>,
}

impl RegistryLoader {
    pub fn new(bindings: BTreeMap<String, String>) -> Self {
        Self {
            handlers: HashMap::new(),
            bindings,
        }
    }

    /// A registry holding the handlers shipped with the invoker, under the `builtin` module.
    pub fn with_builtins(bindings: BTreeMap<String, String>) -> Self {
        Self::new(bindings).register("builtin", "echo", Arc::new(Echo))
    }

    pub fn register(mut self, module: &str, entrypoint: &str, handler: Arc<dyn Handler>) -> Self {
        self.handlers
            .insert((module.to_owned(), entrypoint.to_owned()), handler);
        self
    }
}

impl HandlerLoader for RegistryLoader {
    fn load(
        &self,
        module: &str,
        entrypoint: &str,
        kind: TriggerKind,
    ) -> Result<HandlerUnit, LoadError> {
        ensure_message_trigger(module, entrypoint, kind)?;

        let handler = self
            .handlers
            .get(&(module.to_owned(), entrypoint.to_owned()))
            .ok_or_else(|| LoadError::NotFound {
                module: module.to_owned(),
                entrypoint: entrypoint.to_owned(),
            })?;

        Ok(HandlerUnit::new(
            module,
            entrypoint,
            kind,
            handler.clone(),
            self.bindings.clone(),
        ))
    }
}

/// Logs every payload it receives.
pub struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn call(&self, ctx: InvocationContext) -> Result<(), HandlerError> {
        match ctx.message_str() {
            Some(text) => info!(topic = ctx.topic(), "{}", text),
            None => info!(topic = ctx.topic(), "{} bytes of binary payload", ctx.message().len()),
        }
        ctx.end();
        Ok(())
    }
}

/// Functions shipped as executables under a directory, one process per message.
pub struct ProcessLoader {
    directory: PathBuf,
    bindings: BTreeMap<String, String>,
}

impl ProcessLoader {
    pub fn new(directory: impl Into<PathBuf>, bindings: BTreeMap<String, String>) -> Self {
        Self {
            directory: directory.into(),
            bindings,
        }
    }
}

impl HandlerLoader for ProcessLoader {
    fn load(
        &self,
        module: &str,
        entrypoint: &str,
        kind: TriggerKind,
    ) -> Result<HandlerUnit, LoadError> {
        ensure_message_trigger(module, entrypoint, kind)?;

        let program = self.directory.join(module);
        let metadata = match std::fs::metadata(&program) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound {
                    module: module.to_owned(),
                    entrypoint: entrypoint.to_owned(),
                })
            }
            Err(error) => return Err(error.into()),
        };
        if !metadata.is_file() || !is_executable(&metadata) {
            return Err(LoadError::NotExecutable(program.display().to_string()));
        }

        let handler = ProcessHandler {
            program,
            entrypoint: entrypoint.to_owned(),
        };
        Ok(HandlerUnit::new(
            module,
            entrypoint,
            kind,
            Arc::new(handler),
            self.bindings.clone(),
        ))
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// Spawns the function executable with the entry point as its only argument and the payload
/// on stdin. The child is killed if the call is dropped before it exits.
pub struct ProcessHandler {
    program: PathBuf,
    entrypoint: String,
}

#[async_trait]
impl Handler for ProcessHandler {
    async fn call(&self, ctx: InvocationContext) -> Result<(), HandlerError> {
        let mut command = Command::new(&self.program);
        command
            .arg(&self.entrypoint)
            .env_clear()
            .envs(ctx.bindings())
            .env("KAFKA_TOPIC", ctx.topic())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        if let Some(key) = ctx.key().and_then(|key| std::str::from_utf8(key).ok()) {
            command.env("KAFKA_KEY", key);
        }

        let mut child = command.spawn().map_err(|error| {
            HandlerError::new(format!("failed to start {}", self.program.display()))
                .with_trace(error.to_string())
        })?;

        // stdin is fed while stdout and stderr are drained, the function may write before it reads
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(ctx.message()).await {
                    // the function does not have to read its input
                    Err(error) if error.kind() != std::io::ErrorKind::BrokenPipe => {
                        return Err(error);
                    }
                    _ => {}
                }
            }
            Ok(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        fed.map_err(|error| {
            HandlerError::new("failed to write message to function").with_trace(error.to_string())
        })?;
        let output = output.map_err(|error| {
            HandlerError::new("failed to wait for function").with_trace(error.to_string())
        })?;

        if !output.stdout.is_empty() {
            debug!("{}", String::from_utf8_lossy(&output.stdout).trim_end());
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(HandlerError::new(format!("function exited with {}", output.status))
                .with_trace(String::from_utf8_lossy(&output.stderr).trim_end()))
        }
    }
}
