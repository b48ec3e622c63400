#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing_subscriber::fmt::MakeWriter;

use kafka_invoker::consumer::{Message, MessageSource};
use kafka_invoker::error::{HandlerError, TransportError};
use kafka_invoker::handler::{Handler, HandlerUnit, TriggerKind};
use kafka_invoker::invocation::InvocationContext;

pub fn message(topic: &str, offset: i64, value: &'static str) -> Message {
    Message {
        topic: topic.to_owned(),
        partition: 0,
        offset,
        key: None,
        value: Bytes::from_static(value.as_bytes()),
        timestamp: None,
    }
}

/// Serves queued messages in order, then reports itself exhausted.
#[derive(Default)]
pub struct MemorySource {
    messages: Mutex<VecDeque<Message>>,
    committed: Mutex<Vec<(String, i32, i64)>>,
}

impl MemorySource {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages.into()),
            committed: Mutex::default(),
        }
    }

    pub fn committed(&self) -> Vec<(String, i32, i64)> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&self) -> Result<Option<Message>, TransportError> {
        Ok(self.messages.lock().unwrap().pop_front())
    }

    fn commit(&self, message: &Message) -> Result<(), TransportError> {
        self.committed.lock().unwrap().push((
            message.topic.clone(),
            message.partition,
            message.offset,
        ));
        Ok(())
    }
}

pub fn unit(handler: impl Handler + 'static) -> HandlerUnit {
    HandlerUnit::new(
        "orders",
        "handle",
        TriggerKind::Message,
        Arc::new(handler),
        BTreeMap::new(),
    )
}

/// Sleeps, then returns normally.
pub struct Sleeps(pub Duration);

#[async_trait]
impl Handler for Sleeps {
    async fn call(&self, _ctx: InvocationContext) -> Result<(), HandlerError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Always fails like a script throwing a TypeError.
pub struct Throws;

pub const TYPE_ERROR_TRACE: &str =
    "TypeError: Cannot read properties of undefined (reading 'id')\n    at handle (orders.js:2:24)";

#[async_trait]
impl Handler for Throws {
    async fn call(&self, _ctx: InvocationContext) -> Result<(), HandlerError> {
        Err(HandlerError::new("TypeError: Cannot read properties of undefined")
            .with_trace(TYPE_ERROR_TRACE))
    }
}

/// Behaviour chosen from the payload: `fail`, `panic`, `hang`, `report` or anything else
/// to succeed.
pub struct Scripted {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Handler for Scripted {
    async fn call(&self, ctx: InvocationContext) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match ctx.message_str() {
            Some("fail") => Err(HandlerError::new("failed on purpose")),
            Some("panic") => panic!("panicked on purpose"),
            Some("hang") => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            Some("report") => {
                ctx.report_failure(HandlerError::new("reported through the context"));
                ctx.end();
                Ok(())
            }
            _ => {
                ctx.end();
                Ok(())
            }
        }
    }
}

/// Value of one series in a Prometheus text rendering.
pub fn metric(rendered: &str, series: &str) -> Option<f64> {
    rendered
        .lines()
        .find_map(|line| line.strip_prefix(series)?.strip_prefix(' '))
        .and_then(|value| value.trim().parse().ok())
}

/// In-memory log sink for a `tracing_subscriber::fmt` subscriber.
#[derive(Clone, Default)]
pub struct Logs(Arc<Mutex<Vec<u8>>>);

impl Logs {
    /// Everything logged since the last call.
    pub fn take(&self) -> String {
        let written = std::mem::take(&mut *self.0.lock().unwrap());
        String::from_utf8(written).unwrap()
    }
}

impl std::io::Write for Logs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Logs {
    type Writer = Logs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
