//! Consume a Kafka topic and run a function against every message, under a timeout,
//! with per-topic call, error and latency metrics.
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod invocation;
pub mod loader;
pub mod metrics;
pub mod sandbox;
pub mod server;
