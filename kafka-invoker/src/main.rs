//! Run a function against every message of a Kafka topic.
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use health::HealthRegistry;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_invoker::config::{Config, FunctionRuntime};
use kafka_invoker::consumer::{KafkaConsumer, KafkaContext};
use kafka_invoker::dispatch::Dispatcher;
use kafka_invoker::error::LoadError;
use kafka_invoker::handler::{HandlerLoader, HandlerUnit, TriggerKind};
use kafka_invoker::loader::{ProcessLoader, RegistryLoader};
use kafka_invoker::metrics::InvocationMetrics;
use kafka_invoker::sandbox::Sandbox;
use kafka_invoker::server::{router, serve};

const METRICS_UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

fn load_function(config: &Config) -> Result<HandlerUnit, LoadError> {
    let module = config.mod_name.as_str();
    let entrypoint = config.func_handler.as_str();

    match config.func_runtime {
        FunctionRuntime::Process => ProcessLoader::new(&config.func_dir, config.bindings()).load(
            module,
            entrypoint,
            TriggerKind::Message,
        ),
        FunctionRuntime::Builtin => RegistryLoader::with_builtins(config.bindings()).load(
            module,
            entrypoint,
            TriggerKind::Message,
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .boxed();
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().context("Invalid configuration")?;
    info!("Configuration loaded: {:?}", config);

    let metrics = InvocationMetrics::new().context("failed to build the metrics recorder")?;
    let liveness = HealthRegistry::new("liveness");

    let upkeep = metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(METRICS_UPKEEP_INTERVAL);
        loop {
            interval.tick().await;
            upkeep.run_upkeep();
        }
    });

    let unit = load_function(&config).context("failed to load the function")?;
    info!("loaded function {} for {} triggers", unit.name(), unit.kind());

    // fed by consumer statistics while idle, by the dispatcher while a message is processed
    let kafka_liveness = liveness.register("kafka", config.liveness_deadline.0);
    let consumer = KafkaConsumer::new(
        &config,
        KafkaContext::new(kafka_liveness.clone(), metrics.clone()),
    )
    .context("failed to create the kafka consumer")?;
    kafka_liveness.report_healthy();

    let bind = config.bind();
    let app = router(liveness, metrics.clone());
    let server = tokio::task::spawn(async move { serve(app, &bind).await });
    info!("serving /healthz and /metrics on {}", config.bind());

    let dispatcher = Dispatcher::new(
        consumer,
        unit,
        Sandbox::new(config.func_timeout.0),
        metrics,
    )
    .with_liveness(kafka_liveness);

    tokio::select! {
        result = dispatcher.run_until(shutdown_signal()) => {
            result.context("kafka consumer failed")?;
        }
        result = server => {
            result
                .context("http server task failed")?
                .context("http server failed")?;
        }
    }

    Ok(())
}
