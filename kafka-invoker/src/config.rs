use std::collections::BTreeMap;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    /// Overrides the hosts derived from the kubeless service and namespace.
    #[envconfig(from = "KAFKA_HOSTS")]
    pub kafka_hosts: Option<String>,

    #[envconfig(from = "KUBELESS_KAFKA_SVC", default = "kafka")]
    pub kafka_service: String,

    #[envconfig(from = "KUBELESS_KAFKA_NAMESPACE", default = "kubeless")]
    pub kafka_namespace: String,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub kafka_tls: bool,

    #[envconfig(from = "KAFKA_CONSUMER_OFFSET_RESET", default = "latest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(from = "KAFKA_CONSUMER_AUTO_COMMIT_INTERVAL_MS", default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    #[envconfig(from = "TOPIC_NAME")]
    pub topic_name: NonEmptyString,

    #[envconfig(from = "MOD_NAME")]
    pub mod_name: NonEmptyString,

    #[envconfig(from = "FUNC_HANDLER")]
    pub func_handler: NonEmptyString,

    #[envconfig(from = "FUNC_TIMEOUT", default = "3")]
    pub func_timeout: EnvSecondsDuration,

    #[envconfig(from = "FUNC_RUNTIME", default = "process")]
    pub func_runtime: FunctionRuntime,

    #[envconfig(from = "FUNC_DIR", default = "/kubeless")]
    pub func_dir: String,

    #[envconfig(from = "LIVENESS_DEADLINE", default = "30")]
    pub liveness_deadline: EnvSecondsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn kafka_hosts(&self) -> String {
        match &self.kafka_hosts {
            Some(hosts) if !hosts.is_empty() => hosts.clone(),
            _ => format!("{}.{}:9092", self.kafka_service, self.kafka_namespace),
        }
    }

    /// One consumer group per deployed function, so replicas share the topic partitions.
    pub fn consumer_group(&self) -> String {
        format!("{}{}", self.mod_name.as_str(), self.func_handler.as_str())
    }

    /// Environment handed to every invocation of the function.
    pub fn bindings(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("MOD_NAME".to_owned(), self.mod_name.0.clone()),
            ("FUNC_HANDLER".to_owned(), self.func_handler.0.clone()),
            (
                "FUNC_TIMEOUT".to_owned(),
                self.func_timeout.0.as_secs().to_string(),
            ),
            ("TOPIC_NAME".to_owned(), self.topic_name.0.clone()),
        ])
    }
}

/// A duration configured in whole, strictly positive seconds.
#[derive(Debug, Clone, Copy)]
pub struct EnvSecondsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecondsDurationError;

impl std::fmt::Display for ParseEnvSecondsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a positive number of seconds")
    }
}

impl FromStr for EnvSecondsDuration {
    type Err = ParseEnvSecondsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(ParseEnvSecondsDurationError),
            Ok(secs) => Ok(EnvSecondsDuration(time::Duration::from_secs(secs))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl std::fmt::Display for StringIsEmptyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "value must not be empty")
    }
}

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// How the function named by `MOD_NAME`/`FUNC_HANDLER` is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionRuntime {
    /// An executable under `FUNC_DIR`, spawned once per message.
    Process,
    /// A handler compiled into this binary.
    Builtin,
}

impl FromStr for FunctionRuntime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "process" => Ok(FunctionRuntime::Process),
            "builtin" => Ok(FunctionRuntime::Builtin),
            _ => Err(format!("unknown function runtime {s}, must be process or builtin")),
        }
    }
}
