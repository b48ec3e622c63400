use async_trait::async_trait;
use bytes::Bytes;
use health::HealthHandle;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Message as _, Statistics};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::TransportError;
use crate::metrics::InvocationMetrics;

/// A message as delivered by the broker, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    /// Empty when the broker delivered no payload.
    pub value: Bytes,
    pub timestamp: Option<i64>,
}

/// Delivers messages one at a time and records progress once they are processed.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next message. `None` means the source is exhausted.
    async fn recv(&self) -> Result<Option<Message>, TransportError>;

    /// Marks the message as processed, to be covered by the next offset commit.
    fn commit(&self, message: &Message) -> Result<(), TransportError>;
}

pub struct KafkaContext {
    liveness: HealthHandle,
    metrics: InvocationMetrics,
}

impl KafkaContext {
    pub fn new(liveness: HealthHandle, metrics: InvocationMetrics) -> Self {
        Self { liveness, metrics }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, stats: Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        for (topic, topic_stats) in stats.topics {
            for (partition, partition_stats) in topic_stats.partitions {
                // librdkafka reports the internal UA partition as -1
                if partition < 0 || partition_stats.consumer_lag < 0 {
                    continue;
                }
                self.metrics
                    .record_consumer_lag(&topic, partition, partition_stats.consumer_lag);
            }
        }
    }
}

impl ConsumerContext for KafkaContext {}

/// Member of the function's consumer group, subscribed to a single topic.
///
/// Offsets are auto-committed, but only offsets explicitly stored through `commit` are
/// eligible, which keeps delivery at-least-once.
pub struct KafkaConsumer {
    consumer: StreamConsumer<KafkaContext>,
}

impl KafkaConsumer {
    pub fn new(config: &Config, context: KafkaContext) -> Result<Self, TransportError> {
        let group = config.consumer_group();
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.kafka_hosts())
            .set("group.id", &group)
            .set("statistics.interval.ms", "10000")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                config.kafka_consumer_auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset);

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer<KafkaContext> =
            client_config.create_with_context(context)?;
        consumer.subscribe(&[config.topic_name.as_str()])?;

        info!(
            "joined consumer group {} on topic {} via {}",
            group,
            config.topic_name.as_str(),
            config.kafka_hosts()
        );

        Ok(Self { consumer })
    }
}

#[async_trait]
impl MessageSource for KafkaConsumer {
    async fn recv(&self) -> Result<Option<Message>, TransportError> {
        loop {
            let message = match self.consumer.recv().await {
                Ok(message) => message,
                Err(KafkaError::PartitionEOF(partition)) => {
                    debug!("reached end of partition {}", partition);
                    continue;
                }
                Err(error) => return Err(error.into()),
            };

            return Ok(Some(Message {
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(Bytes::copy_from_slice),
                value: message
                    .payload()
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default(),
                timestamp: message.timestamp().to_millis(),
            }));
        }
    }

    fn commit(&self, message: &Message) -> Result<(), TransportError> {
        self.consumer
            .store_offset(&message.topic, message.partition, message.offset)?;
        Ok(())
    }
}
