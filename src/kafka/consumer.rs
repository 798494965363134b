use crate::config::{ConsumerConfig, KafkaConfig};
use crate::consumer::{ConsumerPipeline, Delivery, EventHandler};
use crate::Result;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset};
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives a [`ConsumerPipeline`] from an rdkafka `StreamConsumer`.
///
/// Offsets are committed only after a terminal classification. A retryable
/// failure seeks the partition back to the failed offset after a backoff so
/// the same message is delivered again.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    retry_backoff: Duration,
}

impl KafkaConsumer {
    pub fn new(kafka: &KafkaConfig, config: &ConsumerConfig) -> Result<Self> {
        let offset_reset = if config.from_beginning { "earliest" } else { "latest" };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", kafka.brokers.join(","))
            .set("client.id", &kafka.client_id)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()?;

        Ok(Self {
            consumer,
            retry_backoff: config.retry_backoff(),
        })
    }

    #[instrument(skip(self))]
    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.consumer.subscribe(&[topic])?;
        info!("Subscribed to topic '{}'", topic);
        Ok(())
    }

    /// Consumes until the pipeline's shutdown token is cancelled or the
    /// stream ends, then unsubscribes and logs final metrics.
    pub async fn run<H: EventHandler>(&self, pipeline: &mut ConsumerPipeline<H>) -> Result<()> {
        let shutdown = pipeline.shutdown_token();
        let mut stream = self.consumer.stream();
        info!("Consumer loop started");

        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping consumer");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!("Kafka consumer error: {}", e);
                        continue;
                    }
                    None => break,
                },
            };

            let delivery = Delivery::new(
                message.topic(),
                message.partition(),
                message.offset(),
                message.payload(),
            );

            match pipeline.process(delivery).await {
                Ok(Some(classification)) => {
                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        warn!("Failed to commit offset {}: {}", message.offset(), e);
                    } else {
                        debug!(
                            "Committed offset {} ({})",
                            message.offset(),
                            classification.as_str()
                        );
                    }
                }
                // Left uncommitted; redelivered after restart
                Ok(None) => break,
                Err(e) if e.is_retryable() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                    self.consumer.seek(
                        message.topic(),
                        message.partition(),
                        Offset::Offset(message.offset()),
                        SEEK_TIMEOUT,
                    )?;
                    debug!(
                        "Rewound partition {} to offset {} for redelivery",
                        message.partition(),
                        message.offset()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        drop(stream);
        self.consumer.unsubscribe();
        pipeline.log_final_metrics();
        Ok(())
    }
}
