use crate::{Error, Result};
use rdkafka::admin::AdminClient;
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Topic metadata lookups through the Kafka admin client.
pub struct TopicManager {
    admin_client: Arc<AdminClient<DefaultClientContext>>,
    metadata_timeout: Duration,
}

impl TopicManager {
    pub fn new(brokers: &[String], client_id: &str, metadata_timeout: Duration) -> Result<Self> {
        let admin_client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("client.id", format!("{}-admin", client_id))
            .create()?;

        Ok(Self {
            admin_client: Arc::new(admin_client),
            metadata_timeout,
        })
    }

    /// Number of partitions the broker reports for `topic`.
    #[instrument(skip(self))]
    pub async fn partition_count(&self, topic: &str) -> Result<usize> {
        let admin_client = Arc::clone(&self.admin_client);
        let timeout = self.metadata_timeout;
        let name = topic.to_string();

        let metadata =
            super::blocking(move || admin_client.inner().fetch_metadata(Some(name.as_str()), timeout))
                .await?;

        let Some(found) = metadata.topics().iter().find(|t| t.name() == topic) else {
            warn!("Topic '{}' missing from broker metadata", topic);
            return Err(Error::Kafka(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownTopicOrPartition,
            )));
        };
        if let Some(err) = found.error() {
            return Err(Error::Kafka(KafkaError::MetadataFetch(err.into())));
        }

        let count = found.partitions().len();
        debug!("Topic '{}' has {} partitions", topic, count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires running Kafka
    async fn test_partition_count_lookup() {
        let manager = TopicManager::new(
            &["localhost:9092".to_string()],
            "kafka-pipeline-test",
            Duration::from_secs(5),
        )
        .unwrap();

        // Auto-created on first metadata request with broker defaults
        let count = manager.partition_count("kafka-pipeline-test").await.unwrap();
        assert!(count >= 1);
    }
}
