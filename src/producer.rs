//! Producer dispatch pipeline.
//!
//! [`ProducerPipeline`] turns caller payloads into Kafka records:
//! metadata enrichment, optional schema validation, optional routing,
//! serialization, header merging, optional partition selection, and finally
//! the broker send. Batches are validated up front and sent in chunks.
//!
//! ```rust,no_run
//! use kafka_pipeline::broker::MemoryBroker;
//! use kafka_pipeline::config::ProducerConfig;
//! use kafka_pipeline::producer::{OutgoingMessage, ProducerPipeline};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> kafka_pipeline::Result<()> {
//! let broker = Arc::new(MemoryBroker::new());
//! let pipeline = ProducerPipeline::new(broker, ProducerConfig::new("orders"));
//!
//! let receipt = pipeline
//!     .send_message(OutgoingMessage::new(json!({"id": 1})).with_key("customer-7"))
//!     .await?;
//! println!("sent {} to {}", receipt.metadata.message_id, receipt.topic);
//! # Ok(())
//! # }
//! ```

use crate::broker::{BrokerClient, Headers, Record};
use crate::config::{ProducerConfig, ProducerSettings};
use crate::kafka::serializer::{JsonSerializer, PayloadSerializer};
use crate::metadata::{EnhancedMetadata, MetadataManager, MetadataOverrides};
use crate::partitioner::{HashPartitioner, PartitionContext, Partitioner};
use crate::routing::{Router, RoutingRule};
use crate::schema::SchemaValidator;
use crate::transaction::{TransactionManager, TransactionOutcome, TransactionSender};
use crate::{Error, Result};
use bytes::Bytes;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A payload plus the per-message options accepted by the pipeline.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub payload: Value,
    pub key: Option<String>,
    /// Caller headers; they win over metadata headers on key collision.
    pub headers: Headers,
    pub metadata: MetadataOverrides,
}

impl OutgoingMessage {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            key: None,
            headers: Headers::new(),
            metadata: MetadataOverrides::default(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataOverrides) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What was sent for a single message.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub topic: String,
    pub partition: Option<i32>,
    pub metadata: EnhancedMetadata,
}

/// What was sent for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub topic: String,
    pub message_count: usize,
    pub chunk_sizes: Vec<usize>,
}

/// A message that passed validation and serialization.
struct Prepared {
    topic: String,
    record: Record,
    metadata: EnhancedMetadata,
    payload: Value,
    key: Option<String>,
}

pub struct ProducerPipeline {
    broker: Arc<dyn BrokerClient>,
    config: ProducerConfig,
    router: Router,
    partitioner: Option<Box<dyn Partitioner>>,
    metadata: MetadataManager,
    transactions: Option<TransactionManager>,
    serializer: Box<dyn PayloadSerializer>,
    validator: Option<Box<dyn SchemaValidator>>,
}

impl ProducerPipeline {
    pub fn new(broker: Arc<dyn BrokerClient>, config: ProducerConfig) -> Self {
        let transactions = config
            .enable_transactions
            .then(|| TransactionManager::new(Arc::clone(&broker)));
        let partitioner = config
            .enable_partitioning
            .then(|| Box::new(HashPartitioner) as Box<dyn Partitioner>);

        Self {
            router: Router::new(config.topic.clone()),
            broker,
            partitioner,
            metadata: MetadataManager::new(),
            transactions,
            serializer: Box::new(JsonSerializer),
            validator: None,
            config,
        }
    }

    pub fn with_serializer(mut self, serializer: Box<dyn PayloadSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_validator(mut self, validator: Box<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Replaces the partitioner. Pipelines built with `enable_partitioning`
    /// start with a [`HashPartitioner`].
    pub fn with_partitioner(mut self, partitioner: Box<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.config.settings
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn update_configuration(&mut self, settings: ProducerSettings) {
        info!(?settings, "Producer settings updated");
        self.config.settings = settings;
    }

    pub fn set_compression(&mut self, compression: impl Into<String>) {
        self.config.settings.compression = compression.into();
    }

    pub fn set_max_batch_size(&mut self, max_batch_size: usize) {
        self.config.settings.max_batch_size = max_batch_size.max(1);
    }

    pub fn set_linger_ms(&mut self, linger_ms: u64) {
        self.config.settings.linger_ms = linger_ms;
    }

    pub fn set_request_timeout_ms(&mut self, request_timeout_ms: u64) {
        self.config.settings.request_timeout_ms = request_timeout_ms;
    }

    pub fn set_partitioner(&mut self, partitioner: Box<dyn Partitioner>) {
        debug!(partitioner = partitioner.name(), "Partitioner set");
        self.partitioner = Some(partitioner);
    }

    pub fn clear_partitioner(&mut self) {
        self.partitioner = None;
    }

    pub fn add_routing_rule(&mut self, rule: RoutingRule) {
        self.router.add_rule(rule);
    }

    pub fn set_default_metadata(&mut self, defaults: MetadataOverrides) {
        self.metadata.set_defaults(defaults);
    }

    pub fn metadata_manager(&self) -> &MetadataManager {
        &self.metadata
    }

    pub fn transactions(&self) -> Option<&TransactionManager> {
        self.transactions.as_ref()
    }

    pub fn transactions_mut(&mut self) -> Option<&mut TransactionManager> {
        self.transactions.as_mut()
    }

    #[instrument(skip(self, message), fields(key = ?message.key))]
    pub async fn send_message(&self, message: OutgoingMessage) -> Result<SendReceipt> {
        let mut prepared = self.prepare(message, true)?;

        if self.partitioner.is_some() {
            let count = self.partition_count(&prepared.topic).await;
            self.assign_partition(&mut prepared, count);
        }

        let Prepared {
            topic,
            record,
            metadata,
            ..
        } = prepared;
        let partition = record.partition;

        self.broker.send(&topic, vec![record]).await?;
        debug!(
            topic = %topic,
            partition = ?partition,
            message_id = %metadata.message_id,
            correlation_id = %metadata.correlation_id,
            "Message sent"
        );

        Ok(SendReceipt {
            topic,
            partition,
            metadata,
        })
    }

    /// Sends `items` to the configured topic in chunks of at most
    /// `max_batch_size`. Nothing is sent unless every item validates and
    /// serializes; the first failing chunk aborts the remaining ones.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn send_batch(&self, items: Vec<OutgoingMessage>) -> Result<BatchReport> {
        let topic = self.config.topic.clone();
        let mut prepared = items
            .into_iter()
            .map(|item| self.prepare(item, false))
            .collect::<Result<Vec<_>>>()?;

        if prepared.is_empty() {
            return Ok(BatchReport {
                topic,
                message_count: 0,
                chunk_sizes: Vec::new(),
            });
        }

        if self.partitioner.is_some() {
            let count = self.partition_count(&topic).await;
            for item in &mut prepared {
                self.assign_partition(item, count);
            }
        }

        let records: Vec<Record> = prepared.into_iter().map(|p| p.record).collect();
        let message_count = records.len();
        let chunk_size = self.config.settings.max_batch_size.max(1);
        let mut remaining = records.into_iter().peekable();
        let mut chunks: Vec<Vec<Record>> = Vec::new();
        while remaining.peek().is_some() {
            chunks.push(remaining.by_ref().take(chunk_size).collect());
        }
        let total_chunks = chunks.len();
        let linger = self.config.settings.linger();

        let mut chunk_sizes = Vec::with_capacity(total_chunks);
        for (index, chunk) in chunks.into_iter().enumerate() {
            if index > 0 {
                if let Some(delay) = linger {
                    tokio::time::sleep(delay).await;
                }
            }

            let size = chunk.len();
            if let Err(e) = self.broker.send(&topic, chunk).await {
                warn!(
                    topic = %topic,
                    chunk = index + 1,
                    total_chunks,
                    error = %e,
                    "Batch chunk failed, aborting remaining chunks"
                );
                return Err(e);
            }
            debug!(topic = %topic, chunk = index + 1, total_chunks, size, "Batch chunk sent");
            chunk_sizes.push(size);
        }

        info!(topic = %topic, message_count, chunks = total_chunks, "Batch sent");
        Ok(BatchReport {
            topic,
            message_count,
            chunk_sizes,
        })
    }

    /// Runs `operation` in a producer transaction.
    pub async fn send_in_transaction<F, Fut, T>(&mut self, operation: F) -> Result<TransactionOutcome<T>>
    where
        F: FnOnce(TransactionSender) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let manager = self.transactions.as_mut().ok_or(Error::TransactionsDisabled)?;
        Ok(manager.execute_transaction(operation).await)
    }

    /// Validates, routes and serializes one message.
    fn prepare(&self, message: OutgoingMessage, route: bool) -> Result<Prepared> {
        let OutgoingMessage {
            payload,
            key,
            headers,
            metadata: overrides,
        } = message;

        let metadata = self.metadata.create_metadata(overrides);

        if self.config.enable_validation {
            if let Some(validator) = &self.validator {
                let result = validator.validate(&payload);
                if !result.is_valid {
                    return Err(Error::Validation(format!(
                        "{} schema: {}",
                        validator.name(),
                        result.reason()
                    )));
                }
            }
        }

        let topic = if route && self.config.enable_routing {
            self.router.route(&payload, Some(&metadata)).topic
        } else {
            self.config.topic.clone()
        };

        let value = self.serializer.serialize(&payload)?;

        let mut merged = MetadataManager::metadata_to_headers(&metadata);
        merged.extend(headers);

        let record = Record {
            partition: None,
            key: key.clone().map(Bytes::from),
            value,
            headers: merged,
            timestamp: Some(metadata.timestamp.timestamp_millis()),
        };

        Ok(Prepared {
            topic,
            record,
            metadata,
            payload,
            key,
        })
    }

    fn assign_partition(&self, prepared: &mut Prepared, partition_count: usize) {
        let Some(partitioner) = &self.partitioner else {
            return;
        };

        let context = PartitionContext {
            topic: &prepared.topic,
            partition_count,
            message: &prepared.payload,
            key: prepared.key.as_deref(),
            metadata: Some(&prepared.metadata),
        };
        let partition = partitioner.partition(&context);
        prepared.record.partition = Some(partition as i32);
    }

    /// Partition count for `topic`, falling back to the configured default
    /// when the lookup fails, times out, or reports no partitions.
    async fn partition_count(&self, topic: &str) -> usize {
        let fallback = self.config.default_partition_count;
        let lookup = self.broker.fetch_partition_count(topic);

        match tokio::time::timeout(self.config.partition_lookup_timeout(), lookup).await {
            Ok(Ok(count)) if count > 0 => count,
            Ok(Ok(_)) => {
                warn!(topic, fallback, "Topic reported no partitions, using default count");
                fallback
            }
            Ok(Err(e)) => {
                warn!(topic, fallback, error = %e, "Partition lookup failed, using default count");
                fallback
            }
            Err(_) => {
                warn!(topic, fallback, "Partition lookup timed out, using default count");
                fallback
            }
        }
    }
}
