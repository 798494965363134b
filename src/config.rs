use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

/// Broker connection settings handed to rdkafka.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_idempotence")]
    pub enable_idempotence: bool,
    /// Required by the broker when producer transactions are enabled.
    #[serde(default)]
    pub transactional_id: Option<String>,
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
}

/// Producer pipeline settings.
///
/// The subset in [`ProducerSettings`] can be changed at runtime through
/// `ProducerPipeline::update_configuration`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    pub topic: String,
    #[serde(default)]
    pub enable_routing: bool,
    #[serde(default)]
    pub enable_partitioning: bool,
    #[serde(default)]
    pub enable_transactions: bool,
    #[serde(default)]
    pub enable_validation: bool,
    #[serde(default = "default_partition_lookup_timeout_ms")]
    pub partition_lookup_timeout_ms: u64,
    #[serde(default = "default_partition_count")]
    pub default_partition_count: usize,
    #[serde(flatten)]
    pub settings: ProducerSettings,
}

/// Runtime-tunable producer knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProducerSettings {
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub linger_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Subscribed topic; falls back to the producer topic when unset.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub from_beginning: bool,
    /// Upper bound on remembered event ids. `None` keeps every id.
    #[serde(default)]
    pub dedup_capacity: Option<usize>,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(path.as_ref(), Self::environment())
    }

    /// `KAFKA_PIPELINE_<SECTION>__<KEY>` overrides. Values are parsed into
    /// numbers and booleans; `kafka.brokers` takes a comma-separated list.
    fn environment() -> config::Environment {
        config::Environment::with_prefix("KAFKA_PIPELINE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("kafka.brokers")
    }

    fn load(path: &Path, environment: config::Environment) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(environment)
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.is_empty() {
            return Err(Error::InvalidConfig("kafka.brokers must not be empty".to_string()));
        }
        if self.producer.topic.trim().is_empty() {
            return Err(Error::InvalidConfig("producer.topic must not be empty".to_string()));
        }
        if self.producer.settings.max_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "producer.max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.consumer.group_id.trim().is_empty() {
            return Err(Error::InvalidConfig("consumer.group_id must not be empty".to_string()));
        }
        if self.producer.enable_transactions && self.kafka.transactional_id.is_none() {
            return Err(Error::InvalidConfig(
                "kafka.transactional_id is required when transactions are enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn consumer_topic(&self) -> &str {
        self.consumer.topic.as_deref().unwrap_or(&self.producer.topic)
    }
}

impl ProducerConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            enable_routing: false,
            enable_partitioning: false,
            enable_transactions: false,
            enable_validation: false,
            partition_lookup_timeout_ms: default_partition_lookup_timeout_ms(),
            default_partition_count: default_partition_count(),
            settings: ProducerSettings::default(),
        }
    }

    pub fn partition_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.partition_lookup_timeout_ms)
    }
}

impl ProducerSettings {
    pub fn linger(&self) -> Option<Duration> {
        (self.linger_ms > 0).then(|| Duration::from_millis(self.linger_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            max_batch_size: default_max_batch_size(),
            linger_ms: 0,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ConsumerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            topic: None,
            from_beginning: false,
            dedup_capacity: None,
            retry_backoff_ms: default_retry_backoff_ms(),
            session_timeout_ms: default_session_timeout_ms(),
        }
    }
}

fn default_client_id() -> String {
    "kafka-pipeline".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_idempotence() -> bool {
    true
}

fn default_transaction_timeout_ms() -> u64 {
    60_000
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_max_batch_size() -> usize {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_partition_lookup_timeout_ms() -> u64 {
    5_000
}

fn default_partition_count() -> usize {
    3
}

fn default_group_id() -> String {
    "kafka-pipeline-consumer".to_string()
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_session_timeout_ms() -> u64 {
    30_000
}
