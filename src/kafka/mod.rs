//! rdkafka-backed adapters for the pipelines.

pub mod consumer;
pub mod producer;
pub mod serializer;
pub mod topic_manager;


pub use consumer::KafkaConsumer;
pub use producer::KafkaBroker;
pub use serializer::{JsonSerializer, PayloadSerializer, SerializationFormat, StringSerializer};
pub use topic_manager::TopicManager;

use crate::{Error, Result};
use rdkafka::error::KafkaResult;

/// Runs a blocking librdkafka call off the async runtime.
pub(crate) async fn blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> KafkaResult<T> + Send + 'static,
    T: Send + 'static,
{
    let result = tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(result?)
}
