//! Broker client abstraction consumed by the pipelines.
//!
//! The pipelines never talk to rdkafka directly. They go through
//! [`BrokerClient`], which is implemented by [`crate::kafka::KafkaBroker`]
//! for a real cluster and by [`MemoryBroker`] for tests and dry runs.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

mod memory;

pub use memory::{MemoryBroker, SentBatch};

/// Wire headers: string keys mapped to raw bytes.
pub type Headers = BTreeMap<String, Bytes>;

/// A single record as handed to the broker, without its topic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

/// A record addressed to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub record: Record,
}

impl Record {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

impl Message {
    pub fn new(topic: impl Into<String>, record: Record) -> Self {
        Self {
            topic: topic.into(),
            record,
        }
    }
}

/// Handle on a broker-side transaction.
///
/// Exactly one of `commit` or `abort` is called per handle.
#[async_trait]
pub trait TransactionHandle: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// The broker operations the producer side depends on.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Sends all records to `topic` in order. Fails as a whole.
    async fn send(&self, topic: &str, records: Vec<Record>) -> Result<()>;

    /// Opens a broker transaction; sends issued until the handle is
    /// committed or aborted belong to it.
    async fn transaction(&self) -> Result<Box<dyn TransactionHandle>>;

    async fn fetch_partition_count(&self, topic: &str) -> Result<usize>;
}

/// Splits messages into per-topic groups, keeping first-seen topic order and
/// the relative order of records within each topic.
pub fn group_by_topic(messages: Vec<Message>) -> Vec<(String, Vec<Record>)> {
    let mut groups: Vec<(String, Vec<Record>)> = Vec::new();

    for message in messages {
        match groups.iter_mut().find(|(topic, _)| *topic == message.topic) {
            Some((_, records)) => records.push(message.record),
            None => groups.push((message.topic, vec![message.record])),
        }
    }

    groups
}
