use super::{blocking, TopicManager};
use crate::broker::{BrokerClient, Headers, Record, TransactionHandle};
use crate::config::{KafkaConfig, ProducerConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// [`BrokerClient`] over an rdkafka `FutureProducer`.
///
/// Compression, acks and idempotence are fixed when the client is created.
pub struct KafkaBroker {
    producer: FutureProducer,
    topics: TopicManager,
    request_timeout: Duration,
    transaction_timeout: Duration,
    transactional: bool,
}

impl KafkaBroker {
    pub fn new(kafka: &KafkaConfig, producer: &ProducerConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", kafka.brokers.join(","))
            .set("client.id", &kafka.client_id)
            .set("acks", &kafka.acks)
            .set("enable.idempotence", kafka.enable_idempotence.to_string())
            .set("compression.type", &producer.settings.compression)
            .set("message.timeout.ms", producer.settings.request_timeout_ms.to_string());

        if producer.enable_transactions {
            let transactional_id = kafka.transactional_id.as_deref().ok_or_else(|| {
                Error::InvalidConfig("transactions require kafka.transactional_id".to_string())
            })?;
            client_config
                .set("transactional.id", transactional_id)
                .set("transaction.timeout.ms", kafka.transaction_timeout_ms.to_string());
        }

        let topics = TopicManager::new(
            &kafka.brokers,
            &kafka.client_id,
            producer.partition_lookup_timeout(),
        )?;

        Ok(Self {
            producer: client_config.create()?,
            topics,
            request_timeout: producer.settings.request_timeout(),
            transaction_timeout: Duration::from_millis(kafka.transaction_timeout_ms),
            transactional: producer.enable_transactions,
        })
    }
}

pub(crate) fn to_owned_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_ref()),
            })
        })
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    #[instrument(skip(self))]
    async fn connect(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.request_timeout;
        blocking(move || producer.client().fetch_metadata(None, timeout).map(|_| ())).await?;

        if self.transactional {
            let producer = self.producer.clone();
            let timeout = self.transaction_timeout;
            blocking(move || producer.init_transactions(timeout)).await?;
            info!("Initialized transactional producer");
        }

        info!("Connected to Kafka");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn disconnect(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.request_timeout;
        blocking(move || producer.flush(timeout)).await?;
        info!("Flushed and disconnected from Kafka");
        Ok(())
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn send(&self, topic: &str, records: Vec<Record>) -> Result<()> {
        let deliveries = records.iter().map(|record| {
            let mut future_record = FutureRecord::<[u8], [u8]>::to(topic)
                .payload(record.value.as_ref())
                .headers(to_owned_headers(&record.headers));
            if let Some(key) = &record.key {
                future_record = future_record.key(key.as_ref());
            }
            if let Some(partition) = record.partition {
                future_record = future_record.partition(partition);
            }
            if let Some(timestamp) = record.timestamp {
                future_record = future_record.timestamp(timestamp);
            }
            self.producer.send(future_record, self.request_timeout)
        });

        let acks = try_join_all(deliveries)
            .await
            .map_err(|(err, _)| Error::Send {
                topic: topic.to_string(),
                message: err.to_string(),
            })?;

        debug!("Delivered {} records to '{}'", acks.len(), topic);
        Ok(())
    }

    async fn transaction(&self) -> Result<Box<dyn TransactionHandle>> {
        if !self.transactional {
            return Err(Error::TransactionsDisabled);
        }
        self.producer.begin_transaction()?;

        Ok(Box::new(KafkaTransaction {
            producer: self.producer.clone(),
            timeout: self.transaction_timeout,
        }))
    }

    async fn fetch_partition_count(&self, topic: &str) -> Result<usize> {
        self.topics.partition_count(topic).await
    }
}

struct KafkaTransaction {
    producer: FutureProducer,
    timeout: Duration,
}

#[async_trait]
impl TransactionHandle for KafkaTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        let KafkaTransaction { producer, timeout } = *self;
        blocking(move || producer.commit_transaction(timeout)).await
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let KafkaTransaction { producer, timeout } = *self;
        blocking(move || producer.abort_transaction(timeout)).await
    }
}
