use crate::Result;
use prometheus::{IntCounter, Opts, Registry};

/// Point-in-time copy of the consumer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub dlq: u64,
}

/// Monotonic consumer counters, registered in a per-pipeline registry.
#[derive(Clone)]
pub struct ConsumerMetrics {
    registry: Registry,
    total: IntCounter,
    processed: IntCounter,
    skipped: IntCounter,
    errors: IntCounter,
    dlq: IntCounter,
}

impl ConsumerMetrics {
    pub fn new(group_id: &str) -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::with_opts(
                Opts::new(name, help).const_label("group_id", group_id.to_string()),
            )?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            total: counter(
                "kafka_pipeline_consumer_messages_total",
                "Messages classified by the consumer pipeline",
            )?,
            processed: counter(
                "kafka_pipeline_consumer_processed_total",
                "Messages handled successfully",
            )?,
            skipped: counter(
                "kafka_pipeline_consumer_skipped_total",
                "Duplicate messages skipped",
            )?,
            errors: counter(
                "kafka_pipeline_consumer_errors_total",
                "Handler failures sent back for redelivery",
            )?,
            dlq: counter(
                "kafka_pipeline_consumer_dlq_total",
                "Messages classified as dead-letter candidates",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_processed(&self) {
        self.total.inc();
        self.processed.inc();
    }

    pub fn record_skipped(&self) {
        self.total.inc();
        self.skipped.inc();
    }

    pub fn record_error(&self) {
        self.total.inc();
        self.errors.inc();
    }

    pub fn record_dlq(&self) {
        self.total.inc();
        self.dlq.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total: self.total.get(),
            processed: self.processed.get(),
            skipped: self.skipped.get(),
            errors: self.errors.get(),
            dlq: self.dlq.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_registry() {
        let metrics = ConsumerMetrics::new("test-group").unwrap();
        metrics.record_processed();
        metrics.record_processed();
        metrics.record_skipped();
        metrics.record_dlq();
        metrics.record_error();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                total: 5,
                processed: 2,
                skipped: 1,
                errors: 1,
                dlq: 1,
            }
        );
        assert_eq!(metrics.registry().gather().len(), 5);
    }

    #[test]
    fn test_independent_pipelines_do_not_collide() {
        let first = ConsumerMetrics::new("g").unwrap();
        let second = ConsumerMetrics::new("g").unwrap();
        first.record_processed();
        assert_eq!(second.snapshot().total, 0);
    }
}
