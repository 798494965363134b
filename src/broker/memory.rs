use super::{BrokerClient, Record, TransactionHandle};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// One call to [`BrokerClient::send`] as observed by [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentBatch {
    pub topic: String,
    pub records: Vec<Record>,
    /// Set when the send happened inside an open transaction.
    pub transactional: bool,
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    sent: Vec<SentBatch>,
    send_calls: usize,
    fail_send_at: Option<usize>,
    in_transaction: bool,
    commits: usize,
    aborts: usize,
    fail_transaction: bool,
    fail_commit: bool,
    fail_abort: bool,
    partition_counts: HashMap<String, usize>,
    fail_metadata: bool,
    metadata_delay: Option<Duration>,
}

/// In-process broker that records every send.
///
/// Used as the test double for the pipelines and by the CLI `--dry-run`
/// mode. Failures can be injected per operation.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions(self, topic: impl Into<String>, count: usize) -> Self {
        self.lock().partition_counts.insert(topic.into(), count);
        self
    }

    /// Makes the `n`th send call (zero based) fail.
    pub fn fail_send_at(self, n: usize) -> Self {
        self.lock().fail_send_at = Some(n);
        self
    }

    pub fn fail_transactions(self) -> Self {
        self.lock().fail_transaction = true;
        self
    }

    pub fn fail_commits(self) -> Self {
        self.lock().fail_commit = true;
        self
    }

    pub fn fail_aborts(self) -> Self {
        self.lock().fail_abort = true;
        self
    }

    pub fn fail_metadata(self) -> Self {
        self.lock().fail_metadata = true;
        self
    }

    pub fn with_metadata_delay(self, delay: Duration) -> Self {
        self.lock().metadata_delay = Some(delay);
        self
    }

    pub fn sent(&self) -> Vec<SentBatch> {
        self.lock().sent.clone()
    }

    /// Sizes of the recorded sends, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().sent.iter().map(|b| b.records.len()).collect()
    }

    pub fn send_calls(&self) -> usize {
        self.lock().send_calls
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn aborts(&self) -> usize {
        self.lock().aborts
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.lock().connected = false;
        Ok(())
    }

    async fn send(&self, topic: &str, records: Vec<Record>) -> Result<()> {
        let mut state = self.lock();
        let call = state.send_calls;
        state.send_calls += 1;

        if state.fail_send_at == Some(call) {
            return Err(Error::Send {
                topic: topic.to_string(),
                message: format!("injected failure on send #{}", call),
            });
        }

        debug!(topic, records = records.len(), "memory broker accepted send");
        let transactional = state.in_transaction;
        state.sent.push(SentBatch {
            topic: topic.to_string(),
            records,
            transactional,
        });
        Ok(())
    }

    async fn transaction(&self) -> Result<Box<dyn TransactionHandle>> {
        let mut state = self.lock();
        if state.fail_transaction {
            return Err(Error::Transaction {
                transaction_id: String::new(),
                message: "injected begin failure".to_string(),
            });
        }
        state.in_transaction = true;
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
        }))
    }

    async fn fetch_partition_count(&self, topic: &str) -> Result<usize> {
        let (delay, fail, count) = {
            let state = self.lock();
            (
                state.metadata_delay,
                state.fail_metadata,
                state.partition_counts.get(topic).copied(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if fail {
            return Err(Error::Send {
                topic: topic.to_string(),
                message: "injected metadata failure".to_string(),
            });
        }

        count.ok_or_else(|| Error::Send {
            topic: topic.to_string(),
            message: "unknown topic".to_string(),
        })
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<State>>,
}

impl MemoryTransaction {
    fn finish(&self, commit: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.in_transaction = false;

        let failed = if commit { state.fail_commit } else { state.fail_abort };
        if failed {
            return Err(Error::Transaction {
                transaction_id: String::new(),
                message: format!("injected {} failure", if commit { "commit" } else { "abort" }),
            });
        }

        if commit {
            state.commits += 1;
        } else {
            state.aborts += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionHandle for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish(true)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.finish(false)
    }
}
