//! Begin/send/commit/rollback protocol over a broker transaction.
//!
//! At most one transaction is active per manager. Commit and rollback
//! always return the manager to the inactive state, even when the broker
//! call fails, so a failed commit never wedges the producer.

use crate::broker::{group_by_topic, BrokerClient, Message, TransactionHandle};
use crate::metadata::generate_id;
use crate::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Summary of a finished transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub transaction_id: String,
    pub success: bool,
    pub message_count: usize,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Result of [`TransactionManager::execute_transaction`].
#[derive(Debug)]
pub enum TransactionOutcome<T> {
    Committed { value: T, result: TransactionResult },
    Failed { result: TransactionResult, error: Error },
}

impl<T> TransactionOutcome<T> {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }

    pub fn result(&self) -> &TransactionResult {
        match self {
            TransactionOutcome::Committed { result, .. } | TransactionOutcome::Failed { result, .. } => result,
        }
    }

    /// Drops the summary and keeps the value or the triggering error.
    pub fn into_result(self) -> Result<T> {
        match self {
            TransactionOutcome::Committed { value, .. } => Ok(value),
            TransactionOutcome::Failed { error, .. } => Err(error),
        }
    }
}

struct ActiveTransaction {
    id: String,
    handle: Box<dyn TransactionHandle>,
    started: Instant,
    message_count: usize,
}

/// Scoped sender handed to the operation in `execute_transaction`.
///
/// Counts every message it successfully sends.
#[derive(Clone)]
pub struct TransactionSender {
    broker: Arc<dyn BrokerClient>,
    sent: Arc<AtomicUsize>,
}

impl TransactionSender {
    pub async fn send(&self, messages: Vec<Message>) -> Result<()> {
        for (topic, records) in group_by_topic(messages) {
            let count = records.len();
            self.broker.send(&topic, records).await?;
            self.sent.fetch_add(count, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn message_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

pub struct TransactionManager {
    broker: Arc<dyn BrokerClient>,
    active: Option<ActiveTransaction>,
}

impl TransactionManager {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            active: None,
        }
    }

    pub fn is_transaction_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_transaction_id(&self) -> Option<&str> {
        self.active.as_ref().map(|tx| tx.id.as_str())
    }

    /// Starts a transaction, generating an id when none is given.
    #[instrument(skip(self))]
    pub async fn begin_transaction(&mut self, id: Option<String>) -> Result<String> {
        if let Some(active) = &self.active {
            return Err(Error::TransactionAlreadyActive(active.id.clone()));
        }

        let id = id.unwrap_or_else(|| generate_id("tx"));
        let handle = self.broker.transaction().await.map_err(|e| Error::Transaction {
            transaction_id: id.clone(),
            message: format!("begin failed: {}", e),
        })?;

        info!(transaction_id = %id, "Transaction started");
        self.active = Some(ActiveTransaction {
            id: id.clone(),
            handle,
            started: Instant::now(),
            message_count: 0,
        });
        Ok(id)
    }

    /// Sends inside the active transaction, one broker call per topic.
    pub async fn send_in_transaction(&mut self, messages: Vec<Message>) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Err(Error::NoActiveTransaction);
        };
        if messages.is_empty() {
            return Ok(());
        }

        for (topic, records) in group_by_topic(messages) {
            let count = records.len();
            debug!(transaction_id = %active.id, topic = %topic, count, "Sending in transaction");
            self.broker.send(&topic, records).await?;
            active.message_count += count;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn commit_transaction(&mut self) -> Result<TransactionResult> {
        let active = self.active.take().ok_or(Error::NoActiveTransaction)?;
        let ActiveTransaction {
            id,
            handle,
            started,
            message_count,
        } = active;

        match handle.commit().await {
            Ok(()) => {
                let result = TransactionResult {
                    transaction_id: id,
                    success: true,
                    message_count,
                    error: None,
                    duration: started.elapsed(),
                };
                info!(
                    transaction_id = %result.transaction_id,
                    message_count,
                    duration_ms = result.duration.as_millis() as u64,
                    "Transaction committed"
                );
                Ok(result)
            }
            Err(e) => {
                error!(transaction_id = %id, error = %e, "Transaction commit failed");
                Err(Error::Transaction {
                    transaction_id: id,
                    message: format!("commit failed: {}", e),
                })
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn rollback_transaction(&mut self) -> Result<()> {
        let active = self.active.take().ok_or(Error::NoActiveTransaction)?;

        match active.handle.abort().await {
            Ok(()) => {
                info!(transaction_id = %active.id, "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                error!(transaction_id = %active.id, error = %e, "Transaction rollback failed");
                Err(Error::Transaction {
                    transaction_id: active.id,
                    message: format!("rollback failed: {}", e),
                })
            }
        }
    }

    /// Runs `operation` inside a fresh transaction.
    ///
    /// Commits when the operation succeeds. When the operation or the commit
    /// fails, the transaction opened here is rolled back on a best-effort
    /// basis and a [`TransactionOutcome::Failed`] carries the triggering
    /// error; rollback errors are only logged. A failed begin leaves any
    /// transaction that was already active untouched.
    pub async fn execute_transaction<F, Fut, T>(&mut self, operation: F) -> TransactionOutcome<T>
    where
        F: FnOnce(TransactionSender) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let transaction_id = generate_id("tx");
        let sender = TransactionSender {
            broker: Arc::clone(&self.broker),
            sent: Arc::new(AtomicUsize::new(0)),
        };

        if let Err(error) = self.begin_transaction(Some(transaction_id.clone())).await {
            warn!(transaction_id = %transaction_id, error = %error, "Transaction did not start");
            return failed_outcome(transaction_id, 0, started, error);
        }

        let outcome = match operation(sender.clone()).await {
            Ok(value) => {
                if let Some(active) = self.active.as_mut() {
                    active.message_count += sender.message_count();
                }
                self.commit_transaction().await.map(|result| (value, result))
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok((value, result)) => TransactionOutcome::Committed { value, result },
            Err(error) => {
                if self.active_transaction_id() == Some(transaction_id.as_str()) {
                    if let Err(rollback_error) = self.rollback_transaction().await {
                        warn!(
                            transaction_id = %transaction_id,
                            error = %rollback_error,
                            "Rollback after failed transaction also failed"
                        );
                    }
                }

                failed_outcome(transaction_id, sender.message_count(), started, error)
            }
        }
    }
}

fn failed_outcome<T>(
    transaction_id: String,
    message_count: usize,
    started: Instant,
    error: Error,
) -> TransactionOutcome<T> {
    TransactionOutcome::Failed {
        result: TransactionResult {
            transaction_id,
            success: false,
            message_count,
            error: Some(error.to_string()),
            duration: started.elapsed(),
        },
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Record};

    fn manager(broker: &Arc<MemoryBroker>) -> TransactionManager {
        TransactionManager::new(Arc::clone(broker) as Arc<dyn BrokerClient>)
    }

    fn messages(topics: &[&str]) -> Vec<Message> {
        topics
            .iter()
            .enumerate()
            .map(|(i, topic)| Message::new(*topic, Record::new(format!("m{}", i))))
            .collect()
    }

    #[tokio::test]
    async fn test_begin_twice_names_active_id() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = manager(&broker);

        let id = manager.begin_transaction(Some("tx-1".to_string())).await.unwrap();
        assert_eq!(id, "tx-1");
        assert!(manager.is_transaction_active());

        let err = manager.begin_transaction(None).await.unwrap_err();
        assert!(matches!(&err, Error::TransactionAlreadyActive(active) if active == "tx-1"));
        assert!(err.to_string().contains("tx-1"));
    }

    #[tokio::test]
    async fn test_commit_groups_by_topic() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = manager(&broker);

        manager.begin_transaction(None).await.unwrap();
        manager.send_in_transaction(messages(&["a", "b", "a"])).await.unwrap();
        manager.send_in_transaction(Vec::new()).await.unwrap();
        let result = manager.commit_transaction().await.unwrap();

        assert!(result.success);
        assert_eq!(result.message_count, 3);
        assert!(!manager.is_transaction_active());
        assert_eq!(broker.batch_sizes(), vec![2, 1]);
        assert!(broker.sent().iter().all(|b| b.transactional));
        assert_eq!(broker.commits(), 1);
    }

    #[tokio::test]
    async fn test_operations_without_active_transaction_fail() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = manager(&broker);

        assert!(matches!(
            manager.send_in_transaction(messages(&["a"])).await,
            Err(Error::NoActiveTransaction)
        ));
        assert!(matches!(manager.commit_transaction().await, Err(Error::NoActiveTransaction)));
        assert!(matches!(manager.rollback_transaction().await, Err(Error::NoActiveTransaction)));
    }

    #[tokio::test]
    async fn test_failed_commit_clears_active_state() {
        let broker = Arc::new(MemoryBroker::new().fail_commits());
        let mut manager = manager(&broker);

        manager.begin_transaction(Some("tx-c".to_string())).await.unwrap();
        let err = manager.commit_transaction().await.unwrap_err();
        assert!(matches!(err, Error::Transaction { ref transaction_id, .. } if transaction_id == "tx-c"));
        assert!(!manager.is_transaction_active());

        // not stuck: a new transaction can start
        manager.begin_transaction(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_rollback_clears_active_state() {
        let broker = Arc::new(MemoryBroker::new().fail_aborts());
        let mut manager = manager(&broker);

        manager.begin_transaction(None).await.unwrap();
        assert!(manager.rollback_transaction().await.is_err());
        assert!(!manager.is_transaction_active());
    }

    #[tokio::test]
    async fn test_execute_transaction_commits() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = manager(&broker);

        let outcome = manager
            .execute_transaction(|sender| async move {
                sender.send(messages(&["a", "b"])).await?;
                sender.send(messages(&["a"])).await?;
                Ok("done")
            })
            .await;

        assert!(outcome.is_committed());
        assert_eq!(outcome.result().message_count, 3);
        assert_eq!(outcome.into_result().unwrap(), "done");
        assert_eq!(broker.commits(), 1);
        assert!(!manager.is_transaction_active());
    }

    #[tokio::test]
    async fn test_execute_transaction_rolls_back_on_error() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = manager(&broker);

        let outcome: TransactionOutcome<()> = manager
            .execute_transaction(|sender| async move {
                sender.send(messages(&["a", "a"])).await?;
                Err(Error::Validation("business rule violated".to_string()))
            })
            .await;

        match outcome {
            TransactionOutcome::Failed { result, error } => {
                assert!(!result.success);
                assert_eq!(result.message_count, 2);
                assert!(result.error.as_deref().unwrap().contains("business rule violated"));
                assert!(matches!(error, Error::Validation(_)));
            }
            TransactionOutcome::Committed { .. } => panic!("expected failure"),
        }
        assert_eq!(broker.aborts(), 1);
        assert_eq!(broker.commits(), 0);
        assert!(!manager.is_transaction_active());
    }

    #[tokio::test]
    async fn test_execute_transaction_keeps_original_error_when_rollback_fails() {
        let broker = Arc::new(MemoryBroker::new().fail_aborts());
        let mut manager = manager(&broker);

        let outcome: TransactionOutcome<()> = manager
            .execute_transaction(|_| async { Err(Error::Validation("original".to_string())) })
            .await;

        let err = outcome.into_result().unwrap_err();
        assert!(matches!(err, Error::Validation(ref reason) if reason == "original"));
        assert!(!manager.is_transaction_active());
    }

    #[tokio::test]
    async fn test_execute_transaction_begin_failure() {
        let broker = Arc::new(MemoryBroker::new().fail_transactions());
        let mut manager = manager(&broker);

        let outcome = manager.execute_transaction(|_| async { Ok(()) }).await;
        assert!(!outcome.is_committed());
        assert_eq!(outcome.result().message_count, 0);
        assert!(outcome.result().transaction_id.starts_with("tx_"));
    }

    #[tokio::test]
    async fn test_execute_transaction_leaves_existing_transaction_alone() {
        let broker = Arc::new(MemoryBroker::new());
        let mut manager = manager(&broker);
        manager.begin_transaction(Some("outer".to_string())).await.unwrap();

        let outcome = manager.execute_transaction(|_| async { Ok(()) }).await;

        assert!(!outcome.is_committed());
        assert_ne!(outcome.result().transaction_id, "outer");
        assert!(outcome.result().transaction_id.starts_with("tx_"));
        assert!(matches!(
            outcome.into_result(),
            Err(Error::TransactionAlreadyActive(ref active)) if active == "outer"
        ));
        assert_eq!(manager.active_transaction_id(), Some("outer"));
        assert_eq!(broker.aborts(), 0);

        manager.commit_transaction().await.unwrap();
        assert_eq!(broker.commits(), 1);
    }
}
