//! Master (metadata store) interface
//!
//! The master holds ground truth: operation nodes, agent instance nodes,
//! transactions, the scheduler lock. The core only sees this trait; the
//! host wires it to the real store, tests wire it to the in-memory one.

use crate::error::{SchedulerError, SchedulerResult};
use crate::operation::OperationState;
use async_trait::async_trait;
use atoll_core::{AgentId, IncarnationId, JobResources, OperationId, TransactionId};
use atoll_fairshare::OperationPoolParams;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Transaction flavors the scheduler starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// Guards one operation's controller state
    OperationController,
    /// Guards a snapshot read
    SnapshotRead,
}

/// An operation as persisted in the master, loaded during revival
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedOperation {
    pub id: OperationId,
    pub operation_type: String,
    pub user: String,
    pub spec: serde_json::Value,
    pub state: OperationState,
    pub runtime_params: HashMap<String, OperationPoolParams>,
    pub controller_agent_tag: String,
    pub controller_transactions: Vec<TransactionId>,
    /// Set when the operation reached a terminal state but its node was
    /// never flushed
    pub flushed: bool,
    /// Demand hint restored until the controller reports fresh numbers
    pub last_needed_resources: JobResources,
}

/// Async master access
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Take the scheduler lock under a master-held transaction; failure
    /// means another scheduler is alive
    async fn acquire_scheduler_lock(&self, incarnation: IncarnationId) -> SchedulerResult<()>;

    /// Confirm the lock is still held; `LockLost` here is process-fatal
    async fn ping_scheduler_lock(&self, incarnation: IncarnationId) -> SchedulerResult<()>;

    async fn create_operation_node(
        &self,
        id: OperationId,
        attributes: serde_json::Value,
    ) -> SchedulerResult<()>;

    /// Merge a patch into the operation node's attributes
    async fn update_operation_node(
        &self,
        id: OperationId,
        patch: serde_json::Value,
    ) -> SchedulerResult<()>;

    /// Final write of everything buffered for the operation; only after a
    /// successful flush may the operation be destroyed
    async fn flush_operation_node(&self, id: OperationId) -> SchedulerResult<()>;

    /// All persisted operations, for revival
    async fn list_operation_nodes(&self) -> SchedulerResult<Vec<PersistedOperation>>;

    async fn start_transaction(
        &self,
        transaction_type: TransactionType,
    ) -> SchedulerResult<TransactionId>;

    async fn abort_transaction(&self, id: TransactionId) -> SchedulerResult<()>;

    async fn ping_transaction(&self, id: TransactionId) -> SchedulerResult<()>;

    /// Create `controller_agents/instances/<id>` with connection time,
    /// tags and annotations
    async fn create_agent_instance_node(
        &self,
        id: &AgentId,
        attributes: serde_json::Value,
    ) -> SchedulerResult<()>;

    async fn check_permission(
        &self,
        user: &str,
        path: &str,
        permission: &str,
    ) -> SchedulerResult<bool>;
}

/// Exponential backoff for transient master errors
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Run `call` until it succeeds, fails permanently, or the attempts run
    /// out. Only transient errors are retried.
    pub async fn run<T, F, Fut>(&self, mut call: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = SchedulerResult<T>>,
    {
        let mut backoff = self.backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.attempts => {
                    warn!(%error, attempt, "Transient master error; backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.backoff_cap);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Patch for an operation's persisted state attribute
pub fn state_patch(state: OperationState) -> serde_json::Value {
    serde_json::json!({ "state": state })
}

/// Patch recording a terminal result
pub fn result_patch(state: OperationState, error: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "state": state,
        "result": { "error": error },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_retries_transient_errors() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::default();
        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(SchedulerError::TransientMaster("busy".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_policy_fails_fast_on_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::default();
        let result: SchedulerResult<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SchedulerError::Master("gone".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_exhausts_attempts() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            ..RetryPolicy::default()
        };
        let result: SchedulerResult<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SchedulerError::TransientMaster("busy".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
