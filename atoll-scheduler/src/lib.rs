//! The Atoll scheduler core
//!
//! Ties the other crates together into the long-lived scheduler process:
//! - operation model and lifecycle state machine, persisted through the
//!   master before every further transition
//! - node shards processing worker heartbeats in parallel
//! - the controller-agent tracker: handshakes, heartbeats, leases,
//!   assignment policies
//! - the revival protocol that reconstructs running operations after a
//!   scheduler or agent restart without losing work

pub mod agent;
pub mod agent_tracker;
pub mod alerts;
pub mod cancel;
pub mod config;
pub mod error;
pub mod master;
pub mod node_shard;
pub mod operation;
pub mod orchid;
pub mod scheduler;
pub mod testing;

pub use agent::{AgentState, ControllerAgent};
pub use agent_tracker::ControllerAgentTracker;
pub use alerts::{AlertSet, SchedulerAlertType};
pub use cancel::CancelableContext;
pub use config::{AgentPickStrategy, SchedulerConfig};
pub use error::{SchedulerError, SchedulerResult};
pub use master::{MasterClient, PersistedOperation, RetryPolicy, TransactionType};
pub use node_shard::NodeShard;
pub use operation::{Operation, OperationState};
pub use scheduler::Scheduler;
