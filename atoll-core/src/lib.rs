//! Core vocabulary of the Atoll scheduler
//!
//! Provides:
//! - Typed resource vectors with branch-free arithmetic
//! - Boolean scheduling-tag filters with memoized hashes
//! - Immutable exec-node descriptors
//! - Strongly-typed identifiers shared by every other crate

pub mod ids;
pub mod node;
pub mod resources;
pub mod tags;

pub use ids::{AgentId, ControllerEpoch, IncarnationId, JobId, NodeId, OperationId, TransactionId};
pub use node::ExecNodeDescriptor;
pub use resources::{DiskQuota, JobResources, JobResourcesWithQuota};
pub use tags::{BooleanFormula, FilterRegistry, SchedulingTagFilter};
