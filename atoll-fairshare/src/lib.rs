//! Fair-share hierarchical scheduling
//!
//! Maintains one pool tree per scheduling domain. Pools hold configuration
//! (weight, min share, max share, mode); operations are the leaves. A
//! periodic update pass turns demand into per-element fair shares; node
//! heartbeats run a scheduling pass against an immutable tree snapshot,
//! optionally preempting running jobs to honor guarantees.

pub mod config;
pub mod context;
pub mod controller;
pub mod element;
pub mod error;
pub mod preempt;
pub mod schedule;
pub mod strategy;
pub mod testing;
pub mod tree;
pub mod update;

pub use config::{FairShareTreeConfig, FifoSortParameter, PoolConfig, SchedulingMode, StrategyConfig};
pub use context::{NodeSchedulingContext, PreemptedJob, RunningJob, StartedJob};
pub use controller::{OperationControllerApi, OperationDemand};
pub use element::{OperationPoolParams, SchedulableAttributes};
pub use error::{StrategyError, StrategyResult};
pub use strategy::FairShareStrategy;
pub use tree::{FairShareTree, TreeSnapshot};
