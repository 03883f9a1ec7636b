//! Scheduler / controller-agent wire model
//!
//! The two processes are permanently-connected logical peers exchanging six
//! message streams over the agent heartbeat:
//!
//! | Stream | Direction |
//! |---|---|
//! | Operation events | agent -> scheduler |
//! | Job events | agent -> scheduler |
//! | Schedule-job responses | agent -> scheduler |
//! | Operation events (commands) | scheduler -> agent |
//! | Job events | scheduler -> agent |
//! | Schedule-job requests | scheduler -> agent |
//!
//! Each stream is carried by a durable [`MessageQueueOutbox`] on the sender
//! and a deduplicating [`MessageQueueInbox`] on the receiver, so delivery is
//! exactly-once in sender order across reconnects.

pub mod envelope;
pub mod messages;
pub mod node;
pub mod queue;

pub use envelope::{
    AgentHeartbeatRequest, AgentHeartbeatResponse, AgentOperationInfo, HandshakeRequest,
    HandshakeResponse, MemoryStatistics,
};
pub use messages::{
    AgentJobEvent, AgentJobEventKind, AgentOperationEvent, AgentOperationEventKind, JobAbortReason,
    JobStartSpec, PreemptionMode, RevivedJob, ScheduleJobFailReason, ScheduleJobRequest, ScheduleJobResponse,
    SchedulerJobEvent, SchedulerJobEventKind, SchedulerOperationEvent, SchedulerOperationEventKind,
    WireError,
};
pub use node::{
    JobInterruptCommand, JobStartCommand, NodeHeartbeatRequest, NodeHeartbeatResponse,
    ReportedJobState, ReportedJobStatus,
};
pub use queue::{MessageQueueInbox, MessageQueueOutbox, QueueSegment};
