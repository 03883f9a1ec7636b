//! Handshake and agent heartbeat envelopes
//!
//! The handshake establishes the agent's incarnation; every later heartbeat
//! carries the agent->scheduler stream segments plus acknowledgments for the
//! scheduler->agent streams, and receives the mirror image back.

use crate::messages::{
    AgentJobEvent, AgentOperationEvent, ScheduleJobRequest, ScheduleJobResponse,
    SchedulerJobEvent, SchedulerOperationEvent, WireError,
};
use crate::queue::QueueSegment;
use atoll_core::{AgentId, ExecNodeDescriptor, IncarnationId, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Controller memory accounting, piggybacked on heartbeats and consumed by
/// the memory-balanced agent pick policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStatistics {
    pub limit: i64,
    pub usage: i64,
}

impl MemoryStatistics {
    pub fn free(&self) -> i64 {
        (self.limit - self.usage).max(0)
    }
}

/// Agent -> scheduler registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub agent_id: AgentId,
    pub tags: BTreeSet<String>,
    pub addresses: Vec<String>,
    /// Operations the agent still holds state for (from a previous
    /// incarnation); the scheduler reconciles this against its own view
    pub known_operations: Vec<OperationId>,
}

/// Scheduler -> agent registration reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// The agent's fresh incarnation; every subsequent RPC must carry it
    pub incarnation_id: IncarnationId,
    pub scheduler_incarnation_id: IncarnationId,
    /// Operations the scheduler believes this agent owns; anything the agent
    /// knows that is missing here must be abandoned by the agent
    pub known_operations: Vec<OperationId>,
    pub config: serde_json::Value,
}

/// Per-operation info piggybacked on the agent heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOperationInfo {
    pub operation_id: OperationId,
    /// Alert key -> error (Some sets the alert, None resets it)
    pub alerts: BTreeMap<String, Option<WireError>>,
    pub suspicious_jobs: Option<serde_json::Value>,
    /// Controller runtime data feeding the fair-share demand
    pub pending_job_count: i64,
    pub needed_resources: atoll_core::JobResources,
}

/// Agent -> scheduler heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatRequest {
    pub agent_id: AgentId,
    pub incarnation_id: IncarnationId,
    pub operations: Vec<AgentOperationInfo>,
    /// Outgoing stream segments
    pub operation_events: QueueSegment<AgentOperationEvent>,
    pub job_events: QueueSegment<AgentJobEvent>,
    pub schedule_job_responses: QueueSegment<ScheduleJobResponse>,
    /// Acks for the scheduler->agent streams
    pub scheduler_operation_events_ack: u64,
    pub scheduler_job_events_ack: u64,
    pub schedule_job_requests_ack: u64,
    pub controller_memory: Option<MemoryStatistics>,
    /// When set, the reply carries the cached exec-node descriptor list
    pub exec_nodes_requested: bool,
}

/// Scheduler -> agent heartbeat reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeatResponse {
    /// Acks for the agent->scheduler streams
    pub operation_events_ack: u64,
    pub job_events_ack: u64,
    pub schedule_job_responses_ack: u64,
    /// Outgoing stream segments
    pub scheduler_operation_events: QueueSegment<SchedulerOperationEvent>,
    pub scheduler_job_events: QueueSegment<SchedulerJobEvent>,
    pub schedule_job_requests: QueueSegment<ScheduleJobRequest>,
    /// Operations the agent reported but the scheduler does not know
    pub operations_to_unregister: Vec<OperationId>,
    pub exec_nodes: Option<Vec<ExecNodeDescriptor>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AgentOperationEvent, AgentOperationEventKind};
    use crate::queue::MessageQueueOutbox;
    use atoll_core::{ControllerEpoch, JobResources};

    #[test]
    fn test_heartbeat_request_roundtrip() {
        let outbox = MessageQueueOutbox::new("test");
        outbox.enqueue(AgentOperationEvent {
            operation_id: OperationId::new(),
            controller_epoch: ControllerEpoch(2),
            kind: AgentOperationEventKind::Completed,
        });
        let request = AgentHeartbeatRequest {
            agent_id: AgentId::new("agent-7"),
            incarnation_id: IncarnationId::new(),
            operations: vec![AgentOperationInfo {
                operation_id: OperationId::new(),
                alerts: BTreeMap::new(),
                suspicious_jobs: Some(serde_json::json!({ "j1": "cpu stall" })),
                pending_job_count: 12,
                needed_resources: JobResources {
                    cpu: 12.0,
                    memory: 12 << 28,
                    user_slots: 12,
                    network: 0,
                    gpu: 0,
                },
            }],
            operation_events: outbox.build_outgoing(),
            job_events: Default::default(),
            schedule_job_responses: Default::default(),
            scheduler_operation_events_ack: 41,
            scheduler_job_events_ack: 7,
            schedule_job_requests_ack: 0,
            controller_memory: Some(MemoryStatistics {
                limit: 64 << 30,
                usage: 10 << 30,
            }),
            exec_nodes_requested: true,
        };

        let json = serde_json::to_string(&request).unwrap();
        let back: AgentHeartbeatRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_id, request.agent_id);
        assert_eq!(back.incarnation_id, request.incarnation_id);
        assert_eq!(back.operation_events.first_sequence_number, 1);
        assert_eq!(back.operation_events.items.len(), 1);
        assert_eq!(back.scheduler_operation_events_ack, 41);
        assert_eq!(back.operations[0].pending_job_count, 12);
        assert!(back.exec_nodes_requested);
    }

    #[test]
    fn test_memory_statistics_free_floor() {
        let statistics = MemoryStatistics {
            limit: 100,
            usage: 120,
        };
        assert_eq!(statistics.free(), 0);
        assert_eq!(MemoryStatistics { limit: 100, usage: 30 }.free(), 70);
    }
}
