//! Operation model and lifecycle state machine
//!
//! Transitions follow the fixed table below; every applied transition
//! appends exactly one event to the operation's event log. The scheduler
//! persists the new state to the master between `validate_transition` and
//! `apply_transition`, so a state is durable before the next one is
//! attempted.
//!
//! ```text
//! Starting -> Initializing -> Preparing -> Pending -> Materializing -> Running
//!                                            ^            \-> Running    |
//!                                            |                           v
//!                                         Reviving  <---------------  (agent loss)
//! any non-terminal -> Aborting -> Aborted
//! any non-terminal -> Failing  -> Failed
//! Running -> Completing -> Completed
//! ```

use crate::cancel::CancelableContext;
use crate::error::{SchedulerError, SchedulerResult};
use atoll_core::{AgentId, ControllerEpoch, OperationId};
use atoll_fairshare::OperationPoolParams;
use atoll_proto::WireError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Operation lifecycle states; `Completed`, `Failed` and `Aborted` are
/// terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Starting,
    Initializing,
    Preparing,
    Pending,
    Materializing,
    Reviving,
    Running,
    Completing,
    Failing,
    Aborting,
    Completed,
    Failed,
    Aborted,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Aborted
        )
    }

    /// The fixed transition table
    pub fn can_transition_to(&self, to: OperationState) -> bool {
        use OperationState::*;
        if self.is_terminal() {
            return false;
        }
        // Failing and aborting are reachable from any non-terminal state;
        // reviving from anything not already draining, since agent loss
        // can strike at any phase.
        match to {
            Aborting => return *self != Aborting,
            Failing => return *self != Failing && *self != Aborting,
            Reviving => return *self != Failing && *self != Aborting,
            _ => {}
        }
        matches!(
            (*self, to),
            (Starting, Initializing)
                | (Initializing, Preparing)
                | (Preparing, Pending)
                | (Pending, Materializing)
                | (Materializing, Running)
                | (Reviving, Running)
                | (Reviving, Pending)
                | (Running, Completing)
                | (Completing, Completed)
                | (Failing, Failed)
                | (Aborting, Aborted)
        )
    }
}

/// One entry of the operation event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationEvent {
    pub state: OperationState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct OperationRuntime {
    state: OperationState,
    suspended: bool,
    controller_epoch: ControllerEpoch,
    agent: Option<AgentId>,
    alerts: BTreeMap<String, WireError>,
    runtime_params: HashMap<String, OperationPoolParams>,
    result_error: Option<WireError>,
    events: Vec<OperationEvent>,
}

/// A user-submitted work unit producing many short-lived jobs
pub struct Operation {
    pub id: OperationId,
    pub operation_type: String,
    pub user: String,
    /// Opaque to the core; the controller interprets it
    pub spec: serde_json::Value,
    pub controller_agent_tag: String,
    pub start_time: DateTime<Utc>,
    /// Canceled when the operation reaches a terminal state
    pub cancel: CancelableContext,
    runtime: Mutex<OperationRuntime>,
}

impl Operation {
    pub fn new(
        id: OperationId,
        operation_type: impl Into<String>,
        user: impl Into<String>,
        spec: serde_json::Value,
        controller_agent_tag: impl Into<String>,
        runtime_params: HashMap<String, OperationPoolParams>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            operation_type: operation_type.into(),
            user: user.into(),
            spec,
            controller_agent_tag: controller_agent_tag.into(),
            start_time,
            cancel: CancelableContext::new(),
            runtime: Mutex::new(OperationRuntime {
                state: OperationState::Starting,
                suspended: false,
                controller_epoch: ControllerEpoch::default(),
                agent: None,
                alerts: BTreeMap::new(),
                runtime_params,
                result_error: None,
                events: vec![OperationEvent {
                    state: OperationState::Starting,
                    timestamp: start_time,
                }],
            }),
        }
    }

    /// Rebuild an operation from its persisted attributes during revival
    pub fn from_persisted(
        persisted: &crate::master::PersistedOperation,
        now: DateTime<Utc>,
    ) -> Self {
        let operation = Self::new(
            persisted.id,
            persisted.operation_type.clone(),
            persisted.user.clone(),
            persisted.spec.clone(),
            persisted.controller_agent_tag.clone(),
            persisted.runtime_params.clone(),
            now,
        );
        operation.runtime.lock().state = persisted.state;
        operation
    }

    pub fn state(&self) -> OperationState {
        self.runtime.lock().state
    }

    pub fn is_suspended(&self) -> bool {
        self.runtime.lock().suspended
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.runtime.lock().suspended = suspended;
    }

    pub fn controller_epoch(&self) -> ControllerEpoch {
        self.runtime.lock().controller_epoch
    }

    pub fn agent(&self) -> Option<AgentId> {
        self.runtime.lock().agent.clone()
    }

    /// Weak by design: the operation survives agent death, only the handle
    /// is dropped
    pub fn set_agent(&self, agent: Option<AgentId>) {
        self.runtime.lock().agent = agent;
    }

    pub fn runtime_params(&self) -> HashMap<String, OperationPoolParams> {
        self.runtime.lock().runtime_params.clone()
    }

    pub fn set_runtime_params(&self, params: HashMap<String, OperationPoolParams>) {
        self.runtime.lock().runtime_params = params;
    }

    pub fn set_alert(&self, key: impl Into<String>, error: WireError) {
        self.runtime.lock().alerts.insert(key.into(), error);
    }

    pub fn reset_alert(&self, key: &str) {
        self.runtime.lock().alerts.remove(key);
    }

    pub fn alerts(&self) -> BTreeMap<String, WireError> {
        self.runtime.lock().alerts.clone()
    }

    pub fn result_error(&self) -> Option<WireError> {
        self.runtime.lock().result_error.clone()
    }

    pub fn set_result_error(&self, error: WireError) {
        self.runtime.lock().result_error = Some(error);
    }

    pub fn events(&self) -> Vec<OperationEvent> {
        self.runtime.lock().events.clone()
    }

    /// Check a transition without applying it
    pub fn validate_transition(&self, to: OperationState) -> SchedulerResult<()> {
        let state = self.runtime.lock().state;
        if state.can_transition_to(to) {
            Ok(())
        } else {
            Err(SchedulerError::InvalidStateTransition {
                from: format!("{state:?}"),
                to: format!("{to:?}"),
            })
        }
    }

    /// Apply a previously validated (and persisted) transition. Emits one
    /// event; entering `Reviving` bumps the controller epoch, fencing
    /// every event produced under the old one.
    pub fn apply_transition(&self, to: OperationState, now: DateTime<Utc>) -> SchedulerResult<()> {
        let mut runtime = self.runtime.lock();
        if !runtime.state.can_transition_to(to) {
            return Err(SchedulerError::InvalidStateTransition {
                from: format!("{:?}", runtime.state),
                to: format!("{to:?}"),
            });
        }
        runtime.state = to;
        runtime.events.push(OperationEvent {
            state: to,
            timestamp: now,
        });
        if to == OperationState::Reviving {
            runtime.controller_epoch = runtime.controller_epoch.next();
        }
        if to.is_terminal() {
            self.cancel.cancel();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("type", &self.operation_type)
            .field("user", &self.user)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation() -> Operation {
        Operation::new(
            OperationId::new(),
            "map",
            "alice",
            serde_json::json!({}),
            "default",
            HashMap::new(),
            Utc::now(),
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let op = operation();
        let now = Utc::now();
        for state in [
            OperationState::Initializing,
            OperationState::Preparing,
            OperationState::Pending,
            OperationState::Materializing,
            OperationState::Running,
            OperationState::Completing,
            OperationState::Completed,
        ] {
            op.validate_transition(state).unwrap();
            op.apply_transition(state, now).unwrap();
        }
        assert!(op.state().is_terminal());
        assert!(op.cancel.is_canceled());
        // One event per transition plus the initial Starting entry.
        assert_eq!(op.events().len(), 8);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let op = operation();
        assert!(op.validate_transition(OperationState::Running).is_err());
        assert!(op.validate_transition(OperationState::Completed).is_err());
        // But aborting is reachable from anywhere non-terminal.
        assert!(op.validate_transition(OperationState::Aborting).is_ok());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let op = operation();
        let now = Utc::now();
        op.apply_transition(OperationState::Aborting, now).unwrap();
        op.apply_transition(OperationState::Aborted, now).unwrap();
        assert!(op.validate_transition(OperationState::Aborting).is_err());
        assert!(op.validate_transition(OperationState::Initializing).is_err());
    }

    #[test]
    fn test_reviving_bumps_controller_epoch() {
        let op = operation();
        let now = Utc::now();
        for state in [
            OperationState::Initializing,
            OperationState::Preparing,
            OperationState::Pending,
            OperationState::Materializing,
            OperationState::Running,
        ] {
            op.apply_transition(state, now).unwrap();
        }
        assert_eq!(op.controller_epoch(), ControllerEpoch(0));
        op.apply_transition(OperationState::Reviving, now).unwrap();
        assert_eq!(op.controller_epoch(), ControllerEpoch(1));
        // A second agent restart re-enters Reviving legally.
        op.apply_transition(OperationState::Reviving, now).unwrap();
        assert_eq!(op.controller_epoch(), ControllerEpoch(2));
    }

    #[test]
    fn test_suspension_is_a_flag_not_a_state() {
        let op = operation();
        op.set_suspended(true);
        assert_eq!(op.state(), OperationState::Starting);
        assert!(op.is_suspended());
        op.set_suspended(false);
        assert!(!op.is_suspended());
    }
}
