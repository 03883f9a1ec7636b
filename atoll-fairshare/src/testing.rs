//! Scripted controllers for tests
//!
//! A [`ScriptedController`] hands out identical jobs from a counter of
//! pending jobs, the way a real controller would materialize a uniform
//! operation. Tests drive the counter directly.

use crate::controller::{OperationControllerApi, OperationDemand};
use async_trait::async_trait;
use atoll_core::{ControllerEpoch, JobId, JobResources};
use atoll_proto::{JobStartSpec, ScheduleJobFailReason, ScheduleJobRequest};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Controller double producing `pending` identical jobs
pub struct ScriptedController {
    epoch: Mutex<ControllerEpoch>,
    job_resources: JobResources,
    pending: AtomicI64,
    schedule_calls: AtomicU64,
    /// Artificial response delay, to exercise schedule-job timeouts
    response_delay: Mutex<Option<Duration>>,
}

impl ScriptedController {
    pub fn new(job_resources: JobResources, pending: i64) -> Self {
        Self {
            epoch: Mutex::new(ControllerEpoch::default()),
            job_resources,
            pending: AtomicI64::new(pending),
            schedule_calls: AtomicU64::new(0),
            response_delay: Mutex::new(None),
        }
    }

    pub fn set_pending(&self, pending: i64) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn set_epoch(&self, epoch: ControllerEpoch) {
        *self.epoch.lock() = epoch;
    }

    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.response_delay.lock() = delay;
    }

    pub fn schedule_calls(&self) -> u64 {
        self.schedule_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationControllerApi for ScriptedController {
    fn demand(&self) -> OperationDemand {
        let pending = self.pending().max(0);
        OperationDemand {
            resource_demand: self.job_resources * pending as f64,
            pending_job_count: pending,
        }
    }

    fn controller_epoch(&self) -> ControllerEpoch {
        *self.epoch.lock()
    }

    async fn schedule_job(
        &self,
        _request: ScheduleJobRequest,
    ) -> Result<JobStartSpec, ScheduleJobFailReason> {
        self.schedule_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.response_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.pending.fetch_sub(1, Ordering::SeqCst);
        if remaining <= 0 {
            self.pending.fetch_add(1, Ordering::SeqCst);
            return Err(ScheduleJobFailReason::NoPendingJobs);
        }
        Ok(JobStartSpec {
            resources: atoll_core::JobResourcesWithQuota::new(self.job_resources),
            interruptible: true,
            preemption_mode: atoll_proto::PreemptionMode::Normal,
        })
    }

    fn on_unscheduled_job_aborted(&self, _job_id: JobId) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }
}
