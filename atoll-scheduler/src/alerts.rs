//! Scheduler alert set
//!
//! Alerts are keyed by a closed enum and live in a concurrent map; each is
//! set with an error, cleared when the condition heals, and mirrored into
//! the orchid tree.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Well-known alert keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAlertType {
    UpdateFairShare,
    UpdatePools,
    SnapshotLoad,
    AgentConnectivity,
    MasterConnectivity,
}

/// Concurrent alert map
#[derive(Debug, Default)]
pub struct AlertSet {
    alerts: DashMap<SchedulerAlertType, String>,
}

impl AlertSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: SchedulerAlertType, error: impl Into<String>) {
        let error = error.into();
        tracing::warn!(alert = ?key, %error, "Scheduler alert set");
        self.alerts.insert(key, error);
    }

    pub fn clear(&self, key: SchedulerAlertType) {
        if self.alerts.remove(&key).is_some() {
            tracing::info!(alert = ?key, "Scheduler alert cleared");
        }
    }

    pub fn clear_all(&self) {
        self.alerts.clear();
    }

    pub fn get(&self, key: SchedulerAlertType) -> Option<String> {
        self.alerts.get(&key).map(|entry| entry.clone())
    }

    pub fn is_set(&self, key: SchedulerAlertType) -> bool {
        self.alerts.contains_key(&key)
    }

    /// All alerts, for the orchid tree
    pub fn snapshot(&self) -> Vec<(SchedulerAlertType, String)> {
        self.alerts
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_roundtrip() {
        let alerts = AlertSet::new();
        alerts.set(SchedulerAlertType::UpdatePools, "bad pool config");
        assert!(alerts.is_set(SchedulerAlertType::UpdatePools));
        assert_eq!(
            alerts.get(SchedulerAlertType::UpdatePools).as_deref(),
            Some("bad pool config")
        );

        alerts.clear(SchedulerAlertType::UpdatePools);
        assert!(!alerts.is_set(SchedulerAlertType::UpdatePools));
    }

    #[test]
    fn test_clear_all() {
        let alerts = AlertSet::new();
        alerts.set(SchedulerAlertType::SnapshotLoad, "boom");
        alerts.set(SchedulerAlertType::UpdateFairShare, "slow");
        alerts.clear_all();
        assert!(alerts.snapshot().is_empty());
    }
}
