//! Job resource vectors
//!
//! A scheduling decision touches hundreds of these, so the arithmetic is
//! plain field-by-field math with no allocation on the hot path. Disk is the
//! exception: it is a per-medium map and only enters admission checks, never
//! the inner scheduling loops.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

/// Typed resource vector: one scalar capacity per scheduling dimension
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JobResources {
    /// CPU cores (fractional)
    pub cpu: f64,
    /// Memory in bytes
    pub memory: i64,
    /// User job slots
    pub user_slots: i64,
    /// Network weight units
    pub network: i64,
    /// GPU devices
    pub gpu: i64,
}

impl JobResources {
    /// The zero vector
    pub const fn zero() -> Self {
        Self {
            cpu: 0.0,
            memory: 0,
            user_slots: 0,
            network: 0,
            gpu: 0,
        }
    }

    /// The unconstrained vector; resource-limit values start from this so
    /// a limit naming only some components leaves the rest unbounded
    pub const fn infinite() -> Self {
        Self {
            cpu: f64::MAX,
            memory: i64::MAX,
            user_slots: i64::MAX,
            network: i64::MAX,
            gpu: i64::MAX,
        }
    }

    /// True if every component is zero
    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0
            && self.memory == 0
            && self.user_slots == 0
            && self.network == 0
            && self.gpu == 0
    }

    /// Componentwise minimum
    pub fn min(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu.min(other.cpu),
            memory: self.memory.min(other.memory),
            user_slots: self.user_slots.min(other.user_slots),
            network: self.network.min(other.network),
            gpu: self.gpu.min(other.gpu),
        }
    }

    /// Componentwise maximum
    pub fn max(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu.max(other.cpu),
            memory: self.memory.max(other.memory),
            user_slots: self.user_slots.max(other.user_slots),
            network: self.network.max(other.network),
            gpu: self.gpu.max(other.gpu),
        }
    }

    /// True if `self >= other` on every dimension
    pub fn dominates(&self, other: &Self) -> bool {
        self.cpu >= other.cpu
            && self.memory >= other.memory
            && self.user_slots >= other.user_slots
            && self.network >= other.network
            && self.gpu >= other.gpu
    }

    /// Clamp every component at zero
    pub fn clamp_non_negative(&self) -> Self {
        Self {
            cpu: self.cpu.max(0.0),
            memory: self.memory.max(0),
            user_slots: self.user_slots.max(0),
            network: self.network.max(0),
            gpu: self.gpu.max(0),
        }
    }

    /// Maximum componentwise ratio of `self` to `limits`.
    ///
    /// Dimensions with a zero limit contribute zero, so 0/0 = 0 and a
    /// demand against a missing capacity never produces an infinity.
    pub fn dominant_ratio(&self, limits: &Self) -> f64 {
        fn ratio(value: f64, limit: f64) -> f64 {
            if limit == 0.0 {
                0.0
            } else {
                value / limit
            }
        }

        ratio(self.cpu, limits.cpu)
            .max(ratio(self.memory as f64, limits.memory as f64))
            .max(ratio(self.user_slots as f64, limits.user_slots as f64))
            .max(ratio(self.network as f64, limits.network as f64))
            .max(ratio(self.gpu as f64, limits.gpu as f64))
    }
}

impl Add for JobResources {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            user_slots: self.user_slots + rhs.user_slots,
            network: self.network + rhs.network,
            gpu: self.gpu + rhs.gpu,
        }
    }
}

impl AddAssign for JobResources {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for JobResources {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            cpu: self.cpu - rhs.cpu,
            memory: self.memory - rhs.memory,
            user_slots: self.user_slots - rhs.user_slots,
            network: self.network - rhs.network,
            gpu: self.gpu - rhs.gpu,
        }
    }
}

impl SubAssign for JobResources {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Mul<f64> for JobResources {
    type Output = Self;

    fn mul(self, factor: f64) -> Self {
        Self {
            cpu: self.cpu * factor,
            memory: (self.memory as f64 * factor) as i64,
            user_slots: (self.user_slots as f64 * factor) as i64,
            network: (self.network as f64 * factor) as i64,
            gpu: (self.gpu as f64 * factor) as i64,
        }
    }
}

/// Disk capacity demands keyed by medium name
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskQuota {
    /// Bytes per medium; absent medium means zero
    pub medium_to_quota: BTreeMap<String, i64>,
}

impl DiskQuota {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quota for a single medium
    pub fn of(medium: impl Into<String>, quota: i64) -> Self {
        let mut medium_to_quota = BTreeMap::new();
        medium_to_quota.insert(medium.into(), quota);
        Self { medium_to_quota }
    }

    pub fn is_empty(&self) -> bool {
        self.medium_to_quota.values().all(|&quota| quota == 0)
    }

    /// True if `self` can satisfy `demand` on every medium
    pub fn dominates(&self, demand: &Self) -> bool {
        demand
            .medium_to_quota
            .iter()
            .all(|(medium, &quota)| self.medium_to_quota.get(medium).copied().unwrap_or(0) >= quota)
    }

    /// Merge another quota in
    pub fn add(&mut self, other: &Self) {
        for (medium, &quota) in &other.medium_to_quota {
            *self.medium_to_quota.entry(medium.clone()).or_insert(0) += quota;
        }
    }

    /// Subtract another quota
    pub fn subtract(&mut self, other: &Self) {
        for (medium, &quota) in &other.medium_to_quota {
            *self.medium_to_quota.entry(medium.clone()).or_insert(0) -= quota;
        }
    }
}

/// Resource vector together with its disk demand
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobResourcesWithQuota {
    pub resources: JobResources,
    pub disk_quota: DiskQuota,
}

impl JobResourcesWithQuota {
    pub fn new(resources: JobResources) -> Self {
        Self {
            resources,
            disk_quota: DiskQuota::new(),
        }
    }

    pub fn with_disk_quota(resources: JobResources, disk_quota: DiskQuota) -> Self {
        Self {
            resources,
            disk_quota,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(cpu: f64, memory: i64, user_slots: i64) -> JobResources {
        JobResources {
            cpu,
            memory,
            user_slots,
            network: 0,
            gpu: 0,
        }
    }

    #[test]
    fn test_add_sub_roundtrip() {
        let a = res(4.0, 1024, 2);
        let b = res(1.5, 512, 1);
        assert_eq!(a + b - b, a);
    }

    #[test]
    fn test_dominates() {
        let limits = res(8.0, 2048, 4);
        assert!(limits.dominates(&res(8.0, 2048, 4)));
        assert!(limits.dominates(&res(1.0, 0, 0)));
        assert!(!limits.dominates(&res(8.5, 0, 0)));
        assert!(!limits.dominates(&res(0.0, 4096, 0)));
    }

    #[test]
    fn test_dominant_ratio() {
        let limits = res(10.0, 1000, 10);
        let usage = res(5.0, 900, 1);
        assert!((usage.dominant_ratio(&limits) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_dominant_ratio_zero_over_zero() {
        let limits = res(10.0, 0, 0);
        let usage = res(5.0, 0, 0);
        assert!((usage.dominant_ratio(&limits) - 0.5).abs() < 1e-9);
        assert_eq!(JobResources::zero().dominant_ratio(&JobResources::zero()), 0.0);
    }

    #[test]
    fn test_scalar_multiply() {
        let a = res(2.0, 1000, 4);
        let half = a * 0.5;
        assert_eq!(half, res(1.0, 500, 2));
    }

    #[test]
    fn test_clamp_non_negative() {
        let a = res(1.0, 100, 1) - res(2.0, 50, 3);
        assert_eq!(a.clamp_non_negative(), res(0.0, 50, 0));
    }

    #[test]
    fn test_infinite_limits_constrain_only_named_components() {
        let limits = JobResources {
            cpu: 4.0,
            ..JobResources::infinite()
        };
        assert!(limits.dominates(&res(4.0, 1 << 40, 10_000)));
        assert!(!limits.dominates(&res(4.5, 0, 0)));
    }

    #[test]
    fn test_disk_quota_dominates() {
        let inventory = DiskQuota::of("ssd", 100);
        assert!(inventory.dominates(&DiskQuota::of("ssd", 100)));
        assert!(!inventory.dominates(&DiskQuota::of("ssd", 101)));
        assert!(!inventory.dominates(&DiskQuota::of("hdd", 1)));
        assert!(inventory.dominates(&DiskQuota::new()));
    }

    #[test]
    fn test_disk_quota_accumulation() {
        let mut inventory = DiskQuota::of("ssd", 100);
        inventory.add(&DiskQuota::of("hdd", 50));
        inventory.subtract(&DiskQuota::of("ssd", 30));
        assert_eq!(inventory.medium_to_quota["ssd"], 70);
        assert_eq!(inventory.medium_to_quota["hdd"], 50);
    }
}
