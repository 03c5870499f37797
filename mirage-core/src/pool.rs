use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PoolSection;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown proxy '{0}'")]
    UnknownProxy(String),
}

/// Failures before a proxy is flagged for review.
const FLAG_AFTER_FAILURES: u32 = 3;
/// Failures before a proxy is pulled from selection entirely.
const BLACKLIST_AFTER_FAILURES: u32 = 5;

const SYNTHETIC_IDENTIFIERS: [&str; 5] = [
    "synthetic-ip-001",
    "synthetic-ip-002",
    "synthetic-ip-003",
    "synthetic-ip-004",
    "synthetic-ip-005",
];

/// Derived from cumulative failures. Ordered by severity: transitions only
/// ever move towards `Blacklisted`; the sole way back is an explicit
/// operator override via [`ProxyPool::set_health`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Flagged,
    Blacklisted,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthState::Healthy => "healthy",
            HealthState::Flagged => "flagged",
            HealthState::Blacklisted => "blacklisted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPolicy {
    RoundRobin,
    LeastUsed,
    Random,
    FirstAvailable,
}

impl RotationPolicy {
    /// Unknown names degrade to first-in-catalog-order selection instead of
    /// erroring, so a config typo cannot kill a run.
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "round_robin" => RotationPolicy::RoundRobin,
            "least_used" => RotationPolicy::LeastUsed,
            "random" => RotationPolicy::Random,
            other => {
                if !other.is_empty() {
                    debug!(policy = other, "unknown rotation policy, using first available");
                }
                RotationPolicy::FirstAvailable
            }
        }
    }
}

impl fmt::Display for RotationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RotationPolicy::RoundRobin => "round_robin",
            RotationPolicy::LeastUsed => "least_used",
            RotationPolicy::Random => "random",
            RotationPolicy::FirstAvailable => "first_available",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyRecord {
    pub id: String,
    pub use_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub health: HealthState,
    pub enabled: bool,
}

impl ProxyRecord {
    fn new(id: String) -> Self {
        Self {
            id,
            use_count: 0,
            success_count: 0,
            failure_count: 0,
            last_used_at: None,
            health: HealthState::Healthy,
            enabled: true,
        }
    }

    fn selectable(&self) -> bool {
        self.enabled && self.health != HealthState::Blacklisted
    }

    fn escalate(&mut self, target: HealthState) {
        if target > self.health {
            self.health = target;
        }
    }
}

/// Point-in-time snapshot of one record, safe to hand to observers.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub id: String,
    pub use_count: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub success_rate: f64,
    pub health: HealthState,
    pub enabled: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Owns the proxy pool and its health bookkeeping. This is the only shared
/// mutable state in the engine; every operation takes the single inner lock
/// so counter updates and health transitions are atomic under concurrent
/// sessions.
#[derive(Debug)]
pub struct ProxyPool {
    records: Mutex<Vec<ProxyRecord>>,
}

impl ProxyPool {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self {
            records: Mutex::new(Vec::new()),
        };
        for id in identifiers {
            pool.add(id.into());
        }
        pool
    }

    /// Placeholder pool so selection and scoring stay exercisable without
    /// live egress resources.
    pub fn synthetic() -> Self {
        Self::new(SYNTHETIC_IDENTIFIERS)
    }

    pub fn from_config(section: &PoolSection) -> Self {
        if !section.proxies.is_empty() {
            Self::new(section.proxies.iter().cloned())
        } else if section.synthetic_pool {
            Self::synthetic()
        } else {
            Self::new(Vec::<String>::new())
        }
    }

    /// Inserts a fresh healthy record. Duplicate identifiers are ignored.
    pub fn add(&self, id: impl Into<String>) {
        let id = id.into();
        let mut records = self.records.lock().unwrap();
        if records.iter().any(|record| record.id == id) {
            warn!(proxy = %id, "duplicate proxy identifier ignored");
            return;
        }
        records.push(ProxyRecord::new(id));
    }

    /// Idempotent: removing an absent identifier is a no-op.
    pub fn remove(&self, id: &str) {
        let mut records = self.records.lock().unwrap();
        records.retain(|record| record.id != id);
    }

    /// Picks an identifier among enabled, non-blacklisted records.
    /// Selection never mutates state; ties under `least_used` resolve to
    /// catalog order.
    pub fn select(&self, policy: RotationPolicy) -> Option<String> {
        let records = self.records.lock().unwrap();
        let eligible: Vec<&ProxyRecord> = records
            .iter()
            .filter(|record| record.selectable())
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let chosen = match policy {
            RotationPolicy::RoundRobin | RotationPolicy::LeastUsed => eligible
                .iter()
                .min_by_key(|record| record.use_count)
                .copied(),
            RotationPolicy::Random => {
                let mut rng = rand::thread_rng();
                eligible.choose(&mut rng).copied()
            }
            RotationPolicy::FirstAvailable => eligible.first().copied(),
        };
        chosen.map(|record| record.id.clone())
    }

    /// Records one session outcome. Unknown identifiers are a no-op so an
    /// overridden proxy from outside the pool cannot corrupt bookkeeping.
    pub fn record_outcome(&self, id: &str, success: bool) {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.iter_mut().find(|record| record.id == id) else {
            return;
        };
        record.use_count += 1;
        if success {
            record.success_count += 1;
        } else {
            record.failure_count += 1;
            if record.failure_count >= BLACKLIST_AFTER_FAILURES {
                record.escalate(HealthState::Blacklisted);
            } else if record.failure_count >= FLAG_AFTER_FAILURES {
                record.escalate(HealthState::Flagged);
            }
            if record.health != HealthState::Healthy {
                warn!(
                    proxy = %record.id,
                    failures = record.failure_count,
                    health = %record.health,
                    "proxy demoted after repeated failures"
                );
            }
        }
        record.last_used_at = Some(Utc::now());
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> PoolResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| PoolError::UnknownProxy(id.to_string()))?;
        record.enabled = enabled;
        Ok(())
    }

    /// Operator override; the only rehabilitation path back to `Healthy`.
    pub fn set_health(&self, id: &str, health: HealthState) -> PoolResult<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| PoolError::UnknownProxy(id.to_string()))?;
        record.health = health;
        Ok(())
    }

    pub fn health_of(&self, id: &str) -> PoolResult<HealthState> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .find(|record| record.id == id)
            .map(|record| record.health)
            .ok_or_else(|| PoolError::UnknownProxy(id.to_string()))
    }

    pub fn stats(&self) -> Vec<ProxyStats> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .map(|record| ProxyStats {
                id: record.id.clone(),
                use_count: record.use_count,
                success_count: record.success_count,
                failure_count: record.failure_count,
                success_rate: if record.use_count > 0 {
                    record.success_count as f64 / record.use_count as f64
                } else {
                    0.0
                },
                health: record.health,
                enabled: record.enabled,
                last_used_at: record.last_used_at,
            })
            .collect()
    }

    pub fn count_by_state(&self, state: HealthState) -> usize {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .filter(|record| record.health == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_escalate_at_three_and_five() {
        let pool = ProxyPool::new(["a"]);
        for _ in 0..2 {
            pool.record_outcome("a", false);
        }
        assert_eq!(pool.health_of("a").unwrap(), HealthState::Healthy);

        pool.record_outcome("a", false);
        assert_eq!(pool.health_of("a").unwrap(), HealthState::Flagged);

        pool.record_outcome("a", false);
        assert_eq!(pool.health_of("a").unwrap(), HealthState::Flagged);

        pool.record_outcome("a", false);
        assert_eq!(pool.health_of("a").unwrap(), HealthState::Blacklisted);
    }

    #[test]
    fn health_never_improves_from_successes() {
        let pool = ProxyPool::new(["a"]);
        for _ in 0..3 {
            pool.record_outcome("a", false);
        }
        assert_eq!(pool.health_of("a").unwrap(), HealthState::Flagged);
        for _ in 0..20 {
            pool.record_outcome("a", true);
        }
        assert_eq!(pool.health_of("a").unwrap(), HealthState::Flagged);
    }

    #[test]
    fn operator_override_rehabilitates() {
        let pool = ProxyPool::new(["a"]);
        for _ in 0..5 {
            pool.record_outcome("a", false);
        }
        assert_eq!(pool.health_of("a").unwrap(), HealthState::Blacklisted);
        pool.set_health("a", HealthState::Healthy).unwrap();
        assert_eq!(pool.health_of("a").unwrap(), HealthState::Healthy);
    }

    #[test]
    fn select_skips_blacklisted_and_disabled() {
        let pool = ProxyPool::new(["a", "b", "c"]);
        for _ in 0..5 {
            pool.record_outcome("a", false);
        }
        pool.set_enabled("b", false).unwrap();
        for _ in 0..100 {
            for policy in [
                RotationPolicy::LeastUsed,
                RotationPolicy::Random,
                RotationPolicy::FirstAvailable,
            ] {
                assert_eq!(pool.select(policy).as_deref(), Some("c"));
            }
        }
    }

    #[test]
    fn select_returns_none_when_nothing_is_eligible() {
        let pool = ProxyPool::new(["a"]);
        pool.set_enabled("a", false).unwrap();
        assert!(pool.select(RotationPolicy::LeastUsed).is_none());
        assert!(ProxyPool::new(Vec::<String>::new())
            .select(RotationPolicy::Random)
            .is_none());
    }

    #[test]
    fn selection_does_not_mutate_counters() {
        let pool = ProxyPool::new(["a", "b"]);
        assert_eq!(pool.select(RotationPolicy::RoundRobin).as_deref(), Some("a"));
        assert_eq!(pool.select(RotationPolicy::RoundRobin).as_deref(), Some("a"));

        pool.record_outcome("a", true);
        assert_eq!(pool.select(RotationPolicy::RoundRobin).as_deref(), Some("b"));
    }

    #[test]
    fn least_used_breaks_ties_in_catalog_order() {
        let pool = ProxyPool::new(["b", "a"]);
        assert_eq!(pool.select(RotationPolicy::LeastUsed).as_deref(), Some("b"));
    }

    #[test]
    fn stats_report_success_rate() {
        let pool = ProxyPool::new(["a", "b"]);
        pool.record_outcome("a", true);
        pool.record_outcome("a", true);
        pool.record_outcome("a", false);

        let stats = pool.stats();
        let a = stats.iter().find(|s| s.id == "a").unwrap();
        assert_eq!(a.use_count, 3);
        assert!((a.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
        assert!(a.success_count + a.failure_count <= a.use_count);
        assert!(a.last_used_at.is_some());

        let b = stats.iter().find(|s| s.id == "b").unwrap();
        assert_eq!(b.success_rate, 0.0);
        assert!(b.last_used_at.is_none());
    }

    #[test]
    fn unknown_policy_falls_back_to_first_available() {
        assert_eq!(
            RotationPolicy::from_name("weighted_lottery"),
            RotationPolicy::FirstAvailable
        );
        assert_eq!(
            RotationPolicy::from_name("ROUND_ROBIN"),
            RotationPolicy::RoundRobin
        );
    }

    #[test]
    fn remove_is_idempotent_and_add_skips_duplicates() {
        let pool = ProxyPool::new(["a"]);
        pool.remove("missing");
        pool.add("a");
        assert_eq!(pool.len(), 1);
        pool.remove("a");
        pool.remove("a");
        assert!(pool.is_empty());
    }

    #[test]
    fn synthetic_pool_has_five_healthy_records() {
        let pool = ProxyPool::synthetic();
        assert_eq!(pool.len(), 5);
        assert_eq!(pool.count_by_state(HealthState::Healthy), 5);
    }

    #[test]
    fn record_outcome_for_unknown_id_is_a_noop() {
        let pool = ProxyPool::new(["a"]);
        pool.record_outcome("ghost", false);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats()[0].use_count, 0);
    }
}
