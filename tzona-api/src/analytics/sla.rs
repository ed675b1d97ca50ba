//! Per-route SLA tracking.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::performance::p95_index;
use crate::config::{SlaTarget, SlaTargets};

#[derive(Debug, Default)]
struct SlaBucket {
    total: u64,
    success: u64,
    durations: VecDeque<f64>,
    last_updated_at: Option<DateTime<Utc>>,
    breaches: u64,
    breaching: bool,
}

impl SlaBucket {
    fn availability(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.success as f64 / self.total as f64
        }
    }

    fn p95(&self) -> f64 {
        if self.durations.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.durations.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted[p95_index(sorted.len())]
    }
}

/// Result of recording one sample against a target.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaEvaluation {
    pub target_id: String,
    pub availability: f64,
    pub p95_ms: f64,
    pub breached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaTargetSnapshot {
    pub id: String,
    pub method: String,
    pub route: String,
    pub window_samples: u64,
    pub availability: f64,
    pub availability_target: f64,
    pub p95_ms: f64,
    pub p95_target_ms: u64,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub breaches: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaSnapshot {
    pub targets: Vec<SlaTargetSnapshot>,
    pub max_samples: usize,
}

pub struct SlaMonitor {
    targets: SlaTargets,
    buckets: Mutex<HashMap<String, SlaBucket>>,
}

impl Default for SlaMonitor {
    fn default() -> Self {
        Self::new(SlaTargets::default())
    }
}

impl SlaMonitor {
    pub fn new(targets: SlaTargets) -> Self {
        Self {
            targets,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, SlaBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn find_target(&self, method: &str, route: &str) -> Option<&SlaTarget> {
        self.targets
            .targets
            .iter()
            .find(|t| t.method.eq_ignore_ascii_case(method) && t.route == route)
    }

    /// Record a finished request. Returns `None` when no target matches.
    pub fn record(
        &self,
        method: &str,
        route: Option<&str>,
        status: u16,
        duration_ms: f64,
    ) -> Option<SlaEvaluation> {
        let target = self.find_target(method, route?)?;

        let mut buckets = self.buckets();
        let bucket = buckets.entry(target.key()).or_default();
        bucket.total += 1;
        if status < 500 {
            bucket.success += 1;
        }
        bucket.durations.push_back(duration_ms.max(0.0));
        while bucket.durations.len() > self.targets.max_samples {
            bucket.durations.pop_front();
        }
        bucket.last_updated_at = Some(Utc::now());

        let availability = bucket.availability();
        let p95_ms = bucket.p95();
        let breached = availability < target.availability || p95_ms > target.p95_ms as f64;
        if breached {
            bucket.breaches += 1;
        }

        if breached && !bucket.breaching {
            warn!(
                sla_target = %target.id,
                route = %target.route,
                availability,
                availability_target = target.availability,
                p95_ms,
                p95_target_ms = target.p95_ms,
                "SLA breach"
            );
        } else if !breached && bucket.breaching {
            info!(sla_target = %target.id, availability, p95_ms, "SLA recovered");
        }
        bucket.breaching = breached;

        Some(SlaEvaluation {
            target_id: target.id.clone(),
            availability,
            p95_ms,
            breached,
        })
    }

    pub fn snapshot(&self) -> SlaSnapshot {
        let buckets = self.buckets();
        let empty = SlaBucket::default();
        let targets = self
            .targets
            .targets
            .iter()
            .map(|target| {
                let bucket = buckets.get(&target.key()).unwrap_or(&empty);
                SlaTargetSnapshot {
                    id: target.id.clone(),
                    method: target.method.clone(),
                    route: target.route.clone(),
                    window_samples: bucket.total,
                    availability: bucket.availability(),
                    availability_target: target.availability,
                    p95_ms: bucket.p95(),
                    p95_target_ms: target.p95_ms,
                    last_updated_at: bucket.last_updated_at,
                    breaches: bucket.breaches,
                }
            })
            .collect();
        SlaSnapshot {
            targets,
            max_samples: self.targets.max_samples,
        }
    }

    pub fn reset(&self) {
        self.buckets().clear();
    }
}
