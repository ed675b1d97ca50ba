//! Per-scope key versions.
//!
//! Bumping a scope's version orphans every key built with the previous one,
//! which invalidates a whole scope without enumerating its keys. Versions are
//! process-local.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::strategy::CacheResource;

pub const INITIAL_SCOPE_VERSION: u64 = 1;

#[derive(Debug, Default)]
pub struct ScopeVersions {
    versions: DashMap<(CacheResource, String), Arc<AtomicU64>>,
}

impl ScopeVersions {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, resource: CacheResource, scope: &str) -> Arc<AtomicU64> {
        if let Some(slot) = self.versions.get(&(resource, scope.to_string())) {
            return Arc::clone(slot.value());
        }
        self.versions
            .entry((resource, scope.to_string()))
            .or_insert_with(|| Arc::new(AtomicU64::new(INITIAL_SCOPE_VERSION)))
            .clone()
    }

    /// Current version; 1 for a scope never bumped.
    pub fn get(&self, resource: CacheResource, scope: &str) -> u64 {
        self.versions
            .get(&(resource, scope.to_string()))
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(INITIAL_SCOPE_VERSION)
    }

    /// Increment and return the new version. Wraps from `u64::MAX` to 1.
    pub fn bump(&self, resource: CacheResource, scope: &str) -> u64 {
        let slot = self.slot(resource, scope);
        let previous = slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(if current == u64::MAX {
                    INITIAL_SCOPE_VERSION
                } else {
                    current + 1
                })
            })
            .unwrap_or(INITIAL_SCOPE_VERSION);
        if previous == u64::MAX {
            INITIAL_SCOPE_VERSION
        } else {
            previous + 1
        }
    }

    /// Force a version. Values below 1 are raised to 1.
    pub fn set(&self, resource: CacheResource, scope: &str, version: u64) {
        self.slot(resource, scope)
            .store(version.max(INITIAL_SCOPE_VERSION), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
