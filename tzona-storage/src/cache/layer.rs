//! Resource-aware cache layer.
//!
//! Builds full keys (`base[:gv][:rv][:v{scope}][:f:{projection}]`), applies
//! adaptive TTLs and performs point and scope invalidation on top of a
//! [`CacheStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::adaptive_ttl::{AdaptiveTtl, AdaptiveTtlConfig};
use super::scope_version::ScopeVersions;
use super::store::CacheStore;
use super::strategy::{CacheResource, CacheVersioning, ResourceParams};

#[derive(Debug)]
pub struct CacheLayer {
    store: Arc<CacheStore>,
    versions: ScopeVersions,
    adaptive: AdaptiveTtl,
    versioning: CacheVersioning,
}

impl CacheLayer {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            versions: ScopeVersions::new(),
            adaptive: AdaptiveTtl::new(AdaptiveTtlConfig::default()),
            versioning: CacheVersioning::default(),
        }
    }

    pub fn with_adaptive_ttl(mut self, config: AdaptiveTtlConfig) -> Self {
        self.adaptive = AdaptiveTtl::new(config);
        self
    }

    pub fn with_versioning(mut self, versioning: CacheVersioning) -> Self {
        self.versioning = versioning.normalized();
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn scope_versions(&self) -> &ScopeVersions {
        &self.versions
    }

    pub fn adaptive_ttl(&self) -> &AdaptiveTtl {
        &self.adaptive
    }

    /// Full cache key for `params`, with an optional field projection.
    pub fn build_key(&self, params: &ResourceParams, projection: Option<&str>) -> String {
        let resource = params.resource();
        let mut key = params.base_key();
        key.push_str(&self.versioning.suffix(resource));
        if let Some(scope) = params.scope_key() {
            key.push_str(&format!(":v{}", self.versions.get(resource, &scope)));
        }
        if let Some(projection) = projection.filter(|p| !p.is_empty()) {
            key.push_str(":f:");
            key.push_str(projection);
        }
        key
    }

    pub fn adaptive_ttl_seconds(&self, resource: CacheResource, scope: Option<&str>) -> u64 {
        self.adaptive
            .ttl_seconds(resource, scope, resource.base_ttl().as_secs())
    }

    pub fn record_mutation(&self, resource: CacheResource, scope: Option<&str>) {
        self.adaptive.record_mutation(resource, scope);
    }

    fn ttl_for(&self, params: &ResourceParams) -> Duration {
        let scope = params.scope_key();
        Duration::from_secs(self.adaptive_ttl_seconds(params.resource(), scope.as_deref()))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        params: &ResourceParams,
        projection: Option<&str>,
    ) -> Option<T> {
        self.store.get(&self.build_key(params, projection)).await
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        params: &ResourceParams,
        projection: Option<&str>,
        value: &T,
    ) {
        let key = self.build_key(params, projection);
        self.store.set(&key, value, self.ttl_for(params)).await;
    }

    pub async fn remember<T, E, F, Fut>(
        &self,
        params: &ResourceParams,
        projection: Option<&str>,
        factory: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.build_key(params, projection);
        self.store.remember(&key, self.ttl_for(params), factory).await
    }

    /// Delete the exact key for `params` (no projection). Projected
    /// variants of the same key expire on their own TTL.
    pub async fn invalidate(&self, params: &ResourceParams) {
        let scope = params.scope_key();
        self.record_mutation(params.resource(), scope.as_deref());
        let key = self.build_key(params, None);
        debug!(resource = %params.resource(), key = %key, "Invalidating cache entry");
        self.store.delete(&key).await;
    }

    /// Orphan every key of `resource` in `scope`. Returns the new version, or
    /// `None` when the resource is unscoped or the scope is empty.
    pub fn bump_scope(&self, resource: CacheResource, scope: &str) -> Option<u64> {
        if !resource.is_scoped() || scope.is_empty() {
            return None;
        }
        let version = self.versions.bump(resource, scope);
        self.record_mutation(resource, Some(scope));
        debug!(resource = %resource, scope, version, "Bumped cache scope version");
        Some(version)
    }
}
