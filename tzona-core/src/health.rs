//! Unified health check types
//!
//! Shared between the readiness surface and the components it aggregates
//! (database availability, cache tier, downstream microservices).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Overall readiness of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Fold dependency statuses into one readiness status.
    ///
    /// Any unhealthy dependency makes the service unhealthy. Any degraded or
    /// unknown dependency makes it degraded. Disabled dependencies are neutral.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = DependencyStatus>,
    {
        let mut overall = HealthStatus::Ok;
        for status in statuses {
            match status {
                DependencyStatus::Unhealthy => return HealthStatus::Unhealthy,
                DependencyStatus::Degraded | DependencyStatus::Unknown => {
                    overall = HealthStatus::Degraded;
                }
                DependencyStatus::Ok | DependencyStatus::Disabled => {}
            }
        }
        overall
    }

    /// Only an unhealthy service fails readiness.
    pub fn is_ready(self) -> bool {
        self != HealthStatus::Unhealthy
    }
}

/// Health of a single dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum DependencyStatus {
    /// Dependency is fully operational
    Ok,
    /// Dependency works with reduced capability
    Degraded,
    /// Dependency is not reachable
    Unhealthy,
    /// Not yet determined
    Unknown,
    /// Not configured for this deployment
    Disabled,
}

/// Detailed health check result for one dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub status: DependencyStatus,
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl HealthCheck {
    pub fn new(component: impl Into<String>, status: DependencyStatus) -> Self {
        Self {
            status,
            component: component.into(),
            message: None,
            latency_ms: None,
            metadata: None,
        }
    }

    pub fn ok(component: impl Into<String>) -> Self {
        Self::new(component, DependencyStatus::Ok)
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, DependencyStatus::Degraded).with_message(message)
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, DependencyStatus::Unhealthy).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_all_ok() {
        let status = HealthStatus::aggregate([DependencyStatus::Ok, DependencyStatus::Ok]);
        assert_eq!(status, HealthStatus::Ok);
    }

    #[test]
    fn test_aggregate_unknown_degrades() {
        let status = HealthStatus::aggregate([DependencyStatus::Ok, DependencyStatus::Unknown]);
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn test_aggregate_unhealthy_wins() {
        let status = HealthStatus::aggregate([
            DependencyStatus::Degraded,
            DependencyStatus::Unhealthy,
            DependencyStatus::Ok,
        ]);
        assert_eq!(status, HealthStatus::Unhealthy);
        assert!(!status.is_ready());
    }

    #[test]
    fn test_aggregate_disabled_is_neutral() {
        let status = HealthStatus::aggregate([DependencyStatus::Disabled, DependencyStatus::Ok]);
        assert_eq!(status, HealthStatus::Ok);
        assert!(HealthStatus::Degraded.is_ready());
    }

    #[test]
    fn test_health_check_serializes_lowercase() {
        let check = HealthCheck::degraded("database", "cooldown").with_latency(12);
        let json = serde_json::to_value(&check).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["latencyMs"], 12);
        assert!(json.get("metadata").is_none());
    }
}
