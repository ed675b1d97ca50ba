//! API Configuration Module
//!
//! Bind address, request timeout, availability bypass paths, downstream
//! microservice probes and SLA targets. Configuration is loaded from
//! environment variables with sensible defaults for development.

use std::net::SocketAddr;
use std::time::Duration;

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// Paths that stay reachable while the database is unavailable.
pub const DEFAULT_BYPASS_PATHS: [&str; 4] = ["/health", "/health/live", "/api/health", "/metrics"];

pub const DEFAULT_SERVICE_NAME: &str = "training-area-api";

/// A downstream service checked by the readiness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroserviceTarget {
    pub name: String,
    /// Base URL; the probe calls `{base_url}/api/health`.
    pub base_url: String,
}

impl MicroserviceTarget {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn health_url(&self) -> String {
        format!("{}/api/health", self.base_url)
    }
}

/// Parse a `name=url,name=url` list. Malformed entries are skipped.
pub fn parse_microservices(raw: &str) -> Vec<MicroserviceTarget> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, url) = entry.split_once('=')?;
            let (name, url) = (name.trim(), url.trim());
            (!name.is_empty() && !url.is_empty()).then(|| MicroserviceTarget::new(name, url))
        })
        .collect()
}

/// HTTP service configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,

    /// Applied to every request by the tower-http timeout layer.
    pub request_timeout: Duration,

    /// Exact paths that skip the availability gate.
    pub availability_bypass_paths: Vec<String>,

    /// Reported by liveness and readiness responses.
    pub service_name: String,

    pub microservices: Vec<MicroserviceTarget>,
    pub probe_timeout: Duration,

    /// How long a readiness snapshot is reused.
    pub health_cache_ttl: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            request_timeout: Duration::from_secs(30),
            availability_bypass_paths: DEFAULT_BYPASS_PATHS.iter().map(|p| p.to_string()).collect(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            microservices: Vec::new(),
            probe_timeout: Duration::from_millis(1500),
            health_cache_ttl: Duration::from_secs(5),
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `TZONA_API_HOST`: Bind host (default: 0.0.0.0)
    /// - `PORT` or `TZONA_API_PORT`: Bind port (default: 3000)
    /// - `TZONA_REQUEST_TIMEOUT_MS`: Per-request timeout (default: 30000, min 100)
    /// - `TZONA_AVAILABILITY_BYPASS_PATHS`: Comma-separated paths that skip the gate
    /// - `TZONA_SERVICE_NAME`: Service name (default: training-area-api)
    /// - `TZONA_MICROSERVICES`: `name=url` pairs, comma-separated
    /// - `TZONA_MICROSERVICE_TIMEOUT_MS`: Probe timeout (default: 1500)
    /// - `TZONA_HEALTH_CACHE_TTL_MS`: Readiness snapshot reuse (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = std::env::var("TZONA_API_HOST")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.host);

        let port = std::env::var("PORT")
            .or_else(|_| std::env::var("TZONA_API_PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        let request_timeout = std::env::var("TZONA_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|ms| Duration::from_millis(ms.max(100)))
            .unwrap_or(defaults.request_timeout);

        let availability_bypass_paths = std::env::var("TZONA_AVAILABILITY_BYPASS_PATHS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|paths| !paths.is_empty())
            .unwrap_or(defaults.availability_bypass_paths);

        let service_name = std::env::var("TZONA_SERVICE_NAME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.service_name);

        let microservices = std::env::var("TZONA_MICROSERVICES")
            .ok()
            .map(|s| parse_microservices(&s))
            .unwrap_or_default();

        let probe_timeout = std::env::var("TZONA_MICROSERVICE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.probe_timeout);

        let health_cache_ttl = std::env::var("TZONA_HEALTH_CACHE_TTL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.health_cache_ttl);

        Self {
            host,
            port,
            request_timeout,
            availability_bypass_paths,
            service_name,
            microservices,
            probe_timeout,
            health_cache_ttl,
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    pub fn is_bypassed(&self, path: &str) -> bool {
        self.availability_bypass_paths.iter().any(|p| p == path)
    }

    pub fn with_microservice(mut self, target: MicroserviceTarget) -> Self {
        self.microservices.push(target);
        self
    }

    pub fn with_health_cache_ttl(mut self, ttl: Duration) -> Self {
        self.health_cache_ttl = ttl;
        self
    }
}

// ============================================================================
// SLA TARGETS
// ============================================================================

/// Availability and latency objective for one route.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaTarget {
    pub id: String,
    pub method: String,
    pub route: String,
    pub availability: f64,
    pub p95_ms: u64,
}

impl SlaTarget {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        route: impl Into<String>,
        availability: f64,
        p95_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into().to_uppercase(),
            route: route.into(),
            availability: availability.clamp(0.0, 1.0),
            p95_ms,
        }
    }

    /// `"METHOD route"`, the key samples are matched on.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.route)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlaTargets {
    pub targets: Vec<SlaTarget>,
    /// Durations retained per target.
    pub max_samples: usize,
}

impl Default for SlaTargets {
    fn default() -> Self {
        Self {
            targets: vec![
                SlaTarget::new("profile", "GET", "/api/profile/summary", 0.995, 1200),
                SlaTarget::new("sessions", "GET", "/api/sessions", 0.99, 1500),
                SlaTarget::new("daily-advice", "GET", "/api/daily-advice", 0.99, 1200),
            ],
            max_samples: 1000,
        }
    }
}

impl SlaTargets {
    /// Environment variables:
    /// - `TZONA_SLA_MAX_SAMPLES`: Durations kept per target (default: 1000, min 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_samples = std::env::var("TZONA_SLA_MAX_SAMPLES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .map(|n| n.max(10))
            .unwrap_or(defaults.max_samples);
        Self {
            max_samples,
            ..defaults
        }
    }
}
