//! In-process analytics collectors feeding the metrics dashboard.
//!
//! - [`performance`]: request totals, latency, throughput, slow requests
//! - [`sla`]: per-route availability and p95 objectives
//! - [`slow_query`]: database queries over the slow threshold
//! - [`web_vitals`]: client-reported page metrics

pub mod performance;
pub mod sla;
pub mod slow_query;
pub mod web_vitals;

pub use performance::{
    CompletedRequest, PerformanceCollector, PerformanceConfig, PerformanceSnapshot, SlowRequest,
};
pub use sla::{SlaEvaluation, SlaMonitor, SlaSnapshot, SlaTargetSnapshot};
pub use slow_query::{SlowQueryMonitor, SlowQuerySnapshot};
pub use web_vitals::{
    WebVitalMetric, WebVitalRating, WebVitalReport, WebVitalsSnapshot, WebVitalsStore,
};

use std::sync::Arc;

use crate::config::SlaTargets;

/// The collectors shared by middleware, the database client and handlers.
#[derive(Clone, Default)]
pub struct Analytics {
    pub performance: Arc<PerformanceCollector>,
    pub sla: Arc<SlaMonitor>,
    pub slow_queries: Arc<SlowQueryMonitor>,
    pub web_vitals: Arc<WebVitalsStore>,
}

impl Analytics {
    pub fn from_env() -> Self {
        Self {
            performance: Arc::new(PerformanceCollector::new(PerformanceConfig::from_env())),
            sla: Arc::new(SlaMonitor::new(SlaTargets::from_env())),
            slow_queries: Arc::new(SlowQueryMonitor::from_env()),
            web_vitals: Arc::new(WebVitalsStore::new()),
        }
    }

    pub fn reset(&self) {
        self.performance.reset();
        self.sla.reset();
        self.slow_queries.reset();
        self.web_vitals.reset();
    }
}
