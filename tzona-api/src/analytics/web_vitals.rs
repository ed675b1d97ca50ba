//! Client-reported web vitals.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "UPPERCASE")]
pub enum WebVitalMetric {
    Cls,
    Fid,
    Inp,
    Lcp,
    Ttfb,
    Fcp,
}

impl WebVitalMetric {
    pub const ALL: [WebVitalMetric; 6] = [
        WebVitalMetric::Cls,
        WebVitalMetric::Fid,
        WebVitalMetric::Inp,
        WebVitalMetric::Lcp,
        WebVitalMetric::Ttfb,
        WebVitalMetric::Fcp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WebVitalMetric::Cls => "CLS",
            WebVitalMetric::Fid => "FID",
            WebVitalMetric::Inp => "INP",
            WebVitalMetric::Lcp => "LCP",
            WebVitalMetric::Ttfb => "TTFB",
            WebVitalMetric::Fcp => "FCP",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for WebVitalMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "kebab-case")]
pub enum WebVitalRating {
    Good,
    NeedsImprovement,
    Poor,
}

impl WebVitalRating {
    pub fn as_str(self) -> &'static str {
        match self {
            WebVitalRating::Good => "good",
            WebVitalRating::NeedsImprovement => "needs-improvement",
            WebVitalRating::Poor => "poor",
        }
    }
}

/// A validated client report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct WebVitalReport {
    pub metric: WebVitalMetric,
    pub value: f64,
    pub rating: WebVitalRating,
    /// Client timestamp, epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub navigation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebVitalCounts {
    pub total: u64,
    pub good: u64,
    pub needs_improvement: u64,
    pub poor: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebVitalMetricSnapshot {
    pub metric: WebVitalMetric,
    #[serde(flatten)]
    pub counts: WebVitalCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebVitalsSnapshot {
    pub updated_at: Option<DateTime<Utc>>,
    pub metrics: Vec<WebVitalMetricSnapshot>,
}

#[derive(Default)]
struct WebVitalsState {
    counts: [WebVitalCounts; 6],
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct WebVitalsStore {
    state: Mutex<WebVitalsState>,
}

impl WebVitalsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, WebVitalsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, report: &WebVitalReport) {
        let mut state = self.state();
        let counts = &mut state.counts[report.metric.index()];
        counts.total += 1;
        match report.rating {
            WebVitalRating::Good => counts.good += 1,
            WebVitalRating::NeedsImprovement => counts.needs_improvement += 1,
            WebVitalRating::Poor => counts.poor += 1,
        }
        counts.last_value = Some(report.value);
        counts.last_timestamp = Some(report.timestamp);
        state.updated_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> WebVitalsSnapshot {
        let state = self.state();
        WebVitalsSnapshot {
            updated_at: state.updated_at,
            metrics: WebVitalMetric::ALL
                .iter()
                .map(|metric| WebVitalMetricSnapshot {
                    metric: *metric,
                    counts: state.counts[metric.index()].clone(),
                })
                .collect(),
        }
    }

    pub fn reset(&self) {
        *self.state() = WebVitalsState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(metric: WebVitalMetric, rating: WebVitalRating, value: f64) -> WebVitalReport {
        WebVitalReport {
            metric,
            value,
            rating,
            timestamp: 1_700_000_000_000,
            page: None,
            navigation_type: None,
            session_id: None,
        }
    }

    #[test]
    fn test_wire_names() -> Result<(), serde_json::Error> {
        let parsed: WebVitalReport = serde_json::from_str(
            r#"{"metric":"TTFB","value":12.5,"rating":"needs-improvement","timestamp":1,"navigationType":"reload"}"#,
        )?;
        assert_eq!(parsed.metric, WebVitalMetric::Ttfb);
        assert_eq!(parsed.rating, WebVitalRating::NeedsImprovement);
        assert_eq!(parsed.navigation_type.as_deref(), Some("reload"));
        assert!(serde_json::from_str::<WebVitalReport>(
            r#"{"metric":"XYZ","value":1,"rating":"good","timestamp":1}"#
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn test_counts_by_rating() {
        let store = WebVitalsStore::new();
        store.record(&report(WebVitalMetric::Lcp, WebVitalRating::Good, 1200.0));
        store.record(&report(WebVitalMetric::Lcp, WebVitalRating::Poor, 5200.0));
        store.record(&report(WebVitalMetric::Cls, WebVitalRating::NeedsImprovement, 0.2));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.metrics.len(), 6);
        assert!(snapshot.updated_at.is_some());

        let lcp = &snapshot.metrics[3];
        assert_eq!(lcp.metric, WebVitalMetric::Lcp);
        assert_eq!(lcp.counts.total, 2);
        assert_eq!(lcp.counts.good, 1);
        assert_eq!(lcp.counts.poor, 1);
        assert_eq!(lcp.counts.last_value, Some(5200.0));

        let cls = &snapshot.metrics[0];
        assert_eq!(cls.counts.needs_improvement, 1);
    }

    #[test]
    fn test_snapshot_json_is_flat() -> Result<(), serde_json::Error> {
        let store = WebVitalsStore::new();
        store.record(&report(WebVitalMetric::Fcp, WebVitalRating::Good, 800.0));
        let json = serde_json::to_value(store.snapshot())?;
        assert_eq!(json["metrics"][5]["metric"], "FCP");
        assert_eq!(json["metrics"][5]["needsImprovement"], 0);
        assert_eq!(json["metrics"][5]["lastValue"], 800.0);
        Ok(())
    }
}
