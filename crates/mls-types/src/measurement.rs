use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeasureStrategy {
    Mobile,
    Desktop,
}

impl MeasureStrategy {
    pub const ALL: [MeasureStrategy; 2] = [MeasureStrategy::Mobile, MeasureStrategy::Desktop];

    pub fn as_str(self) -> &'static str {
        match self {
            MeasureStrategy::Mobile => "mobile",
            MeasureStrategy::Desktop => "desktop",
        }
    }
}

/// Core-vitals timings in milliseconds (CLS is unitless).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoreVitals {
    pub lcp_ms: f64,
    pub fcp_ms: f64,
    pub tbt_ms: f64,
    pub cls: f64,
    pub ttfb_ms: f64,
}

/// One endpoint's measurement outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementOutcome {
    pub url: String,
    /// 0-100 performance score.
    pub performance: f64,
    pub vitals: CoreVitals,
    pub total_bytes: u64,
    /// Raw upstream response, kept for later inspection.
    #[serde(default)]
    pub raw: Value,
}

/// One measurement run comparing the source endpoint to the optimized edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementComparison {
    pub id: String,
    pub site_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    pub strategy: MeasureStrategy,
    pub original: MeasurementOutcome,
    pub optimized: MeasurementOutcome,
    /// Per-metric improvement percentages keyed by metric name.
    #[serde(default)]
    pub improvements: Value,
    pub payload_savings_bytes: i64,
    pub measured_at: DateTime<Utc>,
}

impl MeasurementComparison {
    pub fn compare(
        site_id: &str,
        build_id: Option<&str>,
        strategy: MeasureStrategy,
        original: MeasurementOutcome,
        optimized: MeasurementOutcome,
    ) -> Self {
        let improvements = serde_json::json!({
            "performance": improvement_pct(original.performance, optimized.performance, true),
            "lcpMs": improvement_pct(original.vitals.lcp_ms, optimized.vitals.lcp_ms, false),
            "fcpMs": improvement_pct(original.vitals.fcp_ms, optimized.vitals.fcp_ms, false),
            "tbtMs": improvement_pct(original.vitals.tbt_ms, optimized.vitals.tbt_ms, false),
            "ttfbMs": improvement_pct(original.vitals.ttfb_ms, optimized.vitals.ttfb_ms, false),
        });
        let payload_savings_bytes = original.total_bytes as i64 - optimized.total_bytes as i64;
        Self {
            id: crate::prefixed_id("meas"),
            site_id: site_id.to_string(),
            build_id: build_id.map(str::to_string),
            strategy,
            original,
            optimized,
            improvements,
            payload_savings_bytes,
            measured_at: Utc::now(),
        }
    }
}

/// Percent improvement; `higher_is_better` flips the direction for scores.
fn improvement_pct(before: f64, after: f64, higher_is_better: bool) -> f64 {
    if before.abs() < f64::EPSILON {
        return 0.0;
    }
    let delta = if higher_is_better {
        after - before
    } else {
        before - after
    };
    (delta / before * 100.0 * 100.0).round() / 100.0
}
