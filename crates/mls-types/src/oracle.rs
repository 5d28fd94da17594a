use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting for oracle calls, accumulated per run for cost tracking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    /// Cost in USD for a per-million-token price pair.
    pub fn cost_usd(&self, input_per_mtok: f64, output_per_mtok: f64) -> f64 {
        self.input_tokens as f64 / 1_000_000.0 * input_per_mtok
            + self.output_tokens as f64 / 1_000_000.0 * output_per_mtok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedPerformance {
    pub performance_score: f64,
    pub payload_savings_percent: f64,
    pub lcp_improvement_percent: f64,
}

/// The oracle's answer to a plan request: a full settings override document
/// with per-section rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationPlan {
    pub settings: Value,
    /// Rationale keyed by settings section (`css`, `js`, …).
    #[serde(default)]
    pub rationale: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<ExpectedPerformance>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewVerdict {
    Pass,
    NeedsChanges,
    CriticalFailure,
}

impl ReviewVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewVerdict::Pass => "pass",
            ReviewVerdict::NeedsChanges => "needs-changes",
            ReviewVerdict::CriticalFailure => "critical-failure",
        }
    }
}

/// The oracle's answer to a review request at the end of an iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiReviewDecision {
    pub verdict: ReviewVerdict,
    /// Sparse settings delta to merge when verdict is `needs-changes`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting_delta: Option<Value>,
    pub reasoning: String,
    #[serde(default)]
    pub should_rebuild: bool,
    #[serde(default)]
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verdict_uses_kebab_case_on_the_wire() {
        let decision: AiReviewDecision = serde_json::from_value(json!({
            "verdict": "needs-changes",
            "settingDelta": {"css": {"purgeAggressiveness": "safe"}},
            "reasoning": "slider classes were purged",
            "shouldRebuild": true,
            "confidence": 0.8,
        }))
        .unwrap();
        assert_eq!(decision.verdict, ReviewVerdict::NeedsChanges);
        assert!(decision.setting_delta.is_some());
    }

    #[test]
    fn token_usage_cost() {
        let usage = TokenUsage {
            input_tokens: 2_000_000,
            output_tokens: 1_000_000,
        };
        let cost = usage.cost_usd(3.0, 15.0);
        assert!((cost - 21.0).abs() < f64::EPSILON);
    }
}
