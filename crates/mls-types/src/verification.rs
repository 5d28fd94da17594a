use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DiffStatus {
    Identical,
    Acceptable,
    NeedsReview,
    Failed,
}

impl DiffStatus {
    /// Thresholds: identical < 0.1 %, acceptable < 2 %, needs-review < 10 %.
    pub fn from_percent(diff_percent: f64) -> Self {
        if diff_percent < 0.1 {
            DiffStatus::Identical
        } else if diff_percent < 2.0 {
            DiffStatus::Acceptable
        } else if diff_percent < 10.0 {
            DiffStatus::NeedsReview
        } else {
            DiffStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisualDiffResult {
    pub page: String,
    pub viewport: String,
    pub diff_percent: f64,
    pub diff_pixels: u64,
    pub status: DiffStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionalResult {
    pub page: String,
    pub selector: String,
    pub action: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkCheckResult {
    pub page: String,
    pub href: String,
    pub status: u16,
    pub passed: bool,
    #[serde(default)]
    pub external: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PagePerformance {
    pub page: String,
    pub performance: f64,
    pub ttfb_ms: f64,
    pub load_time_ms: f64,
}

/// Combined output of the four verification categories. Partial failures in
/// one category leave the others populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    #[serde(default)]
    pub visual: Vec<VisualDiffResult>,
    #[serde(default)]
    pub functional: Vec<FunctionalResult>,
    #[serde(default)]
    pub links: Vec<LinkCheckResult>,
    #[serde(default)]
    pub performance: Vec<PagePerformance>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl VerificationReport {
    pub fn visual_failures(&self) -> usize {
        self.visual
            .iter()
            .filter(|v| v.status == DiffStatus::Failed)
            .count()
    }

    pub fn functional_failures(&self) -> usize {
        self.functional.iter().filter(|f| !f.passed).count()
    }

    pub fn broken_links(&self) -> usize {
        self.links.iter().filter(|l| !l.passed).count()
    }

    pub fn is_clean(&self) -> bool {
        self.visual_failures() == 0 && self.functional_failures() == 0 && self.broken_links() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_status_thresholds() {
        assert_eq!(DiffStatus::from_percent(0.05), DiffStatus::Identical);
        assert_eq!(DiffStatus::from_percent(1.9), DiffStatus::Acceptable);
        assert_eq!(DiffStatus::from_percent(9.99), DiffStatus::NeedsReview);
        assert_eq!(DiffStatus::from_percent(10.0), DiffStatus::Failed);
    }

    #[test]
    fn report_counts_failures_per_category() {
        let report = VerificationReport {
            visual: vec![VisualDiffResult {
                page: "index.html".into(),
                viewport: "mobile".into(),
                diff_percent: 12.0,
                diff_pixels: 40_000,
                status: DiffStatus::Failed,
            }],
            functional: vec![FunctionalResult {
                page: "index.html".into(),
                selector: ".slider".into(),
                action: "click".into(),
                passed: false,
                failure_reason: Some("no state change".into()),
            }],
            links: Vec::new(),
            performance: Vec::new(),
            errors: Vec::new(),
        };
        assert_eq!(report.visual_failures(), 1);
        assert_eq!(report.functional_failures(), 1);
        assert!(!report.is_clean());
    }
}
