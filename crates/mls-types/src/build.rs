use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Crawling,
    Optimizing,
    Deploying,
    Success,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Crawling => "crawling",
            BuildStatus::Optimizing => "optimizing",
            BuildStatus::Deploying => "deploying",
            BuildStatus::Success => "success",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(BuildStatus::Queued),
            "crawling" => Some(BuildStatus::Crawling),
            "optimizing" => Some(BuildStatus::Optimizing),
            "deploying" => Some(BuildStatus::Deploying),
            "success" => Some(BuildStatus::Success),
            "failed" => Some(BuildStatus::Failed),
            "cancelled" => Some(BuildStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildScope {
    Full,
    Partial,
}

impl BuildScope {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildScope::Full => "full",
            BuildScope::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildTrigger {
    User,
    Webhook,
    Schedule,
    Agent,
}

impl BuildTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildTrigger::User => "user",
            BuildTrigger::Webhook => "webhook",
            BuildTrigger::Schedule => "schedule",
            BuildTrigger::Agent => "agent",
        }
    }
}

/// The eight internal pipeline phases. `optimizing` is the umbrella label
/// shown to clients for `Images..=Fonts`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Crawl,
    Images,
    Css,
    Js,
    Html,
    Fonts,
    Deploy,
    Measure,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 8] = [
        BuildPhase::Crawl,
        BuildPhase::Images,
        BuildPhase::Css,
        BuildPhase::Js,
        BuildPhase::Html,
        BuildPhase::Fonts,
        BuildPhase::Deploy,
        BuildPhase::Measure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BuildPhase::Crawl => "crawl",
            BuildPhase::Images => "images",
            BuildPhase::Css => "css",
            BuildPhase::Js => "js",
            BuildPhase::Html => "html",
            BuildPhase::Fonts => "fonts",
            BuildPhase::Deploy => "deploy",
            BuildPhase::Measure => "measure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == value)
    }

    /// Coarse status label the state machine exposes while this phase runs.
    pub fn display_status(self) -> BuildStatus {
        match self {
            BuildPhase::Crawl => BuildStatus::Crawling,
            BuildPhase::Deploy | BuildPhase::Measure => BuildStatus::Deploying,
            _ => BuildStatus::Optimizing,
        }
    }
}

/// Structured failure payload carried on a failed build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    pub phase: String,
    pub step: String,
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorDetails {
    pub fn fatal(phase: BuildPhase, step: &str, message: impl Into<String>) -> Self {
        Self {
            phase: phase.as_str().to_string(),
            step: step.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(phase: BuildPhase, step: &str, message: impl Into<String>) -> Self {
        Self {
            phase: phase.as_str().to_string(),
            step: step.to_string(),
            message: message.into(),
            retryable: true,
        }
    }
}

/// Byte totals broken down by asset class.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SizeBreakdown {
    pub html: u64,
    pub css: u64,
    pub js: u64,
    pub images: u64,
    pub fonts: u64,
}

impl SizeBreakdown {
    pub fn total(&self) -> u64 {
        self.html + self.css + self.js + self.images + self.fonts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildLogLine {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// One end-to-end pipeline run for a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: String,
    pub site_id: String,
    pub scope: BuildScope,
    pub triggered_by: BuildTrigger,
    pub status: BuildStatus,
    pub pages_total: u64,
    pub pages_processed: u64,
    pub original_size: SizeBreakdown,
    pub optimized_size: SizeBreakdown,
    pub iframe_facades_applied: u64,
    pub scripts_removed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_before: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_after: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    /// Fully resolved settings snapshot this build ran with.
    #[serde(default)]
    pub resolved_settings: Value,
    /// Last phase that completed; retries re-enter after it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_phase: Option<BuildPhase>,
    #[serde(default)]
    pub log: Vec<BuildLogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Build {
    pub fn new(site_id: &str, scope: BuildScope, triggered_by: BuildTrigger) -> Self {
        Self {
            id: crate::build_id(),
            site_id: site_id.to_string(),
            scope,
            triggered_by,
            status: BuildStatus::Queued,
            pages_total: 0,
            pages_processed: 0,
            original_size: SizeBreakdown::default(),
            optimized_size: SizeBreakdown::default(),
            iframe_facades_applied: 0,
            scripts_removed: 0,
            score_before: None,
            score_after: None,
            error_details: None,
            resolved_settings: Value::Object(serde_json::Map::new()),
            checkpoint_phase: None,
            log: Vec::new(),
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(BuildStatus::Success.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
        assert!(!BuildStatus::Deploying.is_terminal());
    }

    #[test]
    fn phase_display_status_buckets() {
        assert_eq!(BuildPhase::Crawl.display_status(), BuildStatus::Crawling);
        assert_eq!(BuildPhase::Css.display_status(), BuildStatus::Optimizing);
        assert_eq!(BuildPhase::Fonts.display_status(), BuildStatus::Optimizing);
        assert_eq!(BuildPhase::Deploy.display_status(), BuildStatus::Deploying);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            BuildStatus::Queued,
            BuildStatus::Crawling,
            BuildStatus::Optimizing,
            BuildStatus::Deploying,
            BuildStatus::Success,
            BuildStatus::Failed,
            BuildStatus::Cancelled,
        ] {
            assert_eq!(BuildStatus::parse(status.as_str()), Some(status));
        }
    }
}
