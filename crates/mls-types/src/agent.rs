use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::{ReviewVerdict, TokenUsage, VerificationReport};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Analyzing,
    Planning,
    Building,
    Verifying,
    Reviewing,
    Complete,
    Failed,
}

impl AgentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentPhase::Complete | AgentPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentPhase::Analyzing => "analyzing",
            AgentPhase::Planning => "planning",
            AgentPhase::Building => "building",
            AgentPhase::Verifying => "verifying",
            AgentPhase::Reviewing => "reviewing",
            AgentPhase::Complete => "complete",
            AgentPhase::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "analyzing" => Some(AgentPhase::Analyzing),
            "planning" => Some(AgentPhase::Planning),
            "building" => Some(AgentPhase::Building),
            "verifying" => Some(AgentPhase::Verifying),
            "reviewing" => Some(AgentPhase::Reviewing),
            "complete" => Some(AgentPhase::Complete),
            "failed" => Some(AgentPhase::Failed),
            _ => None,
        }
    }
}

/// Outcome of one optimize-verify-review pass, kept in the checkpoint so the
/// review prompt can see the full history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    pub iteration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<ReviewVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Sparse settings delta the review asked to merge before the next pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_delta: Option<Value>,
}

/// The full resumable state of a run. Persisted before every build phase;
/// the single source of truth when a crashed worker resumes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentCheckpoint {
    pub iteration: u32,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
    /// Settings document the next build should run with.
    #[serde(default)]
    pub settings: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_rationale: Option<Value>,
    #[serde(default)]
    pub tokens: TokenUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRun {
    pub id: String,
    pub site_id: String,
    pub phase: AgentPhase,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Seconds spent per phase, keyed by phase name.
    #[serde(default)]
    pub phase_timings: HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub checkpoint: AgentCheckpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_build_id: Option<String>,
    /// Presence on disk gates resumability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRun {
    pub fn new(site_id: &str, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            id: crate::run_id(),
            site_id: site_id.to_string(),
            phase: AgentPhase::Analyzing,
            iteration: 0,
            max_iterations,
            phase_timings: HashMap::new(),
            last_error: None,
            checkpoint: AgentCheckpoint::default(),
            current_build_id: None,
            workdir: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Final report assembled when a run reaches a terminal phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReport {
    pub run_id: String,
    pub site_id: String,
    pub final_verdict: String,
    pub total_iterations: u32,
    pub tokens: TokenUsage,
    #[serde(default)]
    pub history: Vec<IterationRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_are_terminal() {
        assert!(AgentPhase::Complete.is_terminal());
        assert!(AgentPhase::Failed.is_terminal());
        assert!(!AgentPhase::Reviewing.is_terminal());
    }

    #[test]
    fn checkpoint_serde_round_trip() {
        let mut run = AgentRun::new("site_a", 10);
        run.checkpoint.iteration = 3;
        run.checkpoint.history.push(IterationRecord {
            iteration: 1,
            build_id: Some("build_b".into()),
            verification: None,
            verdict: Some(ReviewVerdict::NeedsChanges),
            reasoning: Some("slider broke".into()),
            settings_delta: None,
        });
        let json = serde_json::to_string(&run).unwrap();
        let back: AgentRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.checkpoint.iteration, 3);
        assert_eq!(back.checkpoint.history.len(), 1);
    }
}
