use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TopicKind {
    Build,
    Agent,
    LiveEdit,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Build => "build",
            TopicKind::Agent => "agent",
            TopicKind::LiveEdit => "live-edit",
        }
    }
}

/// Topic key of form `{kind}:{siteId}` or `{kind}:{siteId}:{stream}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    pub site_id: String,
    pub stream: Option<String>,
}

impl Topic {
    pub fn new(kind: TopicKind, site_id: impl Into<String>) -> Self {
        Self {
            kind,
            site_id: site_id.into(),
            stream: None,
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn key(&self) -> String {
        match &self.stream {
            Some(stream) => format!("{}:{}:{}", self.kind.as_str(), self.site_id, stream),
            None => format!("{}:{}", self.kind.as_str(), self.site_id),
        }
    }
}

/// Typed events published on a topic. Serialized with a `type` tag so SSE
/// clients can switch on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Log {
        ts: DateTime<Utc>,
        level: String,
        message: String,
    },
    Phase {
        phase: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
    },
    StepStart {
        step: String,
        description: String,
    },
    StepComplete {
        step: String,
        result: Value,
    },
    Patch {
        path: String,
    },
    Plan {
        #[serde(rename = "planId")]
        plan_id: String,
        edits: Vec<Value>,
        rationale: String,
    },
    Deploy {
        message: String,
    },
    VerificationStart,
    VerificationResult {
        payload: Value,
    },
    Done,
    Error {
        message: String,
    },
    Heartbeat,
}

impl ProgressEvent {
    pub fn log(level: &str, message: impl Into<String>) -> Self {
        ProgressEvent::Log {
            ts: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        }
    }

    pub fn phase(phase: &str) -> Self {
        ProgressEvent::Phase {
            phase: phase.to_string(),
            iteration: None,
        }
    }

    pub fn phase_iteration(phase: &str, iteration: u32) -> Self {
        ProgressEvent::Phase {
            phase: phase.to_string(),
            iteration: Some(iteration),
        }
    }

    pub fn step_start(step: &str, description: impl Into<String>) -> Self {
        ProgressEvent::StepStart {
            step: step.to_string(),
            description: description.into(),
        }
    }

    pub fn step_complete(step: &str, result: Value) -> Self {
        ProgressEvent::StepComplete {
            step: step.to_string(),
            result,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ProgressEvent::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_keys_include_optional_stream() {
        let plain = Topic::new(TopicKind::Build, "site_a");
        assert_eq!(plain.key(), "build:site_a");
        let scoped = Topic::new(TopicKind::LiveEdit, "site_a").with_stream("audit");
        assert_eq!(scoped.key(), "live-edit:site_a:audit");
    }

    #[test]
    fn events_carry_a_type_tag() {
        let json = serde_json::to_value(ProgressEvent::phase("crawl")).unwrap();
        assert_eq!(json["type"], "phase");
        assert_eq!(json["phase"], "crawl");
        let json = serde_json::to_value(ProgressEvent::Heartbeat).unwrap();
        assert_eq!(json["type"], "heartbeat");
    }
}
