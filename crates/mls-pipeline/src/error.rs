use thiserror::Error;

use mls_adapters::UpstreamError;
use mls_types::{BuildPhase, ErrorDetails};

/// Phase-level failure. Everything a caller needs for diagnosis and retry
/// routing lives in the structured details.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("build failed in {}/{}: {}", .0.phase, .0.step, .0.message)]
    Phase(ErrorDetails),

    #[error("cancelled")]
    Cancelled,

    #[error("phase {phase} exceeded its {budget_secs}s budget")]
    Timeout { phase: String, budget_secs: u64 },
}

impl PipelineError {
    pub fn fatal(phase: BuildPhase, step: &str, message: impl Into<String>) -> Self {
        PipelineError::Phase(ErrorDetails::fatal(phase, step, message))
    }

    pub fn retryable(phase: BuildPhase, step: &str, message: impl Into<String>) -> Self {
        PipelineError::Phase(ErrorDetails::retryable(phase, step, message))
    }

    pub fn from_upstream(phase: BuildPhase, step: &str, err: UpstreamError) -> Self {
        PipelineError::Phase(ErrorDetails {
            phase: phase.as_str().to_string(),
            step: step.to_string(),
            message: err.to_string(),
            retryable: err.retryable,
        })
    }

    pub fn from_store(phase: BuildPhase, step: &str, err: mls_store::StoreError) -> Self {
        PipelineError::Phase(ErrorDetails {
            phase: phase.as_str().to_string(),
            step: step.to_string(),
            message: err.to_string(),
            retryable: err.is_transient(),
        })
    }

    pub fn from_io(phase: BuildPhase, step: &str, err: std::io::Error) -> Self {
        PipelineError::Phase(ErrorDetails {
            phase: phase.as_str().to_string(),
            step: step.to_string(),
            message: err.to_string(),
            retryable: false,
        })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Phase(details) => details.retryable,
            PipelineError::Cancelled => false,
            PipelineError::Timeout { .. } => false,
        }
    }

    pub fn details(&self, fallback_phase: BuildPhase) -> ErrorDetails {
        match self {
            PipelineError::Phase(details) => details.clone(),
            PipelineError::Cancelled => ErrorDetails {
                phase: fallback_phase.as_str().to_string(),
                step: "cancel".to_string(),
                message: "cancelled".to_string(),
                retryable: false,
            },
            PipelineError::Timeout { phase, budget_secs } => ErrorDetails {
                phase: phase.clone(),
                step: "timeout".to_string(),
                message: format!("phase budget of {budget_secs}s exceeded"),
                retryable: false,
            },
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
