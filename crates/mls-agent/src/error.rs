use thiserror::Error;

use mls_types::ErrorDetails;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] mls_store::StoreError),

    #[error(transparent)]
    Queue(#[from] mls_queue::QueueError),

    #[error(transparent)]
    Settings(#[from] mls_settings::SettingsError),

    #[error(transparent)]
    Upstream(#[from] mls_adapters::UpstreamError),

    #[error("build {build_id} failed in {}/{}: {}", .details.phase, .details.step, .details.message)]
    BuildFailed {
        build_id: String,
        details: ErrorDetails,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("run {run_id} cannot resume: {reason}")]
    NotResumable { run_id: String, reason: String },
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Store(err) => err.is_transient(),
            AgentError::Upstream(err) => err.retryable,
            AgentError::BuildFailed { details, .. } => details.retryable,
            _ => false,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
