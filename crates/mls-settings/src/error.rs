use thiserror::Error;

/// Configuration failures are fatal at build start and never retried.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings document failed validation: {0}")]
    Invalid(String),

    #[error("invalid URL pattern `{pattern}`: {detail}")]
    InvalidPattern { pattern: String, detail: String },

    #[error(transparent)]
    Store(#[from] mls_store::StoreError),
}
