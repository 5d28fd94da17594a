use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("no successful build exists for site {site_id}")]
    NotFound { site_id: String },

    #[error("path `{path}` escapes the workspace")]
    PathEscape { path: String },

    #[error("no current plan with id {plan_id}")]
    UnknownPlan { plan_id: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] mls_store::StoreError),

    #[error(transparent)]
    Upstream(#[from] mls_adapters::UpstreamError),
}

impl WorkspaceError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;
