use thiserror::Error;

/// Failure from an external collaborator. `retryable` drives the queue's
/// backoff: timeouts, rate-limits and 5xx retry; everything else is fatal
/// for the calling phase.
#[derive(Debug, Error)]
#[error("{service}: {message}")]
pub struct UpstreamError {
    pub service: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl UpstreamError {
    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
            retryable: false,
        }
    }

    /// reqwest failures: connection problems and timeouts are transient.
    pub fn from_http(service: &'static str, err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        Self {
            service,
            message: err.to_string(),
            retryable,
        }
    }

    /// Non-success responses: 408/429/5xx are transient.
    pub fn from_status(service: &'static str, status: reqwest::StatusCode, body: &str) -> Self {
        let retryable = status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error();
        Self {
            service,
            message: format!("HTTP {}: {}", status.as_u16(), truncate(body, 300)),
            retryable,
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub type AdapterResult<T> = Result<T, UpstreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let transient = UpstreamError::from_status(
            "measurement",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down",
        );
        assert!(transient.retryable);
        let fatal =
            UpstreamError::from_status("edge", reqwest::StatusCode::UNPROCESSABLE_ENTITY, "bad");
        assert!(!fatal.retryable);
    }
}
