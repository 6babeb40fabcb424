//! Error Handling Module
//!
//! One error enum covers the whole dispatch layer. Configuration errors are
//! raised before any network I/O; API errors carry the status code, the
//! request URL, and a best-effort message extracted from the response body.

use thiserror::Error;

/// Errors produced by the dispatch layer.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Invalid or missing configuration, detected before any network I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Non-2xx HTTP status from the server.
    #[error("API error ({url} {status}): {message}")]
    Api {
        status: u16,
        url: String,
        message: String,
    },

    /// Network-level failure reaching the server.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The per-call deadline elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The stream broke after the response was established.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The response body could not be parsed into the expected shape.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl DispatchError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Build an API error from a status code, the request URL, and the raw
    /// response body. Extracts `error.message` from the conventional JSON
    /// error envelope, falling back to the body text verbatim.
    pub fn api_error(status: u16, url: impl Into<String>, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")?
                    .get("message")?
                    .as_str()
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| body.to_string());
        Self::Api {
            status,
            url: url.into(),
            message,
        }
    }

    /// True for errors raised before any request was sent.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}
