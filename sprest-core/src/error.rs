use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a request can surface. `Clone` so that a single envelope
/// failure can be handed to each member of a batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Malformed base URL or a node that cannot resolve to an absolute endpoint.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    OData(#[from] ODataError),

    #[error("Request to {url} still throttled (status {status}) after {attempts} attempts")]
    Throttled {
        url: String,
        status: u16,
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("Failed to parse response from {url}: {message}")]
    Parse { url: String, message: String },

    #[error("Batch {batch_id}: {message}")]
    BatchState { batch_id: String, message: String },

    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Parse {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn batch_state(batch_id: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::BatchState {
            batch_id: batch_id.to_string(),
            message: message.into(),
        }
    }

    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::OData(e) => Some(e.status),
            Error::Throttled { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a caller-side retry has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Throttled { .. } | Error::Transport { .. } => true,
            Error::OData(e) => e.status >= 500,
            _ => false,
        }
    }
}

/// A 4xx/5xx response, with the server's OData error body normalised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ODataError {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    pub raw: String,
    pub url: String,
}

impl ODataError {
    /// Build from a failed response body, recognising the minimal
    /// (`odata.error`), verbose (`error` with a `{lang, value}` message) and
    /// Graph (`error` with a plain message) payload shapes.
    pub fn from_body(status: u16, raw: &str, url: &str) -> Self {
        let parsed = serde_json::from_str::<Value>(raw).ok();
        let error_obj = parsed
            .as_ref()
            .and_then(|v| v.get("odata.error").or_else(|| v.get("error")));

        let (code, message) = match error_obj {
            Some(obj) => {
                let code = obj.get("code").and_then(Value::as_str).map(str::to_string);
                let message = match obj.get("message") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Object(m)) => m
                        .get("value")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                };
                (code, message)
            }
            None => (None, None),
        };

        let message = message.unwrap_or_else(|| {
            if raw.trim().is_empty() {
                format!("HTTP {}", status)
            } else {
                raw.trim().to_string()
            }
        });

        ODataError {
            status,
            code,
            message,
            raw: raw.to_string(),
            url: url.to_string(),
        }
    }
}

impl fmt::Display for ODataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {} from {}: {}", self.status, self.url, self.message)?;
        if let Some(ref code) = self.code {
            write!(f, " ({})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for ODataError {}
