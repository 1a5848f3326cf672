//! Wire formats for batch envelopes.
//!
//! A format turns an ordered list of sub-requests into one outbound request
//! and splits the envelope response back into one fragment per sub-request,
//! in the same order.

mod graph;
mod sharepoint;

pub use graph::GraphBatchFormat;
pub use sharepoint::SharePointBatchFormat;

use serde::{Deserialize, Serialize};
use sprest_core::{BatchId, Error, HttpRequest, RawResponse};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Default upper bound on an encoded envelope body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

pub trait BatchFormat: Send + Sync + fmt::Debug {
    /// Largest number of sub-requests the service accepts in one envelope.
    fn max_requests(&self) -> usize;

    /// The `$batch` endpoint for a service root or web URL.
    fn endpoint(&self, base_url: &str) -> String;

    fn encode(
        &self,
        batch_id: &BatchId,
        base_url: &str,
        requests: &[HttpRequest],
    ) -> Result<HttpRequest, CodecError>;

    /// Split a successful envelope response. Fragments are returned in
    /// request order and carry the URL of the request they answer.
    fn decode(&self, response: &RawResponse, requests: &[HttpRequest]) -> Result<Vec<RawResponse>, CodecError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchFormatKind {
    #[default]
    SharePoint,
    Graph,
}

impl BatchFormatKind {
    pub fn build(self) -> Arc<dyn BatchFormat> {
        match self {
            BatchFormatKind::SharePoint => Arc::new(SharePointBatchFormat::new()),
            BatchFormatKind::Graph => Arc::new(GraphBatchFormat::new()),
        }
    }
}

impl FromStr for BatchFormatKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sharepoint" | "sp" => Ok(BatchFormatKind::SharePoint),
            "graph" => Ok(BatchFormatKind::Graph),
            other => Err(Error::configuration(format!("Unknown batch format '{}'", other))),
        }
    }
}

impl fmt::Display for BatchFormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchFormatKind::SharePoint => write!(f, "sharepoint"),
            BatchFormatKind::Graph => write!(f, "graph"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Batch response has no multipart boundary")]
    MissingBoundary,
    #[error("Malformed batch payload: {0}")]
    Malformed(String),
    #[error("Batch response carries {actual} fragments for {expected} requests")]
    CountMismatch { expected: usize, actual: usize },
    #[error("Batch response has no entry for request {0}")]
    MissingResponse(String),
    #[error("JSON error: {0}")]
    Json(String),
    #[error("Batch body too large: {0} bytes")]
    BodyTooLarge(usize),
}

impl CodecError {
    pub fn into_error(self, url: &str) -> Error {
        Error::parse(url, self.to_string())
    }
}

/// The method a sub-request is sent with, honouring an `X-HTTP-Method` tunnel.
pub(crate) fn effective_method(request: &HttpRequest) -> String {
    request
        .header("x-http-method")
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| request.method.as_str().to_string())
}

pub(crate) fn check_count(expected: usize, actual: usize) -> Result<(), CodecError> {
    if expected == actual {
        Ok(())
    } else {
        Err(CodecError::CountMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_kind_parsing() {
        assert_eq!("SharePoint".parse::<BatchFormatKind>().unwrap(), BatchFormatKind::SharePoint);
        assert_eq!(" graph ".parse::<BatchFormatKind>().unwrap(), BatchFormatKind::Graph);
        assert!(matches!(
            "odata".parse::<BatchFormatKind>(),
            Err(Error::Configuration(_))
        ));
        assert_eq!(BatchFormatKind::Graph.to_string(), "graph");
    }

    #[test]
    fn test_effective_method_honours_tunnel() {
        use sprest_core::http::Method;
        let plain = HttpRequest::new(Method::POST, "u");
        assert_eq!(effective_method(&plain), "POST");
        let merge = plain.with_header("X-HTTP-Method", "merge");
        assert_eq!(effective_method(&merge), "MERGE");
    }

    #[test]
    fn test_format_limits() {
        assert_eq!(BatchFormatKind::Graph.build().max_requests(), 20);
        assert_eq!(BatchFormatKind::SharePoint.build().max_requests(), 100);
    }

    #[test]
    fn test_codec_error_lifts_to_parse_error() {
        let err = CodecError::CountMismatch { expected: 2, actual: 1 }.into_error("https://x/_api/$batch");
        match err {
            Error::Parse { url, message } => {
                assert_eq!(url, "https://x/_api/$batch");
                assert!(message.contains("1 fragments for 2 requests"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
