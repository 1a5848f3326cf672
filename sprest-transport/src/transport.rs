use async_trait::async_trait;
use sprest_core::{Error, HttpRequest, RawResponse};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Attach the originating URL and lift into the crate-wide error.
    pub fn into_error(self, url: &str) -> Error {
        Error::transport(url, self.to_string())
    }
}

/// The fetch-like capability the pipeline sends through. Implementations
/// buffer the whole response body.
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError> {
        (**self).send(request).await
    }
}
