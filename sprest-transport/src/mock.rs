//! A scripted in-memory transport for tests and demos.

use crate::{HttpTransport, TransportError};
use async_trait::async_trait;
use sprest_core::{HttpRequest, RawResponse};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::trace;

type Handler = Arc<dyn Fn(&HttpRequest) -> Result<RawResponse, TransportError> + Send + Sync>;

/// Replays queued responses in FIFO order, then falls back to the handler if
/// one is set. Every request is recorded. With nothing queued and no handler,
/// `send` fails with `TransportError::Closed`.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    scripted: VecDeque<Result<RawResponse, TransportError>>,
    handler: Option<Handler>,
    requests: Vec<HttpRequest>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that answers every request with `handler`.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
    {
        let transport = Self::new();
        transport.lock().handler = Some(Arc::new(handler));
        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // Poisoning is ignored so a panicked test leaves the log readable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_response(&self, response: RawResponse) {
        self.lock().scripted.push_back(Ok(response));
    }

    pub fn push_json(&self, status: u16, value: serde_json::Value) {
        self.push_response(RawResponse::json(status, &value));
    }

    pub fn push_error(&self, error: TransportError) {
        self.lock().scripted.push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        self.lock().requests.last().cloned()
    }

    pub fn remaining(&self) -> usize {
        self.lock().scripted.len()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MockTransport")
            .field("scripted", &state.scripted.len())
            .field("has_handler", &state.handler.is_some())
            .field("requests", &state.requests.len())
            .finish()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError> {
        trace!(method = %request.method, url = %request.url, "Mock transport received request");
        let (next, handler) = {
            let mut state = self.lock();
            state.requests.push(request.clone());
            (state.scripted.pop_front(), state.handler.clone())
        };

        let result = match (next, handler) {
            (Some(result), _) => result,
            (None, Some(handler)) => handler(&request),
            (None, None) => Err(TransportError::Closed),
        };

        result.map(|response| {
            if response.url.is_empty() {
                response.with_url(request.url)
            } else {
                response
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprest_core::http::Method;

    #[tokio::test]
    async fn test_scripted_then_handler() {
        let transport = MockTransport::with_handler(|req| Ok(RawResponse::new(200, req.url.clone())));
        transport.push_response(RawResponse::new(201, "first"));
        transport.push_error(TransportError::Timeout(std::time::Duration::from_secs(1)));

        let first = transport.send(HttpRequest::new(Method::GET, "https://x/a")).await.unwrap();
        assert_eq!(first.status, 201);
        assert_eq!(first.url, "https://x/a");

        let second = transport.send(HttpRequest::new(Method::GET, "https://x/b")).await;
        assert!(matches!(second, Err(TransportError::Timeout(_))));

        let third = transport.send(HttpRequest::new(Method::GET, "https://x/c")).await.unwrap();
        assert_eq!(third.text(), "https://x/c");

        assert_eq!(transport.request_count(), 3);
        assert_eq!(transport.last_request().unwrap().url, "https://x/c");
        assert_eq!(transport.remaining(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_script_closes() {
        let transport = MockTransport::new();
        let result = transport.send(HttpRequest::new(Method::GET, "https://x")).await;
        assert_eq!(result.unwrap_err(), TransportError::Closed);
    }
}
