use crate::{HttpTransport, TransportError};
use async_trait::async_trait;
use sprest_core::http::HeaderMap;
use sprest_core::{HttpRequest, RawResponse};
use std::time::Duration;
use tracing::{debug, trace};

/// Transport backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        Self::with_default_headers(timeout, HeaderMap::new())
    }

    pub fn with_default_headers(timeout: Duration, headers: HeaderMap) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Request(format!("Failed to build HTTP client: {}", e)))?;
        Ok(ReqwestTransport { client, timeout })
    }

    /// Wrap an already configured client (proxies, custom TLS, auth middleware).
    pub fn from_client(client: reqwest::Client, timeout: Duration) -> Self {
        ReqwestTransport { client, timeout }
    }

    fn map_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_connect() {
            TransportError::Connection(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, TransportError> {
        debug!(method = %request.method, url = %request.url, "Sending HTTP request");

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = request.body {
            trace!("Request body: {} bytes", body.len());
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        debug!(status = status.as_u16(), bytes = body.len(), "Received HTTP response");

        Ok(RawResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            url: request.url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprest_core::http::Method;

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/_api/web/lists")
            .match_header("accept", "application/json")
            .match_body("{\"Title\":\"Tasks\"}")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"Id":1}"#)
            .create_async()
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let request = HttpRequest::new(Method::POST, format!("{}/_api/web/lists", server.url()))
            .with_header("Accept", "application/json")
            .with_body(r#"{"Title":"Tasks"}"#);

        let response = transport.send(request).await.unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.status_text, "Created");
        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(response.text(), r#"{"Id":1}"#);
        assert!(response.url.ends_with("/_api/web/lists"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_statuses_are_responses_not_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/_api/web")
            .with_status(429)
            .with_header("retry-after", "3")
            .create_async()
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .send(HttpRequest::new(Method::GET, format!("{}/_api/web", server.url())))
            .await
            .unwrap();
        assert_eq!(response.status, 429);
        assert_eq!(response.header("retry-after"), Some("3"));
    }

    #[tokio::test]
    async fn test_connection_failure_maps_to_transport_error() {
        let transport = ReqwestTransport::new(Duration::from_secs(2)).unwrap();
        let result = transport
            .send(HttpRequest::new(Method::GET, "http://127.0.0.1:1/_api/web"))
            .await;
        assert!(result.is_err());
    }
}
