// Fluent SharePoint / Graph client
// Owns the transport, batch wire format, observer registry and response cache
// shared by every node created from it.

use crate::batch::Batch;
use crate::cache::{ResponseCache, DEFAULT_CACHE_TTL};
use crate::pipeline::ObserverRegistry;
use crate::queryable::{Node, Queryable};
use indexmap::IndexMap;
use sprest_core::http::HeaderMap;
use sprest_core::response::set_header;
use sprest_core::{Composer, Error, HttpRequest, RawResponse, Result};
use sprest_transport::{send_with_retry, BatchFormat, BatchFormatKind, HttpTransport, ReqwestTransport, RetryConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Web URL (SharePoint) or service root (Graph) every node starts from
    pub base_url: String,
    /// Wire format used by `Batch::execute`
    pub batch_format: BatchFormatKind,
    /// Maximum number of requests in a single batch; never above what the
    /// format allows
    pub max_batch_size: usize,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    /// Headers sent with every request unless a node overrides them
    pub default_headers: IndexMap<String, String>,
    pub retry: RetryConfig,
    /// Lifetime of entries written to the response cache
    pub cache_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let mut default_headers = IndexMap::new();
        default_headers.insert("Accept".to_string(), "application/json".to_string());
        Self {
            base_url: String::new(),
            batch_format: BatchFormatKind::SharePoint,
            max_batch_size: 100,
            timeout_ms: 30000,
            default_headers,
            retry: RetryConfig::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn graph(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            batch_format: BatchFormatKind::Graph,
            max_batch_size: 20,
            ..Default::default()
        }
    }

    /// Defaults overlaid with `SPREST_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("SPREST_BASE_URL") {
            config.base_url = url;
        }
        if let Some(format) = lookup("SPREST_BATCH_FORMAT") {
            config.batch_format = format.parse()?;
            if config.batch_format == BatchFormatKind::Graph {
                config.max_batch_size = 20;
            }
        }
        if let Some(timeout) = lookup("SPREST_TIMEOUT_MS") {
            config.timeout_ms = parse_number("SPREST_TIMEOUT_MS", &timeout)?;
        }
        if let Some(size) = lookup("SPREST_MAX_BATCH_SIZE") {
            config.max_batch_size = parse_number("SPREST_MAX_BATCH_SIZE", &size)?;
        }
        if let Some(retries) = lookup("SPREST_MAX_RETRIES") {
            let attempts: u32 = parse_number("SPREST_MAX_RETRIES", &retries)?;
            config.retry = config.retry.with_max_attempts(attempts.saturating_add(1));
        }
        Ok(config)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        Composer::new(&self.base_url, None)?;
        if self.max_batch_size == 0 {
            return Err(Error::configuration("max_batch_size must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(Error::configuration("timeout_ms must be at least 1"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    format: Arc<dyn BatchFormat>,
    observers: ObserverRegistry,
    cache: ResponseCache,
}

/// Entry point of the fluent API. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client over a pooled reqwest transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = ReqwestTransport::new(config.timeout()).map_err(|e| e.into_error(&config.base_url))?;
        Self::with_transport(config, transport)
    }

    /// Client over an injected transport.
    pub fn with_transport<T: HttpTransport + 'static>(config: ClientConfig, transport: T) -> Result<Self> {
        config.validate()?;
        debug!(base_url = %config.base_url, format = %config.batch_format, "Creating client");
        Ok(Self {
            inner: Arc::new(ClientInner {
                format: config.batch_format.build(),
                transport: Arc::new(transport),
                observers: ObserverRegistry::new(),
                cache: ResponseCache::global().clone(),
                config,
            }),
        })
    }

    /// Same client with a private response cache instead of the global one.
    /// Observers registered so far carry over.
    pub fn with_cache(self, cache: ResponseCache) -> Self {
        let inner = &self.inner;
        Self {
            inner: Arc::new(ClientInner {
                config: inner.config.clone(),
                transport: Arc::clone(&inner.transport),
                format: Arc::clone(&inner.format),
                observers: inner.observers.clone(),
                cache,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn base_url(&self) -> &str {
        &self.inner.config.base_url
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.inner.observers
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    pub fn batch_format(&self) -> Arc<dyn BatchFormat> {
        Arc::clone(&self.inner.format)
    }

    /// Node at the configured base URL.
    pub fn root(&self) -> Result<Queryable> {
        Ok(Queryable::new(self.clone(), Composer::new(self.base_url(), None)?))
    }

    /// Typed node at `path` below the base URL, or at an absolute URL.
    pub fn at<N: Node>(&self, path: &str) -> Result<N> {
        let composer = if sprest_core::url::is_url_absolute(path) {
            Composer::from_absolute(path)?
        } else {
            Composer::new(self.base_url(), Some(path))?
        };
        Ok(N::from_queryable(Queryable::new(self.clone(), composer)))
    }

    pub fn create_batch(&self) -> Batch {
        let size = self.inner.config.max_batch_size.min(self.inner.format.max_requests());
        Batch::new(self.clone(), self.base_url().to_string(), size)
    }

    /// Headers every request starts from.
    pub(crate) fn default_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.inner.config.default_headers {
            set_header(&mut headers, name, value);
        }
        headers
    }

    /// Content type given to request bodies that do not declare one.
    pub(crate) fn default_content_type(&self) -> &'static str {
        match self.inner.config.batch_format {
            BatchFormatKind::SharePoint => "application/json;odata=verbose;charset=utf-8",
            BatchFormatKind::Graph => "application/json",
        }
    }

    /// Send one request through the transport, retrying throttled responses.
    pub async fn send(&self, request: HttpRequest) -> Result<RawResponse> {
        send_with_retry(self.inner.transport.as_ref(), request, &self.inner.config.retry).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.config.base_url)
            .field("batch_format", &self.inner.config.batch_format)
            .field("transport", &self.inner.transport)
            .field("observers", &self.inner.observers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprest_transport::MockTransport;
    use std::collections::HashMap;

    #[test]
    fn test_client_creation() {
        let client = Client::new(ClientConfig::new("https://contoso.sharepoint.com/sites/dev"));
        assert!(client.is_ok());
    }

    #[test]
    fn test_bad_base_url_fails_fast() {
        for url in ["", "   ", "not a url", "ftp://contoso/sites/dev"] {
            let err = Client::with_transport(ClientConfig::new(url), MockTransport::new()).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{:?} accepted", url);
        }
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SPREST_BASE_URL", "https://graph.microsoft.com/v1.0"),
            ("SPREST_BATCH_FORMAT", "graph"),
            ("SPREST_TIMEOUT_MS", "5000"),
            ("SPREST_MAX_RETRIES", "2"),
        ]
        .into_iter()
        .collect();

        let config = ClientConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.base_url, "https://graph.microsoft.com/v1.0");
        assert_eq!(config.batch_format, BatchFormatKind::Graph);
        assert_eq!(config.max_batch_size, 20);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_config_rejects_malformed_values() {
        let bad = ClientConfig::from_lookup(|k| (k == "SPREST_TIMEOUT_MS").then(|| "soon".to_string()));
        assert!(matches!(bad, Err(Error::Configuration(_))));

        let bad = ClientConfig::from_lookup(|k| (k == "SPREST_BATCH_FORMAT").then(|| "soap".to_string()));
        assert!(matches!(bad, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_batch_size_is_capped_by_format() {
        let mut config = ClientConfig::graph("https://graph.microsoft.com/v1.0");
        config.max_batch_size = 50;
        let client = Client::with_transport(config, MockTransport::new()).unwrap();
        assert_eq!(client.create_batch().max_size(), 20);
    }

    #[test]
    fn test_with_cache_isolates() {
        let client = Client::with_transport(ClientConfig::new("https://x/sites/a"), MockTransport::new()).unwrap();
        let private = ResponseCache::new();
        let isolated = client.clone().with_cache(private.clone());
        private.insert("k".into(), "u", RawResponse::new(200, ""), Duration::from_secs(5));
        assert_eq!(isolated.cache().len(), 1);
        assert!(client.cache().get("k").is_none());
    }
}
