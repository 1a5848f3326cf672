// Opt-in response cache for idempotent reads.
//
// Entries are keyed on the absolute URL plus every request header, so two
// callers with different credentials or preferences never share a response.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use sprest_core::http::HeaderMap;
use sprest_core::RawResponse;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CacheEntry {
    url: String,
    response: RawResponse,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct ResponseCache {
    entries: Arc<DashMap<String, CacheEntry>>,
}

static GLOBAL_CACHE: OnceLock<ResponseCache> = OnceLock::new();

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache clients use unless given their own.
    pub fn global() -> &'static ResponseCache {
        GLOBAL_CACHE.get_or_init(ResponseCache::new)
    }

    /// SHA-256 over the URL and the sorted, lower-cased header list.
    pub fn key(url: &str, headers: &HeaderMap) -> String {
        let mut pairs: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        pairs.sort();

        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        for (name, value) in &pairs {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
        }
        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// A live entry, dropping it first if it has expired.
    pub fn get(&self, key: &str) -> Option<RawResponse> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                trace!(url = %entry.url, "Response cache hit");
                return Some(entry.response.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn insert(&self, key: String, url: &str, response: RawResponse, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                url: url.to_string(),
                response,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove every entry cached for `url`, whatever headers it was fetched
    /// with. Returns how many were removed.
    pub fn invalidate(&self, url: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.url != url);
        before - self.entries.len()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}
