// Request pipeline: configure -> validate -> send -> parse -> post-process.
//
// Observers registered on a client see every request that client issues,
// in registration order. Node-local observers run after them.

use crate::cache::ResponseCache;
use bytes::Bytes;
use sprest_core::http::{HeaderMap, Method};
use sprest_core::{BatchId, Error, HttpRequest, RawResponse, ResponseParser, Result};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// Everything the pipeline knows about one invocation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Absolute URL including the rendered query string.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub batch_id: Option<BatchId>,
    pub use_cache: bool,
}

impl RequestContext {
    pub fn to_request(&self) -> HttpRequest {
        HttpRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    pub fn is_batched(&self) -> bool {
        self.batch_id.is_some()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// How an invocation ended, as reported to observers.
#[derive(Debug, Clone, Copy)]
pub enum Settlement<'a> {
    Fulfilled,
    Rejected(&'a Error),
}

impl Settlement<'_> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled)
    }
}

/// Hooks into the pipeline. Every method has a no-op default.
///
/// `pre_request` may rewrite the request or veto it by returning an error.
/// `post_response` sees the raw response (or batch fragment) before parsing.
/// `on_settled` runs last, once per invocation, whatever the outcome; for
/// batched requests it runs inside `Batch::execute`, in registration order.
pub trait PipelineObserver: Send + Sync {
    fn pre_request(&self, _ctx: &mut RequestContext) -> Result<()> {
        Ok(())
    }

    fn post_response(&self, _ctx: &RequestContext, _response: &RawResponse) -> Result<()> {
        Ok(())
    }

    fn on_settled(&self, _ctx: &RequestContext, _settlement: Settlement<'_>) {}
}

type PreRequestFn = dyn Fn(&mut RequestContext) -> Result<()> + Send + Sync;
type SettledFn = dyn Fn(&RequestContext, Settlement<'_>) + Send + Sync;

/// Closure-backed observer.
pub struct FnObserver {
    pre_request: Option<Box<PreRequestFn>>,
    on_settled: Option<Box<SettledFn>>,
}

impl FnObserver {
    pub fn pre_request<F>(f: F) -> Self
    where
        F: Fn(&mut RequestContext) -> Result<()> + Send + Sync + 'static,
    {
        FnObserver {
            pre_request: Some(Box::new(f)),
            on_settled: None,
        }
    }

    pub fn on_settled<F>(f: F) -> Self
    where
        F: Fn(&RequestContext, Settlement<'_>) + Send + Sync + 'static,
    {
        FnObserver {
            pre_request: None,
            on_settled: Some(Box::new(f)),
        }
    }
}

impl PipelineObserver for FnObserver {
    fn pre_request(&self, ctx: &mut RequestContext) -> Result<()> {
        match self.pre_request {
            Some(ref f) => f(ctx),
            None => Ok(()),
        }
    }

    fn on_settled(&self, ctx: &RequestContext, settlement: Settlement<'_>) {
        if let Some(ref f) = self.on_settled {
            f(ctx, settlement);
        }
    }
}

impl fmt::Debug for FnObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnObserver")
            .field("pre_request", &self.pre_request.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

type ObserverList = RwLock<Vec<(u64, Arc<dyn PipelineObserver>)>>;

/// Ordered observer list owned by one client.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    observers: Arc<ObserverList>,
    next_id: Arc<AtomicU64>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<O: PipelineObserver + 'static>(&self, observer: O) -> ObserverHandle {
        self.add_arc(Arc::new(observer))
    }

    pub fn add_arc(&self, observer: Arc<dyn PipelineObserver>) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.write().push((id, observer));
        debug!(observer_id = id, "Pipeline observer added");
        ObserverHandle {
            id,
            registry: Arc::downgrade(&self.observers),
        }
    }

    /// Remove every observer of this registry. Other clients are unaffected.
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn PipelineObserver>> {
        self.read().iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(u64, Arc<dyn PipelineObserver>)>> {
        self.observers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(u64, Arc<dyn PipelineObserver>)>> {
        self.observers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry").field("observers", &self.len()).finish()
    }
}

/// Returned by `ObserverRegistry::add`; removes exactly that observer.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    id: u64,
    registry: Weak<ObserverList>,
}

impl ObserverHandle {
    /// Returns `false` if the observer was already gone.
    pub fn remove(&self) -> bool {
        let Some(list) = self.registry.upgrade() else {
            return false;
        };
        let mut list = list.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        before != list.len()
    }
}

/// Where a successful read is stored once parsed.
#[derive(Debug, Clone)]
pub(crate) struct CacheTarget {
    pub cache: ResponseCache,
    pub key: String,
    pub ttl: Duration,
}

/// The observers and cache slot that accompany one invocation from
/// `configure` to settlement.
#[derive(Clone)]
pub(crate) struct Stages {
    pub ctx: RequestContext,
    pub observers: Vec<Arc<dyn PipelineObserver>>,
    pub cache: Option<CacheTarget>,
}

impl Stages {
    /// configure: run every `pre_request` hook in order.
    pub fn configure(mut self) -> Result<Self> {
        for observer in &self.observers {
            observer.pre_request(&mut self.ctx)?;
        }
        Ok(self)
    }

    /// validate: the request must resolve to an absolute http(s) endpoint.
    pub fn validate(self) -> Result<Self> {
        if !sprest_core::url::is_url_absolute(&self.ctx.url) {
            return Err(Error::configuration(format!(
                "Request URL '{}' is not absolute",
                self.ctx.url
            )));
        }
        if self.ctx.method == Method::GET && self.ctx.body.is_some() {
            return Err(Error::configuration(format!(
                "GET request to {} cannot carry a body",
                self.ctx.url
            )));
        }
        Ok(self)
    }

    /// parse + post-process. Consumes the transport outcome and reports the
    /// settlement to every observer before handing the result back.
    pub fn settle<P: ResponseParser>(&self, parser: &P, response: Result<RawResponse>) -> Result<P::Output> {
        let result = response.and_then(|response| {
            for observer in &self.observers {
                observer.post_response(&self.ctx, &response)?;
            }
            let cacheable = match self.cache {
                Some(_) if response.is_success() => Some(response.clone()),
                _ => None,
            };
            let parsed = parser.parse(response)?;
            if let (Some(target), Some(raw)) = (&self.cache, cacheable) {
                target.cache.insert(target.key.clone(), &self.ctx.url, raw, target.ttl);
                trace!(url = %self.ctx.url, "Response cached");
            }
            Ok(parsed)
        });

        let settlement = match result {
            Ok(_) => Settlement::Fulfilled,
            Err(ref e) => Settlement::Rejected(e),
        };
        for observer in &self.observers {
            observer.on_settled(&self.ctx, settlement);
        }
        if let Err(ref e) = result {
            debug!(method = %self.ctx.method, url = %self.ctx.url, error = %e, "Request failed");
        }
        result
    }
}
