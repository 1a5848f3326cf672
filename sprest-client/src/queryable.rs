// Invokable Node
// A node pairs a URL/query composer with the client it belongs to. Calling a
// verb runs the request pipeline; when the node is tagged with a batch the
// send stage registers on that batch instead of hitting the transport.

use crate::batch::{Batch, Settle};
use crate::cache::ResponseCache;
use crate::client::Client;
use crate::pipeline::{CacheTarget, FnObserver, PipelineObserver, RequestContext, Settlement, Stages};
use bytes::Bytes;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sprest_core::http::header::CONTENT_TYPE;
use sprest_core::http::Method;
use sprest_core::response::set_header;
use sprest_core::{
    Composer, Entity, EntityArrayParser, EntityFactory, EntityParser, Error, ODataParser, RequestSeq,
    ResponseParser, Result, ValueParser,
};
use sprest_transport::BatchFormatKind;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// The pending result of one invocation.
///
/// Unbatched requests are sent when the invocation is first polled. Batched
/// requests are already registered when it is created and resolve once the
/// batch executes.
#[must_use = "the outcome of an invocation is only observable by awaiting it"]
pub struct Invocation<T> {
    future: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> Invocation<T> {
    pub(crate) fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Invocation {
            future: Box::pin(future),
        }
    }

    pub fn ready(result: Result<T>) -> Self {
        Self::new(futures::future::ready(result))
    }
}

impl<T> Future for Invocation<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Invocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation").finish_non_exhaustive()
    }
}

/// The untyped node every wrapper is built on.
#[derive(Clone)]
pub struct Queryable {
    client: Client,
    composer: Composer,
    headers: IndexMap<String, String>,
    batch: Option<Batch>,
    slot: Option<RequestSeq>,
    use_cache: bool,
    observers: Vec<Arc<dyn PipelineObserver>>,
}

impl Queryable {
    pub fn new(client: Client, composer: Composer) -> Self {
        Queryable {
            client,
            composer,
            headers: IndexMap::new(),
            batch: None,
            slot: None,
            use_cache: false,
            observers: Vec::new(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut Composer {
        &mut self.composer
    }

    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    pub fn headers(&self) -> &IndexMap<String, String> {
        &self.headers
    }

    pub fn uses_cache(&self) -> bool {
        self.use_cache
    }

    /// Same settings, new composer. Reserved batch slots are never inherited.
    fn derive(&self, composer: Composer) -> Queryable {
        Queryable {
            client: self.client.clone(),
            composer,
            headers: self.headers.clone(),
            batch: self.batch.clone(),
            slot: None,
            use_cache: self.use_cache,
            observers: self.observers.clone(),
        }
    }

    /// Node for entities hydrated from a response: same client, headers and
    /// observers, outside any batch.
    pub(crate) fn detached(&self) -> Queryable {
        let mut node = self.derive(self.composer.clone());
        node.batch = None;
        node.use_cache = false;
        node
    }

    /// Plain node at `url` sharing only this node's client and headers. Used
    /// for lookups a wrapper issues on its own behalf.
    pub(crate) fn unbatched_at(&self, url: &str) -> Result<Queryable> {
        let mut node = Queryable::new(self.client.clone(), Composer::from_absolute(url)?);
        node.headers = self.headers.clone();
        Ok(node)
    }

    /// Register the next batched invocation of this node at a position
    /// reserved earlier with `Batch::reserve_slot`.
    pub(crate) fn with_slot(mut self, seq: RequestSeq) -> Self {
        self.slot = Some(seq);
        self
    }

    /// configure + validate. Runs synchronously so composition mistakes and
    /// batch state errors surface at the call site.
    fn prepare(&self, method: Method, body: Option<Bytes>) -> Result<Stages> {
        let mut headers = self.client.default_headers();
        for (name, value) in &self.headers {
            set_header(&mut headers, name, value);
        }
        if body.is_some() && !headers.contains_key(CONTENT_TYPE) {
            set_header(&mut headers, CONTENT_TYPE.as_str(), self.client.default_content_type());
        }

        let use_cache = self.use_cache && method == Method::GET && self.batch.is_none();
        let ctx = RequestContext {
            method,
            url: self.composer.to_url(),
            headers,
            body,
            batch_id: self.batch.as_ref().map(Batch::id),
            use_cache,
        };

        let mut observers = self.client.observers().snapshot();
        observers.extend(self.observers.iter().cloned());

        let mut stages = Stages {
            ctx,
            observers,
            cache: None,
        }
        .configure()?
        .validate()?;

        if stages.ctx.use_cache {
            stages.cache = Some(CacheTarget {
                cache: self.client.cache().clone(),
                key: ResponseCache::key(&stages.ctx.url, &stages.ctx.headers),
                ttl: self.client.config().cache_ttl,
            });
        }
        trace!(method = %stages.ctx.method, url = %stages.ctx.url, batched = stages.ctx.is_batched(), "Request configured");
        Ok(stages)
    }

    pub(crate) fn run<P: ResponseParser>(&self, method: Method, body: Option<Bytes>, parser: P) -> Invocation<P::Output> {
        let stages = match self.prepare(method, body) {
            Ok(stages) => stages,
            Err(e) => {
                self.release_slot();
                return Invocation::ready(Err(e));
            }
        };
        match self.batch {
            Some(ref batch) => self.enqueue(batch, stages, parser),
            None => self.dispatch(stages, parser),
        }
    }

    /// send, unbatched: lazily through the client's transport.
    fn dispatch<P: ResponseParser>(&self, stages: Stages, parser: P) -> Invocation<P::Output> {
        let client = self.client.clone();
        Invocation::new(async move {
            let hit = stages.cache.as_ref().and_then(|target| target.cache.get(&target.key));
            if let Some(hit) = hit {
                debug!(url = %stages.ctx.url, "Serving response from cache");
                let stages = Stages { cache: None, ..stages };
                return stages.settle(&parser, Ok(hit));
            }
            let response = client.send(stages.ctx.to_request()).await;
            stages.settle(&parser, response)
        })
    }

    fn release_slot(&self) {
        if let (Some(batch), Some(seq)) = (&self.batch, self.slot) {
            batch.release_slot(seq);
        }
    }

    /// send, batched: register now, settle when the batch executes.
    fn enqueue<P: ResponseParser>(&self, batch: &Batch, stages: Stages, parser: P) -> Invocation<P::Output> {
        let (tx, rx) = oneshot::channel();
        let request = stages.ctx.to_request();
        let settle: Settle = Box::new(move |response| {
            // The caller may have dropped the invocation; the outcome still
            // went through the observers.
            let _ = tx.send(stages.settle(&parser, response));
        });

        if let Err(e) = batch.register(self.slot, request, settle) {
            self.release_slot();
            return Invocation::ready(Err(e));
        }

        let batch_id = batch.id();
        Invocation::new(async move {
            rx.await
                .map_err(|_| Error::batch_state(batch_id, "batch was dropped before it executed"))?
        })
    }
}

impl fmt::Debug for Queryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queryable")
            .field("url", &self.composer.to_url())
            .field("batch", &self.batch.as_ref().map(Batch::id))
            .field("use_cache", &self.use_cache)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Builds typed nodes for hydrated entities.
pub struct NodeFactory<N> {
    template: Queryable,
    _node: PhantomData<fn() -> N>,
}

impl<N: Node> NodeFactory<N> {
    pub fn new(template: &Queryable) -> Self {
        NodeFactory {
            template: template.detached(),
            _node: PhantomData,
        }
    }
}

impl<N> Clone for NodeFactory<N> {
    fn clone(&self) -> Self {
        NodeFactory {
            template: self.template.clone(),
            _node: PhantomData,
        }
    }
}

impl<N> fmt::Debug for NodeFactory<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeFactory").field("template", &self.template).finish()
    }
}

impl<N: Node> EntityFactory for NodeFactory<N> {
    type Node = N;

    fn create(&self, url: &str) -> Result<N> {
        Ok(N::from_queryable(self.template.derive(Composer::from_absolute(url)?)))
    }
}

/// Capability shared by every node type. Wrappers implement the four
/// conversions; composition, query building and the verbs come for free.
pub trait Node: Clone + Send + Sync + Sized + 'static {
    fn from_queryable(queryable: Queryable) -> Self;
    fn queryable(&self) -> &Queryable;
    fn queryable_mut(&mut self) -> &mut Queryable;
    fn into_queryable(self) -> Queryable;

    fn client(&self) -> &Client {
        self.queryable().client()
    }

    /// URL without the query string.
    fn url(&self) -> &str {
        self.queryable().composer().url()
    }

    /// Absolute URL with the rendered query string.
    fn to_url(&self) -> String {
        self.queryable().composer().to_url()
    }

    fn parent_url(&self) -> &str {
        self.queryable().composer().parent_url()
    }

    fn child<N: Node>(&self, segment: &str) -> N {
        self.child_with(segment, true)
    }

    fn child_with<N: Node>(&self, segment: &str, inherit_query: bool) -> N {
        let queryable = self.queryable();
        N::from_queryable(queryable.derive(queryable.composer().child(segment, inherit_query)))
    }

    /// Typed node at an absolute URL, keeping this node's client and settings.
    fn at_url<N: Node>(&self, url: &str) -> Result<N> {
        Ok(N::from_queryable(self.queryable().derive(Composer::from_absolute(url)?)))
    }

    /// Convert between node types without touching the URL.
    fn cast<N: Node>(&self) -> N {
        let queryable = self.queryable();
        N::from_queryable(queryable.derive(queryable.composer().clone()))
    }

    fn select<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.queryable_mut().composer.select(fields);
        self
    }

    fn expand<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.queryable_mut().composer.expand(fields);
        self
    }

    fn filter(mut self, expression: &str) -> Self {
        self.queryable_mut().composer.filter(expression);
        self
    }

    fn top(mut self, count: u32) -> Self {
        self.queryable_mut().composer.top(count);
        self
    }

    fn skip(mut self, count: u32) -> Self {
        self.queryable_mut().composer.skip(count);
        self
    }

    fn orderby(mut self, field: &str, ascending: bool) -> Self {
        self.queryable_mut().composer.orderby(field, ascending);
        self
    }

    fn query_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.queryable_mut().composer.set_param(key, value);
        self
    }

    fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.queryable_mut().headers.insert(name.into(), value.into());
        self
    }

    fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let own = &mut self.queryable_mut().headers;
        for (name, value) in headers {
            own.insert(name.into(), value.into());
        }
        self
    }

    /// Serve GETs on this node from the client's response cache when fresh.
    fn using_caching(mut self) -> Self {
        self.queryable_mut().use_cache = true;
        self
    }

    /// Observer for invocations of this node (and nodes derived from it).
    fn observe<O: PipelineObserver + 'static>(mut self, observer: O) -> Self {
        self.queryable_mut().observers.push(Arc::new(observer));
        self
    }

    /// Run `f` when an invocation of this node settles, before its result is
    /// handed back.
    fn on_settled<F>(self, f: F) -> Self
    where
        F: Fn(&RequestContext, Settlement<'_>) + Send + Sync + 'static,
    {
        self.observe(FnObserver::on_settled(f))
    }

    /// Tag this node so its invocations register on `batch`. Fails fast with
    /// a batch state error once the batch no longer accepts requests.
    fn in_batch(mut self, batch: &Batch) -> Result<Self> {
        batch.ensure_accepting()?;
        self.queryable_mut().batch = Some(batch.clone());
        Ok(self)
    }

    /// Run the pipeline with an explicit method, body and parser.
    fn invoke<P: ResponseParser>(&self, method: Method, body: Option<Bytes>, parser: P) -> Invocation<P::Output> {
        self.queryable().run(method, body, parser)
    }

    fn get(&self) -> Invocation<Value> {
        self.invoke(Method::GET, None, ODataParser)
    }

    fn get_as<T: DeserializeOwned + Send + 'static>(&self) -> Invocation<T> {
        self.invoke(Method::GET, None, ValueParser::<T>::new())
    }

    fn get_entity<N: Node>(&self) -> Invocation<Entity<N>> {
        let factory = NodeFactory::<N>::new(self.queryable());
        self.invoke(Method::GET, None, EntityParser::new(factory))
    }

    fn get_entities<N: Node>(&self) -> Invocation<Vec<Entity<N>>> {
        let factory = NodeFactory::<N>::new(self.queryable());
        self.invoke(Method::GET, None, EntityArrayParser::new(factory))
    }

    fn post(&self, body: &Value) -> Invocation<Value> {
        self.invoke(Method::POST, Some(Bytes::from(body.to_string())), ODataParser)
    }

    /// Partial update: `MERGE` tunnelled through POST on SharePoint, `PATCH`
    /// on Graph. Matches any ETag.
    fn update(&self, body: &Value) -> Invocation<Value> {
        let body = Some(Bytes::from(body.to_string()));
        match self.client().config().batch_format {
            BatchFormatKind::SharePoint => self
                .clone()
                .with_header("X-HTTP-Method", "MERGE")
                .with_header("IF-MATCH", "*")
                .invoke(Method::POST, body, ODataParser),
            BatchFormatKind::Graph => self.invoke(Method::PATCH, body, ODataParser),
        }
    }

    fn delete(&self) -> Invocation<Value> {
        match self.client().config().batch_format {
            BatchFormatKind::SharePoint => self
                .clone()
                .with_header("X-HTTP-Method", "DELETE")
                .with_header("IF-MATCH", "*")
                .invoke(Method::POST, None, ODataParser),
            BatchFormatKind::Graph => self.invoke(Method::DELETE, None, ODataParser),
        }
    }
}

impl Node for Queryable {
    fn from_queryable(queryable: Queryable) -> Self {
        queryable
    }

    fn queryable(&self) -> &Queryable {
        self
    }

    fn queryable_mut(&mut self) -> &mut Queryable {
        self
    }

    fn into_queryable(self) -> Queryable {
        self
    }
}
