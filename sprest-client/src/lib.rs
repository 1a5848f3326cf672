//! Fluent SharePoint REST / Microsoft Graph client.
//!
//! A [`Client`] hands out typed nodes. Chaining on a node composes a URL and
//! query without any I/O; calling a verb runs the request pipeline, either
//! straight through the transport or as a member of a [`Batch`].

pub mod batch;
pub mod cache;
pub mod client;
pub mod logging;
pub mod macros;
pub mod pipeline;
pub mod queryable;
pub mod sharepoint;

pub use batch::{Batch, BatchDependency, BatchState};
pub use cache::{ResponseCache, DEFAULT_CACHE_TTL};
pub use client::{Client, ClientConfig};
pub use pipeline::{FnObserver, ObserverHandle, ObserverRegistry, PipelineObserver, RequestContext, Settlement};
pub use queryable::{Invocation, Node, NodeFactory, Queryable};
pub use sharepoint::{Item, ItemAddResult, Items, List, ListAddResult, ListEnsureResult, ListSettings, Lists, Web};

pub use sprest_core::{Entity, Error, ODataError, Result};
pub use sprest_transport::{BatchFormatKind, HttpTransport, RetryConfig};
