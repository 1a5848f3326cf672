// Hydration: turning decoded OData objects back into chainable nodes.
//
// The canonical URL of an entity is recovered from whichever metadata
// convention the server used:
//   verbose      -> __metadata.uri
//   minimal      -> odata.editLink resolved against the web of odata.metadata / odata.id
//   no metadata  -> odata.editLink resolved against the web of the request URL
// Graph payloads may carry @odata.id instead.

use crate::error::{Error, Result};
use crate::parser::{ODataParser, ResponseParser};
use crate::response::RawResponse;
use crate::url::{combine, extract_web_url, is_url_absolute};
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::ops::Deref;
use tracing::{debug, warn};

/// Which metadata convention produced an entity URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataConvention {
    Verbose,
    Minimal,
    NoMetadata,
    Graph,
    /// Nothing usable was present; the requesting URL was used.
    Missing,
}

fn str_field<'a>(entity: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    entity
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Recompute the canonical resource URL of `entity`. `request_url` is the URL
/// the payload was fetched from and anchors relative edit links.
pub fn entity_url(entity: &Map<String, Value>, request_url: &str) -> (String, MetadataConvention) {
    if let Some(uri) = entity
        .get("__metadata")
        .and_then(|m| m.get("uri"))
        .and_then(Value::as_str)
    {
        return (uri.to_string(), MetadataConvention::Verbose);
    }

    if let Some(edit_link) = str_field(entity, "odata.editLink") {
        if is_url_absolute(edit_link) {
            return (edit_link.to_string(), MetadataConvention::Minimal);
        }
        let anchor = str_field(entity, "odata.metadata")
            .or_else(|| str_field(entity, "odata.id").filter(|id| is_url_absolute(id)));
        return match anchor {
            Some(anchor) => (
                combine(&[extract_web_url(anchor), "_api", edit_link]),
                MetadataConvention::Minimal,
            ),
            None => (
                combine(&[extract_web_url(request_url), "_api", edit_link]),
                MetadataConvention::NoMetadata,
            ),
        };
    }

    if let Some(id) = str_field(entity, "odata.id").filter(|id| is_url_absolute(id)) {
        return (id.to_string(), MetadataConvention::Minimal);
    }

    if let Some(id) = str_field(entity, "@odata.id") {
        let url = if is_url_absolute(id) {
            id.to_string()
        } else {
            combine(&[strip_query(request_url), id])
        };
        return (url, MetadataConvention::Graph);
    }

    warn!(
        url = %request_url,
        "No uri information found in OData entity; chaining will target the requesting URL"
    );
    (strip_query(request_url).to_string(), MetadataConvention::Missing)
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map(|(p, _)| p).unwrap_or(url)
}

/// Creates typed nodes for hydrated entities. Implemented by the client layer,
/// which knows how to carry its transport and configuration into a new node.
pub trait EntityFactory: Send + Sync + 'static {
    type Node: Send + 'static;

    fn create(&self, url: &str) -> Result<Self::Node>;
}

/// Decoded entity data fused with a further-chainable node.
#[derive(Debug, Clone)]
pub struct Entity<N> {
    node: N,
    url: String,
    convention: MetadataConvention,
    data: Map<String, Value>,
}

impl<N> Entity<N> {
    pub fn node(&self) -> &N {
        &self.node
    }

    pub fn into_node(self) -> N {
        self.node
    }

    /// Canonical URL recovered from the payload metadata.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn convention(&self) -> MetadataConvention {
        self.convention
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Deserialise the data into a concrete struct.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| Error::parse(&self.url, e.to_string()))
    }

    /// Hydrate again from this entity's own data. Yields an equivalent entity,
    /// never a nested one.
    pub fn rehydrate<F>(&self, factory: &F) -> Result<Entity<F::Node>>
    where
        F: EntityFactory,
    {
        hydrate(factory, Value::Object(self.data.clone()), &self.url)
    }
}

impl<N> Deref for Entity<N> {
    type Target = N;

    fn deref(&self) -> &N {
        &self.node
    }
}

/// Entities serialise as their data, metadata included, so a serialised
/// entity hydrates back to the same URL.
impl<N> Serialize for Entity<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

/// Hydrate one decoded JSON object.
pub fn hydrate<F: EntityFactory>(factory: &F, value: Value, request_url: &str) -> Result<Entity<F::Node>> {
    let data = match value {
        Value::Object(map) => map,
        other => {
            return Err(Error::parse(
                request_url,
                format!("expected an entity object, found {}", kind_of(&other)),
            ))
        }
    };
    let (url, convention) = entity_url(&data, request_url);
    debug!(url = %url, ?convention, "hydrating entity");
    let node = factory.create(&url)?;
    Ok(Entity {
        node,
        url,
        convention,
        data,
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parses one entity and hydrates it into `F::Node`.
#[derive(Debug, Clone)]
pub struct EntityParser<F> {
    factory: F,
}

impl<F: EntityFactory> EntityParser<F> {
    pub fn new(factory: F) -> Self {
        EntityParser { factory }
    }
}

impl<F: EntityFactory> ResponseParser for EntityParser<F> {
    type Output = Entity<F::Node>;

    fn parse(&self, response: RawResponse) -> Result<Self::Output> {
        let url = response.url.clone();
        let value = ODataParser.parse(response)?;
        hydrate(&self.factory, value, &url)
    }
}

/// Parses a collection and hydrates every member.
#[derive(Debug, Clone)]
pub struct EntityArrayParser<F> {
    factory: F,
}

impl<F: EntityFactory> EntityArrayParser<F> {
    pub fn new(factory: F) -> Self {
        EntityArrayParser { factory }
    }
}

impl<F: EntityFactory> ResponseParser for EntityArrayParser<F> {
    type Output = Vec<Entity<F::Node>>;

    fn parse(&self, response: RawResponse) -> Result<Self::Output> {
        let url = response.url.clone();
        match ODataParser.parse(response)? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| hydrate(&self.factory, item, &url))
                .collect(),
            other => Err(Error::parse(
                url,
                format!("expected an entity collection, found {}", kind_of(&other)),
            )),
        }
    }
}
