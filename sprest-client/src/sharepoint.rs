// SharePoint entity wrappers: web -> lists -> list -> items -> item.
//
// Each wrapper is a typed node declaring its URL segment and a few verbs on
// top of the shared invocation contract.

use crate::client::Client;
use crate::queryable::{Invocation, Node, Queryable};
use crate::queryable_node;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use sprest_core::http::Method;
use sprest_core::url::{odata_guid, odata_string};
use sprest_core::{Error, LambdaParser, ODataParser, RawResponse, RequestSeq, ResponseParser, Result};
use tokio::sync::oneshot;
use tracing::debug;

queryable_node! {
    /// A SharePoint web (site).
    pub struct Web;
}

queryable_node! {
    pub struct Lists;
}

queryable_node! {
    pub struct List;
}

queryable_node! {
    pub struct Items;
}

queryable_node! {
    pub struct Item;
}

impl Client {
    /// The web at the configured base URL.
    pub fn web(&self) -> Result<Web> {
        self.at("_api/web")
    }
}

impl Web {
    pub fn lists(&self) -> Lists {
        self.child("lists")
    }
}

/// Verbose-mode write body: `__metadata.type` followed by the properties.
fn with_metadata(type_name: &str, properties: Map<String, Value>) -> Value {
    let mut body = Map::new();
    body.insert("__metadata".to_string(), json!({ "type": type_name }));
    body.extend(properties);
    Value::Object(body)
}

fn into_object(properties: Value) -> Result<Map<String, Value>> {
    match properties {
        Value::Object(map) => Ok(map),
        other => Err(Error::configuration(format!(
            "entity properties must be a JSON object, got {}",
            other
        ))),
    }
}

/// Settings used by `Lists::add` and `Lists::ensure`.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSettings {
    pub title: String,
    pub description: String,
    /// List template; 100 is a generic custom list.
    pub template: u32,
    pub enable_content_types: bool,
    /// Extra `SP.List` properties sent with the request.
    pub additional: Map<String, Value>,
}

impl ListSettings {
    pub fn new(title: impl Into<String>) -> Self {
        ListSettings {
            title: title.into(),
            description: String::new(),
            template: 100,
            enable_content_types: false,
            additional: Map::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn template(mut self, template: u32) -> Self {
        self.template = template;
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.additional.insert(name.into(), value);
        self
    }

    fn update_body(&self) -> Value {
        let mut properties = Map::new();
        properties.insert("Title".into(), json!(self.title));
        properties.insert("Description".into(), json!(self.description));
        properties.insert("ContentTypesEnabled".into(), json!(self.enable_content_types));
        properties.extend(self.additional.clone());
        with_metadata("SP.List", properties)
    }

    fn add_body(&self) -> Value {
        let mut properties = Map::new();
        properties.insert("AllowContentTypes".into(), json!(true));
        properties.insert("BaseTemplate".into(), json!(self.template));
        properties.insert("ContentTypesEnabled".into(), json!(self.enable_content_types));
        properties.insert("Description".into(), json!(self.description));
        properties.insert("Title".into(), json!(self.title));
        properties.extend(self.additional.clone());
        with_metadata("SP.List", properties)
    }
}

#[derive(Debug, Clone)]
pub struct ListAddResult {
    pub data: Value,
    pub list: List,
}

#[derive(Debug, Clone)]
pub struct ListEnsureResult {
    /// `false` when the list already existed and was updated in place.
    pub created: bool,
    pub data: Value,
    pub list: List,
}

impl Lists {
    pub fn get_by_title(&self, title: &str) -> List {
        self.child(&format!("getByTitle({})", odata_string(title)))
    }

    pub fn get_by_id(&self, id: &str) -> List {
        let mut list: List = self.cast();
        list.queryable_mut()
            .composer_mut()
            .append_raw(&format!("({})", odata_guid(id)));
        list
    }

    pub fn add(&self, settings: &ListSettings) -> Invocation<ListAddResult> {
        let template = Lists::from_queryable(self.queryable().detached());
        let title = settings.title.clone();
        let parser = LambdaParser::new(move |response: RawResponse| {
            Ok(ListAddResult {
                data: ODataParser.parse(response)?,
                list: template.get_by_title(&title),
            })
        });
        let target: Queryable = self.child_with("", false);
        target.run(Method::POST, Some(Bytes::from(settings.add_body().to_string())), parser)
    }

    /// Create the list unless one with the same title exists, in which case
    /// its settings are updated. Not available inside a batch.
    pub async fn ensure(&self, settings: &ListSettings) -> Result<ListEnsureResult> {
        if let Some(batch) = self.queryable().batch() {
            return Err(Error::batch_state(batch.id(), "lists cannot be ensured inside a batch"));
        }

        let list = self.get_by_title(&settings.title);
        match list.get().await {
            Ok(data) => {
                list.update(&settings.update_body()).await?;
                Ok(ListEnsureResult {
                    created: false,
                    data,
                    list,
                })
            }
            Err(Error::OData(ref e)) if e.status == 404 => {
                debug!(title = %settings.title, "List not found, creating it");
                let added = self.add(settings).await?;
                Ok(ListEnsureResult {
                    created: true,
                    data: added.data,
                    list: added.list,
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl List {
    pub fn items(&self) -> Items {
        self.child("items")
    }

    /// The type name SharePoint expects in `__metadata.type` when writing
    /// items of this list, e.g. `SP.Data.TasksListItem`.
    pub fn entity_type_full_name(&self) -> Invocation<String> {
        let parser = LambdaParser::new(|response: RawResponse| {
            let url = response.url.clone();
            ODataParser
                .parse(response)?
                .get("ListItemEntityTypeFullName")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::parse(url, "ListItemEntityTypeFullName missing from response"))
        });
        self.clone()
            .select(&["ListItemEntityTypeFullName"])
            .invoke(Method::GET, None, parser)
    }
}

#[derive(Debug, Clone)]
pub struct ItemAddResult {
    pub data: Value,
    pub item: Item,
}

impl Items {
    pub fn get_by_id(&self, id: u64) -> Item {
        let mut item: Item = self.cast();
        item.queryable_mut().composer_mut().append_raw(&format!("({})", id));
        item
    }

    /// The owning list, as a plain node outside any batch.
    pub fn list(&self) -> Result<List> {
        let url = match self.parent_url() {
            "" => {
                let url = self.url();
                url.rfind('/').map_or(url, |idx| &url[..idx])
            }
            parent => parent,
        };
        Ok(List::from_queryable(self.queryable().unbatched_at(url)?))
    }

    /// Add an item, looking up the list's entity type name first.
    pub fn add(&self, properties: Value) -> Invocation<ItemAddResult> {
        self.add_as(properties, None)
    }

    /// Add an item. Inside a batch the entity type lookup runs outside the
    /// batch while a dependency holds `execute` back, and the add keeps the
    /// position it was called at.
    pub fn add_as(&self, properties: Value, entity_type_full_name: Option<&str>) -> Invocation<ItemAddResult> {
        let properties = match into_object(properties) {
            Ok(properties) => properties,
            Err(e) => return Invocation::ready(Err(e)),
        };
        let entity_type = entity_type_full_name.map(str::to_string);

        let Some(batch) = self.queryable().batch().cloned() else {
            let items = self.clone();
            return Invocation::new(async move {
                let type_name = match entity_type {
                    Some(name) => name,
                    None => items.list()?.entity_type_full_name().await?,
                };
                items.post_item(None, &type_name, properties).await
            });
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                return Invocation::ready(Err(Error::configuration(
                    "adding an item inside a batch requires a Tokio runtime",
                )))
            }
        };
        let dependency = match batch.add_dependency() {
            Ok(dependency) => dependency,
            Err(e) => return Invocation::ready(Err(e)),
        };
        let slot = match batch.reserve_slot() {
            Ok(slot) => slot,
            Err(e) => return Invocation::ready(Err(e)),
        };

        let items = self.clone();
        let (tx, rx) = oneshot::channel();
        runtime.spawn(async move {
            let type_name = match entity_type {
                Some(name) => Ok(name),
                None => match items.list() {
                    Ok(list) => list.entity_type_full_name().await,
                    Err(e) => Err(e),
                },
            };
            let registered = match type_name {
                Ok(name) => items.post_item(Some(slot), &name, properties),
                Err(e) => {
                    debug!(error = %e, "Entity type lookup failed, releasing batch slot");
                    dependency.batch().release_slot(slot);
                    Invocation::ready(Err(e))
                }
            };
            dependency.release();
            let _ = tx.send(registered);
        });

        let batch_id = batch.id();
        Invocation::new(async move {
            let registered = rx
                .await
                .map_err(|_| Error::batch_state(batch_id, "item add was abandoned before it registered"))?;
            registered.await
        })
    }

    fn post_item(&self, slot: Option<RequestSeq>, type_name: &str, properties: Map<String, Value>) -> Invocation<ItemAddResult> {
        let template = Items::from_queryable(self.queryable().detached());
        let parser = LambdaParser::new(move |response: RawResponse| {
            let url = response.url.clone();
            let data = ODataParser.parse(response)?;
            let id = data
                .get("Id")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::parse(url, "added item carries no Id"))?;
            Ok(ItemAddResult {
                item: template.get_by_id(id),
                data,
            })
        });

        let mut target: Queryable = self.child_with("", false);
        if let Some(seq) = slot {
            target = target.with_slot(seq);
        }
        let body = with_metadata(type_name, properties);
        target.run(Method::POST, Some(Bytes::from(body.to_string())), parser)
    }
}

impl Item {
    /// `MERGE` the given fields, tagged with the list's entity type name.
    pub fn update_as(&self, properties: Value, entity_type_full_name: &str) -> Invocation<Value> {
        match into_object(properties) {
            Ok(properties) => self.update(&with_metadata(entity_type_full_name, properties)),
            Err(e) => Invocation::ready(Err(e)),
        }
    }
}
