// URL/Query Composer
// Builds an absolute URL plus an ordered query string from a chain of fluent
// calls. Nothing in here performs I/O.

use crate::error::{Error, Result};
use crate::url::{combine, escape_path_segment, escape_query_value};
use indexmap::IndexMap;
use percent_encoding::percent_decode_str;

/// Composition state of one node: its absolute URL, its own query parameters
/// and the URL of the node it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composer {
    url: String,
    query: IndexMap<String, String>,
    parent_url: String,
}

impl Composer {
    /// Root composer. Fails fast when `base_url` is empty or not an absolute
    /// http(s) URL, so misconfiguration never survives until request time.
    pub fn new(base_url: &str, path: Option<&str>) -> Result<Self> {
        let base = base_url.trim();
        if base.is_empty() {
            return Err(Error::configuration("base URL is empty"));
        }
        let parsed = ::url::Url::parse(base)
            .map_err(|e| Error::configuration(format!("invalid base URL '{}': {}", base, e)))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(Error::configuration(format!(
                "base URL '{}' must use http or https",
                base
            )));
        }

        let url = match path {
            Some(p) if !p.trim().is_empty() => combine(&[base.to_string(), escape_path_segment(p)]),
            _ => combine(&[base]),
        };

        Ok(Composer {
            url,
            query: IndexMap::new(),
            parent_url: String::new(),
        })
    }

    /// Composer rooted at an already absolute URL, e.g. one recovered from
    /// response metadata. Query parameters embedded in the URL are lifted into
    /// the ordered query map.
    pub fn from_absolute(url: &str) -> Result<Self> {
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (url, None),
        };
        let mut composer = Composer::new(path, None)?;
        if let Some(q) = query {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                let value = percent_decode_str(v).decode_utf8_lossy();
                composer.query.insert(k.to_string(), value.into_owned());
            }
        }
        Ok(composer)
    }

    /// Derive a child node. The child's URL is `combine(url, segment)`; its
    /// query is a shallow copy of ours when `inherit_query` is set, so
    /// mutating it never reaches back here.
    pub fn child(&self, segment: &str, inherit_query: bool) -> Self {
        let url = if segment.trim().is_empty() {
            self.url.clone()
        } else {
            combine(&[self.url.clone(), escape_path_segment(segment)])
        };
        Composer {
            url,
            query: if inherit_query {
                self.query.clone()
            } else {
                IndexMap::new()
            },
            parent_url: self.url.clone(),
        }
    }

    /// Append a segment to this node's own URL.
    pub fn append(&mut self, segment: &str) {
        self.url = combine(&[self.url.clone(), escape_path_segment(segment)]);
    }

    /// Append raw text (e.g. `(5)`) to the URL without a separating slash.
    pub fn append_raw(&mut self, text: &str) {
        self.url.push_str(&escape_path_segment(text));
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn parent_url(&self) -> &str {
        &self.parent_url
    }

    pub fn query(&self) -> &IndexMap<String, String> {
        &self.query
    }

    pub fn query_mut(&mut self) -> &mut IndexMap<String, String> {
        &mut self.query
    }

    pub fn set_param(&mut self, key: &str, value: impl Into<String>) {
        self.query.insert(key.to_string(), value.into());
    }

    pub fn select<S: AsRef<str>>(&mut self, fields: &[S]) {
        if !fields.is_empty() {
            self.set_param("$select", join(fields));
        }
    }

    pub fn expand<S: AsRef<str>>(&mut self, fields: &[S]) {
        if !fields.is_empty() {
            self.set_param("$expand", join(fields));
        }
    }

    pub fn filter(&mut self, expression: &str) {
        self.set_param("$filter", expression);
    }

    pub fn top(&mut self, count: u32) {
        self.set_param("$top", count.to_string());
    }

    pub fn skip(&mut self, count: u32) {
        self.set_param("$skip", count.to_string());
    }

    /// Adds an ordering term; repeated calls accumulate in call order.
    pub fn orderby(&mut self, field: &str, ascending: bool) {
        let term = if ascending {
            field.to_string()
        } else {
            format!("{} desc", field)
        };
        match self.query.get_mut("$orderby") {
            Some(existing) if !existing.is_empty() => {
                existing.push(',');
                existing.push_str(&term);
            }
            _ => self.set_param("$orderby", term),
        }
    }

    /// The rendered query string without the leading `?`.
    pub fn query_string(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| format!("{}={}", k, escape_query_value(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Absolute URL including the query string.
    pub fn to_url(&self) -> String {
        if self.query.is_empty() {
            self.url.clone()
        } else {
            format!("{}?{}", self.url, self.query_string())
        }
    }
}

fn join<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| f.as_ref().trim())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}
