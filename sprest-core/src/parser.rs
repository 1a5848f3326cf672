//! Response parsers.
//!
//! A parser is a stateless strategy bound to a request when it is invoked. It
//! turns a buffered [`RawResponse`] into a typed value. Every parser first
//! checks the status: anything `>= 400` becomes an [`ODataError`] built from
//! the server's error payload.

use crate::error::{Error, ODataError, Result};
use crate::response::RawResponse;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

pub trait ResponseParser: Send + Sync + 'static {
    type Output: Send + 'static;

    fn parse(&self, response: RawResponse) -> Result<Self::Output>;
}

impl<P: ResponseParser> ResponseParser for Arc<P> {
    type Output = P::Output;

    fn parse(&self, response: RawResponse) -> Result<Self::Output> {
        (**self).parse(response)
    }
}

/// Fail with an [`ODataError`] when the response status is `>= 400`.
pub fn check_status(response: &RawResponse) -> Result<()> {
    if response.status >= 400 {
        let raw = response.text();
        return Err(ODataError::from_body(response.status, &raw, &response.url).into());
    }
    Ok(())
}

/// Coarse classification of a response body by its declared content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Json,
    Text,
    Binary,
}

impl ContentKind {
    pub fn of(response: &RawResponse) -> Self {
        match response.content_type().map(|c| c.to_ascii_lowercase()) {
            Some(ct) if ct.contains("json") => ContentKind::Json,
            Some(ct) if ct.starts_with("text/") || ct.contains("xml") => ContentKind::Text,
            Some(_) => ContentKind::Binary,
            None => {
                // Undeclared: sniff for a JSON document, otherwise treat as text.
                match response.body.iter().find(|b| !b.is_ascii_whitespace()) {
                    Some(b'{') | Some(b'[') => ContentKind::Json,
                    _ => ContentKind::Text,
                }
            }
        }
    }
}

fn decode_json(response: &RawResponse) -> Result<Value> {
    serde_json::from_slice(&response.body)
        .map_err(|e| Error::parse(&response.url, format!("invalid JSON: {}", e)))
}

fn is_annotation(key: &str) -> bool {
    key.starts_with("odata.") || key.starts_with('@') || key.contains("@odata.")
}

/// Unwrap the collection and entity envelopes of the three OData payload
/// conventions: verbose `{"d":{"results":[..]}}` / `{"d":{..}}`, and
/// minimal / no-metadata `{"value": ..}` next to nothing but annotations.
pub fn normalize_odata(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if map.len() == 1 && map.contains_key("d") {
                return match map.remove("d") {
                    Some(Value::Object(mut d)) if d.contains_key("results") => {
                        d.remove("results").unwrap_or(Value::Null)
                    }
                    Some(other) => other,
                    None => Value::Null,
                };
            }
            if map.contains_key("value") && map.keys().all(|k| k == "value" || is_annotation(k)) {
                return map.remove("value").unwrap_or(Value::Null);
            }
            Value::Object(map)
        }
        other => other,
    }
}

/// Body decoded according to its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Json(Value),
    Text(String),
    Binary(Bytes),
}

/// Picks JSON, text or binary decoding from `Content-Type`. JSON is normalised.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultParser;

impl ResponseParser for DefaultParser {
    type Output = Payload;

    fn parse(&self, response: RawResponse) -> Result<Payload> {
        check_status(&response)?;
        if response.is_empty() {
            return Ok(Payload::Empty);
        }
        let payload = match ContentKind::of(&response) {
            ContentKind::Json => Payload::Json(normalize_odata(decode_json(&response)?)),
            ContentKind::Text => Payload::Text(response.text()),
            ContentKind::Binary => Payload::Binary(response.body),
        };
        Ok(payload)
    }
}

/// The default parser of every verb: normalised JSON, `{}` for empty bodies,
/// text bodies as a JSON string.
#[derive(Debug, Clone, Copy, Default)]
pub struct ODataParser;

impl ResponseParser for ODataParser {
    type Output = Value;

    fn parse(&self, response: RawResponse) -> Result<Value> {
        let url = response.url.clone();
        match DefaultParser.parse(response)? {
            Payload::Empty => Ok(Value::Object(Map::new())),
            Payload::Json(v) => Ok(v),
            Payload::Text(t) => Ok(Value::String(t)),
            Payload::Binary(b) => Err(Error::parse(
                url,
                format!("expected an OData payload, got {} bytes of binary content", b.len()),
            )),
        }
    }
}

/// JSON exactly as sent, without envelope normalisation.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonParser;

impl ResponseParser for JsonParser {
    type Output = Value;

    fn parse(&self, response: RawResponse) -> Result<Value> {
        check_status(&response)?;
        if response.is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        decode_json(&response)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TextParser;

impl ResponseParser for TextParser {
    type Output = String;

    fn parse(&self, response: RawResponse) -> Result<String> {
        check_status(&response)?;
        String::from_utf8(response.body.to_vec())
            .map_err(|e| Error::parse(&response.url, format!("body is not UTF-8: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferParser;

impl ResponseParser for BufferParser {
    type Output = Bytes;

    fn parse(&self, response: RawResponse) -> Result<Bytes> {
        check_status(&response)?;
        Ok(response.body)
    }
}

/// Binary content together with its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlobParser;

impl ResponseParser for BlobParser {
    type Output = Blob;

    fn parse(&self, response: RawResponse) -> Result<Blob> {
        check_status(&response)?;
        Ok(Blob {
            content_type: response.content_type().map(str::to_string),
            bytes: response.body,
        })
    }
}

/// Deserialises the normalised OData payload into `T`.
pub struct ValueParser<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> ValueParser<T> {
    pub fn new() -> Self {
        ValueParser {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for ValueParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ValueParser<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueParser")
            .field("target", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: DeserializeOwned + Send + 'static> ResponseParser for ValueParser<T> {
    type Output = T;

    fn parse(&self, response: RawResponse) -> Result<T> {
        let url = response.url.clone();
        let value = ODataParser.parse(response)?;
        trace!(url = %url, "deserialising into {}", std::any::type_name::<T>());
        serde_json::from_value(value).map_err(|e| Error::parse(url, e.to_string()))
    }
}

/// Wraps a caller-supplied closure.
pub struct LambdaParser<F, T> {
    func: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> LambdaParser<F, T>
where
    F: Fn(RawResponse) -> Result<T> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        LambdaParser {
            func,
            _marker: PhantomData,
        }
    }
}

impl<F, T> fmt::Debug for LambdaParser<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LambdaParser")
    }
}

impl<F, T> ResponseParser for LambdaParser<F, T>
where
    F: Fn(RawResponse) -> Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn parse(&self, response: RawResponse) -> Result<T> {
        check_status(&response)?;
        (self.func)(response)
    }
}
