use super::{check_count, effective_method, BatchFormat, CodecError, DEFAULT_MAX_BODY_SIZE};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sprest_core::http::header::{ACCEPT, CONTENT_TYPE};
use sprest_core::http::{Method, StatusCode};
use sprest_core::response::set_header;
use sprest_core::url::combine;
use sprest_core::{BatchId, HttpRequest, RawResponse};
use std::collections::HashMap;
use tracing::trace;

/// Microsoft Graph JSON batching (`POST {root}/$batch`).
#[derive(Debug, Clone)]
pub struct GraphBatchFormat {
    max_requests: usize,
    max_body_size: usize,
}

impl GraphBatchFormat {
    pub fn new() -> Self {
        Self {
            max_requests: 20,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

impl Default for GraphBatchFormat {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct BatchRequestBody<'a> {
    requests: Vec<BatchRequestItem<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchRequestItem<'a> {
    id: String,
    method: String,
    url: &'a str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    headers: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BatchResponseBody {
    #[serde(default)]
    responses: Vec<BatchResponseItem>,
}

#[derive(Debug, Deserialize)]
struct BatchResponseItem {
    id: String,
    status: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

/// Graph wants sub-request URLs relative to the service root.
fn relative_url<'a>(root: &str, url: &'a str) -> Result<&'a str, CodecError> {
    let root = root.trim_end_matches('/');
    match url.strip_prefix(root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') => Ok(rest),
        _ if url.starts_with('/') => Ok(url),
        _ => Err(CodecError::Malformed(format!(
            "request {} is outside the service root {}",
            url, root
        ))),
    }
}

fn encode_body(request: &HttpRequest) -> Option<Value> {
    let body = request.body.as_ref()?;
    let is_json = request
        .header("content-type")
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(true);
    if is_json {
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            return Some(value);
        }
    }
    Some(Value::String(String::from_utf8_lossy(body).into_owned()))
}

impl BatchFormat for GraphBatchFormat {
    fn max_requests(&self) -> usize {
        self.max_requests
    }

    fn endpoint(&self, base_url: &str) -> String {
        combine(&[base_url, "$batch"])
    }

    fn encode(
        &self,
        batch_id: &BatchId,
        base_url: &str,
        requests: &[HttpRequest],
    ) -> Result<HttpRequest, CodecError> {
        let mut items = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let mut headers = Map::new();
            for (name, value) in request.headers.iter() {
                if name.as_str().eq_ignore_ascii_case("x-http-method") {
                    continue;
                }
                if let Ok(value) = value.to_str() {
                    headers.insert(name.as_str().to_string(), Value::String(value.to_string()));
                }
            }
            let body = encode_body(request);
            if body.is_some() && !headers.contains_key(CONTENT_TYPE.as_str()) {
                headers.insert(CONTENT_TYPE.as_str().to_string(), Value::from("application/json"));
            }

            items.push(BatchRequestItem {
                id: (index + 1).to_string(),
                method: effective_method(request),
                url: relative_url(base_url, &request.url)?,
                headers,
                body,
            });
        }

        let body = serde_json::to_vec(&BatchRequestBody { requests: items })
            .map_err(|e| CodecError::Json(e.to_string()))?;
        if body.len() > self.max_body_size {
            return Err(CodecError::BodyTooLarge(body.len()));
        }

        trace!(batch_id = %batch_id, bytes = body.len(), "Encoded Graph batch body");

        Ok(HttpRequest::new(Method::POST, self.endpoint(base_url))
            .with_header(CONTENT_TYPE.as_str(), "application/json")
            .with_header(ACCEPT.as_str(), "application/json")
            .with_body(body))
    }

    fn decode(&self, response: &RawResponse, requests: &[HttpRequest]) -> Result<Vec<RawResponse>, CodecError> {
        let parsed: BatchResponseBody =
            serde_json::from_slice(&response.body).map_err(|e| CodecError::Json(e.to_string()))?;
        check_count(requests.len(), parsed.responses.len())?;

        let mut by_id: HashMap<String, BatchResponseItem> =
            parsed.responses.into_iter().map(|item| (item.id.clone(), item)).collect();

        requests
            .iter()
            .enumerate()
            .map(|(index, request)| {
                let id = (index + 1).to_string();
                let item = by_id.remove(&id).ok_or(CodecError::MissingResponse(id))?;

                let content_type = item
                    .headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                    .map(|(_, value)| value.as_str());
                let body = match (item.body, content_type) {
                    (None, _) | (Some(Value::Null), _) => Vec::new(),
                    (Some(Value::String(text)), Some(ct)) if !ct.contains("json") => text.into_bytes(),
                    (Some(value), _) => serde_json::to_vec(&value).map_err(|e| CodecError::Json(e.to_string()))?,
                };

                let reason = StatusCode::from_u16(item.status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or_default();
                let mut fragment = RawResponse::new(item.status, body)
                    .with_url(request.url.clone())
                    .with_status_text(reason);
                for (name, value) in &item.headers {
                    set_header(&mut fragment.headers, name, value);
                }
                Ok(fragment)
            })
            .collect()
    }
}
