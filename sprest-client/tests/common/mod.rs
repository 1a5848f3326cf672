// Shared helpers: a scripted SharePoint that answers both plain requests and
// multipart batch envelopes from one routing closure.

#![allow(dead_code)]

use serde_json::Value;
use sprest_client::logging::init_test_logging;
use sprest_client::{Client, ClientConfig, RequestContext, ResponseCache, Settlement};
use sprest_core::http::StatusCode;
use sprest_core::{HttpRequest, RawResponse};
use sprest_transport::MockTransport;
use std::sync::{Arc, Mutex};

pub const WEB: &str = "https://contoso.sharepoint.com/sites/dev";

/// One request as the server sees it, batched or not.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub method: String,
    pub url: String,
    pub body: Option<Value>,
}

impl Part {
    fn from_request(request: &HttpRequest) -> Self {
        let method = request
            .header("x-http-method")
            .map(str::to_string)
            .unwrap_or_else(|| request.method.to_string());
        Part {
            method,
            url: request.url.clone(),
            body: request
                .body
                .as_ref()
                .and_then(|b| serde_json::from_slice(b).ok()),
        }
    }
}

/// Response for one part.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Fragment {
    pub fn json(status: u16, value: Value) -> Self {
        Fragment {
            status,
            content_type: Some("application/json;odata=nometadata".into()),
            headers: Vec::new(),
            body: value.to_string(),
        }
    }

    pub fn raw(status: u16, content_type: &str, body: &str) -> Self {
        Fragment {
            status,
            content_type: Some(content_type.into()),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Fragment {
            status,
            content_type: None,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn into_response(self) -> RawResponse {
        let mut response = RawResponse::new(self.status, self.body);
        if let Some(ct) = self.content_type {
            response = response.with_header("Content-Type", &ct);
        }
        for (name, value) in &self.headers {
            response = response.with_header(name, value);
        }
        response
    }
}

fn is_request_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_end_matches('\r');
    let rest = line.strip_suffix(" HTTP/1.1")?;
    let (method, url) = rest.split_once(' ')?;
    if ["GET", "POST", "PUT", "PATCH", "DELETE", "MERGE"].contains(&method) {
        Some((method.to_string(), url.to_string()))
    } else {
        None
    }
}

/// Every sub-request of a SharePoint batch envelope, in wire order.
pub fn batch_parts(envelope: &HttpRequest) -> Vec<Part> {
    let text = String::from_utf8_lossy(envelope.body.as_deref().unwrap_or_default()).into_owned();
    let mut parts = Vec::new();
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        let Some((method, url)) = is_request_line(line) else {
            continue;
        };
        // headers up to the blank line
        for header in lines.by_ref() {
            if header.trim().is_empty() {
                break;
            }
        }
        let body = match lines.peek() {
            Some(next) if !next.trim().is_empty() && !next.starts_with("--") => {
                lines.next().and_then(|b| serde_json::from_str(b).ok())
            }
            _ => None,
        };
        parts.push(Part { method, url, body });
    }
    parts
}

/// A flat multipart batch response with one part per fragment.
pub fn multipart_response(fragments: Vec<Fragment>) -> RawResponse {
    let boundary = "batchresponse_5f2c";
    let mut body = String::new();
    for fragment in fragments {
        let reason = StatusCode::from_u16(fragment.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str("Content-Type: application/http\r\nContent-Transfer-Encoding: binary\r\n\r\n");
        body.push_str(&format!("HTTP/1.1 {} {}\r\n", fragment.status, reason));
        if let Some(ct) = fragment.content_type {
            body.push_str(&format!("CONTENT-TYPE: {}\r\n", ct));
        }
        for (name, value) in &fragment.headers {
            body.push_str(&format!("{}: {}\r\n", name, value));
        }
        body.push_str("\r\n");
        body.push_str(&fragment.body);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    RawResponse::new(200, body).with_header("Content-Type", &format!("multipart/mixed; boundary={}", boundary))
}

/// Transport that routes every request, including each member of a batch
/// envelope, through `route`.
pub fn fake_sharepoint<F>(route: F) -> MockTransport
where
    F: Fn(&Part) -> Fragment + Send + Sync + 'static,
{
    MockTransport::with_handler(move |request| {
        if request.url.ends_with("/_api/$batch") {
            let fragments = batch_parts(request).iter().map(&route).collect();
            Ok(multipart_response(fragments))
        } else {
            Ok(route(&Part::from_request(request)).into_response())
        }
    })
}

pub fn client(transport: &MockTransport) -> Client {
    client_with(ClientConfig::new(WEB), transport)
}

pub fn client_with(config: ClientConfig, transport: &MockTransport) -> Client {
    init_test_logging();
    Client::with_transport(config, transport.clone())
        .unwrap()
        .with_cache(ResponseCache::new())
}

pub fn envelopes(transport: &MockTransport) -> Vec<HttpRequest> {
    transport
        .requests()
        .into_iter()
        .filter(|r| r.url.ends_with("/$batch"))
        .collect()
}

/// Shared log of settlement markers.
#[derive(Debug, Clone, Default)]
pub struct Order(Arc<Mutex<Vec<u32>>>);

impl Order {
    pub fn push(&self, n: u32) {
        self.0.lock().unwrap().push(n);
    }

    pub fn marker(&self, n: u32) -> impl Fn(&RequestContext, Settlement<'_>) + Send + Sync + 'static {
        let order = self.clone();
        move |_: &RequestContext, _: Settlement<'_>| order.push(n)
    }

    pub fn get(&self) -> Vec<u32> {
        self.0.lock().unwrap().clone()
    }
}
