use super::{check_count, effective_method, BatchFormat, CodecError, DEFAULT_MAX_BODY_SIZE};
use bytes::{BufMut, BytesMut};
use sprest_core::http::header::{ACCEPT, CONTENT_TYPE};
use sprest_core::http::Method;
use sprest_core::response::set_header;
use sprest_core::url::{combine, extract_web_url};
use sprest_core::{BatchId, HttpRequest, RawResponse};
use tracing::trace;
use uuid::Uuid;

const WRITE_CONTENT_TYPE: &str = "application/json;odata=verbose;charset=utf-8";
const MAX_NESTING: usize = 1;

/// SharePoint REST `$batch`: an OData v3 `multipart/mixed` envelope.
///
/// Reads go directly under the batch boundary; each run of consecutive
/// writes is wrapped in one changeset.
#[derive(Debug, Clone)]
pub struct SharePointBatchFormat {
    max_requests: usize,
    max_body_size: usize,
}

impl SharePointBatchFormat {
    pub fn new() -> Self {
        Self {
            max_requests: 100,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

impl Default for SharePointBatchFormat {
    fn default() -> Self {
        Self::new()
    }
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.put_slice(line.as_bytes());
    buf.put_u8(b'\n');
}

fn encode_part(buf: &mut BytesMut, request: &HttpRequest, method: &str) -> Result<(), CodecError> {
    put_line(buf, "Content-Type: application/http");
    put_line(buf, "Content-Transfer-Encoding: binary");
    put_line(buf, "");
    put_line(buf, &format!("{} {} HTTP/1.1", method, request.url));

    for (name, value) in request.headers.iter() {
        if name.as_str().eq_ignore_ascii_case("x-http-method") {
            continue;
        }
        let value = value
            .to_str()
            .map_err(|_| CodecError::Malformed(format!("header '{}' is not visible ASCII", name)))?;
        put_line(buf, &format!("{}: {}", name, value));
    }
    if method != Method::GET.as_str() && !request.headers.contains_key(CONTENT_TYPE) {
        put_line(buf, &format!("content-type: {}", WRITE_CONTENT_TYPE));
    }
    if !request.headers.contains_key(ACCEPT) {
        put_line(buf, "accept: application/json");
    }
    put_line(buf, "");

    if let Some(ref body) = request.body {
        buf.put_slice(body);
        put_line(buf, "");
    }
    put_line(buf, "");
    Ok(())
}

impl BatchFormat for SharePointBatchFormat {
    fn max_requests(&self) -> usize {
        self.max_requests
    }

    fn endpoint(&self, base_url: &str) -> String {
        combine(&[extract_web_url(base_url), "_api/$batch"])
    }

    fn encode(
        &self,
        batch_id: &BatchId,
        base_url: &str,
        requests: &[HttpRequest],
    ) -> Result<HttpRequest, CodecError> {
        let boundary = format!("batch_{}", batch_id);
        let mut buf = BytesMut::with_capacity(512 * requests.len().max(1));
        let mut changeset: Option<String> = None;

        for request in requests {
            let method = effective_method(request);
            if method != Method::GET.as_str() {
                if changeset.is_none() {
                    let id = format!("changeset_{}", Uuid::new_v4());
                    put_line(&mut buf, &format!("--{}", boundary));
                    put_line(&mut buf, &format!("Content-Type: multipart/mixed; boundary=\"{}\"", id));
                    put_line(&mut buf, "");
                    changeset = Some(id);
                }
                if let Some(ref id) = changeset {
                    put_line(&mut buf, &format!("--{}", id));
                }
            } else {
                if let Some(id) = changeset.take() {
                    put_line(&mut buf, &format!("--{}--", id));
                    put_line(&mut buf, "");
                }
                put_line(&mut buf, &format!("--{}", boundary));
            }
            encode_part(&mut buf, request, &method)?;

            if buf.len() > self.max_body_size {
                return Err(CodecError::BodyTooLarge(buf.len()));
            }
        }

        if let Some(id) = changeset.take() {
            put_line(&mut buf, &format!("--{}--", id));
            put_line(&mut buf, "");
        }
        put_line(&mut buf, &format!("--{}--", boundary));

        trace!(batch_id = %batch_id, bytes = buf.len(), "Encoded SharePoint batch body");

        Ok(HttpRequest::new(Method::POST, self.endpoint(base_url))
            .with_header(
                CONTENT_TYPE.as_str(),
                &format!("multipart/mixed; boundary=\"{}\"", boundary),
            )
            .with_header(ACCEPT.as_str(), "application/json")
            .with_body(buf.freeze()))
    }

    fn decode(&self, response: &RawResponse, requests: &[HttpRequest]) -> Result<Vec<RawResponse>, CodecError> {
        let text = std::str::from_utf8(&response.body)
            .map_err(|e| CodecError::Malformed(format!("batch response is not UTF-8: {}", e)))?;
        let boundary = response
            .content_type()
            .and_then(boundary_of)
            .or_else(|| sniff_boundary(text))
            .ok_or(CodecError::MissingBoundary)?;

        let mut fragments = Vec::with_capacity(requests.len());
        collect_fragments(text, &boundary, 0, &mut fragments)?;
        check_count(requests.len(), fragments.len())?;

        Ok(fragments
            .into_iter()
            .zip(requests)
            .map(|(fragment, request)| fragment.with_url(request.url.clone()))
            .collect())
    }
}

/// Extract the `boundary` parameter of a multipart content type.
fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Fall back to the first delimiter line when the response omits its content type.
fn sniff_boundary(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.strip_prefix("--"))
        .map(|b| b.trim_end_matches("--").to_string())
        .filter(|b| !b.is_empty())
}

/// Split a multipart body on `boundary`, returning the raw text of each part
/// without its delimiter lines. Line endings are normalised to `\n`.
fn split_parts(text: &str, boundary: &str) -> Result<Vec<String>, CodecError> {
    let delimiter = format!("--{}", boundary);
    let mut parts = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    let mut closed = false;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix(delimiter.as_str()) {
            if let Some(lines) = current.take() {
                parts.push(lines.join("\n"));
            }
            if rest.trim_end().starts_with("--") {
                closed = true;
                break;
            }
            current = Some(Vec::new());
        } else if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }

    if !closed {
        return Err(CodecError::Malformed(format!(
            "multipart body is not terminated by --{}--",
            boundary
        )));
    }
    Ok(parts)
}

/// Split a header block from what follows the first blank line.
fn split_head(text: &str) -> (Vec<(String, String)>, &str) {
    let mut headers = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        offset += line.len();
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return (headers, &text[offset..]);
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    (headers, "")
}

fn collect_fragments(
    text: &str,
    boundary: &str,
    depth: usize,
    out: &mut Vec<RawResponse>,
) -> Result<(), CodecError> {
    for part in split_parts(text, boundary)? {
        let (headers, content) = split_head(&part);
        let content_type = headers
            .iter()
            .find(|(name, _)| name == "content-type")
            .map(|(_, value)| value.as_str())
            .unwrap_or("");

        if content_type.to_ascii_lowercase().starts_with("multipart/mixed") {
            if depth >= MAX_NESTING {
                return Err(CodecError::Malformed("changesets nested too deeply".into()));
            }
            let nested = boundary_of(content_type).ok_or(CodecError::MissingBoundary)?;
            collect_fragments(content, &nested, depth + 1, out)?;
        } else {
            out.push(parse_http_message(content)?);
        }
    }
    Ok(())
}

/// Parse one embedded `application/http` response.
fn parse_http_message(content: &str) -> Result<RawResponse, CodecError> {
    let content = content.trim_start_matches(['\r', '\n']);
    let (status_line, rest) = content.split_once('\n').unwrap_or((content, ""));
    let status_line = status_line.trim_end_matches('\r');

    let mut fields = status_line.splitn(3, ' ');
    let version = fields.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(CodecError::Malformed(format!("bad status line '{}'", status_line)));
    }
    let status = fields
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| CodecError::Malformed(format!("bad status code in '{}'", status_line)))?;
    let status_text = fields.next().unwrap_or_default().trim().to_string();

    let (headers, body) = split_head(rest);
    let body = body.trim_end_matches(['\r', '\n']);

    let mut response = RawResponse::new(status, body.to_string()).with_status_text(status_text);
    for (name, value) in &headers {
        set_header(&mut response.headers, name, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEB: &str = "https://contoso.sharepoint.com/sites/dev";

    fn batch_id() -> BatchId {
        BatchId::from_uuid(Uuid::from_u128(0x1234))
    }

    fn sample_requests() -> Vec<HttpRequest> {
        vec![
            HttpRequest::new(Method::GET, format!("{}/_api/web", WEB))
                .with_header("Accept", "application/json;odata=nometadata"),
            HttpRequest::new(Method::POST, format!("{}/_api/web/lists", WEB)).with_body(r#"{"Title":"Tasks"}"#),
            HttpRequest::new(Method::POST, format!("{}/_api/web/lists(1)/items(2)", WEB))
                .with_header("X-HTTP-Method", "MERGE")
                .with_header("IF-MATCH", "*")
                .with_body(r#"{"Title":"Renamed"}"#),
            HttpRequest::new(Method::GET, format!("{}/_api/web/lists", WEB)),
            HttpRequest::new(Method::DELETE, format!("{}/_api/web/lists(1)", WEB)),
        ]
    }

    #[test]
    fn test_endpoint_targets_the_web() {
        let format = SharePointBatchFormat::new();
        assert_eq!(
            format.endpoint("https://contoso.sharepoint.com/sites/dev/_api/web/lists"),
            "https://contoso.sharepoint.com/sites/dev/_api/$batch"
        );
        assert_eq!(format.endpoint(WEB), format!("{}/_api/$batch", WEB));
    }

    #[test]
    fn test_encode_groups_consecutive_writes_into_changesets() {
        let format = SharePointBatchFormat::new();
        let envelope = format.encode(&batch_id(), WEB, &sample_requests()).unwrap();
        let body = String::from_utf8(envelope.body.clone().unwrap().to_vec()).unwrap();
        let boundary = format!("batch_{}", batch_id());

        assert_eq!(envelope.method, Method::POST);
        assert_eq!(envelope.url, format!("{}/_api/$batch", WEB));
        assert_eq!(
            envelope.header("content-type"),
            Some(format!("multipart/mixed; boundary=\"{}\"", boundary).as_str())
        );

        // Two runs of writes: [POST, MERGE] and [DELETE].
        assert_eq!(body.matches("boundary=\"changeset_").count(), 2);
        assert!(body.ends_with(&format!("--{}--\n", boundary)));

        let request_lines: Vec<&str> = body.lines().filter(|l| l.ends_with(" HTTP/1.1")).collect();
        assert_eq!(
            request_lines,
            vec![
                format!("GET {}/_api/web HTTP/1.1", WEB),
                format!("POST {}/_api/web/lists HTTP/1.1", WEB),
                format!("MERGE {}/_api/web/lists(1)/items(2) HTTP/1.1", WEB),
                format!("GET {}/_api/web/lists HTTP/1.1", WEB),
                format!("DELETE {}/_api/web/lists(1) HTTP/1.1", WEB),
            ]
        );

        assert!(!body.to_ascii_lowercase().contains("x-http-method"));
        assert!(body.contains("if-match: *"));
        assert!(body.contains(&format!("content-type: {}", WRITE_CONTENT_TYPE)));
        assert!(body.contains("accept: application/json;odata=nometadata"));
        assert!(body.contains(r#"{"Title":"Renamed"}"#));
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let format = SharePointBatchFormat::new().with_max_body_size(64);
        let err = format.encode(&batch_id(), WEB, &sample_requests()).unwrap_err();
        assert!(matches!(err, CodecError::BodyTooLarge(_)));
    }

    fn sample_response() -> RawResponse {
        let body = [
            "--batchresponse_8ad6",
            "Content-Type: application/http",
            "Content-Transfer-Encoding: binary",
            "",
            "HTTP/1.1 200 OK",
            "CONTENT-TYPE: application/json;odata=minimalmetadata;streaming=true;charset=utf-8",
            "",
            r#"{"odata.metadata":"https://x/_api/$metadata#SP.ApiData.Webs/@Element","Title":"Dev"}"#,
            "--batchresponse_8ad6",
            "Content-Type: multipart/mixed; boundary=changesetresponse_77c1",
            "",
            "--changesetresponse_77c1",
            "Content-Type: application/http",
            "Content-Transfer-Encoding: binary",
            "",
            "HTTP/1.1 201 Created",
            "CONTENT-TYPE: application/json;odata=minimalmetadata;streaming=true;charset=utf-8",
            "",
            r#"{"Id":7,"Title":"Tasks"}"#,
            "--changesetresponse_77c1",
            "Content-Type: application/http",
            "Content-Transfer-Encoding: binary",
            "",
            "HTTP/1.1 204 No Content",
            "",
            "",
            "--changesetresponse_77c1--",
            "--batchresponse_8ad6",
            "Content-Type: application/http",
            "Content-Transfer-Encoding: binary",
            "",
            "HTTP/1.1 404 Not Found",
            "CONTENT-TYPE: application/json;odata=minimalmetadata;streaming=true;charset=utf-8",
            "",
            r#"{"odata.error":{"code":"-1, Microsoft.SharePoint.Client.ResourceNotFoundException","message":{"lang":"en-US","value":"Not found"}}}"#,
            "--batchresponse_8ad6",
            "Content-Type: multipart/mixed; boundary=changesetresponse_99aa",
            "",
            "--changesetresponse_99aa",
            "Content-Type: application/http",
            "Content-Transfer-Encoding: binary",
            "",
            "HTTP/1.1 200 OK",
            "",
            "",
            "--changesetresponse_99aa--",
            "--batchresponse_8ad6--",
            "",
        ]
        .join("\r\n");

        RawResponse::new(200, body).with_header("Content-Type", "multipart/mixed; boundary=batchresponse_8ad6")
    }

    #[test]
    fn test_decode_walks_changesets_in_order() {
        let format = SharePointBatchFormat::new();
        let requests = sample_requests();
        let fragments = format.decode(&sample_response(), &requests).unwrap();

        let statuses: Vec<u16> = fragments.iter().map(|f| f.status).collect();
        assert_eq!(statuses, vec![200, 201, 204, 404, 200]);

        assert_eq!(fragments[0].text(), r#"{"odata.metadata":"https://x/_api/$metadata#SP.ApiData.Webs/@Element","Title":"Dev"}"#);
        assert_eq!(fragments[1].status_text, "Created");
        assert_eq!(fragments[1].text(), r#"{"Id":7,"Title":"Tasks"}"#);
        assert!(fragments[2].is_empty());
        assert!(fragments[3].text().contains("Not found"));
        assert_eq!(
            fragments[1].content_type(),
            Some("application/json;odata=minimalmetadata;streaming=true;charset=utf-8")
        );

        for (fragment, request) in fragments.iter().zip(&requests) {
            assert_eq!(fragment.url, request.url);
        }
    }

    #[test]
    fn test_decode_accepts_bare_newlines_and_sniffs_boundary() {
        let format = SharePointBatchFormat::new();
        let body = "--batchresponse_1\nContent-Type: application/http\n\nHTTP/1.1 200 OK\n\n\"x\"\n--batchresponse_1--\n";
        let fragments = format
            .decode(&RawResponse::new(200, body), &sample_requests()[..1])
            .unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text(), "\"x\"");
    }

    #[test]
    fn test_decode_count_mismatch() {
        let format = SharePointBatchFormat::new();
        let err = format.decode(&sample_response(), &sample_requests()[..2]).unwrap_err();
        assert_eq!(err, CodecError::CountMismatch { expected: 2, actual: 5 });
    }

    #[test]
    fn test_decode_rejects_truncated_and_boundaryless_bodies() {
        let format = SharePointBatchFormat::new();
        let truncated = RawResponse::new(200, "--b\nContent-Type: application/http\n\nHTTP/1.1 200 OK\n\n{}\n")
            .with_header("Content-Type", "multipart/mixed; boundary=b");
        assert!(matches!(
            format.decode(&truncated, &sample_requests()[..1]),
            Err(CodecError::Malformed(_))
        ));

        let plain = RawResponse::new(200, "{}").with_header("Content-Type", "application/json");
        assert_eq!(
            format.decode(&plain, &sample_requests()[..1]).unwrap_err(),
            CodecError::MissingBoundary
        );
    }

    #[test]
    fn test_boundary_parameter_parsing() {
        assert_eq!(
            boundary_of("multipart/mixed; boundary=\"batch_1\"; charset=utf-8").as_deref(),
            Some("batch_1")
        );
        assert_eq!(boundary_of("multipart/mixed;BOUNDARY=b").as_deref(), Some("b"));
        assert_eq!(boundary_of("application/json"), None);
    }
}
