// Batch envelope tests against a real local HTTP server
// Exercises encode -> reqwest send -> decode, plus throttling on the envelope

use serde_json::json;
use sprest_core::http::Method;
use sprest_core::{BatchId, HttpRequest};
use sprest_transport::{
    send_with_retry, BatchFormat, GraphBatchFormat, HttpTransport, ReqwestTransport, RetryConfig,
    SharePointBatchFormat,
};
use std::time::Duration;

fn transport() -> ReqwestTransport {
    ReqwestTransport::new(Duration::from_secs(5)).unwrap()
}

// ============================================================================
// SHAREPOINT MULTIPART
// ============================================================================

#[tokio::test]
async fn test_sharepoint_envelope_round_trip() {
    let mut server = mockito::Server::new_async().await;
    let web = format!("{}/sites/dev", server.url());

    let response_body = [
        "--batchresponse_42",
        "Content-Type: application/http",
        "Content-Transfer-Encoding: binary",
        "",
        "HTTP/1.1 200 OK",
        "CONTENT-TYPE: application/json;odata=nometadata",
        "",
        r#"{"Title":"Dev"}"#,
        "--batchresponse_42",
        "Content-Type: multipart/mixed; boundary=changesetresponse_1",
        "",
        "--changesetresponse_1",
        "Content-Type: application/http",
        "Content-Transfer-Encoding: binary",
        "",
        "HTTP/1.1 201 Created",
        "CONTENT-TYPE: application/json;odata=nometadata",
        "",
        r#"{"Id":3}"#,
        "--changesetresponse_1--",
        "--batchresponse_42--",
        "",
    ]
    .join("\r\n");

    let mock = server
        .mock("POST", "/sites/dev/_api/$batch")
        .match_header(
            "content-type",
            mockito::Matcher::Regex("^multipart/mixed; boundary=\"batch_[0-9a-f-]+\"$".into()),
        )
        .match_body(mockito::Matcher::Regex("POST .*/_api/web/lists HTTP/1.1".into()))
        .with_status(200)
        .with_header("content-type", "multipart/mixed; boundary=batchresponse_42")
        .with_body(response_body)
        .create_async()
        .await;

    let requests = vec![
        HttpRequest::new(Method::GET, format!("{}/_api/web", web)),
        HttpRequest::new(Method::POST, format!("{}/_api/web/lists", web)).with_body(r#"{"Title":"T"}"#),
    ];
    let format = SharePointBatchFormat::new();
    let envelope = format.encode(&BatchId::new(), &web, &requests).unwrap();

    let response = transport().send(envelope).await.unwrap();
    let fragments = format.decode(&response, &requests).unwrap();

    mock.assert_async().await;
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].text(), r#"{"Title":"Dev"}"#);
    assert_eq!(fragments[1].status, 201);
    assert_eq!(fragments[1].url, requests[1].url);
}

#[tokio::test]
async fn test_throttled_envelope_is_retried() {
    let mut server = mockito::Server::new_async().await;
    let throttled = server
        .mock("POST", "/_api/$batch")
        .with_status(429)
        .with_header("retry-after", "0")
        .expect(2)
        .create_async()
        .await;

    let requests = vec![HttpRequest::new(Method::GET, format!("{}/_api/web", server.url()))];
    let format = SharePointBatchFormat::new();
    let envelope = format.encode(&BatchId::new(), &server.url(), &requests).unwrap();

    let config = RetryConfig::default().with_max_attempts(2);
    let err = send_with_retry(&transport(), envelope, &config).await.unwrap_err();

    // mockito keeps answering 429, so both attempts are throttled.
    assert_eq!(err.status(), Some(429));
    throttled.assert_async().await;
}

// ============================================================================
// GRAPH JSON
// ============================================================================

#[tokio::test]
async fn test_graph_envelope_round_trip() {
    let mut server = mockito::Server::new_async().await;
    let root = format!("{}/v1.0", server.url());

    let mock = server
        .mock("POST", "/v1.0/$batch")
        .match_body(mockito::Matcher::Regex(r#""url":"/me""#.into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({"responses": [{"id": "1", "status": 200,
                "headers": {"content-type": "application/json"},
                "body": {"displayName": "Megan"}}]})
            .to_string(),
        )
        .create_async()
        .await;

    let requests = vec![HttpRequest::new(Method::GET, format!("{}/me", root))];
    let format = GraphBatchFormat::new();
    let envelope = format.encode(&BatchId::new(), &root, &requests).unwrap();
    let response = transport().send(envelope).await.unwrap();
    let fragments = format.decode(&response, &requests).unwrap();

    mock.assert_async().await;
    assert_eq!(fragments[0].text(), r#"{"displayName":"Megan"}"#);
}

// ============================================================================
// ORDER PROPERTIES
// ============================================================================

use proptest::prelude::*;
use serde_json::Value;
use sprest_core::RawResponse;

const WEB: &str = "https://contoso.sharepoint.com/sites/dev";

/// 0 = GET, 1 = POST, 2 = MERGE tunnelled through POST, 3 = DELETE
fn build_requests(kinds: &[u8], root: &str) -> Vec<HttpRequest> {
    kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            let url = format!("{}/_api/web/lists/getByTitle('L{}')/items", root, i);
            match kind {
                0 => HttpRequest::new(Method::GET, url),
                1 => HttpRequest::new(Method::POST, url).with_body(json!({ "Title": i }).to_string()),
                2 => HttpRequest::new(Method::POST, format!("{}({})", url, i))
                    .with_header("X-HTTP-Method", "MERGE")
                    .with_body(json!({ "Title": i }).to_string()),
                _ => HttpRequest::new(Method::DELETE, format!("{}({})", url, i)),
            }
        })
        .collect()
}

fn wire_method(request: &HttpRequest) -> String {
    request
        .header("x-http-method")
        .map(str::to_string)
        .unwrap_or_else(|| request.method.to_string())
}

fn request_lines(envelope: &HttpRequest) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(envelope.body.as_deref().unwrap_or_default()).into_owned();
    text.lines()
        .filter_map(|line| line.trim_end().strip_suffix(" HTTP/1.1"))
        .filter_map(|line| line.split_once(' '))
        .map(|(method, url)| (method.to_string(), url.to_string()))
        .collect()
}

fn flat_multipart(count: usize) -> RawResponse {
    let mut body = String::new();
    for i in 0..count {
        body.push_str("--batchresponse_p\r\nContent-Type: application/http\r\nContent-Transfer-Encoding: binary\r\n\r\n");
        body.push_str("HTTP/1.1 200 OK\r\nCONTENT-TYPE: application/json\r\n\r\n");
        body.push_str(&json!({ "i": i }).to_string());
        body.push_str("\r\n");
    }
    body.push_str("--batchresponse_p--\r\n");
    RawResponse::new(200, body).with_header("Content-Type", "multipart/mixed; boundary=batchresponse_p")
}

proptest! {
    #[test]
    fn prop_sharepoint_keeps_order_and_count(kinds in proptest::collection::vec(0u8..4, 1..16)) {
        let requests = build_requests(&kinds, WEB);
        let format = SharePointBatchFormat::new();
        let envelope = format.encode(&BatchId::new(), WEB, &requests).unwrap();

        let lines = request_lines(&envelope);
        prop_assert_eq!(lines.len(), requests.len());
        for (request, (method, url)) in requests.iter().zip(&lines) {
            prop_assert_eq!(method, &wire_method(request));
            prop_assert_eq!(url, &request.url);
        }

        let fragments = format.decode(&flat_multipart(requests.len()), &requests).unwrap();
        prop_assert_eq!(fragments.len(), requests.len());
        for (i, (fragment, request)) in fragments.iter().zip(&requests).enumerate() {
            let body: Value = serde_json::from_slice(&fragment.body).unwrap();
            prop_assert_eq!(&body["i"], &json!(i));
            prop_assert_eq!(&fragment.url, &request.url);
        }
    }

    #[test]
    fn prop_graph_matches_by_id(kinds in proptest::collection::vec(0u8..4, 1..20)) {
        let root = "https://graph.microsoft.com/v1.0";
        let requests = build_requests(&kinds, root);
        let format = GraphBatchFormat::new();
        let envelope = format.encode(&BatchId::new(), root, &requests).unwrap();

        let sent: Value = serde_json::from_slice(envelope.body.as_deref().unwrap_or_default()).unwrap();
        let items = sent["requests"].as_array().unwrap();
        prop_assert_eq!(items.len(), requests.len());
        for (i, item) in items.iter().enumerate() {
            let expected_id = (i + 1).to_string();
            prop_assert_eq!(item["id"].as_str(), Some(expected_id.as_str()));
        }

        // Graph may answer in any order.
        let responses: Vec<Value> = (0..requests.len())
            .rev()
            .map(|i| json!({"id": (i + 1).to_string(), "status": 200,
                "headers": {"content-type": "application/json"}, "body": {"i": i}}))
            .collect();
        let response = RawResponse::json(200, &json!({ "responses": responses }));
        let fragments = format.decode(&response, &requests).unwrap();
        prop_assert_eq!(fragments.len(), requests.len());
        for (i, (fragment, request)) in fragments.iter().zip(&requests).enumerate() {
            let body: Value = serde_json::from_slice(&fragment.body).unwrap();
            prop_assert_eq!(&body["i"], &json!(i));
            prop_assert_eq!(&fragment.url, &request.url);
        }
    }
}
