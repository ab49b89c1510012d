use preview_sandbox::{PreviewServer, ServiceConfig};
use serde_json::{json, Value};

async fn start_server() -> PreviewServer {
    let config = ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    };
    PreviewServer::start(config).await.unwrap()
}

fn url(server: &PreviewServer, path: &str) -> String {
    format!("http://{}{}", server.local_addr(), path)
}

#[tokio::test]
async fn preview_round_trip() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(url(&server, "/api/preview"))
        .json(&json!({ "code": { "html": "<b>hi</b>" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-preview-cache"], "miss");
    let fingerprint = response.headers()["x-preview-fingerprint"]
        .to_str()
        .unwrap()
        .to_string();
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "preview": {
                "message": "Preview placeholder",
                "htmlSnippet": "<b>hi</b>",
                "status": "Generated"
            }
        })
    );

    // Same payload again is served from the cache
    let response = client
        .post(url(&server, "/api/preview"))
        .json(&json!({ "code": { "html": "<b>hi</b>" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["x-preview-cache"], "hit");
    assert_eq!(response.headers()["x-preview-fingerprint"], fingerprint.as_str());

    let document = client
        .get(url(&server, &format!("/api/preview/{fingerprint}")))
        .send()
        .await
        .unwrap();
    assert_eq!(document.status(), 200);
    assert!(document.headers().contains_key("content-security-policy"));
    let text = document.text().await.unwrap();
    assert!(text.contains("<b>hi</b>"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn preview_without_html() {
    let server = start_server().await;

    let body: Value = reqwest::Client::new()
        .post(url(&server, "/api/preview"))
        .json(&json!({ "code": {} }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["preview"]["htmlSnippet"], "No HTML provided");
    assert_eq!(body["preview"]["message"], "Preview placeholder");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn rejected_payloads() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(url(&server, "/api/preview"))
        .json(&json!({ "code": { "html": ["not", "a", "string"] } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "WrongType");

    let response = client
        .post(url(&server, "/api/preview"))
        .json(&json!({ "code": { "html": "<p>" }, "extra": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "UnknownField");

    // Nothing was rendered or cached
    let health: Value = client
        .get(url(&server, "/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["cache"]["entries"], 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn blocked_resources_are_reported_in_snippet() {
    let server = start_server().await;

    let body: Value = reqwest::Client::new()
        .post(url(&server, "/api/preview"))
        .json(&json!({ "code": { "html": "<img src=\"https://evil.example/x.png\">" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let snippet = body["preview"]["htmlSnippet"].as_str().unwrap();
    assert!(snippet.contains("data-blocked-src"));
    assert!(!snippet.contains(" src="));

    server.stop().await.unwrap();
}
