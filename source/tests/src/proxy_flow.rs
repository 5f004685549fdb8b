use serde_json::Value;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::test_setup::{spawn_proxy, wait_for_ready};

const ALLOWED_REFERRER: &str = "https://apps.example.com";

fn config_with_rule(port: u16, upstream: &MockServer) -> String {
    serde_json::json!({
        "proxyConfig": {
            "port": port,
            "mustMatch": true,
            "listenURI": "/proxy",
            "allowedReferrers": ALLOWED_REFERRER
        },
        "serverUrls": [
            {"url": format!("http://{}/rest", upstream.address())}
        ]
    })
    .to_string()
}

#[tokio::test]
async fn test_round_trip_through_matched_rule() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/data"))
        .and(query_param("f", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
        .mount(&upstream)
        .await;

    let _proxy = spawn_proxy(&config_with_rule(18101, &upstream));
    wait_for_ready("http://127.0.0.1:18101").await;

    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:18101/proxy/http/{}/rest/data?f=json",
            upstream.address()
        ))
        .header(reqwest::header::REFERER, ALLOWED_REFERRER)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "payload");
}

#[tokio::test]
async fn test_unlisted_referrer_is_rejected() {
    let upstream = MockServer::start().await;

    let _proxy = spawn_proxy(&config_with_rule(18102, &upstream));
    wait_for_ready("http://127.0.0.1:18102").await;

    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:18102/proxy/http/{}/rest/data",
            upstream.address()
        ))
        .header(reqwest::header::REFERER, "https://rogue.example.net/page")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], 403);

    // No referrer at all is rejected the same way.
    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:18102/proxy/http/{}/rest/data",
            upstream.address()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_unmatched_resource_is_not_found() {
    let upstream = MockServer::start().await;

    let config = serde_json::json!({
        "proxyConfig": {
            "port": 18103,
            "mustMatch": true,
            "listenURI": "/proxy",
            "allowedReferrers": ALLOWED_REFERRER
        },
        "serverUrls": [
            {"url": "https://configured.example.com/rest"}
        ]
    })
    .to_string();

    let _proxy = spawn_proxy(&config);
    wait_for_ready("http://127.0.0.1:18103").await;

    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:18103/proxy/http/{}/rest/data",
            upstream.address()
        ))
        .header(reqwest::header::REFERER, ALLOWED_REFERRER)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], 404);
}

#[tokio::test]
async fn test_ping_answers_without_referrer() {
    let upstream = MockServer::start().await;

    let _proxy = spawn_proxy(&config_with_rule(18104, &upstream));
    wait_for_ready("http://127.0.0.1:18104").await;

    let response = reqwest::get("http://127.0.0.1:18104/ping").await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert!(body["Proxy Version"].is_string());
    assert_eq!(body["Configuration File"], "OK");
}

#[tokio::test]
async fn test_status_page_requires_referrer() {
    let upstream = MockServer::start().await;

    let _proxy = spawn_proxy(&config_with_rule(18105, &upstream));
    wait_for_ready("http://127.0.0.1:18105").await;

    let denied = reqwest::get("http://127.0.0.1:18105/status").await.unwrap();
    assert_eq!(denied.status(), 403);

    let allowed = reqwest::Client::new()
        .get("http://127.0.0.1:18105/status")
        .header(reqwest::header::REFERER, ALLOWED_REFERRER)
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);

    let page = allowed.text().await.unwrap();
    assert!(page.contains("Proxy status"));
    assert!(page.contains(ALLOWED_REFERRER));
    assert!(page.contains("Rate meter"));
}

#[tokio::test]
async fn test_wms_content_type_is_rewritten() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/wms"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/vnd.ogc.wms_xml")
                .set_body_string("<WMT_MS_Capabilities/>"),
        )
        .mount(&upstream)
        .await;

    let _proxy = spawn_proxy(&config_with_rule(18106, &upstream));
    wait_for_ready("http://127.0.0.1:18106").await;

    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:18106/proxy/http/{}/rest/wms",
            upstream.address()
        ))
        .header(reqwest::header::REFERER, ALLOWED_REFERRER)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .unwrap(),
        "text/xml"
    );
    assert_eq!(response.text().await.unwrap(), "<WMT_MS_Capabilities/>");
}

#[tokio::test]
async fn test_pass_through_when_must_match_is_off() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/free"))
        .respond_with(ResponseTemplate::new(200).set_body_string("free"))
        .mount(&upstream)
        .await;

    let config = serde_json::json!({
        "proxyConfig": {
            "port": 18107,
            "mustMatch": "false",
            "listenURI": "/proxy",
            "allowedReferrers": "*"
        }
    })
    .to_string();

    let _proxy = spawn_proxy(&config);
    wait_for_ready("http://127.0.0.1:18107").await;

    let response = reqwest::get(format!(
        "http://127.0.0.1:18107/proxy/http/{}/free",
        upstream.address()
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "free");
}

#[tokio::test]
async fn test_query_style_encoding_reaches_the_same_rule() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/encoded"))
        .and(query_param("f", "json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("encoded"))
        .mount(&upstream)
        .await;

    let _proxy = spawn_proxy(&config_with_rule(18108, &upstream));
    wait_for_ready("http://127.0.0.1:18108").await;

    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:18108/proxy?http://{}/rest/encoded?f=json",
            upstream.address()
        ))
        .header(reqwest::header::REFERER, ALLOWED_REFERRER)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "encoded");
}
