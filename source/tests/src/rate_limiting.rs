use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::test_setup::{spawn_proxy, wait_for_ready};

const ALLOWED_REFERRER: &str = "https://apps.example.com";

#[tokio::test]
async fn test_meter_throttles_after_the_configured_burst() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/tiles"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tile"))
        .mount(&upstream)
        .await;

    // Three requests per minute: the whole burst is admitted immediately and
    // the refill is far too slow to matter within the test.
    let config = serde_json::json!({
        "proxyConfig": {
            "port": 18121,
            "mustMatch": true,
            "listenURI": "/proxy",
            "allowedReferrers": ALLOWED_REFERRER
        },
        "serverUrls": [
            {
                "url": format!("http://{}/rest", upstream.address()),
                "rateLimit": 3,
                "rateLimitPeriod": 1
            }
        ]
    })
    .to_string();

    let _proxy = spawn_proxy(&config);
    wait_for_ready("http://127.0.0.1:18121").await;

    let client = reqwest::Client::new();
    let url = format!(
        "http://127.0.0.1:18121/proxy/http/{}/rest/tiles",
        upstream.address()
    );

    for i in 0..3 {
        let response = client
            .get(&url)
            .header(reqwest::header::REFERER, ALLOWED_REFERRER)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "request {i} should be admitted");
    }

    let throttled = client
        .get(&url)
        .header(reqwest::header::REFERER, ALLOWED_REFERRER)
        .send()
        .await
        .unwrap();

    assert_eq!(throttled.status(), 420);
    assert!(throttled.headers().get("Retry-After").is_some());

    let body: Value = throttled.json().await.unwrap();
    assert_eq!(body["error"]["code"], 420);
}

#[tokio::test]
async fn test_unmetered_rule_is_never_throttled() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/open"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let config = serde_json::json!({
        "proxyConfig": {
            "port": 18122,
            "mustMatch": true,
            "listenURI": "/proxy",
            "allowedReferrers": ALLOWED_REFERRER
        },
        "serverUrls": [
            {"url": format!("http://{}/rest", upstream.address())}
        ]
    })
    .to_string();

    let _proxy = spawn_proxy(&config);
    wait_for_ready("http://127.0.0.1:18122").await;

    let client = reqwest::Client::new();
    let url = format!(
        "http://127.0.0.1:18122/proxy/http/{}/rest/open",
        upstream.address()
    );

    for _ in 0..20 {
        let response = client
            .get(&url)
            .header(reqwest::header::REFERER, ALLOWED_REFERRER)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}
