use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::test_setup::{spawn_proxy, wait_for_ready};

const ALLOWED_REFERRER: &str = "https://apps.example.com";

/// One upstream server plays both the token service and the resource: the
/// resource rejects the first exchange with 498, the proxy invalidates its
/// cache, fetches a second token and repeats the exchange once. The client
/// only ever sees the 200.
#[tokio::test]
async fn test_stale_token_is_refreshed_exactly_once() {
    let upstream = MockServer::start().await;

    // The token service must be hit exactly twice: the initial acquisition
    // and the refresh after the 498.
    Mock::given(method("POST"))
        .and(path("/tokens"))
        .and(body_string_contains("request=getToken"))
        .and(body_string_contains("username=farmer"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"token": "issued-token"}"#),
        )
        .expect(2)
        .mount(&upstream)
        .await;

    // First exchange: the resource declares the token invalid.
    Mock::given(method("GET"))
        .and(path("/rest/secure"))
        .respond_with(ResponseTemplate::new(498))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;

    // Second exchange: fresh token accepted.
    Mock::given(method("GET"))
        .and(path("/rest/secure"))
        .and(query_param("token", "issued-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secure payload"))
        .mount(&upstream)
        .await;

    let config = serde_json::json!({
        "proxyConfig": {
            "port": 18131,
            "mustMatch": true,
            "listenURI": "/proxy",
            "allowedReferrers": ALLOWED_REFERRER
        },
        "serverUrls": [
            {
                "url": format!("http://{}/rest", upstream.address()),
                "username": "farmer",
                "password": "hunter2",
                "tokenServiceUrl": format!("http://{}/tokens", upstream.address())
            }
        ]
    })
    .to_string();

    let _proxy = spawn_proxy(&config);
    wait_for_ready("http://127.0.0.1:18131").await;

    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:18131/proxy/http/{}/rest/secure",
            upstream.address()
        ))
        .header(reqwest::header::REFERER, ALLOWED_REFERRER)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "secure payload");

    // MockServer verifies the token-service expectation on drop.
}

#[tokio::test]
async fn test_static_token_is_injected_under_its_parameter_name() {
    let upstream = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/keyed"))
        .and(query_param("apikey", "configured-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string("keyed"))
        .mount(&upstream)
        .await;

    let config = serde_json::json!({
        "proxyConfig": {
            "port": 18132,
            "mustMatch": true,
            "listenURI": "/proxy",
            "allowedReferrers": ALLOWED_REFERRER
        },
        "serverUrls": [
            {
                "url": format!("http://{}/rest", upstream.address()),
                "accessToken": "configured-key",
                "tokenParamName": "apikey"
            }
        ]
    })
    .to_string();

    let _proxy = spawn_proxy(&config);
    wait_for_ready("http://127.0.0.1:18132").await;

    let response = reqwest::Client::new()
        .get(format!(
            "http://127.0.0.1:18132/proxy/http/{}/rest/keyed",
            upstream.address()
        ))
        .header(reqwest::header::REFERER, ALLOWED_REFERRER)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "keyed");
}

#[tokio::test]
async fn test_oauth_client_credentials_flow() {
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=portico-app"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"access_token": "oauth-token", "expires_in": 3600}"#,
        ))
        .expect(1)
        .mount(&upstream)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/oauth-data"))
        .and(query_param("token", "oauth-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("oauth payload"))
        .mount(&upstream)
        .await;

    // The OAuth issuer shares the rule's host, so no portal exchange happens.
    let config = serde_json::json!({
        "proxyConfig": {
            "port": 18133,
            "mustMatch": true,
            "listenURI": "/proxy",
            "allowedReferrers": ALLOWED_REFERRER
        },
        "serverUrls": [
            {
                "url": format!("http://{}/rest", upstream.address()),
                "clientId": "portico-app",
                "clientSecret": "s3cret",
                "oauth2Endpoint": format!("http://{}/oauth2", upstream.address())
            }
        ]
    })
    .to_string();

    let _proxy = spawn_proxy(&config);
    wait_for_ready("http://127.0.0.1:18133").await;

    let client = reqwest::Client::new();
    let url = format!(
        "http://127.0.0.1:18133/proxy/http/{}/rest/oauth-data",
        upstream.address()
    );

    // Two requests, one token acquisition: the second request hits the cache.
    for _ in 0..2 {
        let response = client
            .get(&url)
            .header(reqwest::header::REFERER, ALLOWED_REFERRER)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "oauth payload");
    }
}
