//! The upstream dispatch path.
//!
//! Requests are exchanged with the upstream through the shared HTTP client
//! and the response is streamed to the downstream session chunk by chunk.
//! Running the exchange here (rather than in the proxy engine's own upstream
//! phases) lets the credential-refresh retry inspect the upstream status and
//! repeat the exchange before anything is committed to the client.

use std::sync::atomic::Ordering;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header;
use http::HeaderMap;
use pingora::{Error, ErrorType, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use uuid::Uuid;

use portico_config::rules::ServiceRule;
use portico_config::url_parts::UrlParts;

use crate::proxy::outbound::build_outbound_url;
use crate::proxy::{responses, ProxyState};

/// Upstream statuses that mean "acquire a fresh token and try again" when the
/// rule carries credentials.
const TOKEN_REFRESH_STATUSES: [u16; 4] = [401, 403, 498, 499];

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const WMS_CONTENT_TYPE: &str = "application/vnd.ogc.wms_xml";

pub struct DispatchPlan<'a> {
    /// The matched rule and its index, or `None` for pass-through traffic.
    pub rule: Option<(usize, &'a ServiceRule)>,
    /// The upstream target decoded from the request.
    pub target: UrlParts,
    /// Canonical referrer key (`*` under the global wildcard).
    pub referrer: String,
    /// The raw request line, for error bodies.
    pub raw_target: String,
}

pub async fn dispatch(
    session: &mut Session,
    state: &ProxyState,
    plan: DispatchPlan<'_>,
) -> Result<()> {
    let method = session.req_header().method.clone();
    let headers = upstream_headers(&session.req_header().headers);
    let body = read_request_body(session).await?;

    let token = match plan.rule {
        Some((rule_index, rule)) if rule.credentials.is_configured() => {
            match state.tokens.get_token(rule_index, rule, &plan.referrer).await {
                Ok(token) => token,
                Err(err) => {
                    tracing::error!("credential acquisition for '{}' failed: {err}", rule.url);
                    state.stats.processed_err.fetch_add(1, Ordering::Relaxed);
                    return responses::respond_error_json(
                        session,
                        500,
                        "could not acquire credentials for the upstream service",
                        &plan.raw_target,
                        None,
                    )
                    .await;
                }
            }
        }
        _ => None,
    };

    let rule = plan.rule.map(|(_, rule)| rule);
    let url = build_outbound_url(rule, &plan.target, &plan.referrer, token.as_deref());
    tracing::debug!(method = %method, url = %url, "dispatching upstream");

    let mut outcome = send_upstream(state, &method, &url, &headers, &body).await;

    // A stale token comes back as 401/403/498/499; invalidate, acquire a
    // fresh one and repeat the exchange exactly once.
    let first_status = outcome.as_ref().ok().map(|r| r.status().as_u16());
    if let (Some((rule_index, rule)), Some(status)) = (plan.rule, first_status) {
        if rule.credentials.is_configured() && TOKEN_REFRESH_STATUSES.contains(&status) {
            tracing::warn!(
                status,
                rule = %rule.url,
                "upstream rejected the token, refreshing"
            );
            state.tokens.invalidate(rule_index).await;

            match state.tokens.get_token(rule_index, rule, &plan.referrer).await {
                Ok(fresh) => {
                    let retry_url =
                        build_outbound_url(Some(rule), &plan.target, &plan.referrer, fresh.as_deref());
                    match send_upstream(state, &method, &retry_url, &headers, &body).await {
                        Ok(second) => outcome = Ok(second),
                        Err(err) => {
                            // Fall back to the first answer rather than
                            // failing a request we still hold a response for.
                            tracing::error!("token-refresh retry failed: {err}");
                        }
                    }
                }
                Err(err) => {
                    tracing::error!("token refresh for '{}' failed: {err}", rule.url);
                }
            }
        }
    }

    match outcome {
        Ok(upstream) => {
            stream_response(session, state, upstream).await?;
            state.stats.processed_ok.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(err) => {
            let id = Uuid::new_v4();
            tracing::error!("[{id}] upstream exchange with {url} failed: {err}");
            state.stats.processed_err.fetch_add(1, Ordering::Relaxed);
            responses::respond_error_json(
                session,
                500,
                &format!("proxy could not reach the upstream service ({id})"),
                &url,
                None,
            )
            .await
        }
    }
}

async fn send_upstream(
    state: &ProxyState,
    method: &http::Method,
    url: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> reqwest::Result<reqwest::Response> {
    let mut request = state
        .client
        .request(method.clone(), url)
        .headers(headers.clone());
    if !body.is_empty() {
        request = request.body(body.clone());
    }
    request.send().await
}

/// Drain the request body. Buffering it keeps the exchange repeatable for
/// the token-refresh retry.
async fn read_request_body(session: &mut Session) -> Result<Bytes> {
    let mut body = Vec::new();
    while let Some(chunk) = session.downstream_session.read_request_body().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

fn upstream_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut outgoing = HeaderMap::new();
    for (name, value) in incoming {
        if is_hop_by_hop(name.as_str())
            || name == header::HOST
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        outgoing.append(name.clone(), value.clone());
    }
    outgoing
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

async fn stream_response(
    session: &mut Session,
    state: &ProxyState,
    upstream: reqwest::Response,
) -> Result<()> {
    let status = upstream.status();
    let mut header = ResponseHeader::build(status, Some(upstream.headers().len()))?;

    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if name == header::CONTENT_TYPE && content_type_is_wms(value) {
            header.append_header("Content-Type", "text/xml")?;
            continue;
        }
        header.append_header(name.as_str().to_owned(), value.as_bytes())?;
    }

    session
        .downstream_session
        .write_response_header(Box::new(header))
        .await?;

    let mut stream = upstream.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            state.stats.processed_err.fetch_add(1, Ordering::Relaxed);
            Error::because(ErrorType::ReadError, "reading upstream body", err)
        })?;
        session
            .downstream_session
            .write_response_body(chunk, false)
            .await?;
    }
    session
        .downstream_session
        .write_response_body(Bytes::new(), true)
        .await?;

    Ok(())
}

fn content_type_is_wms(value: &http::HeaderValue) -> bool {
    value
        .to_str()
        .map(|v| v.to_ascii_lowercase().contains(WMS_CONTENT_TYPE))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_filtering() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::HOST, "client.example.com".parse().unwrap());
        incoming.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        incoming.insert(header::CONTENT_LENGTH, "12".parse().unwrap());
        incoming.insert(header::REFERER, "https://apps.example.com".parse().unwrap());
        incoming.insert(header::ACCEPT, "image/png".parse().unwrap());

        let outgoing = upstream_headers(&incoming);
        assert!(outgoing.get(header::HOST).is_none());
        assert!(outgoing.get(header::CONNECTION).is_none());
        assert!(outgoing.get(header::CONTENT_LENGTH).is_none());
        assert_eq!(
            outgoing.get(header::REFERER).unwrap(),
            "https://apps.example.com"
        );
        assert_eq!(outgoing.get(header::ACCEPT).unwrap(), "image/png");
    }

    #[test]
    fn test_wms_content_type_detection() {
        let wms = http::HeaderValue::from_static("application/vnd.ogc.wms_xml; charset=UTF-8");
        assert!(content_type_is_wms(&wms));

        let xml = http::HeaderValue::from_static("text/xml");
        assert!(!content_type_is_wms(&xml));
    }

    #[test]
    fn test_refresh_statuses() {
        for status in [401, 403, 498, 499] {
            assert!(TOKEN_REFRESH_STATUSES.contains(&status));
        }
        assert!(!TOKEN_REFRESH_STATUSES.contains(&500));
    }
}
