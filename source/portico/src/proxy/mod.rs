use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use miette::{Context, IntoDiagnostic, Result as ConfigResult};
use pingora::{prelude::HttpPeer, server::Server, Result};
use pingora_proxy::{ProxyHttp, Session};

use portico_config::internal::Config;
use portico_config::url_parts::UrlParts;

use crate::proxy::dispatcher::DispatchPlan;
use crate::proxy::populate_listeners::populate_listeners;
use crate::proxy::rate_meter::RateMeter;
use crate::proxy::request_url::RequestUrl;
use crate::proxy::status::ProxyStats;
use crate::proxy::tokens::TokenBroker;

pub mod dispatcher;
pub mod outbound;
pub mod populate_listeners;
pub mod rate_meter;
pub mod referrer;
pub mod request_url;
pub mod responses;
pub mod status;
pub mod tokens;

/// Everything a request handler needs, shared across all requests. The rule
/// table and referrer policy inside `config` are frozen at startup; the rate
/// meter and the token broker carry their own synchronization.
pub struct ProxyState {
    pub config: Arc<Config>,
    pub meter: Arc<RateMeter>,
    pub tokens: Arc<TokenBroker>,
    pub stats: Arc<ProxyStats>,
    pub client: reqwest::Client,
}

impl ProxyState {
    pub fn from_config(config: Config) -> ConfigResult<Arc<ProxyState>> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .into_diagnostic()
            .wrap_err("failed to build the upstream HTTP client")?;

        let meter = Arc::new(RateMeter::for_rules(&config.rules));
        let tokens = Arc::new(TokenBroker::new(client.clone()));

        Ok(Arc::new(ProxyState {
            config: Arc::new(config),
            meter,
            tokens,
            stats: Arc::new(ProxyStats::new()),
            client,
        }))
    }
}

pub struct PorticoProxyService {
    pub state: Arc<ProxyState>,
}

/// Create the proxy service and attach its listeners.
pub fn portico_proxy_service(
    state: Arc<ProxyState>,
    server: &Server,
) -> ConfigResult<Box<dyn pingora::services::Service>> {
    let mut service = pingora_proxy::http_proxy_service_with_name(
        &server.configuration,
        PorticoProxyService {
            state: state.clone(),
        },
        "portico-proxy",
    );

    populate_listeners(&state.config, &mut service)?;

    Ok(Box::new(service))
}

pub struct PorticoContext;

#[async_trait]
impl ProxyHttp for PorticoProxyService {
    type CTX = PorticoContext;

    fn new_ctx(&self) -> Self::CTX {
        PorticoContext
    }

    /// Handle the "Request filter" stage. The whole pipeline runs here:
    /// referrer validation, the local endpoints, rule lookup, rate admission
    /// and the upstream exchange itself, so the credential-refresh retry can
    /// observe the upstream status before anything is committed downstream.
    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        self.handle(session).await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        // Every request is completed during the request filter stage; nothing
        // ever reaches peer selection.
        Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(404)))
    }
}

impl PorticoProxyService {
    async fn handle(&self, session: &mut Session) -> Result<()> {
        let state = &self.state;
        let conf = &state.config;

        let raw_target = session
            .req_header()
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_default();
        let path = session.req_header().uri.path().to_owned();
        let raw_referrer = session
            .req_header()
            .headers
            .get(http::header::REFERER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        // The ping endpoint answers before any access checks.
        if path == conf.ping_path {
            return status::respond_ping(session, raw_referrer.as_deref()).await;
        }

        state.stats.attempted.fetch_add(1, Ordering::Relaxed);

        let Some(referrer) = referrer::validate_referrer(raw_referrer.as_deref(), &conf.referrers)
        else {
            tracing::info!(referrer = ?raw_referrer, "rejecting request from unlisted referrer");
            state.stats.processed_err.fetch_add(1, Ordering::Relaxed);
            return responses::respond_error_json(
                session,
                403,
                "referrer is not allowed by the proxy",
                &raw_target,
                None,
            )
            .await;
        };

        if path == conf.status_path {
            return status::respond_status(session, state).await;
        }

        let Some(request) = RequestUrl::parse(&raw_target, &conf.listen_uris, conf.must_match)
        else {
            state.stats.processed_err.fetch_add(1, Ordering::Relaxed);
            return responses::respond_error_json(
                session,
                403,
                "request URL could not be understood",
                &raw_target,
                None,
            )
            .await;
        };

        let target: UrlParts = request.target_parts();

        let Some((rule_index, rule)) = conf.rules.find_match(&target) else {
            if conf.must_match {
                tracing::debug!(target = %request.proxy_path, "no rule matches");
                state.stats.processed_err.fetch_add(1, Ordering::Relaxed);
                return responses::respond_error_json(
                    session,
                    404,
                    "no rule is configured for the requested resource",
                    &raw_target,
                    None,
                )
                .await;
            }
            // mustMatch off: plain pass-through, no credentials, no metering.
            return dispatcher::dispatch(
                session,
                state,
                DispatchPlan {
                    rule: None,
                    target,
                    referrer,
                    raw_target,
                },
            )
            .await;
        };

        if rule.use_rate_meter {
            match state.meter.is_under_rate(&referrer, rule_index, rule).await {
                Ok(admission) if admission.allowed => {}
                Ok(admission) => {
                    tracing::debug!(referrer = %referrer, rule = %rule.url, "rate limit exceeded");
                    state.stats.processed_err.fetch_add(1, Ordering::Relaxed);
                    return responses::respond_error_json(
                        session,
                        420,
                        "rate limit for this resource has been exceeded",
                        &raw_target,
                        Some(admission.reset_after.as_secs().max(1)),
                    )
                    .await;
                }
                Err(err) => {
                    tracing::error!("rate meter failure for rule '{}': {err}", rule.url);
                    state.stats.processed_err.fetch_add(1, Ordering::Relaxed);
                    return responses::respond_error_json(
                        session,
                        500,
                        "rate meter is unavailable",
                        &raw_target,
                        None,
                    )
                    .await;
                }
            }
        }

        dispatcher::dispatch(
            session,
            state,
            DispatchPlan {
                rule: Some((rule_index, rule)),
                target,
                referrer,
                raw_target,
            },
        )
        .await
    }
}
