//! Upstream credential acquisition and caching.
//!
//! One cache slot per rule. The slot's async mutex doubles as the
//! single-flight primitive: concurrent cache misses for the same rule queue
//! on the lock and find the fresh token once the first caller has stored it,
//! while other rules proceed independently. A failed acquisition caches
//! nothing and is reported to the caller that performed it; the next caller
//! simply tries again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use portico_config::rules::{Credentials, ServiceRule};
use portico_config::url_parts::{UrlParts, ANY};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Default lifetime when the token endpoint does not say; matches the
/// `expiration=60` (minutes) requested from user-login token services.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("token endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no token service could be discovered for {0}")]
    NoTokenService(String),
    #[error("token endpoint {0} returned no token")]
    MissingToken(String),
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

type Slot = Arc<Mutex<Option<CachedToken>>>;

pub struct TokenBroker {
    client: reqwest::Client,
    slots: Mutex<HashMap<usize, Slot>>,
}

impl TokenBroker {
    pub fn new(client: reqwest::Client) -> TokenBroker {
        TokenBroker {
            client,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// A valid token for the rule, or `None` when it has no credentials.
    pub async fn get_token(
        &self,
        rule_index: usize,
        rule: &ServiceRule,
        referrer: &str,
    ) -> Result<Option<String>, CredentialError> {
        match &rule.credentials {
            Credentials::None => Ok(None),
            Credentials::StaticToken { access_token } => Ok(Some(access_token.clone())),
            _ => {
                let slot = self.slot(rule_index).await;
                let mut cached = slot.lock().await;

                if let Some(entry) = cached.as_ref() {
                    if entry.expires_at > Instant::now() {
                        return Ok(Some(entry.token.clone()));
                    }
                }

                let fresh = self.acquire(rule, referrer).await?;
                let token = fresh.token.clone();
                *cached = Some(fresh);
                Ok(Some(token))
            }
        }
    }

    /// Drop the cached token so the next caller acquires a fresh one.
    pub async fn invalidate(&self, rule_index: usize) {
        let slot = { self.slots.lock().await.get(&rule_index).cloned() };
        if let Some(slot) = slot {
            *slot.lock().await = None;
        }
    }

    async fn slot(&self, rule_index: usize) -> Slot {
        self.slots
            .lock()
            .await
            .entry(rule_index)
            .or_default()
            .clone()
    }

    async fn acquire(
        &self,
        rule: &ServiceRule,
        referrer: &str,
    ) -> Result<CachedToken, CredentialError> {
        match &rule.credentials {
            Credentials::UserLogin {
                username,
                password,
                token_service_url,
            } => {
                self.acquire_user_login(rule, referrer, username, password, token_service_url)
                    .await
            }
            Credentials::AppLogin {
                client_id,
                client_secret,
                oauth2_endpoint,
            } => {
                self.acquire_app_login(rule, client_id, client_secret, oauth2_endpoint)
                    .await
            }
            // Static tokens and credential-less rules never reach acquisition.
            Credentials::StaticToken { access_token } => Ok(CachedToken {
                token: access_token.clone(),
                expires_at: Instant::now() + DEFAULT_TOKEN_LIFETIME,
            }),
            Credentials::None => Err(CredentialError::NoTokenService(rule.url.clone())),
        }
    }

    async fn acquire_user_login(
        &self,
        rule: &ServiceRule,
        referrer: &str,
        username: &str,
        password: &str,
        token_service_url: &Option<String>,
    ) -> Result<CachedToken, CredentialError> {
        let service_url = match token_service_url {
            Some(url) => url.clone(),
            None => self.discover_token_service(&rule.url).await?,
        };

        // Token services bind the issued token to a referer.
        let referer = if referrer == ANY {
            rule.url.as_str()
        } else {
            referrer
        };

        let body: Value = self
            .client
            .post(&service_url)
            .form(&[
                ("request", "getToken"),
                ("username", username),
                ("password", password),
                ("referer", referer),
                ("expiration", "60"),
                ("f", "json"),
            ])
            .send()
            .await?
            .json()
            .await?;

        token_from_json(&body, &service_url)
    }

    /// Probe `<base>/rest/info` for the authoritative token service, where
    /// `<base>` is the rule URL up to the first `/rest/` or `/sharing/`.
    async fn discover_token_service(&self, rule_url: &str) -> Result<String, CredentialError> {
        let base = ["/rest/", "/sharing/"]
            .iter()
            .filter_map(|marker| rule_url.find(marker))
            .min()
            .map(|idx| &rule_url[..idx])
            .unwrap_or_else(|| rule_url.trim_end_matches('/'));

        let info_url = format!("{base}/rest/info?f=json");
        let info: Value = self.client.get(&info_url).send().await?.json().await?;

        if let Some(url) = info
            .pointer("/authInfo/tokenServicesUrl")
            .and_then(Value::as_str)
        {
            return Ok(url.to_string());
        }

        if let Some(owning) = info.get("owningSystemUrl").and_then(Value::as_str) {
            return Ok(format!(
                "{}/sharing/generateToken",
                owning.trim_end_matches('/')
            ));
        }

        Err(CredentialError::NoTokenService(rule_url.to_string()))
    }

    async fn acquire_app_login(
        &self,
        rule: &ServiceRule,
        client_id: &str,
        client_secret: &str,
        oauth2_endpoint: &str,
    ) -> Result<CachedToken, CredentialError> {
        let endpoint = oauth2_endpoint.trim_end_matches('/');

        let token_url = format!("{endpoint}/token");
        let body: Value = self
            .client
            .post(&token_url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("grant_type", "client_credentials"),
                ("f", "json"),
            ])
            .send()
            .await?
            .json()
            .await?;

        let issued = token_from_json(&body, &token_url)?;

        // A rule served by a portal rather than the OAuth issuer needs its
        // token exchanged for a server token.
        if !same_host(&rule.url, oauth2_endpoint) {
            let exchange_url = format!("{endpoint}/generateToken");
            let body: Value = self
                .client
                .post(&exchange_url)
                .form(&[
                    ("token", issued.token.as_str()),
                    ("serverUrl", rule.url.as_str()),
                    ("f", "json"),
                ])
                .send()
                .await?
                .json()
                .await?;
            return token_from_json(&body, &exchange_url);
        }

        Ok(issued)
    }
}

fn same_host(a: &str, b: &str) -> bool {
    UrlParts::parse(a)
        .hostname
        .eq_ignore_ascii_case(&UrlParts::parse(b).hostname)
}

fn token_from_json(body: &Value, source: &str) -> Result<CachedToken, CredentialError> {
    let token = body
        .get("token")
        .or_else(|| body.get("access_token"))
        .and_then(Value::as_str)
        .ok_or_else(|| CredentialError::MissingToken(source.to_string()))?;

    let expires_at = if let Some(seconds) = body.get("expires_in").and_then(Value::as_u64) {
        Instant::now() + Duration::from_secs(seconds)
    } else if let Some(epoch_ms) = body.get("expires").and_then(Value::as_u64) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Instant::now() + Duration::from_millis(epoch_ms.saturating_sub(now_ms))
    } else {
        Instant::now() + DEFAULT_TOKEN_LIFETIME
    };

    Ok(CachedToken {
        token: token.to_string(),
        expires_at,
    })
}
