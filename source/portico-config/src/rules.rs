//! Compiled upstream rules and the referrer allow-list.
//!
//! Raw configuration records come in from [`crate::raw`]; what comes out here
//! is frozen for the lifetime of the process. Every derived field (parsed URL
//! parts, refill rate, whether the meter applies at all) is computed exactly
//! once during compilation.

use miette::{miette, Result};

use crate::raw::{flag, RawServerUrl};
use crate::url_parts::{UrlParts, ANY};

/// How an upstream rule authenticates, if at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    /// Username/password against the service's token endpoint.
    UserLogin {
        username: String,
        password: String,
        token_service_url: Option<String>,
    },
    /// OAuth2 client-credentials against the service's OAuth endpoint.
    AppLogin {
        client_id: String,
        client_secret: String,
        oauth2_endpoint: String,
    },
    /// A long-lived token pasted straight into the configuration.
    StaticToken { access_token: String },
}

impl Credentials {
    pub fn is_configured(&self) -> bool {
        !matches!(self, Credentials::None)
    }
}

/// One row of the upstream ruleset, fully compiled.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRule {
    /// The source glob as written in the configuration.
    pub url: String,
    pub parts: UrlParts,
    /// `true`: the request path must equal the rule path. `false`: prefix
    /// match.
    pub match_all: bool,
    pub credentials: Credentials,
    /// When set, outbound requests keep the incoming path and query but go to
    /// this host (and its protocol/port where more specific).
    pub host_redirect: Option<UrlParts>,
    /// Requests per `rate_limit_period` minutes. Non-positive disables the
    /// meter.
    pub rate_limit: i64,
    pub rate_limit_period: i64,
    /// Refill rate in tokens per second; zero when the meter is off.
    pub rate: f64,
    pub use_rate_meter: bool,
    /// Query parameter name used when injecting an acquired token.
    pub token_param: String,
    /// Carried for configuration compatibility; Windows-domain logins are not
    /// performed.
    pub domain: Option<String>,
}

impl ServiceRule {
    fn compile(raw: RawServerUrl) -> Result<ServiceRule> {
        let url = raw.url.trim().to_string();
        if url.is_empty() {
            return Err(miette!("serverUrls entry without a url"));
        }

        let credentials = compile_credentials(&raw)
            .map_err(|reason| miette!("serverUrls entry '{url}': {reason}"))?;

        if raw.domain.is_some() {
            tracing::warn!(
                url = %url,
                "'domain' is accepted for compatibility but domain logins are not performed"
            );
        }

        let rate_limit = raw.rate_limit.unwrap_or(0);
        let rate_limit_period = raw.rate_limit_period.unwrap_or(60);
        let use_rate_meter = rate_limit > 0 && rate_limit_period > 0;
        let rate = if use_rate_meter {
            rate_limit as f64 / (rate_limit_period as f64 * 60.0)
        } else {
            0.0
        };

        Ok(ServiceRule {
            parts: UrlParts::parse(&url),
            match_all: flag(&raw.match_all, false),
            credentials,
            host_redirect: raw
                .host_redirect
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(UrlParts::parse),
            rate_limit,
            rate_limit_period,
            rate,
            use_rate_meter,
            token_param: raw
                .token_param_name
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| "token".to_string()),
            domain: raw.domain,
            url,
        })
    }
}

fn compile_credentials(raw: &RawServerUrl) -> std::result::Result<Credentials, String> {
    let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());

    if present(&raw.username) || present(&raw.password) {
        if !(present(&raw.username) && present(&raw.password)) {
            return Err("username and password must be configured together".to_string());
        }
        return Ok(Credentials::UserLogin {
            username: raw.username.clone().unwrap_or_default(),
            password: raw.password.clone().unwrap_or_default(),
            token_service_url: raw.token_service_url.clone(),
        });
    }

    if present(&raw.client_id) || present(&raw.client_secret) {
        if !(present(&raw.client_id) && present(&raw.client_secret) && present(&raw.oauth2_endpoint))
        {
            return Err(
                "clientId, clientSecret and oauth2Endpoint must be configured together".to_string(),
            );
        }
        return Ok(Credentials::AppLogin {
            client_id: raw.client_id.clone().unwrap_or_default(),
            client_secret: raw.client_secret.clone().unwrap_or_default(),
            oauth2_endpoint: raw.oauth2_endpoint.clone().unwrap_or_default(),
        });
    }

    if present(&raw.access_token) {
        return Ok(Credentials::StaticToken {
            access_token: raw.access_token.clone().unwrap_or_default(),
        });
    }

    Ok(Credentials::None)
}

/// The frozen, ordered rule list. Lookup is a first-match scan: earlier rules
/// win, the configuration order is authoritative.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleTable {
    rules: Vec<ServiceRule>,
}

impl RuleTable {
    pub fn compile(raw: Vec<RawServerUrl>) -> Result<RuleTable> {
        let rules = raw
            .into_iter()
            .map(ServiceRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(RuleTable { rules })
    }

    pub fn find_match(&self, request: &UrlParts) -> Option<(usize, &ServiceRule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.parts.matches(request, rule.match_all))
    }

    pub fn get(&self, index: usize) -> Option<&ServiceRule> {
        self.rules.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// One compiled allow-list entry. `canonical_key` is the serialized form used
/// to index the rate meter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedReferrer {
    pub protocol: String,
    pub hostname: String,
    pub path: String,
    pub canonical_key: String,
}

/// The compiled referrer allow-list. A bare `*` entry (or the
/// `matchAllReferrer` switch) flips `accept_any` instead of adding an entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferrerPolicy {
    pub accept_any: bool,
    pub entries: Vec<AllowedReferrer>,
}

impl ReferrerPolicy {
    pub fn compile(raw_entries: Vec<String>, match_all_referrer: bool) -> ReferrerPolicy {
        let mut policy = ReferrerPolicy {
            accept_any: match_all_referrer,
            entries: vec![],
        };

        for entry in raw_entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry == ANY {
                policy.accept_any = true;
                continue;
            }
            let parts = UrlParts::parse(entry);
            let canonical_key = canonical_referrer_key(&parts);
            policy.entries.push(AllowedReferrer {
                protocol: parts.protocol,
                hostname: parts.hostname,
                path: parts.path,
                canonical_key,
            });
        }

        policy
    }
}

fn canonical_referrer_key(parts: &UrlParts) -> String {
    let path = if parts.path == ANY { "" } else { parts.path.as_str() };
    format!("{}://{}{}", parts.protocol, parts.hostname, path)
}
