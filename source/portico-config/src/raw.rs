//! The serde model of the JSON configuration file.
//!
//! This is the *external* shape only. Deployed configuration files are
//! sloppy: booleans arrive as strings, list fields as scalars, referrer lists
//! as comma-joined strings, and very old files wrap the rule list in
//! `{"serverUrls":{"serverUrl":…}}`. Every one of those tolerances lives in
//! this module; the rest of the system only ever sees the strict records in
//! [`crate::internal`] and [`crate::rules`].

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawFile {
    pub proxy_config: RawProxySettings,
    pub server_urls: RawServerUrls,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawProxySettings {
    #[serde(rename = "useHTTPS")]
    pub use_https: Option<Flag>,
    pub port: Option<u16>,
    pub must_match: Option<Flag>,
    pub match_all_referrer: Option<Flag>,
    pub log_file_name: Option<String>,
    pub log_file_path: Option<String>,
    pub log_level: Option<String>,
    pub log_to_console: Option<Flag>,
    pub allowed_referrers: Option<StringList>,
    #[serde(rename = "listenURI")]
    pub listen_uri: Option<StringList>,
    pub ping_path: Option<String>,
    pub status_path: Option<String>,
    pub upstream_timeout: Option<u64>,
    pub https_key_file: Option<String>,
    pub https_certificate_file: Option<String>,
    pub https_pfx_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawServerUrl {
    pub url: String,
    #[serde(default)]
    pub match_all: Option<Flag>,
    #[serde(default)]
    pub host_redirect: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<i64>,
    #[serde(default)]
    pub rate_limit_period: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub oauth2_endpoint: Option<String>,
    #[serde(default)]
    pub token_service_url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_param_name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// A boolean that may arrive as a JSON bool or as a string. The string form
/// is truthy only for lowercase-trimmed `"true"` or `"1"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    pub fn as_bool(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"),
        }
    }
}

pub fn flag(value: &Option<Flag>, default: bool) -> bool {
    value.as_ref().map(Flag::as_bool).unwrap_or(default)
}

/// A field that may be a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    /// Scalar-or-list, entries trimmed.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringList::One(s) => vec![s.trim().to_string()],
            StringList::Many(v) => v.into_iter().map(|s| s.trim().to_string()).collect(),
        }
    }

    /// Like [`Self::into_vec`], but the scalar form additionally splits on
    /// commas (`"a,b,c"`).
    pub fn into_split_vec(self) -> Vec<String> {
        match self {
            StringList::One(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            StringList::Many(v) => v.into_iter().map(|s| s.trim().to_string()).collect(),
        }
    }
}

/// The rule list in any of its historical shapes: a list, a single rule, or
/// the legacy `{"serverUrl": …}` wrapper holding either.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawServerUrls {
    List(Vec<RawServerUrl>),
    One(Box<RawServerUrl>),
    Legacy {
        #[serde(rename = "serverUrl")]
        server_url: OneOrMany,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(Box<RawServerUrl>),
    Many(Vec<RawServerUrl>),
}

impl Default for RawServerUrls {
    fn default() -> Self {
        RawServerUrls::List(vec![])
    }
}

impl RawServerUrls {
    pub fn into_rules(self) -> Vec<RawServerUrl> {
        match self {
            RawServerUrls::List(rules) => rules,
            RawServerUrls::One(rule) => vec![*rule],
            RawServerUrls::Legacy { server_url } => match server_url {
                OneOrMany::One(rule) => vec![*rule],
                OneOrMany::Many(rules) => rules,
            },
        }
    }
}
