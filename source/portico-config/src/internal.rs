//! This is the *actual* internal configuration structure.
//!
//! It is ONLY used for the internal configuration, and should not ever be
//! exposed as the public API for CLI, env vars, or via serde.
//!
//! This is the buffer between the external stable surface (the JSON file,
//! with all its tolerated shapes) and internal impl details which may change
//! at any time.

use std::path::PathBuf;
use std::time::Duration;

use miette::{miette, Result};
use pingora::server::configuration::{Opt as PingoraOpt, ServerConf as PingoraServerConf};

use crate::rules::{ReferrerPolicy, RuleTable};

/// Portico's internal configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub validate_configs: bool,
    pub threads_per_service: usize,
    /// `host:port` the listener binds to.
    pub listen_addr: String,
    pub use_https: bool,
    pub tls: Option<TlsMaterial>,
    /// Reject requests that match no rule (404) instead of passing them
    /// through.
    pub must_match: bool,
    pub listen_uris: Vec<String>,
    pub ping_path: String,
    pub status_path: String,
    /// Applied to token acquisition and to the upstream transfer.
    pub upstream_timeout: Duration,
    pub log: LogSettings,
    pub referrers: ReferrerPolicy,
    pub rules: RuleTable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMaterial {
    CertKey {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
    /// A PKCS#12 blob, unpacked to PEM at startup.
    Pfx { pfx_path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LogLevel,
    pub to_console: bool,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    All,
    Info,
    Warn,
    Error,
    None,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Result<LogLevel> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(LogLevel::All),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "NONE" => Ok(LogLevel::None),
            other => Err(miette!(
                "unknown logLevel '{other}' (expected ALL, INFO, WARN, ERROR or NONE)"
            )),
        }
    }
}

impl Config {
    /// Get the [`Opt`][PingoraOpt] field for Pingora
    pub fn pingora_opt(&self) -> PingoraOpt {
        PingoraOpt {
            upgrade: false,
            daemon: false,
            nocapture: false,
            test: false,
            conf: None,
        }
    }

    /// Get the [`ServerConf`][PingoraServerConf] field for Pingora
    pub fn pingora_server_conf(&self) -> PingoraServerConf {
        PingoraServerConf {
            daemon: false,
            error_log: None,
            threads: self.threads_per_service,
            work_stealing: true,
            ca_file: None,
            ..PingoraServerConf::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.use_https && self.tls.is_none() {
            return Err(miette!(
                "useHTTPS is set but neither httpsPfxFile nor httpsKeyFile/httpsCertificateFile are configured"
            ));
        }
        if self.listen_uris.iter().any(|uri| !uri.starts_with('/')) {
            return Err(miette!("every listenURI must start with '/'"));
        }
        if self.must_match && self.rules.is_empty() {
            tracing::warn!("mustMatch is set but serverUrls is empty; every request will be rejected");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            validate_configs: false,
            threads_per_service: 8,
            listen_addr: "0.0.0.0:8080".to_string(),
            use_https: false,
            tls: None,
            must_match: true,
            listen_uris: vec!["/proxy".to_string()],
            ping_path: "/ping".to_string(),
            status_path: "/status".to_string(),
            upstream_timeout: Duration::from_secs(30),
            log: LogSettings {
                level: LogLevel::Info,
                to_console: true,
                file: None,
            },
            referrers: ReferrerPolicy::default(),
            rules: RuleTable::default(),
        }
    }
}
