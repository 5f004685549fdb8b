//! Reads the JSON configuration file and compiles it into the internal form.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::{Context, IntoDiagnostic, Result};

use crate::internal::{Config, LogLevel, LogSettings, TlsMaterial};
use crate::raw::{flag, RawFile, RawProxySettings};
use crate::rules::{ReferrerPolicy, RuleTable};

#[derive(Debug, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load_file(&self, path: &Path) -> Result<Config> {
        tracing::info!("Loading config from: {}", path.display());
        let text = std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to read configuration file {}", path.display()))?;
        self.load_str(&text)
    }

    pub fn load_str(&self, text: &str) -> Result<Config> {
        let raw: RawFile = serde_json::from_str(text)
            .into_diagnostic()
            .wrap_err("configuration file is not valid JSON")?;
        compile(raw)
    }
}

fn compile(raw: RawFile) -> Result<Config> {
    let defaults = Config::default();
    let settings = raw.proxy_config;

    let rules = RuleTable::compile(raw.server_urls.into_rules())?;

    let referrers = ReferrerPolicy::compile(
        settings
            .allowed_referrers
            .clone()
            .map(|l| l.into_split_vec())
            .unwrap_or_default(),
        flag(&settings.match_all_referrer, false),
    );

    let port = settings.port.unwrap_or(8080);

    Ok(Config {
        validate_configs: false,
        threads_per_service: defaults.threads_per_service,
        listen_addr: format!("0.0.0.0:{port}"),
        use_https: flag(&settings.use_https, false),
        tls: tls_material(&settings),
        must_match: flag(&settings.must_match, true),
        listen_uris: settings
            .listen_uri
            .clone()
            .map(|l| l.into_vec())
            .unwrap_or_else(|| defaults.listen_uris.clone()),
        ping_path: settings
            .ping_path
            .clone()
            .unwrap_or_else(|| defaults.ping_path.clone()),
        status_path: settings
            .status_path
            .clone()
            .unwrap_or_else(|| defaults.status_path.clone()),
        upstream_timeout: settings
            .upstream_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.upstream_timeout),
        log: log_settings(&settings)?,
        referrers,
        rules,
    })
}

fn tls_material(settings: &RawProxySettings) -> Option<TlsMaterial> {
    if let Some(pfx) = settings.https_pfx_file.as_deref().map(str::trim) {
        if !pfx.is_empty() {
            return Some(TlsMaterial::Pfx {
                pfx_path: PathBuf::from(pfx),
            });
        }
    }
    match (
        settings.https_certificate_file.as_deref(),
        settings.https_key_file.as_deref(),
    ) {
        (Some(cert), Some(key)) if !cert.trim().is_empty() && !key.trim().is_empty() => {
            Some(TlsMaterial::CertKey {
                cert_path: PathBuf::from(cert.trim()),
                key_path: PathBuf::from(key.trim()),
            })
        }
        _ => None,
    }
}

fn log_settings(settings: &RawProxySettings) -> Result<LogSettings> {
    let level = match settings.log_level.as_deref() {
        Some(raw) => LogLevel::parse(raw)?,
        None => LogLevel::Info,
    };

    // logFileName may come with a separate logFilePath directory.
    let file = settings
        .log_file_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| match settings.log_file_path.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Path::new(dir).join(name),
            _ => PathBuf::from(name),
        });

    Ok(LogSettings {
        level,
        to_console: flag(&settings.log_to_console, true),
        file,
    })
}
