//! Listener setup: plain TCP, or TLS from a key+cert pair or a PKCS#12 blob.

use std::path::{Path, PathBuf};

use miette::{miette, Context, IntoDiagnostic, Result};
use openssl::pkcs12::Pkcs12;
use pingora::listeners::tls::TlsSettings;

use portico_config::internal::{Config, TlsMaterial};

pub fn populate_listeners<T>(
    config: &Config,
    service: &mut pingora::services::listening::Service<T>,
) -> Result<()> {
    if !config.use_https {
        service.add_tcp(&config.listen_addr);
        return Ok(());
    }

    let material = config
        .tls
        .as_ref()
        .ok_or_else(|| miette!("useHTTPS is set but no certificate material is configured"))?;

    let (cert_path, key_path) = match material {
        TlsMaterial::CertKey {
            cert_path,
            key_path,
        } => (cert_path.clone(), key_path.clone()),
        TlsMaterial::Pfx { pfx_path } => unpack_pfx(pfx_path)?,
    };

    let cert = cert_path
        .to_str()
        .ok_or_else(|| miette!("certificate path is not valid UTF-8"))?;
    let key = key_path
        .to_str()
        .ok_or_else(|| miette!("key path is not valid UTF-8"))?;

    let settings = TlsSettings::intermediate(cert, key)
        .map_err(|err| miette!("failed to load TLS material ({cert}, {key}): {err}"))?;

    service.add_tls_with_settings(&config.listen_addr, None, settings);
    Ok(())
}

/// The TLS stack wants PEM files on disk, so a configured PFX bundle is
/// unpacked once at startup. The configuration format carries no passphrase
/// field; blobs are expected to be unprotected.
fn unpack_pfx(pfx_path: &Path) -> Result<(PathBuf, PathBuf)> {
    let der = std::fs::read(pfx_path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read PFX file {}", pfx_path.display()))?;

    let parsed = Pkcs12::from_der(&der)
        .and_then(|pfx| pfx.parse2(""))
        .map_err(|err| miette!("failed to parse PFX file {}: {err}", pfx_path.display()))?;

    let cert = parsed
        .cert
        .ok_or_else(|| miette!("PFX file {} holds no certificate", pfx_path.display()))?;
    let key = parsed
        .pkey
        .ok_or_else(|| miette!("PFX file {} holds no private key", pfx_path.display()))?;

    let mut cert_pem = cert
        .to_pem()
        .map_err(|err| miette!("failed to encode certificate: {err}"))?;
    if let Some(chain) = parsed.ca {
        for extra in chain {
            let pem = extra
                .to_pem()
                .map_err(|err| miette!("failed to encode chain certificate: {err}"))?;
            cert_pem.extend_from_slice(&pem);
        }
    }

    let key_pem = key
        .private_key_to_pem_pkcs8()
        .map_err(|err| miette!("failed to encode private key: {err}"))?;

    let dir = std::env::temp_dir();
    let pid = std::process::id();
    let cert_path = dir.join(format!("portico-{pid}.crt.pem"));
    let key_path = dir.join(format!("portico-{pid}.key.pem"));

    std::fs::write(&cert_path, &cert_pem)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", cert_path.display()))?;
    std::fs::write(&key_path, &key_pem)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", key_path.display()))?;

    tracing::info!(
        "unpacked {} into {} and {}",
        pfx_path.display(),
        cert_path.display(),
        key_path.display()
    );

    Ok((cert_path, key_path))
}
