use std::path::{Path, PathBuf};

use reqwest::ClientBuilder;
use thiserror::Error;
use tracing::debug;

/// Failures raised while preparing the TLS configuration of a client.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to read root certificates from {path}: {source}")]
    ReadRoots {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no usable certificate found in {0}")]
    EmptyRoots(PathBuf),
    #[error("invalid root certificate bundle: {0}")]
    InvalidRoots(String),
    #[error("FIPS configuration error: {0}")]
    Fips(String),
}

/// Creates a reqwest client builder with TLS configuration.
///
/// `extra_roots` points at a PEM bundle that is trusted in addition to the
/// default roots (the management API may sit behind a private CA).
#[cfg(not(feature = "fips"))]
pub fn create_reqwest_client_builder(
    extra_roots: Option<&Path>,
) -> Result<ClientBuilder, TlsSetupError> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();
    if let Some(path) = extra_roots {
        let pem = read_bundle(path)?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem)
            .map_err(|err| TlsSetupError::InvalidRoots(err.to_string()))?;
        if certs.is_empty() {
            return Err(TlsSetupError::EmptyRoots(path.to_path_buf()));
        }
        debug!(count = certs.len(), path = %path.display(), "trusting extra root certificates");
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }
    Ok(builder)
}

/// Creates a reqwest client builder with FIPS-compliant TLS configuration.
///
/// Native roots are loaded first; `extra_roots` is appended to the same store.
#[cfg(feature = "fips")]
pub fn create_reqwest_client_builder(
    extra_roots: Option<&Path>,
) -> Result<ClientBuilder, TlsSetupError> {
    // The provider must have been installed at process start, e.g. with
    // rustls::crypto::default_fips_provider().install_default().
    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or_else(|| TlsSetupError::Fips("no crypto provider configured".into()))?;

    if !provider.fips() {
        return Err(TlsSetupError::Fips(
            "crypto provider is not FIPS-compliant".into(),
        ));
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    let mut valid_count = 0;
    for cert in native_certs.certs {
        match root_cert_store.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => {
                debug!("Failed to parse certificate: {:?}", err);
            }
        }
    }
    if let Some(path) = extra_roots {
        let pem = read_bundle(path)?;
        let mut reader = std::io::BufReader::new(pem.as_slice());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|err| TlsSetupError::InvalidRoots(err.to_string()))?;
            root_cert_store
                .add(cert)
                .map_err(|err| TlsSetupError::InvalidRoots(err.to_string()))?;
            valid_count += 1;
        }
    }
    if valid_count == 0 {
        return Err(TlsSetupError::Fips(
            "no valid certificates found in root store".into(),
        ));
    }

    let versions = rustls::ALL_VERSIONS.to_vec();
    let config_builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&versions)
        .map_err(|_| TlsSetupError::Fips("failed to set protocol versions".into()))?;

    let config = config_builder
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();

    if !config.fips() {
        return Err(TlsSetupError::Fips(
            "the final TLS configuration is not FIPS-compliant".into(),
        ));
    }
    debug!("Client builder is configured with FIPS.");

    Ok(reqwest::Client::builder().use_preconfigured_tls(config))
}

fn read_bundle(path: &Path) -> Result<Vec<u8>, TlsSetupError> {
    std::fs::read(path).map_err(|source| TlsSetupError::ReadRoots {
        path: path.to_path_buf(),
        source,
    })
}
