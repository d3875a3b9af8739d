//! TLS configuration and certificate loading.

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;

/// ALPN protocol every TLS listener offers unless configured otherwise.
pub const DEFAULT_ALPN: &[u8] = b"http/1.1";

/// Load a rustls server configuration from PEM certificate chain and key files.
///
/// The result advertises at least "http/1.1" over ALPN.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> io::Result<Arc<rustls::ServerConfig>> {
    for (what, path) in [("certificate", cert_path), ("private key", key_path)] {
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{what} file not found: {}", path.display()),
            ));
        }
    }

    let config = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    tracing::debug!(cert = %cert_path.display(), "TLS configuration loaded");
    Ok(with_default_alpn(config.get_inner()))
}

/// Make sure `http/1.1` is among the advertised ALPN protocols.
pub fn with_default_alpn(config: Arc<rustls::ServerConfig>) -> Arc<rustls::ServerConfig> {
    if config.alpn_protocols.iter().any(|p| p.as_slice() == DEFAULT_ALPN) {
        return config;
    }
    let mut config = Arc::unwrap_or_clone(config);
    config.alpn_protocols.push(DEFAULT_ALPN.to_vec());
    Arc::new(config)
}
