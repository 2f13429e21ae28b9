//! TLS termination material.
//!
//! Listeners with a cert/key pair terminate TLS via rustls. ALPN offers h2
//! only when `enable_http2` is set; otherwise the listener negotiates
//! HTTP/1.1 exclusively.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::errors::ProxyError;

/// Build a TLS acceptor from PEM files.
pub fn acceptor(
    cert_file: &str,
    key_file: &str,
    enable_http2: bool,
) -> Result<TlsAcceptor, ProxyError> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls {
            reason: format!("invalid certificate/key pair: {e}"),
        })?;

    config.alpn_protocols = if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path).map_err(|e| ProxyError::Tls {
        reason: format!("cannot open certificate {path}: {e}"),
    })?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| ProxyError::Tls {
        reason: format!("cannot parse certificate {path}: {e}"),
    })?;
    if certs.is_empty() {
        return Err(ProxyError::Tls {
            reason: format!("no certificates found in {path}"),
        });
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path).map_err(|e| ProxyError::Tls {
        reason: format!("cannot open private key {path}: {e}"),
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Tls {
            reason: format!("cannot parse private key {path}: {e}"),
        })?
        .ok_or_else(|| ProxyError::Tls {
            reason: format!("no private key found in {path}"),
        })
}
