//! Upstream connection pooling.
//!
//! Pools are keyed by `(scheme, authority, alpn)`. HTTP/1.1 connections are
//! exclusively owned while in use and parked in a per-origin idle queue on
//! clean completion; HTTP/2 origins share one multiplexed sender. Idle
//! connections are evicted LRU within each origin, capped by
//! `pool_max_idle`, and swept once they sit idle past
//! `pool_idle_timeout_sec`. Dialing honors `connect_timeout_ms`.

use bytes::Bytes;
use http::uri::Authority;
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::ServerName;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use portico_config::Limits;

use crate::body::ProxyBody;
use crate::errors::{ProxyError, TimeoutPhase};

// ============================================================================
// Origin keys
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OriginScheme {
    Http,
    Https,
}

/// Whether the pool may negotiate a multiplexed connection for the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alpn {
    H1,
    H2,
}

/// Pool key: one entry per `(scheme, authority, alpn)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub scheme: OriginScheme,
    pub authority: String,
    pub alpn: Alpn,
    host: String,
    port: u16,
}

impl OriginKey {
    /// Derive the key for a target URI. h2 is only attempted on TLS origins
    /// and only when `enable_http2` is set; plaintext origins always speak
    /// HTTP/1.1.
    pub fn for_target(uri: &Uri, enable_http2: bool) -> Result<Self, ProxyError> {
        let scheme = match uri.scheme_str() {
            Some("http") => OriginScheme::Http,
            Some("https") => OriginScheme::Https,
            other => {
                return Err(ProxyError::UpstreamProtocol(format!(
                    "unsupported upstream scheme {other:?}"
                )))
            }
        };

        let authority = uri
            .authority()
            .ok_or_else(|| ProxyError::UpstreamProtocol("upstream URL has no host".into()))?;

        let host = authority.host().trim_matches(|c| c == '[' || c == ']').to_string();
        let port = authority.port_u16().unwrap_or(match scheme {
            OriginScheme::Http => 80,
            OriginScheme::Https => 443,
        });

        let alpn = match (scheme, enable_http2) {
            (OriginScheme::Https, true) => Alpn::H2,
            _ => Alpn::H1,
        };

        Ok(Self {
            scheme,
            authority: authority.as_str().to_string(),
            alpn,
            host,
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

// ============================================================================
// Pooled connections
// ============================================================================

enum Transport {
    H1(http1::SendRequest<ProxyBody>),
    H2(http2::SendRequest<ProxyBody>),
}

/// A connection checked out of the pool. Exclusively owned until released.
pub struct PooledConn {
    origin: OriginKey,
    transport: Transport,
    /// True when this came from the idle queue rather than a fresh dial; a
    /// send failure on a reused connection earns one transparent retry.
    pub reused: bool,
}

impl PooledConn {
    pub fn is_http2(&self) -> bool {
        matches!(self.transport, Transport::H2(_))
    }

    /// Send a request over this connection. The request URI must be in
    /// origin form (`/path?query`); the pool rewrites it for h2, which
    /// carries scheme and authority in pseudo-headers.
    pub async fn send(
        &mut self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        match &mut self.transport {
            Transport::H1(sender) => {
                sender.ready().await?;
                sender.send_request(req).await
            }
            Transport::H2(sender) => {
                let authority = req
                    .headers()
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<Authority>().ok())
                    .unwrap_or_else(|| {
                        self.origin
                            .authority
                            .parse()
                            .expect("origin authority parses")
                    });
                req.headers_mut().remove(http::header::HOST);

                let mut parts = req.uri().clone().into_parts();
                parts.scheme = Some(match self.origin.scheme {
                    OriginScheme::Http => http::uri::Scheme::HTTP,
                    OriginScheme::Https => http::uri::Scheme::HTTPS,
                });
                parts.authority = Some(authority);
                if parts.path_and_query.is_none() {
                    parts.path_and_query = Some("/".parse().expect("static path parses"));
                }
                *req.uri_mut() = Uri::from_parts(parts).expect("rebuilt uri is valid");

                sender.ready().await?;
                sender.send_request(req).await
            }
        }
    }

    fn is_closed(&self) -> bool {
        match &self.transport {
            Transport::H1(sender) => sender.is_closed(),
            Transport::H2(sender) => sender.is_closed(),
        }
    }
}

// ============================================================================
// The pool
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct PoolLimits {
    max_idle: usize,
    idle_timeout: Duration,
    connect_timeout: Duration,
}

impl From<&Limits> for PoolLimits {
    fn from(limits: &Limits) -> Self {
        Self {
            max_idle: limits.pool_max_idle,
            idle_timeout: Duration::from_secs(limits.pool_idle_timeout_sec),
            connect_timeout: Duration::from_millis(limits.connect_timeout_ms.max(1)),
        }
    }
}

struct IdleConn {
    sender: http1::SendRequest<ProxyBody>,
    idle_since: Instant,
}

/// Shared upstream connection pool.
pub struct UpstreamPool {
    limits: RwLock<PoolLimits>,
    h1_idle: Mutex<HashMap<OriginKey, VecDeque<IdleConn>>>,
    h2_shared: Mutex<HashMap<OriginKey, http2::SendRequest<ProxyBody>>>,
    tls_h1: TlsConnector,
    tls_h2: TlsConnector,
}

impl UpstreamPool {
    pub fn new(limits: &Limits) -> Self {
        // Backends behind this proxy routinely run self-signed certs; the
        // upstream leg skips verification, as the desktop tool always has.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let base = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
            .with_no_client_auth();

        let mut h1 = base.clone();
        h1.alpn_protocols = vec![b"http/1.1".to_vec()];

        let mut h2 = base;
        h2.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Self {
            limits: RwLock::new(PoolLimits::from(limits)),
            h1_idle: Mutex::new(HashMap::new()),
            h2_shared: Mutex::new(HashMap::new()),
            tls_h1: TlsConnector::from(Arc::new(h1)),
            tls_h2: TlsConnector::from(Arc::new(h2)),
        }
    }

    /// Adopt limits from a new config snapshot.
    pub fn apply_limits(&self, limits: &Limits) {
        *self.limits.write() = PoolLimits::from(limits);
    }

    /// Check a connection out of the pool, dialing when nothing reusable is
    /// parked. `fresh` skips reuse entirely (the broken-reuse retry path).
    pub async fn acquire(&self, origin: &OriginKey, fresh: bool) -> Result<PooledConn, ProxyError> {
        let limits = *self.limits.read();

        if !fresh {
            if origin.alpn == Alpn::H2 {
                let shared = self.h2_shared.lock().get(origin).cloned();
                if let Some(sender) = shared {
                    if !sender.is_closed() {
                        trace!(origin = %origin.authority, "reusing multiplexed connection");
                        return Ok(PooledConn {
                            origin: origin.clone(),
                            transport: Transport::H2(sender),
                            reused: true,
                        });
                    }
                    self.h2_shared.lock().remove(origin);
                }
            }

            while let Some(idle) = self.pop_idle(origin) {
                if idle.sender.is_closed() {
                    continue;
                }
                trace!(origin = %origin.authority, "reusing idle connection");
                return Ok(PooledConn {
                    origin: origin.clone(),
                    transport: Transport::H1(idle.sender),
                    reused: true,
                });
            }
        }

        let transport = tokio::time::timeout(limits.connect_timeout, self.connect(origin))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(TimeoutPhase::Connect, limits.connect_timeout))??;

        Ok(PooledConn {
            origin: origin.clone(),
            transport,
            reused: false,
        })
    }

    /// Return a connection. `reusable` is false when the response indicated
    /// the connection cannot be trusted again (protocol error, truncation).
    pub fn release(&self, conn: PooledConn, reusable: bool) {
        match conn.transport {
            Transport::H2(_) => {
                // Multiplexed senders live in the shared map; nothing to do.
            }
            Transport::H1(sender) => {
                if !reusable || sender.is_closed() {
                    return;
                }
                let limits = *self.limits.read();
                if limits.max_idle == 0 {
                    return;
                }

                let mut pools = self.h1_idle.lock();
                let queue = pools.entry(conn.origin).or_default();
                queue.push_back(IdleConn {
                    sender,
                    idle_since: Instant::now(),
                });
                // LRU within the origin: the front is the oldest.
                while queue.len() > limits.max_idle {
                    queue.pop_front();
                }
            }
        }
    }

    /// Evict idle connections past the idle timeout and closed senders.
    /// Driven by the runtime's maintenance tick.
    pub fn sweep(&self) {
        let limits = *self.limits.read();

        {
            let mut pools = self.h1_idle.lock();
            for queue in pools.values_mut() {
                queue.retain(|idle| {
                    !idle.sender.is_closed() && idle.idle_since.elapsed() < limits.idle_timeout
                });
            }
            pools.retain(|_, queue| !queue.is_empty());
        }

        self.h2_shared.lock().retain(|_, sender| !sender.is_closed());
    }

    /// Number of idle connections parked for `origin`.
    pub fn idle_count(&self, origin: &OriginKey) -> usize {
        self.h1_idle
            .lock()
            .get(origin)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn pop_idle(&self, origin: &OriginKey) -> Option<IdleConn> {
        let mut pools = self.h1_idle.lock();
        let queue = pools.get_mut(origin)?;
        // Most recently parked first; it is the most likely to still be open.
        let conn = queue.pop_back();
        if queue.is_empty() {
            pools.remove(origin);
        }
        conn
    }

    async fn connect(&self, origin: &OriginKey) -> Result<Transport, ProxyError> {
        let stream = TcpStream::connect((origin.host(), origin.port())).await?;
        let _ = stream.set_nodelay(true);

        match origin.scheme {
            OriginScheme::Http => self.handshake_h1(origin, stream).await,
            OriginScheme::Https => {
                let connector = match origin.alpn {
                    Alpn::H1 => &self.tls_h1,
                    Alpn::H2 => &self.tls_h2,
                };
                let server_name = ServerName::try_from(origin.host().to_string())
                    .map_err(|e| ProxyError::Tls {
                        reason: format!("invalid upstream server name: {e}"),
                    })?;
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ProxyError::Tls {
                        reason: format!("upstream handshake failed: {e}"),
                    })?;

                let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
                if negotiated_h2 {
                    self.handshake_h2(origin, tls).await
                } else {
                    self.handshake_h1(origin, tls).await
                }
            }
        }
    }

    async fn handshake_h1<S>(&self, origin: &OriginKey, io: S) -> Result<Transport, ProxyError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;

        let authority = origin.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(origin = %authority, error = %e, "upstream connection ended");
            }
        });

        debug!(origin = %origin.authority, "dialed upstream (http/1.1)");
        Ok(Transport::H1(sender))
    }

    async fn handshake_h2<S>(&self, origin: &OriginKey, io: S) -> Result<Transport, ProxyError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io))
            .await
            .map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;

        let authority = origin.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!(origin = %authority, error = %e, "multiplexed upstream connection ended");
            }
        });

        self.h2_shared
            .lock()
            .insert(origin.clone(), sender.clone());

        debug!(origin = %origin.authority, "dialed upstream (h2)");
        Ok(Transport::H2(sender))
    }
}

// ============================================================================
// Upstream TLS verifier
// ============================================================================

/// Accepts any upstream certificate. The inbound leg terminates real TLS;
/// the outbound leg talks to backends the operator configured explicitly.
#[derive(Debug)]
struct NoVerify {
    schemes: Vec<rustls::SignatureScheme>,
}

impl NoVerify {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}
