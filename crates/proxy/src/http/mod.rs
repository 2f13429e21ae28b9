//! The HTTP(S) proxy engine: per-listener accept loops, TLS termination,
//! and connection dispatch into the request handler.
//!
//! One [`HttpListener`] exists per bound address of an HTTP rule. Its
//! bindings (rule, limits, compression, limiter) sit behind a single
//! swappable `Arc` so reconfiguration of an unchanged listener is one
//! pointer store; every request captures the bindings once at its start and
//! keeps that view for its whole life.

pub mod handler;
pub mod static_files;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use portico_config::{Compression, HttpRule, Limits, ListenAddr, TlsConfig};

use crate::context::EngineCtx;
use crate::drain::DrainTracker;
use crate::errors::ProxyError;
use crate::limit::RateLimiter;
use crate::observe::epoch_now;
use crate::sink::RequestRecord;
use crate::tls;

/// The hot-swappable per-listener view of the config snapshot.
pub struct Bindings {
    pub rule: Arc<HttpRule>,
    pub limits: Arc<Limits>,
    pub compression: Arc<Compression>,
    pub limiter: Option<Arc<RateLimiter>>,
}

impl Bindings {
    pub fn new(rule: &HttpRule, limits: &Limits, compression: &Compression) -> Arc<Self> {
        Arc::new(Self {
            rule: Arc::new(rule.clone()),
            limits: Arc::new(limits.clone()),
            compression: Arc::new(compression.clone()),
            limiter: rule.rate_limit.as_ref().map(|rl| Arc::new(RateLimiter::new(rl))),
        })
    }
}

/// One bound address of an HTTP rule.
pub struct HttpListener {
    /// The configured address string; used as the node key in logs,
    /// metrics, and status reports.
    pub listen_addr: String,
    pub bind: ListenAddr,
    /// TLS material captured at listener start. Changing it restarts the
    /// listener (the supervisor treats it as a bind-parameter change).
    pub tls: Option<TlsConfig>,
    bindings: RwLock<Arc<Bindings>>,
    pub ctx: Arc<EngineCtx>,
    pub drain: DrainTracker,
}

impl HttpListener {
    pub fn new(
        listen_addr: String,
        bind: ListenAddr,
        rule: &HttpRule,
        limits: &Limits,
        compression: &Compression,
        ctx: Arc<EngineCtx>,
    ) -> Arc<Self> {
        Arc::new(Self {
            listen_addr,
            bind,
            tls: rule.tls.clone(),
            bindings: RwLock::new(Bindings::new(rule, limits, compression)),
            ctx,
            drain: DrainTracker::new(),
        })
    }

    /// Snapshot the current bindings; each request calls this once.
    pub fn bindings(&self) -> Arc<Bindings> {
        self.bindings.read().clone()
    }

    /// Swap in new bindings; in-flight requests keep their captured view.
    pub fn swap_bindings(&self, bindings: Arc<Bindings>) {
        *self.bindings.write() = bindings;
    }

    /// Whether this listener terminates TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn port(&self) -> u16 {
        self.bind.addr.port()
    }

    /// Accept connections until the surrounding task is cancelled. Returns
    /// only on bind loss; transient accept errors are logged and retried.
    pub async fn serve(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.bind.addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        let acceptor = match &self.tls {
            Some(paths) => {
                let enable_http2 = self.bindings().limits.enable_http2;
                Some(tls::acceptor(&paths.cert_file, &paths.key_file, enable_http2)?)
            }
            None => None,
        };

        info!(
            listen_addr = %self.listen_addr,
            bound = %self.bind.addr,
            tls = acceptor.is_some(),
            "http listener accepting"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let listener = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        listener.handle_connection(acceptor, stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!(listen_addr = %self.listen_addr, error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        acceptor: Option<TlsAcceptor>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) {
        let _guard = self.drain.enter();
        let tls_on = acceptor.is_some();

        match acceptor {
            Some(acceptor) => {
                let handshake_timeout =
                    Duration::from_millis(self.bindings().limits.connect_timeout_ms.max(1));
                let tls_stream = match tokio::time::timeout(
                    handshake_timeout,
                    acceptor.accept(stream),
                )
                .await
                {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        self.observe_tls_failure(peer, &e.to_string());
                        return;
                    }
                    Err(_) => {
                        self.observe_tls_failure(peer, "handshake timeout");
                        return;
                    }
                };
                self.serve_http(tls_stream, peer, tls_on).await;
            }
            None => {
                self.serve_http(stream, peer, tls_on).await;
            }
        }
    }

    async fn serve_http<S>(self: Arc<Self>, io: S, peer: SocketAddr, tls_on: bool)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let listener = self.clone();
        let service = service_fn(move |req| {
            let listener = listener.clone();
            async move { handler::handle(listener, peer, tls_on, req).await }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        if let Err(e) = builder
            .serve_connection_with_upgrades(TokioIo::new(io), service)
            .await
        {
            debug!(peer = %peer, error = %e, "connection ended with error");
        }
    }

    /// A handshake that never produced a request still emits exactly one
    /// observation, with status 0.
    fn observe_tls_failure(&self, peer: SocketAddr, reason: &str) {
        warn!(listen_addr = %self.listen_addr, peer = %peer, reason, "TLS handshake failed");
        self.ctx.observer.push_log(format!(
            "[NODE {}] TLS handshake failed from {}: {}",
            self.listen_addr, peer, reason
        ));
        self.ctx.observer.observe(RequestRecord {
            timestamp: epoch_now(),
            listen_addr: self.listen_addr.clone(),
            client_ip: peer.ip().to_string(),
            peer_ip: peer.ip().to_string(),
            method: String::new(),
            host: String::new(),
            path: String::new(),
            status: 0,
            upstream: String::new(),
            route_id: String::new(),
            latency_ms: 0.0,
            bytes_in: 0,
            bytes_out: 0,
            user_agent: String::new(),
            referer: String::new(),
        });
    }
}
