//! The WebSocket proxy engine.
//!
//! A WS listener accepts HTTP upgrade requests, runs access control,
//! matches a route by longest path prefix, dials the route's upstream
//! (`ws://` or `wss://`), and relays frames in both directions. The relay
//! pings the client on a configurable interval and closes cleanly when no
//! pong arrives within the timeout; close codes are forwarded, and relay
//! errors close the client with 1011.

use futures_util::{SinkExt, StreamExt};
use http::{header, HeaderMap, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use portico_config::{ListenAddr, TlsConfig, WsRoute, WsRule};

use crate::access::{client_ip_from_headers, AccessProtocol};
use crate::body::{self, ProxyBody};
use crate::context::EngineCtx;
use crate::drain::DrainTracker;
use crate::errors::ProxyError;
use crate::observe::epoch_now;
use crate::sink::RequestRecord;
use crate::tls;

/// One bound address of a WS rule.
pub struct WsListener {
    pub listen_addr: String,
    pub bind: ListenAddr,
    pub tls: Option<TlsConfig>,
    rule: RwLock<Arc<WsRule>>,
    pub ctx: Arc<EngineCtx>,
    pub drain: DrainTracker,
}

impl WsListener {
    pub fn new(
        listen_addr: String,
        bind: ListenAddr,
        rule: &WsRule,
        ctx: Arc<EngineCtx>,
    ) -> Arc<Self> {
        Arc::new(Self {
            listen_addr,
            bind,
            tls: rule.tls.clone(),
            rule: RwLock::new(Arc::new(rule.clone())),
            ctx,
            drain: DrainTracker::new(),
        })
    }

    pub fn rule(&self) -> Arc<WsRule> {
        self.rule.read().clone()
    }

    /// Swap the rule on reconfiguration; established relays keep running
    /// with the routes they were opened under.
    pub fn swap_rule(&self, rule: Arc<WsRule>) {
        *self.rule.write() = rule;
    }

    /// Accept upgrade requests until the surrounding task is cancelled.
    pub async fn serve(self: Arc<Self>) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.bind.addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        let acceptor = match &self.tls {
            Some(paths) => Some(tls::acceptor(&paths.cert_file, &paths.key_file, false)?),
            None => None,
        };

        info!(
            listen_addr = %self.listen_addr,
            bound = %self.bind.addr,
            tls = acceptor.is_some(),
            "ws listener accepting"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let listener = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let _guard = listener.drain.enter();
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => listener.serve_conn(tls_stream, peer).await,
                                Err(e) => {
                                    warn!(peer = %peer, error = %e, "ws TLS handshake failed");
                                }
                            },
                            None => listener.serve_conn(stream, peer).await,
                        }
                    });
                }
                Err(e) => {
                    warn!(listen_addr = %self.listen_addr, error = %e, "ws accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn serve_conn<S>(self: Arc<Self>, io: S, peer: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let listener = self.clone();
        let service = service_fn(move |req| {
            let listener = listener.clone();
            async move { Ok::<_, Infallible>(listener.handle_upgrade(peer, req)) }
        });

        let conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        if let Err(e) = conn.await {
            debug!(peer = %peer, error = %e, "ws connection ended with error");
        }
    }

    /// Validate and answer the upgrade, spawning the relay on success.
    fn handle_upgrade(
        self: Arc<Self>,
        peer: SocketAddr,
        mut req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let rule = self.rule();

        let client_ip = client_ip_from_headers(&peer, req.headers());
        if !self
            .ctx
            .access
            .allows(AccessProtocol::Ws, &client_ip, &client_ip.to_string())
        {
            self.observe_upgrade(peer, req.uri().path(), StatusCode::FORBIDDEN.as_u16(), "", "");
            return simple(StatusCode::FORBIDDEN, "Forbidden");
        }

        let Some(key) = websocket_key(req.headers()) else {
            return simple(StatusCode::BAD_REQUEST, "Expected WebSocket upgrade");
        };

        let path = req.uri().path().to_string();
        let Some(route) = match_ws_route(&rule.routes, &path) else {
            self.observe_upgrade(peer, &path, StatusCode::NOT_FOUND.as_u16(), "", "");
            return simple(StatusCode::NOT_FOUND, "No WS route");
        };

        let upstream_url = route.upstream_url.clone();
        let route_path = route.path.clone();
        let ping_interval = Duration::from_secs(rule.ping_interval_sec.max(1));
        let pong_timeout = Duration::from_secs(rule.pong_timeout_sec.max(1));

        self.observe_upgrade(
            peer,
            &path,
            StatusCode::SWITCHING_PROTOCOLS.as_u16(),
            &upstream_url,
            &route_path,
        );

        let accept = derive_accept_key(key.as_bytes());
        let listener = self.clone();
        let upgrade = hyper::upgrade::on(&mut req);

        tokio::spawn(async move {
            let _guard = listener.drain.enter();
            match upgrade.await {
                Ok(upgraded) => {
                    let client = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    if let Err(e) = relay(client, &upstream_url, ping_interval, pong_timeout).await
                    {
                        listener.ctx.observer.push_log(format!(
                            "[NODE {}] ws relay error ({peer} -> {upstream_url}): {e}",
                            listener.listen_addr
                        ));
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "ws upgrade never completed");
                }
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_ACCEPT, accept)
            .body(body::empty())
            .unwrap_or_else(|_| simple(StatusCode::INTERNAL_SERVER_ERROR, ""))
    }

    fn observe_upgrade(&self, peer: SocketAddr, path: &str, status: u16, upstream: &str, route: &str) {
        self.ctx.observer.observe(RequestRecord {
            timestamp: epoch_now(),
            listen_addr: self.listen_addr.clone(),
            client_ip: peer.ip().to_string(),
            peer_ip: peer.ip().to_string(),
            method: "GET".into(),
            host: String::new(),
            path: path.to_string(),
            status,
            upstream: upstream.to_string(),
            route_id: route.to_string(),
            latency_ms: 0.0,
            bytes_in: 0,
            bytes_out: 0,
            user_agent: String::new(),
            referer: String::new(),
        });
        self.ctx.observer.push_log(format!(
            "[NODE {}] ws upgrade {} from {} -> {}",
            self.listen_addr, status, peer, upstream
        ));
    }
}

fn simple(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body::full(message))
        .expect("static response builds")
}

/// RFC 6455 upgrade validation: right headers plus a Sec-WebSocket-Key.
fn websocket_key(headers: &HeaderMap) -> Option<String> {
    let is_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_upgrade || !is_websocket {
        return None;
    }

    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Longest path prefix wins.
fn match_ws_route<'a>(routes: &'a [WsRoute], path: &str) -> Option<&'a WsRoute> {
    routes
        .iter()
        .filter(|r| path.starts_with(r.path.as_str()))
        .max_by_key(|r| r.path.len())
}

/// Bidirectional frame relay with heartbeat.
async fn relay<S>(
    client: WebSocketStream<S>,
    upstream_url: &str,
    ping_interval: Duration,
    pong_timeout: Duration,
) -> Result<(), ProxyError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (upstream, _) = tokio_tungstenite::connect_async(upstream_url)
        .await
        .map_err(|e| ProxyError::UpstreamProtocol(format!("ws dial {upstream_url}: {e}")))?;

    let (mut c_tx, mut c_rx) = client.split();
    let (mut u_tx, mut u_rx) = upstream.split();

    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick is immediate
    let mut last_pong = Instant::now();

    let result: Result<(), ProxyError> = loop {
        tokio::select! {
            from_client = c_rx.next() => match from_client {
                Some(Ok(Message::Pong(payload))) => {
                    last_pong = Instant::now();
                    let _ = u_tx.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("client closed, forwarding close frame");
                    let _ = u_tx.send(Message::Close(frame)).await;
                    break Ok(());
                }
                Some(Ok(msg)) => {
                    if let Err(e) = u_tx.send(msg).await {
                        break Err(ProxyError::UpstreamProtocol(e.to_string()));
                    }
                }
                Some(Err(e)) => break Err(ProxyError::UpstreamProtocol(e.to_string())),
                None => {
                    let _ = u_tx.send(Message::Close(None)).await;
                    break Ok(());
                }
            },
            from_upstream = u_rx.next() => match from_upstream {
                Some(Ok(Message::Close(frame))) => {
                    let _ = c_tx.send(Message::Close(frame)).await;
                    break Ok(());
                }
                Some(Ok(msg)) => {
                    if let Err(e) = c_tx.send(msg).await {
                        break Err(ProxyError::UpstreamProtocol(e.to_string()));
                    }
                }
                Some(Err(e)) => break Err(ProxyError::UpstreamProtocol(e.to_string())),
                None => {
                    let _ = c_tx.send(Message::Close(None)).await;
                    break Ok(());
                }
            },
            _ = ping.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    debug!("pong timeout, closing relay");
                    let frame = CloseFrame {
                        code: CloseCode::Away,
                        reason: "heartbeat timeout".into(),
                    };
                    let _ = c_tx.send(Message::Close(Some(frame.clone()))).await;
                    let _ = u_tx.send(Message::Close(Some(frame))).await;
                    break Ok(());
                }
                if let Err(e) = c_tx.send(Message::Ping(Vec::new())).await {
                    break Err(ProxyError::UpstreamProtocol(e.to_string()));
                }
            }
        }
    };

    if result.is_err() {
        // Relay failure surfaces to the client as an abnormal close.
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: "relay error".into(),
        };
        let _ = c_tx.send(Message::Close(Some(frame))).await;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, upstream: &str) -> WsRoute {
        WsRoute {
            path: path.to_string(),
            upstream_url: upstream.to_string(),
        }
    }

    #[test]
    fn longest_prefix_route_wins() {
        let routes = vec![
            route("/", "ws://a:1"),
            route("/chat", "ws://b:2"),
            route("/chat/admin", "ws://c:3"),
        ];

        assert_eq!(
            match_ws_route(&routes, "/chat/admin/console").unwrap().upstream_url,
            "ws://c:3"
        );
        assert_eq!(match_ws_route(&routes, "/chat/x").unwrap().upstream_url, "ws://b:2");
        assert_eq!(match_ws_route(&routes, "/other").unwrap().upstream_url, "ws://a:1");
        assert!(match_ws_route(&[], "/x").is_none());
    }

    #[test]
    fn upgrade_validation_requires_all_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap(),
        );
        assert_eq!(
            websocket_key(&headers).as_deref(),
            Some("dGhlIHNhbXBsZSBub25jZQ==")
        );

        let mut missing_key = headers.clone();
        missing_key.remove(header::SEC_WEBSOCKET_KEY);
        assert!(websocket_key(&missing_key).is_none());

        let mut not_upgrade = headers.clone();
        not_upgrade.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        assert!(websocket_key(&not_upgrade).is_none());
    }

    #[test]
    fn accept_key_is_rfc_sample() {
        // The RFC 6455 §1.3 worked example.
        assert_eq!(
            derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
