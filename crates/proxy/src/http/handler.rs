//! The per-request HTTP pipeline.
//!
//! parse → access control → rate limit → match → authenticate → transform
//! request → static files → select upstream → pooled forward (with retries
//! and optional internal redirect following) → transform response → stream
//! to client → observe.
//!
//! Failure at any stage is terminal for that request only: it maps to the
//! contract's status code, and exactly one observation is emitted on every
//! terminal path (success, failure, or mid-body disconnect) via a
//! completion hook riding on the response body.

use base64::Engine as _;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use portico_config::HttpRoute;

use crate::access::{client_ip_from_headers, AccessProtocol};
use crate::body::{self, CountingBody, IdleTimeoutBody, ProxyBody};
use crate::errors::{DenyReason, ProxyError, TimeoutPhase};
use crate::limit::RateDecision;
use crate::observe::{access_log_line, epoch_now};
use crate::routing::{match_route, normalize_host, RouteMatch};
use crate::sink::RequestRecord;
use crate::transform::{
    self, build_target_url, build_upstream_headers, compression, rewrite_uri, ExpandCtx,
};
use crate::upstream::pool::{OriginKey, PooledConn, UpstreamPool};

use super::{Bindings, HttpListener};

/// Maximum internal redirect hops when `follow_redirects` is on.
const MAX_REDIRECT_HOPS: usize = 5;

// ============================================================================
// Request metadata
// ============================================================================

struct RequestMeta {
    listen_addr: String,
    started: Instant,
    peer: SocketAddr,
    client_ip: IpAddr,
    method: Method,
    uri: Uri,
    path: String,
    host: String,
    referer: String,
    user_agent: String,
    tls: bool,
}

impl RequestMeta {
    fn new(
        listener: &HttpListener,
        peer: SocketAddr,
        tls: bool,
        parts: &http::request::Parts,
    ) -> Self {
        let header_str = |name: header::HeaderName| {
            parts
                .headers
                .get(&name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };

        // h2 carries the authority in the URI; h1 in the Host header.
        let host = parts
            .uri
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Self {
            listen_addr: listener.listen_addr.clone(),
            started: Instant::now(),
            peer,
            client_ip: client_ip_from_headers(&peer, &parts.headers),
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            path: parts.uri.path().to_string(),
            host,
            referer: header_str(header::REFERER),
            user_agent: header_str(header::USER_AGENT),
            tls,
        }
    }

    fn record(&self, status: u16, upstream: &str, route_id: &str) -> RequestRecord {
        RequestRecord {
            timestamp: epoch_now(),
            listen_addr: self.listen_addr.clone(),
            client_ip: self.client_ip.to_string(),
            peer_ip: self.peer.ip().to_string(),
            method: self.method.to_string(),
            host: normalize_host(&self.host).to_string(),
            path: self.path.clone(),
            status,
            upstream: upstream.to_string(),
            route_id: route_id.to_string(),
            latency_ms: 0.0,
            bytes_in: 0,
            bytes_out: 0,
            user_agent: self.user_agent.clone(),
            referer: self.referer.clone(),
        }
    }
}

// ============================================================================
// Replayable request body
// ============================================================================

/// The client body, tracked for replayability across retries and redirect
/// hops. A buffered body can be resent any number of times; a stream can be
/// consumed exactly once.
enum ReqBody {
    Buffered(Bytes),
    Stream(Option<ProxyBody>),
}

impl ReqBody {
    /// Produce a body for one send attempt, or `None` when a stream was
    /// already consumed.
    fn take(&mut self) -> Option<ProxyBody> {
        match self {
            ReqBody::Buffered(bytes) => Some(body::full(bytes.clone())),
            ReqBody::Stream(inner) => inner.take(),
        }
    }

    /// Whether another attempt can still carry the payload.
    fn replayable(&self) -> bool {
        match self {
            ReqBody::Buffered(_) => true,
            ReqBody::Stream(inner) => inner.is_some(),
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

fn method_carries_body(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

// ============================================================================
// Entry point
// ============================================================================

pub async fn handle(
    listener: Arc<HttpListener>,
    peer: SocketAddr,
    tls_on: bool,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    let bindings = listener.bindings();
    let (parts, incoming) = req.into_parts();
    let meta = RequestMeta::new(&listener, peer, tls_on, &parts);

    // Count every byte actually read off the client body, however far the
    // pipeline gets.
    let (counted, bytes_in) = CountingBody::new(body::boxed(incoming));
    let client_body = body::boxed(counted);

    let outcome = run_pipeline(&listener, &bindings, &meta, &parts.headers, client_body).await;

    Ok(match outcome {
        Ok((resp, route_id, upstream)) => {
            finish(&listener, &meta, resp, &route_id, &upstream, bytes_in)
        }
        Err((err, route_id, upstream)) => {
            listener.ctx.observer.push_log(format!(
                "[NODE {}] request failed at {}: {} {} -> {}",
                meta.listen_addr,
                err.stage().as_str(),
                meta.method,
                meta.uri,
                err
            ));
            let resp = error_response(&err);
            finish(&listener, &meta, resp, &route_id, &upstream, bytes_in)
        }
    })
}

type PipelineOk = (Response<ProxyBody>, String, String);
type PipelineErr = (ProxyError, String, String);

async fn run_pipeline(
    listener: &Arc<HttpListener>,
    bindings: &Arc<Bindings>,
    meta: &RequestMeta,
    headers: &HeaderMap,
    client_body: ProxyBody,
) -> Result<PipelineOk, PipelineErr> {
    let ctx = &listener.ctx;
    let rule = &bindings.rule;

    // 1. Access control.
    let ip_str = meta.client_ip.to_string();
    if !ctx.access.allows(AccessProtocol::Http, &meta.client_ip, &ip_str) {
        return Err((
            ProxyError::Denied(DenyReason::Access),
            String::new(),
            String::new(),
        ));
    }

    // 2. Rate limiting. Bans live in the limiter's own ban map and reject
    // with 429 without spending tokens.
    if let Some(limiter) = &bindings.limiter {
        match limiter.check(meta.client_ip) {
            RateDecision::Allowed => {}
            RateDecision::Banned => {
                return Err((
                    ProxyError::Denied(DenyReason::RateLimited),
                    String::new(),
                    String::new(),
                ));
            }
            RateDecision::Limited { newly_banned } => {
                if newly_banned {
                    if let Some(window) = limiter.ban_window() {
                        ctx.observer.push_log(format!(
                            "[NODE {}] rate limit exceeded, client {} banned for {}s",
                            meta.listen_addr,
                            meta.client_ip,
                            window.as_secs()
                        ));
                    }
                }
                return Err((
                    ProxyError::Denied(DenyReason::RateLimited),
                    String::new(),
                    String::new(),
                ));
            }
        }
    }

    // 3. Route matching.
    let Some(matched) = match_route(&rule.routes, &meta.host, &meta.method, headers, &meta.path)
    else {
        return Err((ProxyError::RouteMiss, String::new(), String::new()));
    };
    let route = matched.route;
    let route_id = route.id.as_str().to_string();

    // 4. Basic auth (unless the route opted out).
    if let Some(auth) = &rule.basic_auth {
        if !route.exclude_basic_auth && !basic_auth_ok(headers, &auth.username, &auth.password) {
            return Err((
                ProxyError::Denied(DenyReason::Auth),
                route_id,
                String::new(),
            ));
        }
    }

    // 5. Request URL transformation.
    let effective_uri = rewrite_uri(&meta.uri, &route.url_rewrites);

    // 6. Static files first; a miss falls through to upstreams.
    if let Some(dir) = &route.static_dir {
        if let Some(resp) =
            super::static_files::serve_static(dir, effective_uri.path(), &meta.method).await
        {
            let resp = finalize_response(bindings, route, meta, headers, resp)
                .await
                .map_err(|e| (e, route_id.clone(), String::new()))?;
            return Ok((resp, route_id, String::new()));
        }
        if route.upstreams.is_empty() {
            return Err((ProxyError::RouteMiss, route_id, String::new()));
        }
    }

    // 7. Request body: buffer only when substitution rules need it.
    let request_ct = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut req_body =
        if transform::has_active_body_rules(&route.request_body_replace, request_ct.as_deref()) {
            let bytes = body::collect_capped(client_body, bindings.limits.max_request_body)
                .await
                .map_err(|e| (e, route_id.clone(), String::new()))?;
            let bytes = transform::apply_body_rules(
                bytes,
                &route.request_body_replace,
                request_ct.as_deref(),
            );
            ReqBody::Buffered(bytes)
        } else {
            ReqBody::Stream(Some(client_body))
        };

    // 8. Forward, retrying across members on locally-generated failures.
    forward(
        listener,
        bindings,
        meta,
        headers,
        route,
        &matched,
        effective_uri,
        &mut req_body,
    )
    .await
    .map(|(resp, upstream)| (resp, route_id.clone(), upstream))
    .map_err(|(e, upstream)| (e, route_id, upstream))
}

// ============================================================================
// Forwarding
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn forward(
    listener: &Arc<HttpListener>,
    bindings: &Arc<Bindings>,
    meta: &RequestMeta,
    inbound_headers: &HeaderMap,
    route: &HttpRoute,
    matched: &RouteMatch<'_>,
    effective_uri: Uri,
    req_body: &mut ReqBody,
) -> Result<(Response<ProxyBody>, String), (ProxyError, String)> {
    let ctx = &listener.ctx;
    let read_timeout = Duration::from_millis(bindings.limits.read_timeout_ms.max(1));
    let route_key = route.id.as_str();

    let retries_allowed = route.upstreams.len().saturating_sub(1);
    let mut tried: Vec<String> = Vec::new();
    let mut last_err: Option<ProxyError> = None;

    while let Some(upstream_url) = ctx.selector.pick(route_key, &route.upstreams, &tried) {
        tried.push(upstream_url.clone());

        let target = match build_target_url(
            &upstream_url,
            matched.matched_prefix,
            route.proxy_pass_path.as_deref(),
            &effective_uri,
            listener.port(),
        ) {
            Ok(t) => t,
            Err(e) => return Err((e, upstream_url)),
        };

        match send_with_redirects(
            listener,
            bindings,
            meta,
            inbound_headers,
            route,
            target,
            req_body,
            read_timeout,
        )
        .await
        {
            Ok(resp) => {
                ctx.selector.record_success(&upstream_url);
                let resp = finalize_response(bindings, route, meta, inbound_headers, resp)
                    .await
                    .map_err(|e| (e, upstream_url.clone()))?;
                return Ok((resp, upstream_url));
            }
            Err(e) => {
                ctx.selector.record_failure(&upstream_url);
                debug!(
                    upstream = %upstream_url,
                    error = %e,
                    attempt = tried.len(),
                    "upstream attempt failed"
                );

                let more_members = tried.len() <= retries_allowed;
                let can_retry =
                    more_members && (is_idempotent(&meta.method) || req_body.replayable());
                if !can_retry || !req_body.replayable() {
                    return Err((terminal_error(e, tried.len()), upstream_url));
                }
                last_err = Some(e);
            }
        }
    }

    let last_upstream = tried.last().cloned().unwrap_or_default();
    match last_err {
        Some(e) => Err((terminal_error(e, tried.len()), last_upstream)),
        None => Err((
            ProxyError::UpstreamUnavailable {
                after_retries: tried.len().saturating_sub(1),
            },
            last_upstream,
        )),
    }
}

/// Collapse transport-level failures into the contract's 502; timeouts and
/// size-cap errors keep their own status.
fn terminal_error(err: ProxyError, attempts: usize) -> ProxyError {
    match err {
        ProxyError::UpstreamTimeout(..) | ProxyError::PayloadTooLarge => err,
        _ => ProxyError::UpstreamUnavailable {
            after_retries: attempts.saturating_sub(1),
        },
    }
}

/// One upstream exchange, following redirects internally when configured.
#[allow(clippy::too_many_arguments)]
async fn send_with_redirects(
    listener: &Arc<HttpListener>,
    bindings: &Arc<Bindings>,
    meta: &RequestMeta,
    inbound_headers: &HeaderMap,
    route: &HttpRoute,
    mut target: Uri,
    req_body: &mut ReqBody,
    read_timeout: Duration,
) -> Result<Response<Incoming>, ProxyError> {
    let ctx = &listener.ctx;
    let mut method = meta.method.clone();
    let mut hops = 0usize;

    loop {
        let origin = OriginKey::for_target(&target, bindings.limits.enable_http2)?;
        let authority = target
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let expand = ExpandCtx {
            peer: meta.peer,
            inbound_headers,
            tls: meta.tls,
        };
        let force_identity = !route.response_body_replace.is_empty();
        let mut upstream_headers = build_upstream_headers(
            route,
            bindings.rule.basic_auth.as_ref(),
            &expand,
            &authority,
            force_identity,
        );
        if method != meta.method {
            // Redirect hop demoted to GET: no body, no body headers.
            upstream_headers.remove(header::CONTENT_LENGTH);
            upstream_headers.remove(header::CONTENT_TYPE);
        }

        let carries_body = method_carries_body(&method);
        let response = send_once(
            &ctx.pool,
            &origin,
            &method,
            &target,
            upstream_headers,
            req_body,
            carries_body,
            read_timeout,
        )
        .await?;

        if !route.follow_redirects || hops >= MAX_REDIRECT_HOPS {
            return Ok(response);
        }
        let Some(next) = redirect_target(&response, &target) else {
            return Ok(response);
        };

        match response.status() {
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => {
                // The method survives; follow only if the payload can be
                // replayed, otherwise relay the redirect to the client.
                if carries_body && !req_body.replayable() {
                    return Ok(response);
                }
            }
            _ => {
                // 301/302/303 continue as a bodiless GET.
                method = Method::GET;
            }
        }

        hops += 1;
        ctx.observer.push_log(format!(
            "[NODE {}] following redirect {} -> {}",
            meta.listen_addr,
            response.status(),
            next
        ));
        target = next;
    }
}

fn redirect_target(response: &Response<Incoming>, current: &Uri) -> Option<Uri> {
    if !response.status().is_redirection() {
        return None;
    }
    let location = response.headers().get(header::LOCATION)?.to_str().ok()?;

    let parsed: Uri = location.parse().ok()?;
    if parsed.scheme().is_some() {
        // Absolute targets must stay within the http(s) family.
        return match parsed.scheme_str() {
            Some("http") | Some("https") => Some(parsed),
            _ => None,
        };
    }

    // Relative: resolve against the current target's origin.
    let mut parts = current.clone().into_parts();
    parts.path_and_query = location.parse().ok();
    Uri::from_parts(parts).ok()
}

/// Send one request over a pooled connection. A send failure on a reused
/// connection earns exactly one transparent retry over a fresh dial,
/// provided the payload can be replayed.
#[allow(clippy::too_many_arguments)]
async fn send_once(
    pool: &Arc<UpstreamPool>,
    origin: &OriginKey,
    method: &Method,
    target: &Uri,
    headers: HeaderMap,
    req_body: &mut ReqBody,
    carries_body: bool,
    read_timeout: Duration,
) -> Result<Response<Incoming>, ProxyError> {
    let mut conn = pool.acquire(origin, false).await?;
    let reused = conn.reused;

    let first_body = if carries_body {
        req_body.take().unwrap_or_else(body::empty)
    } else {
        body::empty()
    };

    match send_on_conn(&mut conn, method, target, &headers, first_body, read_timeout).await {
        Ok(resp) => {
            pool.release(conn, true);
            Ok(resp)
        }
        Err(e) => {
            pool.release(conn, false);

            let can_replay = !carries_body || req_body.replayable();
            if reused && can_replay && !matches!(e, ProxyError::UpstreamTimeout(..)) {
                debug!(origin = %origin.authority, "retrying broken reused connection");
                let mut fresh = pool.acquire(origin, true).await?;
                let second_body = if carries_body {
                    req_body.take().unwrap_or_else(body::empty)
                } else {
                    body::empty()
                };
                let resp =
                    send_on_conn(&mut fresh, method, target, &headers, second_body, read_timeout)
                        .await?;
                pool.release(fresh, true);
                Ok(resp)
            } else {
                Err(e)
            }
        }
    }
}

async fn send_on_conn(
    conn: &mut PooledConn,
    method: &Method,
    target: &Uri,
    headers: &HeaderMap,
    send_body: ProxyBody,
    read_timeout: Duration,
) -> Result<Response<Incoming>, ProxyError> {
    let path_and_query = target
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder().method(method.clone()).uri(path_and_query);
    if let Some(h) = builder.headers_mut() {
        *h = headers.clone();
    }
    let request = builder
        .body(send_body)
        .map_err(|e| ProxyError::UpstreamProtocol(e.to_string()))?;

    match tokio::time::timeout(read_timeout, conn.send(request)).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => Err(ProxyError::UpstreamProtocol(e.to_string())),
        Err(_) => Err(ProxyError::UpstreamTimeout(TimeoutPhase::Read, read_timeout)),
    }
}

// ============================================================================
// Response finalization
// ============================================================================

/// Response-direction transformation: header hygiene, body substitution,
/// compression, and framing preservation. Streams untouched bodies; buffers
/// (capped) only when a rule or compression needs the whole payload.
async fn finalize_response<B>(
    bindings: &Arc<Bindings>,
    route: &HttpRoute,
    meta: &RequestMeta,
    inbound_headers: &HeaderMap,
    response: Response<B>,
) -> Result<Response<ProxyBody>, ProxyError>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<crate::body::BoxError>,
{
    let (mut parts, upstream_body) = response.into_parts();
    transform::filter_response_headers(&mut parts.headers, route);

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let has_rules =
        transform::has_active_body_rules(&route.response_body_replace, content_type.as_deref());

    let accept_encoding = inbound_headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let encoding = compression::negotiate(accept_encoding, &bindings.compression);
    // The body length is unknown until buffered; probe every other gate
    // (enabled, already-encoded, compressible content type) first.
    let may_compress = encoding != compression::ContentEncoding::Identity
        && compression::should_compress(&bindings.compression, &parts.headers, usize::MAX);

    let read_timeout = Duration::from_millis(bindings.limits.read_timeout_ms.max(1));
    let timed = IdleTimeoutBody::new(body::boxed(upstream_body), read_timeout);

    // HEAD responses carry no body to transform; rewriting their headers
    // would misreport the corresponding GET.
    if (!has_rules && !may_compress) || meta.method == Method::HEAD {
        // Framing preserved: stream straight through without buffering.
        return Ok(Response::from_parts(parts, body::boxed(timed)));
    }

    let bytes = body::collect_capped(timed, bindings.limits.max_response_body).await?;
    let bytes = transform::apply_body_rules(bytes, &route.response_body_replace, content_type.as_deref());

    let final_bytes = if may_compress
        && compression::should_compress(&bindings.compression, &parts.headers, bytes.len())
    {
        let compressed = compression::compress(&bytes, encoding, &bindings.compression)?;
        compression::mark_compressed(&mut parts.headers, encoding, compressed.len());
        compressed
    } else {
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        bytes
    };

    let final_body = if meta.method == Method::HEAD {
        body::empty()
    } else {
        body::full(final_bytes)
    };
    Ok(Response::from_parts(parts, final_body))
}

// ============================================================================
// Completion
// ============================================================================

/// Attach the observation hook and access log to the outgoing response.
fn finish(
    listener: &Arc<HttpListener>,
    meta: &RequestMeta,
    response: Response<ProxyBody>,
    route_id: &str,
    upstream: &str,
    bytes_in: Arc<AtomicU64>,
) -> Response<ProxyBody> {
    let status = response.status();

    listener.ctx.observer.push_log(access_log_line(
        &meta.listen_addr,
        &meta.client_ip.to_string(),
        meta.method.as_str(),
        &meta.uri.to_string(),
        status.as_u16(),
        &meta.referer,
        &meta.user_agent,
        meta.started.elapsed(),
    ));

    let mut record = meta.record(status.as_u16(), upstream, route_id);
    let started = meta.started;
    let observer = listener.ctx.observer.clone();

    let (parts, inner) = response.into_parts();
    let hooked = CountingBody::with_hook(inner, move |bytes_out| {
        record.bytes_in = bytes_in.load(Ordering::Relaxed);
        record.bytes_out = bytes_out;
        record.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        observer.observe(record);
    });

    Response::from_parts(parts, body::boxed(hooked))
}

/// Map a pipeline error to its client-visible response.
fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let status = err.status();
    let message = match err {
        ProxyError::Denied(DenyReason::Access) => "Forbidden",
        ProxyError::Denied(DenyReason::RateLimited) => "Rate limit exceeded",
        ProxyError::Denied(DenyReason::Auth) => "Unauthorized",
        ProxyError::RouteMiss => "No route",
        ProxyError::UpstreamUnavailable { .. } => "Bad gateway",
        ProxyError::UpstreamTimeout(..) => "Gateway timeout",
        ProxyError::PayloadTooLarge => "Payload too large",
        _ => "Internal error",
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");

    if status == StatusCode::UNAUTHORIZED {
        builder = builder.header(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"portico\""),
        );
    }

    builder
        .body(body::full(Bytes::from_static(message.as_bytes())))
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to build error response");
            Response::new(body::empty())
        })
}

fn basic_auth_ok(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    text == format!("{username}:{password}")
}
