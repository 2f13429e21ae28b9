//! Request and response transformation.
//!
//! Everything between "route matched" and "bytes forwarded": hop-by-hop
//! header hygiene, forwarding headers, `$var` expansion, URL rewriting,
//! prefix-to-prefix path mapping, and body substitution. Framing is
//! preserved: when no body-modifying rule applies the body streams through
//! untouched; buffering only happens when a rule (or compression) needs the
//! whole payload, and is capped by the configured limits.

pub mod compression;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Uri};
use regex::Regex;
use std::net::SocketAddr;
use tracing::trace;

use portico_config::{BasicAuth, BodyReplace, HttpRoute, UrlRewrite};

use crate::errors::ProxyError;

// ============================================================================
// Hop-by-hop headers
// ============================================================================

/// RFC 7230 §6.1 connection-scoped headers, stripped in both directions.
pub fn is_hop_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("trailers")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let connection_listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in connection_listed {
        headers.remove(name);
    }

    let hop_names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop_names {
        headers.remove(name);
    }
}

// ============================================================================
// Variable expansion
// ============================================================================

/// Per-request context for header-value expansion.
pub struct ExpandCtx<'a> {
    pub peer: SocketAddr,
    pub inbound_headers: &'a HeaderMap,
    pub tls: bool,
}

/// Expand `$remote_addr`, `$scheme`, `$host`, and
/// `$proxy_add_x_forwarded_for` inside a configured header value.
pub fn expand_header_value(raw: &str, ctx: &ExpandCtx<'_>) -> String {
    if !raw.contains('$') {
        return raw.to_string();
    }

    let remote_ip = ctx.peer.ip().to_string();
    let scheme = if ctx.tls { "https" } else { "http" };
    let host = ctx
        .inbound_headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let proxy_add_xff = if raw.contains("$proxy_add_x_forwarded_for") {
        Some(append_forwarded_for(ctx.inbound_headers, &remote_ip))
    } else {
        None
    };

    let mut out = String::with_capacity(raw.len() + 32);
    let mut rest = raw;
    while let Some(idx) = rest.find('$') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];

        if let Some(tail) = rest.strip_prefix("$proxy_add_x_forwarded_for") {
            if let Some(v) = proxy_add_xff.as_deref() {
                out.push_str(v);
            }
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("$remote_addr") {
            out.push_str(&remote_ip);
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("$scheme") {
            out.push_str(scheme);
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("$host") {
            out.push_str(host);
            rest = tail;
        } else {
            out.push('$');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

/// The inbound `X-Forwarded-For` with the immediate peer appended, or just
/// the peer when the request carried none.
pub fn append_forwarded_for(inbound: &HeaderMap, peer_ip: &str) -> String {
    match inbound
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(prior) => format!("{prior}, {peer_ip}"),
        None => peer_ip.to_string(),
    }
}

// ============================================================================
// URL rewriting & target construction
// ============================================================================

/// Apply the first enabled rewrite rule whose pattern matches the URI.
pub fn rewrite_uri(uri: &Uri, rules: &[UrlRewrite]) -> Uri {
    for rule in rules {
        if !rule.enabled {
            continue;
        }
        let Ok(re) = Regex::new(&rule.pattern) else {
            continue;
        };
        let original = uri.to_string();
        if !re.is_match(&original) {
            continue;
        }
        let rewritten = re.replace_all(&original, rule.replacement.as_str());
        match rewritten.parse::<Uri>() {
            Ok(new_uri) => {
                trace!(from = %original, to = %rewritten, "url rewrite applied");
                return new_uri;
            }
            Err(_) => return uri.clone(),
        }
    }
    uri.clone()
}

/// Build the upstream target URL from the selected upstream base, the
/// matched route prefix, and the (possibly rewritten) request URI.
///
/// `proxy_pass_path` replaces the matched prefix; `$server_port` inside the
/// base expands to the listener's bound port.
pub fn build_target_url(
    upstream_base: &str,
    matched_prefix: &str,
    proxy_pass_path: Option<&str>,
    uri: &Uri,
    server_port: u16,
) -> Result<Uri, ProxyError> {
    let mut base = upstream_base.trim().trim_end_matches('/').to_string();
    if base.contains("$server_port") {
        base = base.replace("$server_port", &server_port.to_string());
    }

    let orig_path = uri.path();
    let mut new_path = orig_path.to_string();

    if let Some(pp) = proxy_pass_path {
        let from = if matched_prefix.is_empty() { "/" } else { matched_prefix };
        let to = if pp.trim().is_empty() { "/" } else { pp.trim() };

        if let Some(suffix) = new_path.strip_prefix(from) {
            let suffix = suffix.strip_prefix('/').unwrap_or(suffix);
            let mut out = to.to_string();
            if out.is_empty() {
                out.push('/');
            }
            new_path = if suffix.is_empty() {
                out
            } else if out.ends_with('/') {
                format!("{out}{suffix}")
            } else {
                format!("{out}/{suffix}")
            };
        }

        if !new_path.starts_with('/') {
            new_path = format!("/{new_path}");
        }
    }

    base.push_str(&new_path);
    if let Some(q) = uri.query() {
        base.push('?');
        base.push_str(q);
    }

    base.parse::<Uri>()
        .map_err(|e| ProxyError::UpstreamProtocol(format!("bad upstream url `{base}`: {e}")))
}

// ============================================================================
// Upstream request headers
// ============================================================================

/// Headers never copied verbatim from the inbound request; they are either
/// connection-scoped or recomputed below.
fn is_skipped_inbound(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("x-real-ip")
        || name.eq_ignore_ascii_case("x-forwarded-for")
        || name.eq_ignore_ascii_case("x-forwarded-proto")
        || is_hop_header(name)
}

/// Build the header map sent upstream.
///
/// - hop-by-hop headers stripped
/// - `Host` defaults to the upstream authority; `set_headers` may override
/// - `X-Forwarded-For` appended, `X-Real-IP` and `X-Forwarded-Proto` set
/// - `Authorization` dropped unless `basic_auth.forward`
/// - `set_headers` (with `$var` expansion) then `remove_headers` applied
pub fn build_upstream_headers(
    route: &HttpRoute,
    auth: Option<&BasicAuth>,
    ctx: &ExpandCtx<'_>,
    upstream_authority: &str,
    force_identity_encoding: bool,
) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(ctx.inbound_headers.len() + 4);

    for (name, value) in ctx.inbound_headers {
        if is_skipped_inbound(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Ok(host) = HeaderValue::from_str(upstream_authority) {
        out.insert(header::HOST, host);
    }

    let remote_ip = ctx.peer.ip().to_string();
    if let Ok(v) = HeaderValue::from_str(&remote_ip) {
        out.insert(HeaderName::from_static("x-real-ip"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&append_forwarded_for(ctx.inbound_headers, &remote_ip)) {
        out.insert(HeaderName::from_static("x-forwarded-for"), v);
    }
    out.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static(if ctx.tls { "https" } else { "http" }),
    );

    if force_identity_encoding {
        // Body rules need a readable payload; ask upstream for identity.
        out.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    }

    if let Some(auth) = auth {
        if !auth.forward {
            out.remove(header::AUTHORIZATION);
        }
    }

    for (key, value) in &route.set_headers {
        let key = key.trim();
        if key.is_empty() || is_hop_header(key) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        let expanded = expand_header_value(value, ctx);
        match HeaderValue::from_str(&expanded) {
            Ok(v) => {
                out.insert(name, v);
            }
            Err(_) => continue,
        }
    }

    remove_listed_headers(&mut out, &route.remove_headers);

    out
}

/// Response-direction header hygiene: hop-by-hop strip plus configured
/// removals.
pub fn filter_response_headers(headers: &mut HeaderMap, route: &HttpRoute) {
    strip_hop_headers(headers);
    remove_listed_headers(headers, &route.remove_headers);
}

fn remove_listed_headers(headers: &mut HeaderMap, names: &[String]) {
    for raw in names {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(trimmed.as_bytes()) {
            headers.remove(name);
        }
    }
}

// ============================================================================
// Body substitution
// ============================================================================

/// Whether any enabled rule applies to a body of `content_type`.
pub fn has_active_body_rules(rules: &[BodyReplace], content_type: Option<&str>) -> bool {
    rules
        .iter()
        .any(|rule| rule.enabled && rule_applies(rule, content_type))
}

fn rule_applies(rule: &BodyReplace, content_type: Option<&str>) -> bool {
    if rule.content_types.is_empty() {
        return true;
    }
    let Some(ct) = content_type else {
        return false;
    };
    rule.content_types
        .iter()
        .any(|filter| ct.to_ascii_lowercase().contains(&filter.to_ascii_lowercase()))
}

/// Apply enabled substitution rules in order. Non-UTF-8 bodies pass through
/// unchanged.
pub fn apply_body_rules(
    bytes: Bytes,
    rules: &[BodyReplace],
    content_type: Option<&str>,
) -> Bytes {
    if !has_active_body_rules(rules, content_type) {
        return bytes;
    }

    let Ok(text) = std::str::from_utf8(&bytes) else {
        return bytes;
    };

    let mut body = text.to_string();
    for rule in rules {
        if !rule.enabled || !rule_applies(rule, content_type) {
            continue;
        }
        if rule.use_regex {
            if let Ok(re) = Regex::new(&rule.find) {
                body = re.replace_all(&body, rule.replace.as_str()).into_owned();
            }
        } else {
            body = body.replace(&rule.find, &rule.replace);
        }
    }

    Bytes::from(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_config::HttpRoute;

    fn ctx<'a>(headers: &'a HeaderMap, tls: bool) -> ExpandCtx<'a> {
        ExpandCtx {
            peer: "203.0.113.9:55555".parse().unwrap(),
            inbound_headers: headers,
            tls,
        }
    }

    #[test]
    fn hop_headers_are_stripped_including_connection_listed() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "close, x-custom-hop".parse().unwrap());
        headers.insert("x-custom-hop", "1".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-kept", "yes".parse().unwrap());

        strip_hop_headers(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-custom-hop").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("x-kept").unwrap(), "yes");
    }

    #[test]
    fn variable_expansion() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", "app.example.com".parse().unwrap());
        inbound.insert("x-forwarded-for", "1.1.1.1, 2.2.2.2".parse().unwrap());
        let ctx = ctx(&inbound, true);

        assert_eq!(expand_header_value("$remote_addr", &ctx), "203.0.113.9");
        assert_eq!(expand_header_value("$scheme://$host", &ctx), "https://app.example.com");
        assert_eq!(
            expand_header_value("$proxy_add_x_forwarded_for", &ctx),
            "1.1.1.1, 2.2.2.2, 203.0.113.9"
        );
        assert_eq!(expand_header_value("plain", &ctx), "plain");
        assert_eq!(expand_header_value("$unknown", &ctx), "$unknown");
    }

    #[test]
    fn target_url_prefix_rewrite() {
        let uri: Uri = "/api/users?x=1".parse().unwrap();
        let target =
            build_target_url("http://10.0.0.1:3000", "/api", Some("/v1"), &uri, 8080).unwrap();
        assert_eq!(target.to_string(), "http://10.0.0.1:3000/v1/users?x=1");
    }

    #[test]
    fn target_url_without_rewrite_keeps_path() {
        let uri: Uri = "/api/v2/users".parse().unwrap();
        let target = build_target_url("http://u2.internal", "/api/v2", None, &uri, 80).unwrap();
        assert_eq!(target.to_string(), "http://u2.internal/api/v2/users");
    }

    #[test]
    fn target_url_expands_server_port() {
        let uri: Uri = "/".parse().unwrap();
        let target =
            build_target_url("http://192.168.1.9:$server_port", "/", None, &uri, 8443).unwrap();
        assert_eq!(target.to_string(), "http://192.168.1.9:8443/");
    }

    #[test]
    fn target_url_prefix_to_root() {
        let uri: Uri = "/api".parse().unwrap();
        let target = build_target_url("http://b", "/api", Some("/"), &uri, 80).unwrap();
        assert_eq!(target.to_string(), "http://b/");
    }

    #[test]
    fn rewrite_uses_first_enabled_match() {
        let rules = vec![
            UrlRewrite {
                pattern: "^/old".into(),
                replacement: "/new".into(),
                enabled: false,
            },
            UrlRewrite {
                pattern: "^/old/(.*)$".into(),
                replacement: "/current/$1".into(),
                enabled: true,
            },
            UrlRewrite {
                pattern: "^/current".into(),
                replacement: "/should-not-run".into(),
                enabled: true,
            },
        ];

        let uri: Uri = "/old/docs".parse().unwrap();
        assert_eq!(rewrite_uri(&uri, &rules).to_string(), "/current/docs");

        let untouched: Uri = "/other".parse().unwrap();
        assert_eq!(rewrite_uri(&untouched, &rules).to_string(), "/other");
    }

    #[test]
    fn upstream_headers_forwarding_set() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", "public.example.com".parse().unwrap());
        inbound.insert("user-agent", "curl/8".parse().unwrap());
        inbound.insert("connection", "keep-alive".parse().unwrap());
        inbound.insert("authorization", "Basic YTpi".parse().unwrap());

        let mut route = HttpRoute::default();
        route
            .set_headers
            .insert("X-Origin-Host".into(), "$host".into());
        route.remove_headers.push("X-Powered-By".into());

        let auth = BasicAuth {
            username: "a".into(),
            password: "b".into(),
            forward: false,
        };

        let ctx = ctx(&inbound, false);
        let headers =
            build_upstream_headers(&route, Some(&auth), &ctx, "10.0.0.1:3000", false);

        assert_eq!(headers.get("host").unwrap(), "10.0.0.1:3000");
        assert_eq!(headers.get("x-real-ip").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-origin-host").unwrap(), "public.example.com");
        assert_eq!(headers.get("user-agent").unwrap(), "curl/8");
        assert!(headers.get("authorization").is_none(), "credentials stripped");
        assert!(headers.get("connection").is_none());
    }

    #[test]
    fn authorization_forwarded_when_opted_in() {
        let mut inbound = HeaderMap::new();
        inbound.insert("authorization", "Basic YTpi".parse().unwrap());

        let auth = BasicAuth {
            username: "a".into(),
            password: "b".into(),
            forward: true,
        };
        let ctx = ctx(&inbound, false);
        let headers =
            build_upstream_headers(&HttpRoute::default(), Some(&auth), &ctx, "up:80", false);
        assert!(headers.get("authorization").is_some());
    }

    #[test]
    fn set_headers_override_host() {
        let inbound = HeaderMap::new();
        let mut route = HttpRoute::default();
        route.set_headers.insert("Host".into(), "pinned.internal".into());

        let ctx = ctx(&inbound, false);
        let headers = build_upstream_headers(&route, None, &ctx, "up:80", false);
        assert_eq!(headers.get("host").unwrap(), "pinned.internal");
    }

    #[test]
    fn body_rules_literal_and_regex() {
        let rules = vec![
            BodyReplace {
                find: "http://internal".into(),
                replace: "https://public".into(),
                use_regex: false,
                enabled: true,
                content_types: vec![],
            },
            BodyReplace {
                find: r#""debug":\s*true"#.into(),
                replace: r#""debug": false"#.into(),
                use_regex: true,
                enabled: true,
                content_types: vec!["json".into()],
            },
        ];

        let body = Bytes::from(r#"{"url": "http://internal/x", "debug": true}"#);
        let out = apply_body_rules(body, &rules, Some("application/json"));
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.contains("https://public/x"));
        assert!(text.contains(r#""debug": false"#));
    }

    #[test]
    fn body_rules_respect_content_type_filter() {
        let rules = vec![BodyReplace {
            find: "a".into(),
            replace: "b".into(),
            use_regex: false,
            enabled: true,
            content_types: vec!["text/html".into()],
        }];

        let body = Bytes::from_static(b"aaa");
        assert_eq!(apply_body_rules(body.clone(), &rules, Some("image/png")), body);
        assert!(!has_active_body_rules(&rules, Some("application/json")));
        assert!(has_active_body_rules(&rules, Some("text/html; charset=utf-8")));

        let out = apply_body_rules(body, &rules, Some("text/html"));
        assert_eq!(&out[..], b"bbb");
    }

    #[test]
    fn non_utf8_bodies_pass_through() {
        let rules = vec![BodyReplace {
            find: "x".into(),
            replace: "y".into(),
            use_regex: false,
            enabled: true,
            content_types: vec![],
        }];
        let body = Bytes::from(vec![0xff, 0xfe, b'x']);
        assert_eq!(apply_body_rules(body.clone(), &rules, None), body);
    }
}
