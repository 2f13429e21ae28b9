//! Route matching.
//!
//! Candidates are filtered down in order: enabled → host constraint (exact,
//! then `*.suffix` wildcard) → method set → required headers. Among the
//! survivors the longest path prefix wins; equal prefixes fall back to
//! declaration order, earliest first.

use http::{HeaderMap, Method};

use portico_config::HttpRoute;

/// A successful match.
#[derive(Debug, Clone, Copy)]
pub struct RouteMatch<'a> {
    pub route: &'a HttpRoute,
    /// The route's configured prefix that matched, already normalized.
    pub matched_prefix: &'a str,
}

/// Strip the port and surrounding whitespace off a Host header value.
pub fn normalize_host(host: &str) -> &str {
    let trimmed = host.trim();
    // An IPv6 literal keeps its brackets; ports come after the closing one.
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    trimmed.split(':').next().unwrap_or(trimmed)
}

fn host_matches(constraint: &str, host: &str) -> bool {
    let constraint = normalize_host(constraint);
    if constraint.is_empty() {
        return true;
    }

    if let Some(suffix) = constraint.strip_prefix("*.") {
        // `*.example.com` requires at least one label before the suffix.
        let Some(prefix) = host.strip_suffix(suffix) else {
            return false;
        };
        return prefix.ends_with('.') && prefix.len() > 1;
    }

    constraint.eq_ignore_ascii_case(host)
}

fn methods_match(route: &HttpRoute, method: &Method) -> bool {
    route.methods.is_empty()
        || route
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
}

fn required_headers_match(route: &HttpRoute, headers: &HeaderMap) -> bool {
    route.required_headers.iter().all(|(name, expected)| {
        match headers.get(name.as_str()) {
            None => false,
            Some(value) => {
                let Ok(value) = value.to_str() else { return false };
                if expected == "*" {
                    !value.is_empty()
                } else {
                    value == expected
                }
            }
        }
    })
}

/// Pick the best route for a request, or `None` when nothing matches.
pub fn match_route<'a>(
    routes: &'a [HttpRoute],
    host: &str,
    method: &Method,
    headers: &HeaderMap,
    path: &str,
) -> Option<RouteMatch<'a>> {
    let host = normalize_host(host).to_ascii_lowercase();

    let mut best: Option<(usize, RouteMatch<'a>)> = None;

    for (order, route) in routes.iter().enumerate() {
        if !route.enabled {
            continue;
        }
        if !path.starts_with(route.path.as_str()) {
            continue;
        }
        if let Some(constraint) = route.host.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if !host_matches(&constraint.to_ascii_lowercase(), &host) {
                continue;
            }
        }
        if !methods_match(route, method) {
            continue;
        }
        if !required_headers_match(route, headers) {
            continue;
        }

        let candidate = RouteMatch {
            route,
            matched_prefix: route.path.as_str(),
        };

        best = match best {
            None => Some((order, candidate)),
            Some((best_order, current)) => {
                // Longer prefix wins; equal lengths keep the earlier route.
                if candidate.matched_prefix.len() > current.matched_prefix.len() {
                    Some((order, candidate))
                } else {
                    Some((best_order, current))
                }
            }
        };
    }

    best.map(|(_, m)| m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_common::RouteId;

    fn route(id: &str, path: &str) -> HttpRoute {
        HttpRoute {
            id: RouteId::new(id),
            enabled: true,
            path: path.to_string(),
            ..HttpRoute::default()
        }
    }

    fn get() -> Method {
        Method::GET
    }

    #[test]
    fn longest_prefix_wins() {
        let routes = vec![route("api", "/api"), route("v2", "/api/v2")];
        let m = match_route(&routes, "example.com", &get(), &HeaderMap::new(), "/api/v2/users")
            .expect("matches");
        assert_eq!(m.route.id.as_str(), "v2");
        assert_eq!(m.matched_prefix, "/api/v2");
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let mut a = route("first", "/api");
        a.host = Some("example.com".into());
        let b = route("second", "/api");
        let routes = vec![a, b];

        let m = match_route(&routes, "example.com", &get(), &HeaderMap::new(), "/api/x")
            .expect("matches");
        assert_eq!(m.route.id.as_str(), "first");
    }

    #[test]
    fn disabled_routes_are_skipped() {
        let mut r = route("off", "/api");
        r.enabled = false;
        let routes = vec![r, route("on", "/")];

        let m = match_route(&routes, "h", &get(), &HeaderMap::new(), "/api").expect("matches");
        assert_eq!(m.route.id.as_str(), "on");
    }

    #[test]
    fn host_exact_and_wildcard() {
        let mut exact = route("exact", "/");
        exact.host = Some("api.example.com".into());
        let mut wild = route("wild", "/");
        wild.host = Some("*.example.com".into());

        let routes = vec![exact, wild];

        let m = match_route(&routes, "API.EXAMPLE.COM:8443", &get(), &HeaderMap::new(), "/")
            .expect("matches");
        assert_eq!(m.route.id.as_str(), "exact");

        let m = match_route(&routes, "cdn.example.com", &get(), &HeaderMap::new(), "/")
            .expect("matches");
        assert_eq!(m.route.id.as_str(), "wild");

        // The bare apex does not match the wildcard.
        assert!(match_route(&routes, "example.com", &get(), &HeaderMap::new(), "/").is_none());
    }

    #[test]
    fn method_set_filters() {
        let mut r = route("writes", "/");
        r.methods = vec!["POST".into(), "PUT".into()];
        let routes = vec![r];

        assert!(match_route(&routes, "h", &Method::POST, &HeaderMap::new(), "/").is_some());
        assert!(match_route(&routes, "h", &Method::GET, &HeaderMap::new(), "/").is_none());
    }

    #[test]
    fn required_headers_with_wildcard_value() {
        let mut r = route("authed", "/");
        r.required_headers.insert("X-Api-Key".into(), "*".into());
        r.required_headers.insert("X-Tenant".into(), "acme".into());
        let routes = vec![r];

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "anything".parse().unwrap());
        headers.insert("x-tenant", "acme".parse().unwrap());
        assert!(match_route(&routes, "h", &get(), &headers, "/").is_some());

        let mut wrong = HeaderMap::new();
        wrong.insert("x-api-key", "anything".parse().unwrap());
        wrong.insert("x-tenant", "other".parse().unwrap());
        assert!(match_route(&routes, "h", &get(), &wrong, "/").is_none());

        assert!(match_route(&routes, "h", &get(), &HeaderMap::new(), "/").is_none());
    }

    #[test]
    fn ipv6_host_normalization() {
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert_eq!(normalize_host("example.com:443"), "example.com");
        assert_eq!(normalize_host(" example.com "), "example.com");
    }
}
