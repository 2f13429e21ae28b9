//! Structural validation and normalization.
//!
//! `validate` consumes a raw deserialized [`Config`], normalizes it
//! (defaults, id fill, path shapes, legacy field promotion), checks every
//! structural invariant, and returns the snapshot that gets published. It is
//! pure apart from checking that configured TLS material exists on disk
//! (existence only; the files are parsed at listener start).
//!
//! Errors carry a dotted path into the document, e.g.
//! `http_rules[2].routes[0].path`.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;

use portico_common::{parse_duration, RouteId, RuleId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::parse_listen_addr;
use crate::model::{BodyReplace, Config, HttpRoute, HttpRule, WsRule};

/// A structural configuration error, pointing at the offending field.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Display) -> Self {
        Self {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Validate and normalize a raw config into a publishable snapshot.
pub fn validate(mut cfg: Config) -> Result<Config, ValidationError> {
    normalize(&mut cfg);

    check_http_rules(&cfg)?;
    check_ws_rules(&cfg)?;
    check_stream(&cfg)?;
    check_access(&cfg)?;

    Ok(cfg)
}

// ============================================================================
// Normalization
// ============================================================================

fn normalize(cfg: &mut Config) {
    for rule in &mut cfg.http_rules {
        promote_listen_addr(&mut rule.listen_addrs, &mut rule.listen_addr);
        if rule.id.is_blank() {
            rule.id = RuleId::generate();
        }
        for route in &mut rule.routes {
            if route.id.is_blank() {
                route.id = RouteId::generate();
            }
            route.path = normalize_path(&route.path);
            if let Some(pp) = route.proxy_pass_path.as_mut() {
                *pp = normalize_path(pp);
            }
            for method in &mut route.methods {
                *method = method.trim().to_ascii_uppercase();
            }
            route.methods.retain(|m| !m.is_empty());
        }
    }

    for rule in &mut cfg.ws_rules {
        promote_listen_addr(&mut rule.listen_addrs, &mut rule.listen_addr);
        if rule.id.is_blank() {
            rule.id = RuleId::generate();
        }
        for route in &mut rule.routes {
            route.path = normalize_path(&route.path);
        }
    }

    cfg.compression.gzip.level = cfg.compression.gzip.level.clamp(1, 9);
    cfg.compression.brotli.level = cfg.compression.brotli.level.clamp(0, 11);
}

fn promote_listen_addr(addrs: &mut Vec<String>, legacy: &mut Option<String>) {
    let mut cleaned: Vec<String> = addrs
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if cleaned.is_empty() {
        if let Some(single) = legacy.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            cleaned.push(single.to_string());
        }
    }

    // Duplicate addresses would race on bind; keep the first occurrence.
    let mut seen = HashSet::new();
    cleaned.retain(|a| seen.insert(a.clone()));

    *addrs = cleaned;
    *legacy = None;
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

// ============================================================================
// HTTP rules
// ============================================================================

fn check_http_rules(cfg: &Config) -> Result<(), ValidationError> {
    let mut rule_ids = HashSet::new();

    for (ri, rule) in cfg.http_rules.iter().enumerate() {
        let base = format!("http_rules[{ri}]");

        if !rule_ids.insert(rule.id.clone()) {
            return Err(ValidationError::new(
                format!("{base}.id"),
                format!("duplicate rule id `{}`", rule.id),
            ));
        }

        check_listen_addrs(&base, rule.enabled, &rule.listen_addrs)?;
        check_tls(&base, rule)?;

        if let Some(auth) = &rule.basic_auth {
            if auth.username.trim().is_empty() {
                return Err(ValidationError::new(
                    format!("{base}.basic_auth.username"),
                    "username must not be empty",
                ));
            }
        }

        if let Some(rl) = &rule.rate_limit {
            if rl.rps < 1 {
                return Err(ValidationError::new(
                    format!("{base}.rate_limit.rps"),
                    "must be >= 1",
                ));
            }
            if rl.burst < 1 {
                return Err(ValidationError::new(
                    format!("{base}.rate_limit.burst"),
                    "must be >= 1",
                ));
            }
        }

        let mut route_ids = HashSet::new();
        let mut enabled_routes = 0usize;

        for (pi, route) in rule.routes.iter().enumerate() {
            let rbase = format!("{base}.routes[{pi}]");

            if !route_ids.insert(route.id.clone()) {
                return Err(ValidationError::new(
                    format!("{rbase}.id"),
                    format!("duplicate route id `{}`", route.id),
                ));
            }

            if route.enabled {
                enabled_routes += 1;
            }

            check_route(&rbase, route)?;
        }

        if rule.enabled && enabled_routes == 0 {
            return Err(ValidationError::new(
                format!("{base}.routes"),
                "an enabled rule needs at least one enabled route",
            ));
        }
    }

    Ok(())
}

fn check_route(base: &str, route: &HttpRoute) -> Result<(), ValidationError> {
    if route.enabled && route.upstreams.is_empty() && route.static_dir.is_none() {
        return Err(ValidationError::new(
            format!("{base}.upstreams"),
            "route needs at least one upstream or a static_dir",
        ));
    }

    for (ui, upstream) in route.upstreams.iter().enumerate() {
        let ubase = format!("{base}.upstreams[{ui}]");
        check_origin_url(&ubase, &upstream.url, &["http://", "https://"])?;
        if upstream.weight < 1 {
            return Err(ValidationError::new(
                format!("{ubase}.weight"),
                "must be >= 1",
            ));
        }
    }

    for (wi, rewrite) in route.url_rewrites.iter().enumerate() {
        if let Err(e) = regex::Regex::new(&rewrite.pattern) {
            return Err(ValidationError::new(
                format!("{base}.url_rewrites[{wi}].pattern"),
                e,
            ));
        }
    }

    check_body_rules(
        &format!("{base}.request_body_replace"),
        &route.request_body_replace,
    )?;
    check_body_rules(
        &format!("{base}.response_body_replace"),
        &route.response_body_replace,
    )?;

    if let Some(host) = route.host.as_deref().map(str::trim) {
        if host.contains('/') || host.contains(' ') {
            return Err(ValidationError::new(
                format!("{base}.host"),
                "host constraint must be a bare hostname",
            ));
        }
    }

    Ok(())
}

fn check_body_rules(base: &str, rules: &[BodyReplace]) -> Result<(), ValidationError> {
    for (i, rule) in rules.iter().enumerate() {
        if rule.use_regex {
            if let Err(e) = regex::Regex::new(&rule.find) {
                return Err(ValidationError::new(format!("{base}[{i}].find"), e));
            }
        }
    }
    Ok(())
}

// ============================================================================
// WS rules
// ============================================================================

fn check_ws_rules(cfg: &Config) -> Result<(), ValidationError> {
    let mut rule_ids = HashSet::new();

    for (ri, rule) in cfg.ws_rules.iter().enumerate() {
        let base = format!("ws_rules[{ri}]");

        if !rule_ids.insert(rule.id.clone()) {
            return Err(ValidationError::new(
                format!("{base}.id"),
                format!("duplicate rule id `{}`", rule.id),
            ));
        }

        check_listen_addrs(&base, rule.enabled, &rule.listen_addrs)?;
        check_ws_tls(&base, rule)?;

        if rule.enabled && rule.routes.is_empty() {
            return Err(ValidationError::new(
                format!("{base}.routes"),
                "an enabled rule needs at least one route",
            ));
        }

        for (pi, route) in rule.routes.iter().enumerate() {
            check_origin_url(
                &format!("{base}.routes[{pi}].upstream_url"),
                &route.upstream_url,
                &["ws://", "wss://"],
            )?;
        }
    }

    Ok(())
}

// ============================================================================
// Stream
// ============================================================================

fn check_stream(cfg: &Config) -> Result<(), ValidationError> {
    let stream = &cfg.stream;
    let mut names = HashSet::new();

    for (ui, upstream) in stream.upstreams.iter().enumerate() {
        let base = format!("stream.upstreams[{ui}]");

        if upstream.name.trim().is_empty() {
            return Err(ValidationError::new(format!("{base}.name"), "must not be empty"));
        }
        if !names.insert(upstream.name.clone()) {
            return Err(ValidationError::new(
                format!("{base}.name"),
                format!("duplicate upstream name `{}`", upstream.name),
            ));
        }
        if upstream.members.is_empty() {
            return Err(ValidationError::new(
                format!("{base}.members"),
                "upstream needs at least one member",
            ));
        }

        for (mi, member) in upstream.members.iter().enumerate() {
            let mbase = format!("{base}.members[{mi}]");
            check_host_port(&format!("{mbase}.addr"), &member.addr)?;
            if member.weight < 1 {
                return Err(ValidationError::new(
                    format!("{mbase}.weight"),
                    "must be >= 1",
                ));
            }
        }
    }

    for (si, server) in stream.servers.iter().enumerate() {
        let base = format!("stream.servers[{si}]");

        if server.listen_port == 0 {
            return Err(ValidationError::new(
                format!("{base}.listen_port"),
                "must be non-zero",
            ));
        }
        if !names.contains(&server.proxy_pass) {
            return Err(ValidationError::new(
                format!("{base}.proxy_pass"),
                format!("unknown upstream `{}`", server.proxy_pass),
            ));
        }
        if let Err(e) = parse_duration(&server.connect_timeout) {
            return Err(ValidationError::new(format!("{base}.connect_timeout"), e));
        }
        if let Err(e) = parse_duration(&server.idle_timeout) {
            return Err(ValidationError::new(format!("{base}.idle_timeout"), e));
        }
    }

    Ok(())
}

// ============================================================================
// Access
// ============================================================================

fn check_access(cfg: &Config) -> Result<(), ValidationError> {
    for (wi, entry) in cfg.access.whitelist.iter().enumerate() {
        let trimmed = entry.trim();
        let ok = trimmed.parse::<std::net::IpAddr>().is_ok()
            || trimmed.parse::<cidr::IpCidr>().is_ok();
        if !ok {
            return Err(ValidationError::new(
                format!("access.whitelist[{wi}]"),
                format!("`{trimmed}` is neither an IP nor a CIDR block"),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Shared checks
// ============================================================================

fn check_listen_addrs(
    base: &str,
    enabled: bool,
    addrs: &[String],
) -> Result<(), ValidationError> {
    if enabled && addrs.is_empty() {
        return Err(ValidationError::new(
            format!("{base}.listen_addrs"),
            "an enabled rule needs at least one listen address",
        ));
    }

    for (ai, addr) in addrs.iter().enumerate() {
        if let Err(e) = parse_listen_addr(addr) {
            return Err(ValidationError::new(
                format!("{base}.listen_addrs[{ai}]"),
                e,
            ));
        }
    }

    Ok(())
}

fn check_tls(base: &str, rule: &HttpRule) -> Result<(), ValidationError> {
    let Some(tls) = &rule.tls else { return Ok(()) };
    check_tls_material(base, rule.enabled, &tls.cert_file, &tls.key_file)
}

fn check_ws_tls(base: &str, rule: &WsRule) -> Result<(), ValidationError> {
    let Some(tls) = &rule.tls else { return Ok(()) };
    check_tls_material(base, rule.enabled, &tls.cert_file, &tls.key_file)
}

fn check_tls_material(
    base: &str,
    enabled: bool,
    cert_file: &str,
    key_file: &str,
) -> Result<(), ValidationError> {
    if cert_file.trim().is_empty() {
        return Err(ValidationError::new(
            format!("{base}.tls.cert_file"),
            "must not be empty",
        ));
    }
    if key_file.trim().is_empty() {
        return Err(ValidationError::new(
            format!("{base}.tls.key_file"),
            "must not be empty",
        ));
    }

    // Presence only; the PEM contents are parsed when the listener starts.
    if enabled {
        if !Path::new(cert_file).exists() {
            return Err(ValidationError::new(
                format!("{base}.tls.cert_file"),
                format!("`{cert_file}` does not exist"),
            ));
        }
        if !Path::new(key_file).exists() {
            return Err(ValidationError::new(
                format!("{base}.tls.key_file"),
                format!("`{key_file}` does not exist"),
            ));
        }
    }

    Ok(())
}

fn check_origin_url(path: &str, url: &str, schemes: &[&str]) -> Result<(), ValidationError> {
    let trimmed = url.trim();
    let Some(scheme) = schemes.iter().find(|s| trimmed.starts_with(**s)) else {
        return Err(ValidationError::new(
            path,
            format!("`{trimmed}` must start with one of {schemes:?}"),
        ));
    };

    let rest = &trimmed[scheme.len()..];
    let authority = rest.split('/').next().unwrap_or("");
    if authority.is_empty() || authority.contains(' ') {
        return Err(ValidationError::new(
            path,
            format!("`{trimmed}` has no host"),
        ));
    }

    Ok(())
}

fn check_host_port(path: &str, addr: &str) -> Result<(), ValidationError> {
    let trimmed = addr.trim();
    let Some((host, port)) = trimmed.rsplit_once(':') else {
        return Err(ValidationError::new(
            path,
            format!("`{trimmed}` must be host:port"),
        ));
    };
    if host.is_empty() || port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
        return Err(ValidationError::new(
            path,
            format!("`{trimmed}` must be host:port"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Config {
        toml::from_str(text).expect("fixture parses")
    }

    #[test]
    fn fills_missing_ids_and_promotes_listen_addr() {
        let cfg = parse(
            r#"
            [[http_rules]]
            listen_addr = " :8080 "

            [[http_rules.routes]]
            path = "api"
            [[http_rules.routes.upstreams]]
            url = "http://127.0.0.1:3000"
            "#,
        );

        let cfg = validate(cfg).expect("valid");
        let rule = &cfg.http_rules[0];
        assert!(!rule.id.is_blank());
        assert_eq!(rule.listen_addrs, vec![":8080"]);
        assert!(rule.listen_addr.is_none());
        assert_eq!(rule.routes[0].path, "/api");
        assert!(!rule.routes[0].id.is_blank());
    }

    #[test]
    fn validation_is_idempotent() {
        let cfg = parse(
            r#"
            [[http_rules]]
            listen_addrs = [":8080"]
            [[http_rules.routes]]
            [[http_rules.routes.upstreams]]
            url = "http://10.0.0.1:80"
            "#,
        );

        let once = validate(cfg).expect("valid");
        let text = toml::to_string(&once).expect("serializes");
        let twice = validate(parse(&text)).expect("still valid");
        assert_eq!(once, twice);
    }

    #[test]
    fn enabled_rule_without_addr_fails() {
        let cfg = parse(
            r#"
            [[http_rules]]
            [[http_rules.routes]]
            [[http_rules.routes.upstreams]]
            url = "http://10.0.0.1:80"
            "#,
        );

        let err = validate(cfg).unwrap_err();
        assert_eq!(err.path, "http_rules[0].listen_addrs");
    }

    #[test]
    fn route_without_target_fails() {
        let cfg = parse(
            r#"
            [[http_rules]]
            listen_addrs = [":8080"]
            [[http_rules.routes]]
            path = "/x"
            "#,
        );

        let err = validate(cfg).unwrap_err();
        assert!(err.path.ends_with("upstreams"));
    }

    #[test]
    fn bad_rewrite_regex_is_reported_with_path() {
        let cfg = parse(
            r#"
            [[http_rules]]
            listen_addrs = [":8080"]
            [[http_rules.routes]]
            url_rewrites = [{ pattern = "(", replacement = "x" }]
            [[http_rules.routes.upstreams]]
            url = "http://10.0.0.1:80"
            "#,
        );

        let err = validate(cfg).unwrap_err();
        assert_eq!(err.path, "http_rules[0].routes[0].url_rewrites[0].pattern");
    }

    #[test]
    fn stream_dangling_proxy_pass_fails() {
        let cfg = parse(
            r#"
            [stream]
            enabled = true
            [[stream.servers]]
            listen_port = 50001
            proxy_pass = "nope"
            "#,
        );

        let err = validate(cfg).unwrap_err();
        assert_eq!(err.path, "stream.servers[0].proxy_pass");
    }

    #[test]
    fn whitelist_accepts_ip_and_cidr() {
        let cfg = parse(
            r#"
            [access]
            whitelist = ["10.1.2.3", "192.168.0.0/16", "fd00::/8"]
            "#,
        );
        assert!(validate(cfg).is_ok());

        let cfg = parse(
            r#"
            [access]
            whitelist = ["not-an-ip"]
            "#,
        );
        assert_eq!(validate(cfg).unwrap_err().path, "access.whitelist[0]");
    }

    #[test]
    fn compression_levels_are_clamped() {
        let cfg = parse(
            r#"
            [compression]
            enabled = true
            gzip = { on = true, level = 99 }
            brotli = { on = true, level = 99 }
            "#,
        );

        let cfg = validate(cfg).expect("valid");
        assert_eq!(cfg.compression.gzip.level, 9);
        assert_eq!(cfg.compression.brotli.level, 11);
    }

    #[test]
    fn duplicate_route_ids_fail() {
        let cfg = parse(
            r#"
            [[http_rules]]
            listen_addrs = [":8080"]
            [[http_rules.routes]]
            id = "same"
            [[http_rules.routes.upstreams]]
            url = "http://10.0.0.1:80"
            [[http_rules.routes]]
            id = "same"
            [[http_rules.routes.upstreams]]
            url = "http://10.0.0.2:80"
            "#,
        );

        let err = validate(cfg).unwrap_err();
        assert_eq!(err.path, "http_rules[0].routes[1].id");
    }

    #[test]
    fn rate_limit_bounds() {
        let cfg = parse(
            r#"
            [[http_rules]]
            listen_addrs = [":8080"]
            rate_limit = { rps = 0, burst = 5 }
            [[http_rules.routes]]
            [[http_rules.routes.upstreams]]
            url = "http://10.0.0.1:80"
            "#,
        );

        let err = validate(cfg).unwrap_err();
        assert_eq!(err.path, "http_rules[0].rate_limit.rps");
    }
}
