//! Access control.
//!
//! Every connection passes here before anything else runs. Decision order,
//! per protocol and respecting that protocol's enable toggle:
//!
//! 1. active blacklist entry → deny
//! 2. `allow_all_public` → allow
//! 3. LAN source and `allow_all_lan` → allow
//! 4. whitelist hit (exact IP or CIDR) → allow
//! 5. deny
//!
//! The blacklist is cached as a copy-on-write snapshot: lookups clone an
//! `Arc`, mutations rebuild from the store, and a periodic sweep evicts
//! expired entries.

use cidr::IpCidr;
use http::HeaderMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

use portico_config::AccessConfig;

use crate::sink::SharedBlacklistStore;

/// Which engine is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessProtocol {
    Http,
    Ws,
    Stream,
}

enum WhitelistMatcher {
    Exact(IpAddr),
    Cidr(IpCidr),
}

impl WhitelistMatcher {
    fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            WhitelistMatcher::Exact(allowed) => allowed == ip,
            WhitelistMatcher::Cidr(block) => block.contains(ip),
        }
    }
}

struct Policy {
    http_enabled: bool,
    ws_enabled: bool,
    stream_enabled: bool,
    allow_all_lan: bool,
    allow_all_public: bool,
    whitelist: Vec<WhitelistMatcher>,
}

impl Policy {
    fn from_config(access: &AccessConfig) -> Self {
        let whitelist = access
            .whitelist
            .iter()
            .filter_map(|entry| {
                let trimmed = entry.trim();
                if let Ok(ip) = trimmed.parse::<IpAddr>() {
                    return Some(WhitelistMatcher::Exact(ip));
                }
                if let Ok(block) = trimmed.parse::<IpCidr>() {
                    return Some(WhitelistMatcher::Cidr(block));
                }
                // The validator rejects these; tolerate stale snapshots.
                warn!(entry = %trimmed, "skipping unparsable whitelist entry");
                None
            })
            .collect();

        Self {
            http_enabled: access.http_enabled,
            ws_enabled: access.ws_enabled,
            stream_enabled: access.stream_enabled,
            allow_all_lan: access.allow_all_lan,
            allow_all_public: access.allow_all_public,
            whitelist,
        }
    }

    fn enabled_for(&self, protocol: AccessProtocol) -> bool {
        match protocol {
            AccessProtocol::Http => self.http_enabled,
            AccessProtocol::Ws => self.ws_enabled,
            AccessProtocol::Stream => self.stream_enabled,
        }
    }
}

/// Shared access-control state.
pub struct AccessControl {
    policy: RwLock<Arc<Policy>>,
    /// ip (lowercased) → expires_at (0 = permanent). Swapped wholesale.
    blacklist: RwLock<Arc<HashMap<String, i64>>>,
    store: SharedBlacklistStore,
}

impl AccessControl {
    pub fn new(store: SharedBlacklistStore, access: &AccessConfig) -> Self {
        Self {
            policy: RwLock::new(Arc::new(Policy::from_config(access))),
            blacklist: RwLock::new(Arc::new(HashMap::new())),
            store,
        }
    }

    /// Swap in the policy from a new config snapshot.
    pub fn apply(&self, access: &AccessConfig) {
        *self.policy.write() = Arc::new(Policy::from_config(access));
    }

    /// Rebuild the blacklist cache from the store.
    pub async fn refresh_blacklist(&self) {
        let now = epoch_now();
        match self.store.active(now).await {
            Ok(entries) => {
                let map: HashMap<String, i64> = entries
                    .into_iter()
                    .map(|(ip, exp)| (normalize_ip_key(&ip), exp))
                    .collect();
                debug!(entries = map.len(), "blacklist cache rebuilt");
                *self.blacklist.write() = Arc::new(map);
            }
            Err(e) => warn!(error = %e, "blacklist refresh failed, keeping previous cache"),
        }
    }

    /// Record a ban in the cache without waiting for the next refresh.
    pub fn cache_ban(&self, ip: &str, expires_at: i64) {
        let mut next: HashMap<String, i64> = self.blacklist.read().as_ref().clone();
        next.insert(normalize_ip_key(ip), expires_at);
        *self.blacklist.write() = Arc::new(next);
    }

    /// Drop a ban from the cache.
    pub fn uncache_ban(&self, ip: &str) {
        let mut next: HashMap<String, i64> = self.blacklist.read().as_ref().clone();
        next.remove(&normalize_ip_key(ip));
        *self.blacklist.write() = Arc::new(next);
    }

    /// Whether `ip` has an active blacklist entry.
    pub fn is_blacklisted(&self, ip: &str) -> bool {
        let snapshot = self.blacklist.read().clone();
        match snapshot.get(&normalize_ip_key(ip)) {
            None => false,
            Some(expires_at) => *expires_at == 0 || *expires_at > epoch_now(),
        }
    }

    /// Full admission decision for `client_ip` on `protocol`.
    pub fn allows(&self, protocol: AccessProtocol, client_ip: &IpAddr, ip_str: &str) -> bool {
        let policy = self.policy.read().clone();
        if !policy.enabled_for(protocol) {
            return true;
        }

        if self.is_blacklisted(ip_str) {
            return false;
        }
        if policy.allow_all_public {
            return true;
        }
        if policy.allow_all_lan && is_lan_ip(client_ip) {
            return true;
        }
        policy.whitelist.iter().any(|m| m.matches(client_ip))
    }
}

/// Derive the client IP for logging and admission: first hop of
/// `X-Forwarded-For`, then `X-Real-IP`, then the socket peer.
pub fn client_ip_from_headers(peer: &SocketAddr, headers: &HeaderMap) -> IpAddr {
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<IpAddr>().ok())
    {
        return ip;
    }
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<IpAddr>().ok())
    {
        return ip;
    }
    peer.ip()
}

/// RFC1918, loopback, and link-local sources count as LAN.
pub fn is_lan_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || (o[0] == 169 && o[1] == 254)
        }
        IpAddr::V6(v6) => v6.is_loopback() || is_unique_local_v6(v6) || is_link_local_v6(v6),
    }
}

fn is_unique_local_v6(v6: &std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_link_local_v6(v6: &std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

fn normalize_ip_key(ip: &str) -> String {
    ip.trim().to_ascii_lowercase()
}

fn epoch_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{BlacklistStore, MemoryBlacklistStore};

    fn control(access: AccessConfig) -> AccessControl {
        AccessControl::new(Arc::new(MemoryBlacklistStore::new()), &access)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn lan_detection() {
        assert!(is_lan_ip(&ip("10.1.2.3")));
        assert!(is_lan_ip(&ip("172.16.0.1")));
        assert!(is_lan_ip(&ip("192.168.1.1")));
        assert!(is_lan_ip(&ip("169.254.0.1")));
        assert!(is_lan_ip(&ip("127.0.0.1")));
        assert!(is_lan_ip(&ip("fe80::1")));
        assert!(is_lan_ip(&ip("fd00::1")));
        assert!(!is_lan_ip(&ip("8.8.8.8")));
        assert!(!is_lan_ip(&ip("172.32.0.1")));
    }

    #[test]
    fn lan_allowed_public_denied_by_default() {
        let ac = control(AccessConfig::default());
        assert!(ac.allows(AccessProtocol::Http, &ip("192.168.1.7"), "192.168.1.7"));
        assert!(!ac.allows(AccessProtocol::Http, &ip("8.8.8.8"), "8.8.8.8"));
    }

    #[test]
    fn whitelist_exact_and_cidr() {
        let ac = control(AccessConfig {
            allow_all_lan: false,
            whitelist: vec!["8.8.8.8".into(), "100.64.0.0/10".into()],
            ..AccessConfig::default()
        });

        assert!(ac.allows(AccessProtocol::Http, &ip("8.8.8.8"), "8.8.8.8"));
        assert!(ac.allows(AccessProtocol::Http, &ip("100.64.1.1"), "100.64.1.1"));
        assert!(!ac.allows(AccessProtocol::Http, &ip("8.8.4.4"), "8.8.4.4"));
    }

    #[test]
    fn allow_all_public_still_honors_blacklist() {
        let ac = control(AccessConfig {
            allow_all_public: true,
            ..AccessConfig::default()
        });

        assert!(ac.allows(AccessProtocol::Http, &ip("8.8.8.8"), "8.8.8.8"));
        ac.cache_ban("8.8.8.8", 0);
        assert!(!ac.allows(AccessProtocol::Http, &ip("8.8.8.8"), "8.8.8.8"));
    }

    #[test]
    fn disabled_protocol_admits_everything() {
        let ac = control(AccessConfig {
            stream_enabled: false,
            allow_all_lan: false,
            ..AccessConfig::default()
        });

        assert!(ac.allows(AccessProtocol::Stream, &ip("8.8.8.8"), "8.8.8.8"));
        assert!(!ac.allows(AccessProtocol::Http, &ip("8.8.8.8"), "8.8.8.8"));
    }

    #[tokio::test]
    async fn refresh_pulls_active_entries_from_store() {
        let store = Arc::new(MemoryBlacklistStore::new());
        store.add("9.9.9.9".into(), "test".into(), 0).await.unwrap();

        let ac = AccessControl::new(store, &AccessConfig::default());
        assert!(!ac.is_blacklisted("9.9.9.9"));

        ac.refresh_blacklist().await;
        assert!(ac.is_blacklisted("9.9.9.9"));

        ac.uncache_ban("9.9.9.9");
        assert!(!ac.is_blacklisted("9.9.9.9"));
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let peer: SocketAddr = "203.0.113.5:443".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.7, 10.0.0.1".parse().unwrap());

        assert_eq!(client_ip_from_headers(&peer, &headers), ip("198.51.100.7"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.9".parse().unwrap());
        assert_eq!(client_ip_from_headers(&peer, &headers), ip("198.51.100.9"));

        assert_eq!(client_ip_from_headers(&peer, &HeaderMap::new()), ip("203.0.113.5"));
    }
}
