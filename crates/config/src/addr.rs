//! Listen-address parsing.
//!
//! Rules may bind full socket addresses (`"192.168.1.5:8443"`, `"[::]:80"`)
//! or the `":port"` wildcard shorthand. The shorthand prefers the IPv6
//! wildcard because on most platforms `[::]` accepts IPv4 traffic too
//! (dual-stack); if the host cannot parse it, the IPv4 wildcard is used.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid listen address `{0}`")]
pub struct AddrParseError(pub String);

/// A parsed listen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddr {
    pub addr: SocketAddr,
    /// True when the address came from the `":port"` shorthand and is
    /// expected to accept both address families.
    pub dual_stack: bool,
}

/// Parse a configured listen address.
pub fn parse_listen_addr(s: &str) -> Result<ListenAddr, AddrParseError> {
    let trimmed = s.trim();

    if let Some(port) = trimmed.strip_prefix(':') {
        let v6 = format!("[::]:{port}");
        if let Ok(addr) = v6.parse::<SocketAddr>() {
            return Ok(ListenAddr {
                addr,
                dual_stack: true,
            });
        }
        let v4 = format!("0.0.0.0:{port}");
        return v4
            .parse::<SocketAddr>()
            .map(|addr| ListenAddr {
                addr,
                dual_stack: true,
            })
            .map_err(|_| AddrParseError(s.to_string()));
    }

    trimmed
        .parse::<SocketAddr>()
        .map(|addr| ListenAddr {
            addr,
            dual_stack: false,
        })
        .map_err(|_| AddrParseError(s.to_string()))
}
