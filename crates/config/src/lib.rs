//! Configuration model, loading, and validation for the Portico proxy.
//!
//! The flow is: deserialize the TOML document ([`load`]) → normalize and
//! check it ([`validate`]) → publish the resulting [`Config`] as an
//! immutable snapshot. Everything downstream of the validator assumes
//! defaults are resolved and invariants hold.

pub mod addr;
pub mod load;
pub mod model;
pub mod validate;

pub use addr::{parse_listen_addr, AddrParseError, ListenAddr};
pub use load::{default_config_path, load, save};
pub use model::{
    AccessConfig, BasicAuth, BodyReplace, BrotliConfig, Compression, Config, GzipConfig,
    HttpRoute, HttpRule, Limits, RateLimit, StreamConfig, StreamMember, StreamProtocol,
    StreamServer, StreamUpstream, TlsConfig, Upstream, UrlRewrite, WsRoute, WsRule,
};
pub use validate::{validate, ValidationError};
