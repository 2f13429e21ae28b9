//! Shared primitives for the Portico proxy.
//!
//! This crate holds the small building blocks used across the config and
//! engine crates:
//!
//! - **Typed identifiers**: newtypes preventing rule/route id mix-ups
//! - **Passive failure tracking**: time-bounded exclusion of failing upstreams
//! - **Bounded tables**: LRU-evicting maps for per-client state
//! - **Duration parsing**: human-friendly timeout strings (`10s`, `5m`, `1h`)

pub mod duration;
pub mod failure;
pub mod ids;
pub mod lru;

pub use duration::parse_duration;
pub use failure::FailureTracker;
pub use ids::{RouteId, RuleId};
pub use lru::BoundedTable;
