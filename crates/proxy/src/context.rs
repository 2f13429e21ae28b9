//! Shared engine context.

use std::sync::Arc;

use crate::access::AccessControl;
use crate::events::EventBus;
use crate::observe::Observer;
use crate::sink::SharedBlacklistStore;
use crate::upstream::pool::UpstreamPool;
use crate::upstream::Selector;

/// Handles every listener shares: access control, upstream selection and
/// pooling, observation, blacklist persistence, and the event channel.
///
/// One instance lives for the life of the engine; config swaps mutate the
/// components in place (they each hold snapshot state internally).
pub struct EngineCtx {
    pub access: Arc<AccessControl>,
    pub selector: Arc<Selector>,
    pub pool: Arc<UpstreamPool>,
    pub observer: Arc<Observer>,
    pub blacklist: SharedBlacklistStore,
    pub events: EventBus,
}
