//! Engine assembly.

use std::sync::Arc;

use portico_config::Config;

use crate::access::AccessControl;
use crate::context::EngineCtx;
use crate::events::EventBus;
use crate::observe::Observer;
use crate::runtime::Supervisor;
use crate::sink::{SharedBlacklistStore, SharedRecordSink};
use crate::upstream::pool::UpstreamPool;
use crate::upstream::Selector;

/// Wire the shared components and return a supervisor over `snapshot`.
///
/// The embedding shell supplies the persistence (`sink`, `store`); headless
/// runs pass the in-memory implementations.
pub fn build(
    snapshot: Arc<Config>,
    sink: SharedRecordSink,
    store: SharedBlacklistStore,
) -> Arc<Supervisor> {
    let events = EventBus::default();
    let observer = Observer::new(sink, events.clone());

    let ctx = Arc::new(EngineCtx {
        access: Arc::new(AccessControl::new(store.clone(), &snapshot.access)),
        selector: Arc::new(Selector::new()),
        pool: Arc::new(UpstreamPool::new(&snapshot.limits)),
        observer,
        blacklist: store,
        events,
    });

    Supervisor::new(ctx, snapshot)
}
