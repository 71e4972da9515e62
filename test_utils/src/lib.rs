use std::sync::Arc;

use cache_flush::backend::Collect;
use cache_flush::region::AlwaysOpen;
use log_mgr::forward::CollectSink;
use log_mgr::{Config, FlushPolicy, LogMgr};

/// Log manager wired to collecting fakes so tests can assert on the emitted
/// flush instruction stream and the forwarded ranges.
pub fn collecting_log_mgr(
    policy: FlushPolicy,
) -> (Arc<LogMgr<Collect, AlwaysOpen>>, Collect, CollectSink) {
    let backend = Collect::default();
    let sink = CollectSink::default();
    let mut config = Config::new();
    config.flush_policy = policy;
    let mgr = LogMgr::with_parts(
        config,
        backend.clone(),
        AlwaysOpen,
        Some(Box::new(sink.clone())),
    )
    .expect("failed to build test log manager");
    (mgr, backend, sink)
}
