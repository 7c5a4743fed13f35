//! Logging and metrics conventions shared by the router and KVS engine
//! (SPEC_FULL.md §4.7). Grounded on the teacher's `observability.rs` and its
//! `MetricsCollector` trait: counters are recorded as `tracing` fields rather
//! than shipped to a separate metrics backend, keeping the core
//! transport-agnostic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters a broker process exposes for operational visibility.
pub trait Metrics: Send + Sync {
    /// Total requests/responses/events the router has processed.
    fn messages_routed(&self) -> u64;
    /// Records one more message having passed through the router loop.
    fn record_message_routed(&self);
    /// Records a KVS `load` having stalled on a missing blob.
    fn record_kvs_stall(&self);
    /// Records the current depth of a non-root rank's writeback queue.
    fn record_writeback_depth(&self, depth: usize);
}

/// Default [`Metrics`] implementation: in-memory counters, surfaced through
/// `tracing` events rather than polled externally.
#[derive(Default)]
pub struct TracingMetrics {
    messages_routed: AtomicU64,
    kvs_stalls: AtomicU64,
}

impl Metrics for TracingMetrics {
    fn messages_routed(&self) -> u64 {
        self.messages_routed.load(Ordering::Relaxed)
    }

    fn record_message_routed(&self) {
        let total = self.messages_routed.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(messages_routed = total, "message routed");
    }

    fn record_kvs_stall(&self) {
        let total = self.kvs_stalls.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(kvs_stalls = total, "kvs load stalled");
    }

    fn record_writeback_depth(&self, depth: usize) {
        tracing::debug!(writeback_depth = depth, "writeback queue depth");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = TracingMetrics::default();
        metrics.record_message_routed();
        metrics.record_message_routed();
        assert_eq!(metrics.messages_routed(), 2);
    }
}
