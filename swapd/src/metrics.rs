use std::time::Duration;

use tracing::info;

use crate::state::SwapState;

pub trait SwapMetrics: Send + Sync {
    fn record_transition(&self, offer_id: &str, from: SwapState, to: SwapState);
    fn record_latency(&self, stage: &'static str, elapsed: Duration);
}

#[derive(Default, Debug, Clone)]
pub struct NoopMetrics;

impl SwapMetrics for NoopMetrics {
    fn record_transition(&self, _offer_id: &str, _from: SwapState, _to: SwapState) {}
    fn record_latency(&self, _stage: &'static str, _elapsed: Duration) {}
}

/// Emits transitions and stage latencies as structured log events.
#[derive(Default, Debug, Clone)]
pub struct TracingMetrics;

impl SwapMetrics for TracingMetrics {
    fn record_transition(&self, offer_id: &str, from: SwapState, to: SwapState) {
        info!(offer_id, ?from, ?to, "swap transition");
    }

    fn record_latency(&self, stage: &'static str, elapsed: Duration) {
        info!(stage, elapsed_ms = elapsed.as_millis() as u64, "stage latency");
    }
}
