use serde::{Deserialize, Serialize};

/// Scheduler (Sc) policy (§4.9). These knobs govern the spec's
/// authoritative execution-failure state machine; the richer digest/fetch
/// backoff (`cooldown_minutes` on individual schedules) is a separate,
/// additive concern — see SPEC_FULL.md §4.9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Ring buffer size for recent scheduler errors.
    #[serde(default = "d_ring_buffer_size")]
    pub ring_buffer_size: usize,
    /// Delay before the single retry after a first consecutive failure.
    #[serde(default = "d_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Consecutive failures before a job is auto-disabled.
    #[serde(default = "d_disable_after_failures")]
    pub disable_after_failures: u32,
    /// Tick interval for the scheduler's evaluation loop.
    #[serde(default = "d_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size: d_ring_buffer_size(),
            retry_delay_secs: d_retry_delay_secs(),
            disable_after_failures: d_disable_after_failures(),
            tick_interval_secs: d_tick_interval_secs(),
        }
    }
}

fn d_ring_buffer_size() -> usize {
    20
}
fn d_retry_delay_secs() -> u64 {
    60
}
fn d_disable_after_failures() -> u32 {
    3
}
fn d_tick_interval_secs() -> u64 {
    30
}
