//! Engine configuration.
//!
//! Every knob has a serde default, so an empty table (or `EngineConfig::default()`)
//! gives the stock behavior.

use std::time::Duration;

use serde::Deserialize;

/// Tunables for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Display frame interval for batched commits, in milliseconds.
    #[serde(default = "EngineConfig::default_frame_interval")]
    pub frame_interval_ms: u64,

    /// How often the staleness check runs, in milliseconds.
    #[serde(default = "EngineConfig::default_staleness_interval")]
    pub staleness_check_interval_ms: u64,

    /// Silence longer than this triggers a health probe, in milliseconds.
    #[serde(default = "EngineConfig::default_staleness_threshold")]
    pub staleness_threshold_ms: u64,

    /// Upper bound of the random jitter added to every reconnect delay.
    #[serde(default = "EngineConfig::default_jitter")]
    pub reconnect_jitter_ms: u64,

    /// Debounce before refreshing the session list after a completion.
    #[serde(default = "EngineConfig::default_refresh_debounce")]
    pub refresh_debounce_ms: u64,

    /// Characters an assistant snapshot may lose before it is treated as stale.
    #[serde(default = "EngineConfig::default_shrink_tolerance")]
    pub shrink_tolerance: usize,

    /// Raise `EmptyResponse` for completed assistant messages with no content.
    #[serde(default)]
    pub detect_empty_responses: bool,

    /// Complete deferred native messages after this long without a follow-up
    /// event. `None` waits indefinitely.
    #[serde(default)]
    pub native_completion_fallback_ms: Option<u64>,

    /// How many completed message ids are remembered for deduplication.
    #[serde(default = "EngineConfig::default_completed_capacity")]
    pub completed_ids_capacity: usize,

    /// How many ids are dropped at once when the completed set overflows.
    #[serde(default = "EngineConfig::default_completed_evict")]
    pub completed_ids_evict: usize,
}

impl EngineConfig {
    const fn default_frame_interval() -> u64 {
        16
    }

    const fn default_staleness_interval() -> u64 {
        10_000
    }

    const fn default_staleness_threshold() -> u64 {
        25_000
    }

    const fn default_jitter() -> u64 {
        250
    }

    const fn default_refresh_debounce() -> u64 {
        500
    }

    const fn default_shrink_tolerance() -> usize {
        50
    }

    const fn default_completed_capacity() -> usize {
        1000
    }

    const fn default_completed_evict() -> usize {
        200
    }

    /// Frame interval as a `Duration`.
    #[must_use]
    pub const fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Staleness check period as a `Duration`.
    #[must_use]
    pub const fn staleness_check_interval(&self) -> Duration {
        Duration::from_millis(self.staleness_check_interval_ms)
    }

    /// Staleness threshold as a `Duration`.
    #[must_use]
    pub const fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    /// Refresh debounce as a `Duration`.
    ///
    /// Never shorter than 500 ms.
    #[must_use]
    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms.max(500))
    }

    /// Native completion fallback as a `Duration`, if enabled.
    #[must_use]
    pub fn native_completion_fallback(&self) -> Option<Duration> {
        self.native_completion_fallback_ms.map(Duration::from_millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: Self::default_frame_interval(),
            staleness_check_interval_ms: Self::default_staleness_interval(),
            staleness_threshold_ms: Self::default_staleness_threshold(),
            reconnect_jitter_ms: Self::default_jitter(),
            refresh_debounce_ms: Self::default_refresh_debounce(),
            shrink_tolerance: Self::default_shrink_tolerance(),
            detect_empty_responses: false,
            native_completion_fallback_ms: None,
            completed_ids_capacity: Self::default_completed_capacity(),
            completed_ids_evict: Self::default_completed_evict(),
        }
    }
}
