//! Scanner module containing target enumeration and the probe pipeline

pub mod engine;
pub mod targets;

use serde::{Deserialize, Serialize};

pub use engine::{ScanEngine, ScanStream};

/// Outcome of probing one resolver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Address that was probed
    pub target: String,

    /// Whether the resolver answered in a way that suggests a live tunnel
    pub ok: bool,

    /// Human-readable status, e.g. `OK (Resolved)` or `TIMEOUT`
    pub detail: String,

    /// Round-trip time in milliseconds, -1 when no timing was taken
    pub elapsed_ms: i64,
}

impl ScanResult {
    pub fn new(target: impl Into<String>, ok: bool, detail: impl Into<String>, elapsed_ms: i64) -> Self {
        Self {
            target: target.into(),
            ok,
            detail: detail.into(),
            elapsed_ms,
        }
    }

    /// Elapsed time for display, `-` when none was recorded
    pub fn elapsed_display(&self) -> String {
        if self.elapsed_ms < 0 {
            "-".to_string()
        } else {
            self.elapsed_ms.to_string()
        }
    }
}

/// Counters over a whole run, updated only by the orchestrator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    /// Expected number of scan results
    pub scan_total: u64,

    /// Scan results seen so far
    pub scan_done: u64,

    /// Responsive resolvers
    pub scan_ok: u64,

    /// Unresponsive or refusing resolvers
    pub scan_fail: u64,

    /// Targets handed to the real-test queue
    pub rt_enqueued: u64,

    /// Real tests finished
    pub rt_done: u64,

    /// Real tests that carried traffic end to end
    pub rt_ok: u64,

    /// Real tests that failed
    pub rt_fail: u64,
}

impl Counters {
    /// Real tests still queued or running in live mode
    pub fn rt_pending(&self) -> u64 {
        self.rt_enqueued.saturating_sub(self.rt_done)
    }
}
