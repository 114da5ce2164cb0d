//! Run events emitted by the pipelines
//!
//! Both pipelines report progress through one unbounded event channel so
//! terminal rendering stays out of the hot path. Sends are fire and
//! forget: a dropped receiver never stalls a worker.

use crate::realtest::RealTestResult;
use crate::scanner::{Counters, ScanResult};
use tokio::sync::mpsc;

/// Progress events for one run
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// The run started and the total is known
    Started { total: u64, workers: usize },

    /// One scan probe finished
    Scan(ScanResult),

    /// A real test is starting for this target
    RealTestStarted { target: String },

    /// One real test finished
    RealTest(RealTestResult),

    /// The scan finished with real tests still queued
    DrainStarted { pending: u64 },

    /// The whole run finished
    Finished(Counters),
}

pub type EventSender = mpsc::UnboundedSender<ScanEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ScanEvent>;

/// Create the event channel for one run
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
