//! Scan engine: streams targets through a bounded queue into probe workers
//!
//! A blocking producer walks the target source (expanding CIDR blocks as it
//! goes, so a `/8` never has to exist in memory) and feeds a bounded queue.
//! Async workers pull from the queue, probe, and push results onto an
//! unbounded stream for the caller to consume.

use crate::config::ScanConfig;
use crate::probe;
use crate::scanner::targets::{self, Expansion, TargetStream};
use crate::scanner::ScanResult;
use crate::utils::file_input::TokenSource;
use crate::ScanError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Bound on the in-flight target queue
const QUEUE_CAPACITY: usize = 10_000;

/// Poll interval for queue reads
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Backoff while the target queue is full
const PUSH_RETRY: Duration = Duration::from_millis(50);

/// Launches scans from a config and a target source
pub struct ScanEngine {
    config: ScanConfig,
}

/// A scan in progress, consumed as a stream of results
#[derive(Debug)]
pub struct ScanStream {
    /// Number of probes this scan will send
    pub total: u64,

    /// Probe workers running
    pub workers: usize,

    results: mpsc::UnboundedReceiver<ScanResult>,
    cancel: CancellationToken,
}

impl ScanStream {
    /// Next result, `None` once every worker has finished
    pub async fn recv(&mut self) -> Option<ScanResult> {
        self.results.recv().await
    }

    /// Token that stops target production when cancelled. Probes already
    /// queued still run to completion.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl ScanEngine {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Validate, size and launch a scan over `source`.
    ///
    /// The source is walked twice: once to count targets up front, once to
    /// stream them into the queue.
    pub fn start(&self, source: &TokenSource) -> crate::Result<ScanStream> {
        self.config.validate()?;

        let has_plain = targets::source_has_plain_ip(source.line_iter()?);
        let expansion = Expansion::resolve(self.config.random_per_cidr, has_plain);
        if self.config.random_per_cidr > 0 && has_plain {
            log::info!("Plain addresses present, scanning CIDR blocks in full");
        }

        let total = targets::count_targets(source.line_iter()?, expansion);
        if total == 0 {
            return Err(ScanError::NoTargets);
        }

        let workers = self.config.threads.min(total as usize).max(1);
        let cancel = CancellationToken::new();

        let (work_tx, work_rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::unbounded_channel::<ScanResult>();
        let work_rx = Arc::new(Mutex::new(work_rx));

        let lines = source.line_iter()?;
        let producer_cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            produce(lines, expansion, work_tx, producer_cancel);
        });

        for _ in 0..workers {
            tokio::spawn(scan_worker(
                work_rx.clone(),
                out_tx.clone(),
                self.config.domain.clone(),
                self.config.timeout_ms,
            ));
        }

        Ok(ScanStream {
            total,
            workers,
            results: out_rx,
            cancel,
        })
    }
}

/// Walk the target stream into the queue, backing off while it is full.
/// Dropping the sender on return is what tells the workers to finish.
fn produce(
    lines: Box<dyn Iterator<Item = String> + Send>,
    expansion: Expansion,
    queue: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let stream = TargetStream::new(lines, expansion, cancel.clone());
    for target in stream {
        let mut pending = target;
        loop {
            match queue.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    pending = back;
                    std::thread::sleep(PUSH_RETRY);
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

async fn scan_worker(
    queue: Arc<Mutex<mpsc::Receiver<String>>>,
    out: mpsc::UnboundedSender<ScanResult>,
    domain: String,
    timeout_ms: u64,
) {
    loop {
        let pulled = timeout(POLL_INTERVAL, async { queue.lock().await.recv().await }).await;
        match pulled {
            Ok(Some(target)) => {
                let outcome = probe::probe(&target, &domain, timeout_ms).await;
                let result =
                    ScanResult::new(target, outcome.ok, outcome.detail, outcome.elapsed_ms);
                if out.send(result).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(_) => continue,
        }
    }
}
