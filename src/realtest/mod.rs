//! Real testing: prove a resolver carries actual tunnel traffic
//!
//! DNS probes find resolvers that talk; real tests find resolvers that
//! work. The orchestrator consumes the scan result stream, forwards
//! responsive resolvers by mode (live workers during the scan, or a batch
//! once it ends) and runs each candidate through a full client round trip
//! via [`run_one`].

pub mod harness;
pub mod socks;

use crate::config::{RealTestConfig, ScanConfig};
use crate::events::{EventSender, ScanEvent};
use crate::output::OutputWriters;
use crate::scanner::{Counters, ScanResult, ScanStream};
use harness::TransportProcess;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Poll interval for result and queue polling
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Sleep between empty polls while draining
const IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Max real-test results folded in between two scan results
const LIVE_DRAIN_BATCH: usize = 600;

/// Max real-test results folded in per iteration of the final drain
const FINAL_DRAIN_BATCH: usize = 1200;

/// When responsive resolvers get real-tested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealTestMode {
    /// Never
    #[default]
    Off,
    /// Sequentially, after the scan finishes
    End,
    /// Concurrently with the scan, on a worker pool
    Live,
}

impl FromStr for RealTestMode {
    type Err = crate::ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(RealTestMode::Off),
            "end" => Ok(RealTestMode::End),
            "live" => Ok(RealTestMode::Live),
            other => Err(crate::ScanError::ConfigError(format!(
                "Unknown realtest mode: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for RealTestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealTestMode::Off => write!(f, "off"),
            RealTestMode::End => write!(f, "end"),
            RealTestMode::Live => write!(f, "live"),
        }
    }
}

/// Outcome of one real test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealTestResult {
    /// Resolver that was tested
    pub target: String,

    /// Status label: a round-trip time like `311 ms`, or a failure like
    /// `READY TIMEOUT`
    pub status: String,

    /// Round-trip time in milliseconds, -1 on failure
    pub elapsed_ms: i64,
}

impl RealTestResult {
    fn miss(target: &str, status: &str) -> Self {
        Self {
            target: target.to_string(),
            status: status.to_string(),
            elapsed_ms: -1,
        }
    }

    /// A real test passes exactly when its status carries a round-trip time
    pub fn passed(&self) -> bool {
        self.status.ends_with(" ms")
    }

    /// Elapsed time for display, `-` on failure
    pub fn elapsed_display(&self) -> String {
        if self.elapsed_ms < 0 {
            "-".to_string()
        } else {
            self.elapsed_ms.to_string()
        }
    }
}

/// Run one complete real test against a resolver.
///
/// Picks a fresh ephemeral port, spawns the slipstream client against the
/// resolver, waits for readiness, runs the SOCKS5 verification and always
/// tears the client down before reporting.
pub async fn run_one(target: &str, domain: &str, rt: &RealTestConfig) -> RealTestResult {
    let port = match harness::free_port().await {
        Ok(port) => port,
        Err(e) => {
            log::debug!("No free port for real test of {}: {}", target, e);
            return RealTestResult::miss(target, "ERROR");
        }
    };

    let proc = match TransportProcess::spawn(&rt.binary_path, target, domain, port).await {
        Ok(proc) => proc,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return RealTestResult::miss(target, "SLIPSTREAM NOT FOUND");
        }
        Err(e) => {
            log::debug!("Client spawn for {} failed: {}", target, e);
            return RealTestResult::miss(target, "ERROR");
        }
    };

    let result = if proc.wait_ready(rt.ready_wait()).await {
        let (ms, status) = socks::validate(
            proc.port(),
            rt.attempt_timeout(),
            socks::PROBE_HOST,
            socks::PROBE_PORT,
        )
        .await;
        RealTestResult {
            target: target.to_string(),
            status,
            elapsed_ms: ms,
        }
    } else {
        RealTestResult::miss(target, "READY TIMEOUT")
    };

    proc.shutdown().await;
    result
}

/// Real-test a fixed list of addresses one at a time
pub async fn run_sequential(
    targets: &[String],
    domain: &str,
    rt: &RealTestConfig,
    events: &EventSender,
    outputs: &mut OutputWriters,
) -> crate::Result<Counters> {
    let mut counters = Counters::default();
    let _ = events.send(ScanEvent::Started {
        total: targets.len() as u64,
        workers: 1,
    });

    for target in targets {
        let _ = events.send(ScanEvent::RealTestStarted {
            target: target.clone(),
        });
        counters.rt_enqueued += 1;
        let result = run_one(target, domain, rt).await;
        record_result(&mut counters, outputs, events, result)?;
    }

    let _ = events.send(ScanEvent::Finished(counters.clone()));
    Ok(counters)
}

fn record_result(
    counters: &mut Counters,
    outputs: &mut OutputWriters,
    events: &EventSender,
    result: RealTestResult,
) -> crate::Result<()> {
    counters.rt_done += 1;
    if result.passed() {
        counters.rt_ok += 1;
        outputs.write_realtest_ok(&result.target, result.elapsed_ms)?;
    } else {
        counters.rt_fail += 1;
    }
    let _ = events.send(ScanEvent::RealTest(result));
    Ok(())
}

/// Drives a whole run: consumes the scan stream, keeps the counters,
/// writes hit files and feeds the real-test side according to the mode.
pub struct Orchestrator {
    config: ScanConfig,
    events: EventSender,
    outputs: OutputWriters,
    counters: Counters,
    seen: HashSet<String>,
    end_queue: Vec<String>,
    rt_in: Option<mpsc::UnboundedSender<String>>,
    rt_out: Option<mpsc::UnboundedReceiver<RealTestResult>>,
    rt_stop: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: ScanConfig, events: EventSender, outputs: OutputWriters) -> Self {
        Self {
            config,
            events,
            outputs,
            counters: Counters::default(),
            seen: HashSet::new(),
            end_queue: Vec::new(),
            rt_in: None,
            rt_out: None,
            rt_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Consume the scan stream to completion, then settle the real-test
    /// side according to the mode.
    pub async fn run(mut self, mut stream: ScanStream) -> crate::Result<Counters> {
        self.counters.scan_total = stream.total;
        let cancel = stream.cancel_token();
        let _ = self.events.send(ScanEvent::Started {
            total: stream.total,
            workers: stream.workers,
        });

        if self.config.realtest.mode == RealTestMode::Live {
            self.spawn_live_workers();
        }

        while self.counters.scan_done < self.counters.scan_total {
            self.drain_ready(LIVE_DRAIN_BATCH)?;
            match timeout(POLL_INTERVAL, stream.recv()).await {
                Ok(Some(result)) => self.on_scan_result(result)?,
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        if cancel.is_cancelled() {
            // Flush results that already finished, then stop the workers
            self.drain_ready(usize::MAX)?;
            self.stop_live_workers();
        } else {
            match self.config.realtest.mode {
                RealTestMode::Live => self.drain_live().await?,
                RealTestMode::End => self.run_end_queue(&cancel).await?,
                RealTestMode::Off => {}
            }
        }

        let _ = self.events.send(ScanEvent::Finished(self.counters.clone()));
        Ok(self.counters)
    }

    fn on_scan_result(&mut self, result: ScanResult) -> crate::Result<()> {
        self.counters.scan_done += 1;
        if result.ok {
            self.counters.scan_ok += 1;
            self.outputs.write_scan_ok(&result.target)?;
            if self.admits(&result) {
                self.forward(result.target.clone());
            }
        } else {
            self.counters.scan_fail += 1;
        }
        let _ = self.events.send(ScanEvent::Scan(result));
        Ok(())
    }

    /// Forwarding filter: each address is considered once, and a latency
    /// ceiling may apply. An address rejected once is never retried.
    fn admits(&mut self, result: &ScanResult) -> bool {
        if self.config.realtest.mode == RealTestMode::Off {
            return false;
        }
        if !self.seen.insert(result.target.clone()) {
            return false;
        }
        match self.config.realtest.ms_max {
            None => true,
            Some(ceiling) => result.elapsed_ms >= 0 && result.elapsed_ms < ceiling,
        }
    }

    fn forward(&mut self, target: String) {
        match self.config.realtest.mode {
            RealTestMode::End => self.end_queue.push(target),
            RealTestMode::Live => {
                if let Some(tx) = &self.rt_in {
                    if tx.send(target).is_ok() {
                        self.counters.rt_enqueued += 1;
                    }
                }
            }
            RealTestMode::Off => {}
        }
    }

    /// Fold in any real-test results that are already waiting, up to
    /// `limit` of them, without blocking.
    fn drain_ready(&mut self, limit: usize) -> crate::Result<bool> {
        let mut drained = false;
        for _ in 0..limit {
            let result = match self.rt_out.as_mut().and_then(|rx| rx.try_recv().ok()) {
                Some(result) => result,
                None => break,
            };
            self.record_realtest(result)?;
            drained = true;
        }
        Ok(drained)
    }

    fn record_realtest(&mut self, result: RealTestResult) -> crate::Result<()> {
        record_result(&mut self.counters, &mut self.outputs, &self.events, result)
    }

    /// Wait out the live queue after the scan: results keep folding in
    /// until everything enqueued is done or the drain deadline passes.
    async fn drain_live(&mut self) -> crate::Result<()> {
        let _ = self.events.send(ScanEvent::DrainStarted {
            pending: self.counters.rt_pending(),
        });
        // No more work is coming; closing the queue lets idle workers exit
        self.rt_in.take();

        let deadline = Instant::now() + self.config.realtest.drain_deadline();
        loop {
            let drained = self.drain_ready(FINAL_DRAIN_BATCH)?;
            if self.counters.rt_done >= self.counters.rt_enqueued {
                break;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "Drain deadline reached with {} real tests unfinished",
                    self.counters.rt_pending()
                );
                break;
            }
            if !drained {
                sleep(IDLE_SLEEP).await;
            }
        }

        self.rt_stop.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_end_queue(&mut self, cancel: &CancellationToken) -> crate::Result<()> {
        let targets = std::mem::take(&mut self.end_queue);
        for target in targets {
            if cancel.is_cancelled() {
                break;
            }
            let _ = self.events.send(ScanEvent::RealTestStarted {
                target: target.clone(),
            });
            self.counters.rt_enqueued += 1;
            let result = run_one(&target, &self.config.domain, &self.config.realtest).await;
            self.record_realtest(result)?;
        }
        Ok(())
    }

    fn spawn_live_workers(&mut self) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let in_rx = Arc::new(Mutex::new(in_rx));

        for id in 0..self.config.realtest.parallel {
            tokio::spawn(live_worker(
                id,
                in_rx.clone(),
                out_tx.clone(),
                self.config.domain.clone(),
                self.config.realtest.clone(),
                self.events.clone(),
                self.rt_stop.clone(),
            ));
        }

        self.rt_in = Some(in_tx);
        self.rt_out = Some(out_rx);
    }

    fn stop_live_workers(&mut self) {
        self.rt_stop.store(true, Ordering::SeqCst);
        self.rt_in.take();
    }
}

async fn live_worker(
    id: usize,
    input: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    output: mpsc::UnboundedSender<RealTestResult>,
    domain: String,
    rt: RealTestConfig,
    events: EventSender,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        let pulled = timeout(POLL_INTERVAL, async { input.lock().await.recv().await }).await;
        match pulled {
            Ok(Some(target)) => {
                let _ = events.send(ScanEvent::RealTestStarted {
                    target: target.clone(),
                });
                let result = run_one(&target, &domain, &rt).await;
                if output.send(result).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    log::debug!("Real test worker {} exiting", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::output::RealTestFormat;

    fn test_orchestrator(mode: RealTestMode, ms_max: Option<i64>) -> Orchestrator {
        let (events, rx) = events::channel();
        std::mem::forget(rx); // keep event sends succeeding
        let mut config = ScanConfig::new("t.example.com");
        config.realtest.mode = mode;
        config.realtest.ms_max = ms_max;
        let outputs = OutputWriters::new(None, None, RealTestFormat::Ip).unwrap();
        Orchestrator::new(config, events, outputs)
    }

    fn hit(target: &str, elapsed_ms: i64) -> ScanResult {
        ScanResult::new(target, true, "OK (Resolved)", elapsed_ms)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("off".parse::<RealTestMode>().unwrap(), RealTestMode::Off);
        assert_eq!("End".parse::<RealTestMode>().unwrap(), RealTestMode::End);
        assert_eq!("LIVE".parse::<RealTestMode>().unwrap(), RealTestMode::Live);
        assert!("sometimes".parse::<RealTestMode>().is_err());
    }

    #[test]
    fn test_passed_matches_status_shape() {
        let pass = RealTestResult {
            target: "1.1.1.1".to_string(),
            status: "311 ms".to_string(),
            elapsed_ms: 311,
        };
        assert!(pass.passed());

        for status in ["READY TIMEOUT", "SOCKS FAIL", "TIMEOUT", "ERROR"] {
            assert!(!RealTestResult::miss("1.1.1.1", status).passed());
        }
    }

    #[test]
    fn test_admits_dedups() {
        let mut orch = test_orchestrator(RealTestMode::End, None);
        assert!(orch.admits(&hit("1.1.1.1", 40)));
        assert!(!orch.admits(&hit("1.1.1.1", 40)));
        assert!(orch.admits(&hit("1.0.0.1", 40)));
    }

    #[test]
    fn test_admits_latency_ceiling() {
        let mut orch = test_orchestrator(RealTestMode::End, Some(500));
        assert!(orch.admits(&hit("1.1.1.1", 499)));
        assert!(!orch.admits(&hit("2.2.2.2", 500)));
        assert!(!orch.admits(&hit("3.3.3.3", -1)));

        // A rejected address is burned, not retried
        assert!(!orch.admits(&hit("2.2.2.2", 10)));
    }

    #[test]
    fn test_admits_off_mode_forwards_nothing() {
        let mut orch = test_orchestrator(RealTestMode::Off, None);
        assert!(!orch.admits(&hit("1.1.1.1", 40)));
    }

    #[test]
    fn test_on_scan_result_queues_for_end_mode() {
        let mut orch = test_orchestrator(RealTestMode::End, None);
        orch.on_scan_result(hit("1.1.1.1", 40)).unwrap();
        orch.on_scan_result(hit("1.1.1.1", 45)).unwrap();
        orch.on_scan_result(ScanResult::new("10.0.0.1", false, "TIMEOUT", -1))
            .unwrap();

        assert_eq!(orch.counters.scan_done, 3);
        assert_eq!(orch.counters.scan_ok, 2);
        assert_eq!(orch.counters.scan_fail, 1);
        assert_eq!(orch.end_queue, vec!["1.1.1.1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_live_stops_at_deadline() {
        let mut orch = test_orchestrator(RealTestMode::Live, None);
        orch.config.realtest.drain_timeout_s = 0.0; // floored to 5s

        let (in_tx, _in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        orch.rt_in = Some(in_tx);
        orch.rt_out = Some(out_rx);

        // Three enqueued, only two results ever arrive
        orch.counters.rt_enqueued = 3;
        out_tx
            .send(RealTestResult {
                target: "1.1.1.1".to_string(),
                status: "42 ms".to_string(),
                elapsed_ms: 42,
            })
            .unwrap();
        out_tx.send(RealTestResult::miss("2.2.2.2", "SOCKS FAIL")).unwrap();

        orch.drain_live().await.unwrap();

        assert_eq!(orch.counters.rt_done, 2);
        assert_eq!(orch.counters.rt_ok, 1);
        assert_eq!(orch.counters.rt_fail, 1);
        assert!(orch.rt_stop.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_live_finishes_early_when_all_done() {
        let mut orch = test_orchestrator(RealTestMode::Live, None);

        let (in_tx, _in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        orch.rt_in = Some(in_tx);
        orch.rt_out = Some(out_rx);

        orch.counters.rt_enqueued = 2;
        out_tx.send(RealTestResult::miss("1.1.1.1", "TIMEOUT")).unwrap();
        out_tx.send(RealTestResult::miss("2.2.2.2", "TIMEOUT")).unwrap();

        let started = Instant::now();
        orch.drain_live().await.unwrap();

        assert_eq!(orch.counters.rt_done, 2);
        // Finishing the queue must beat the 5s deadline floor
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_one_reports_missing_client() {
        let mut rt = RealTestConfig::default();
        rt.binary_path = "definitely-not-a-slipstream-client".to_string();
        rt.ready_ms = 200;

        let result = run_one("192.0.2.1", "t.example.com", &rt).await;
        assert_eq!(result.status, "SLIPSTREAM NOT FOUND");
        assert_eq!(result.elapsed_ms, -1);
        assert!(!result.passed());
    }
}
