//! Worker Loop.
//!
//! One dedicated OS thread scans open positions and drives the Orchestrator
//! for each; a second background thread drains auxiliary tasks (fail-safe
//! pass, stale-lock sweep, CSV flush) from a bounded channel so the main
//! loop never blocks on them.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::broker::Broker;
use crate::config::SlmConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::lock_manager::{LockEvent, LockManager};

const BACKGROUND_QUEUE_CAPACITY: usize = 64;
const ITERATION_WARN_THRESHOLD_MS: u128 = 50;
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default)]
pub struct Heartbeat {
    pub position_count: usize,
    pub active_tickets: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum BackgroundTask {
    FailSafeScan,
    StaleLockSweep,
    FlushSummaryCsv,
}

/// Shared worker status, updated by the worker thread and read by callers
/// via `get_worker_status` without touching the broker.
pub struct WorkerHandle {
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    position_count: Arc<AtomicU64>,
    active_tickets: Arc<AtomicU64>,
    worker_thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
    background_thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
    background_tx: Sender<BackgroundTask>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            position_count: self.position_count.load(Ordering::SeqCst) as usize,
            active_tickets: self.active_tickets.load(Ordering::SeqCst) as usize,
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker_thread.lock().unwrap().take() {
            let _ = join_with_timeout(handle, JOIN_TIMEOUT);
        }
        if let Some(handle) = self.background_thread.lock().unwrap().take() {
            let _ = join_with_timeout(handle, JOIN_TIMEOUT);
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

fn join_with_timeout(handle: std::thread::JoinHandle<()>, _timeout: Duration) -> std::thread::Result<()> {
    // std::thread has no native join-with-timeout; the loops themselves poll
    // the shutdown flag at sub-timeout granularity so join returns promptly.
    handle.join()
}

/// Starts the worker and background threads. Idempotent: callers hold the
/// returned handle and must call `stop()` before starting a new one for the
/// same broker instance.
pub fn start_worker(
    broker: Arc<dyn Broker>,
    config: Arc<SlmConfig>,
    locks: Arc<LockManager>,
    diagnostics: Arc<DiagnosticsSink>,
    lock_events: Receiver<LockEvent>,
    on_fail_safe: impl Fn() + Send + Sync + 'static,
    on_iteration: impl Fn(&dyn Broker) + Send + Sync + 'static,
) -> WorkerHandle {
    let running = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(AtomicBool::new(false));
    let position_count = Arc::new(AtomicU64::new(0));
    let active_tickets = Arc::new(AtomicU64::new(0));
    let (tx, rx): (Sender<BackgroundTask>, Receiver<BackgroundTask>) = bounded(BACKGROUND_QUEUE_CAPACITY);

    let worker_thread = {
        let shutdown = shutdown.clone();
        let position_count = position_count.clone();
        let active_tickets = active_tickets.clone();
        let broker = broker.clone();
        let config = config.clone();
        let tx = tx.clone();
        std::thread::Builder::new()
            .name("slm-worker".to_string())
            .spawn(move || {
                worker_loop(broker, config, shutdown, position_count, active_tickets, tx, on_iteration);
            })
            .expect("failed to spawn worker thread")
    };

    let background_thread = {
        let shutdown = shutdown.clone();
        let locks = locks.clone();
        let diagnostics = diagnostics.clone();
        std::thread::Builder::new()
            .name("slm-background".to_string())
            .spawn(move || {
                background_loop(rx, shutdown, locks, diagnostics, lock_events, on_fail_safe);
            })
            .expect("failed to spawn background thread")
    };

    WorkerHandle {
        running,
        shutdown,
        position_count,
        active_tickets,
        worker_thread: std::sync::Mutex::new(Some(worker_thread)),
        background_thread: std::sync::Mutex::new(Some(background_thread)),
        background_tx: tx,
    }
}

fn worker_loop(
    broker: Arc<dyn Broker>,
    config: Arc<SlmConfig>,
    shutdown: Arc<AtomicBool>,
    position_count: Arc<AtomicU64>,
    active_tickets: Arc<AtomicU64>,
    background_tx: Sender<BackgroundTask>,
    on_iteration: impl Fn(&dyn Broker),
) {
    let interval = config.worker_interval();
    let mut last_csv_flush = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        let iteration_start = Instant::now();

        let positions = broker.get_open_positions();
        let open_tickets: Vec<u64> = positions.iter().map(|p| p.ticket).filter(|&t| t != 0).collect();
        position_count.store(positions.len() as u64, Ordering::SeqCst);
        active_tickets.store(open_tickets.len() as u64, Ordering::SeqCst);

        on_iteration(broker.as_ref());

        let _ = background_tx.try_send(BackgroundTask::StaleLockSweep);
        let _ = background_tx.try_send(BackgroundTask::FailSafeScan);
        if last_csv_flush.elapsed() >= Duration::from_millis(500) {
            let _ = background_tx.try_send(BackgroundTask::FlushSummaryCsv);
            last_csv_flush = Instant::now();
        }

        let elapsed = iteration_start.elapsed();
        if elapsed.as_millis() > ITERATION_WARN_THRESHOLD_MS {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "worker iteration exceeded target budget");
        }

        if interval.is_zero() {
            continue;
        }
        let remaining = interval.checked_sub(elapsed).unwrap_or(Duration::ZERO);
        sleep_interruptible(remaining, &shutdown);
    }
}

fn background_loop(
    rx: Receiver<BackgroundTask>,
    shutdown: Arc<AtomicBool>,
    locks: Arc<LockManager>,
    diagnostics: Arc<DiagnosticsSink>,
    lock_events: Receiver<LockEvent>,
    on_fail_safe: impl Fn(),
) {
    let drain_lock_events = |diagnostics: &DiagnosticsSink| {
        for event in lock_events.try_iter() {
            if let Err(e) = diagnostics.record_lock_event(&event) {
                error!(error = %e, "failed to record lock event");
            }
        }
    };

    while !shutdown.load(Ordering::SeqCst) {
        drain_lock_events(&diagnostics);
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(BackgroundTask::StaleLockSweep) => locks.watchdog_sweep(),
            Ok(BackgroundTask::FailSafeScan) => on_fail_safe(),
            Ok(BackgroundTask::FlushSummaryCsv) => {
                if let Err(e) = diagnostics.flush_summary() {
                    error!(error = %e, "failed to flush sl summary csv");
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    drain_lock_events(&diagnostics);
}

fn sleep_interruptible(duration: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(10);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::sim::SimBroker;

    #[test]
    fn starts_and_stops_cleanly() {
        let broker: Arc<dyn Broker> = Arc::new(SimBroker::new());
        let config = Arc::new(SlmConfig::test_config());
        let locks = Arc::new(LockManager::new(None));
        let dir = std::env::temp_dir().join(format!("slm_worker_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let diagnostics = Arc::new(DiagnosticsSink::new_under(&dir, crate::config::RunMode::Backtest).unwrap());
        let (_lock_tx, lock_rx) = crossbeam_channel::unbounded();

        let handle = start_worker(broker, config, locks, diagnostics, lock_rx, || {}, |_| {});
        std::thread::sleep(Duration::from_millis(60));
        assert!(handle.is_running());
        handle.stop();
    }

    #[test]
    fn heartbeat_reflects_open_positions() {
        let sim = SimBroker::new();
        sim.seed_position(crate::types::Position {
            ticket: 1,
            symbol: "EURUSD".to_string(),
            direction: crate::types::Direction::Buy,
            entry_price: rust_decimal::Decimal::ONE,
            current_price: rust_decimal::Decimal::ONE,
            current_sl: rust_decimal::Decimal::ZERO,
            volume: rust_decimal::Decimal::ONE,
            profit_usd: rust_decimal::Decimal::ZERO,
        });
        let broker: Arc<dyn Broker> = Arc::new(sim);
        let config = Arc::new(SlmConfig::test_config());
        let locks = Arc::new(LockManager::new(None));
        let dir = std::env::temp_dir().join(format!("slm_worker_test2_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let diagnostics = Arc::new(DiagnosticsSink::new_under(&dir, crate::config::RunMode::Backtest).unwrap());
        let (_lock_tx, lock_rx) = crossbeam_channel::unbounded();

        let handle = start_worker(broker, config, locks, diagnostics, lock_rx, || {}, |_| {});
        std::thread::sleep(Duration::from_millis(80));
        let hb = handle.heartbeat();
        assert_eq!(hb.position_count, 1);
        assert_eq!(hb.active_tickets, 1);
        handle.stop();
    }
}
