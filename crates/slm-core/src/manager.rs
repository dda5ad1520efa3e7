//! Top-level SLM facade.
//!
//! Owns every process-wide singleton the other modules depend on and wires
//! them into the small set of operations external callers use: the signal
//! pipeline invokes `update_sl_atomic` directly after a fill, the worker
//! loop invokes it once per open position per cycle, and an external health
//! monitor polls `get_worker_status`/`get_timing_stats`.

use dashmap::DashSet;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::arbiter::Arbiter;
use crate::broker::Broker;
use crate::config::SlmConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::fail_safe::{FailSafeAuditor, FailSafePassReport};
use crate::lock_manager::{LockEvent, LockManager};
use crate::metadata_corrector::MetadataCorrector;
use crate::orchestrator::Orchestrator;
use crate::rate_limiter::GlobalRateLimiter;
use crate::tracking::TrackingTable;
use crate::types::{Decision, Direction, Position};
use crate::worker::{self, Heartbeat, WorkerHandle};

#[derive(Debug, Default)]
struct VerificationMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    emergency_invocations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub emergency_invocations: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimingStats {
    pub last_iteration_ms: u64,
    pub worst_iteration_ms: u64,
}

pub struct SlmManager {
    broker: Arc<dyn Broker>,
    config: Arc<SlmConfig>,
    locks: Arc<LockManager>,
    tracking: TrackingTable,
    rate_limiter: GlobalRateLimiter,
    corrector: Arc<MetadataCorrector>,
    disabled_symbols: DashSet<String>,
    diagnostics: Arc<DiagnosticsSink>,
    metrics: VerificationMetrics,
    timing: std::sync::Mutex<TimingStats>,
    worker: std::sync::Mutex<Option<WorkerHandle>>,
    /// Taken by `start_worker` and handed to the background thread, which
    /// drains it into `diagnostics.record_lock_event`. `None` once a worker
    /// has been started.
    lock_event_rx: std::sync::Mutex<Option<crossbeam_channel::Receiver<LockEvent>>>,
}

impl SlmManager {
    pub fn new(broker: Arc<dyn Broker>, config: SlmConfig, diagnostics: DiagnosticsSink) -> Self {
        let config = Arc::new(config);
        let diagnostics = Arc::new(diagnostics);
        let (lock_tx, lock_rx) = crossbeam_channel::unbounded();
        Self {
            broker,
            config,
            locks: Arc::new(LockManager::new(Some(lock_tx))),
            tracking: TrackingTable::new(),
            rate_limiter: GlobalRateLimiter::new(50),
            corrector: Arc::new(MetadataCorrector::new()),
            disabled_symbols: DashSet::new(),
            diagnostics,
            metrics: VerificationMetrics::default(),
            timing: std::sync::Mutex::new(TimingStats::default()),
            worker: std::sync::Mutex::new(None),
            lock_event_rx: std::sync::Mutex::new(Some(lock_rx)),
        }
    }

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(
            self.broker.as_ref(),
            &self.config.risk,
            &self.config.execution,
            self.locks.as_ref(),
            &self.tracking,
            &self.rate_limiter,
            &self.corrector,
            &self.disabled_symbols,
        )
    }

    /// The sole mutating operation.
    pub fn update_sl_atomic(&self, ticket: u64) -> (bool, String) {
        let started = std::time::Instant::now();
        self.metrics.attempts.fetch_add(1, Ordering::SeqCst);

        let position_before = self.broker.get_position_by_ticket(ticket);
        let decision_before = position_before.as_ref().and_then(|p| self.compute_authoritative_sl(p));

        let (success, reason) = self.orchestrator().update_sl_atomic(ticket);

        if success {
            self.metrics.successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.metrics.failures.fetch_add(1, Ordering::SeqCst);
        }
        if reason.starts_with("emergency") {
            self.metrics.emergency_invocations.fetch_add(1, Ordering::SeqCst);
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mut timing = self.timing.lock().unwrap();
        timing.last_iteration_ms = elapsed_ms;
        timing.worst_iteration_ms = timing.worst_iteration_ms.max(elapsed_ms);
        drop(timing);

        let (symbol, entry_price, target_sl, effective_profit_target) = match (&position_before, &decision_before) {
            (Some(p), Some(d)) => (p.symbol.clone(), p.entry_price, d.target_price.unwrap_or(Decimal::ZERO), d.target_usd),
            (Some(p), None) => (p.symbol.clone(), p.entry_price, Decimal::ZERO, Decimal::ZERO),
            (None, _) => (String::new(), Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
        };

        let position_after = if success { self.broker.get_position_by_ticket(ticket) } else { None };
        let applied_sl = position_after.as_ref().map(|p| p.current_sl).unwrap_or(Decimal::ZERO);
        let effective_profit_applied = position_after
            .as_ref()
            .map(|p| Decimal::try_from(self.get_effective_sl_profit(p)).unwrap_or(Decimal::ZERO))
            .unwrap_or(Decimal::ZERO);

        let _ = self.diagnostics.record_sl_update(&crate::diagnostics::SlUpdateRecord {
            ts: chrono::Utc::now(),
            ticket,
            symbol,
            entry_price,
            target_sl,
            applied_sl,
            attempt_number: 0,
            retry_backoff_ms: 0,
            reason: reason.clone(),
            broker_error_code: None,
            effective_profit_target,
            effective_profit_applied,
            success,
            thread_id: format!("{:?}", std::thread::current().id()),
        });

        (success, reason)
    }

    /// Implied USD loss/gain if the broker's currently-held SL triggers.
    pub fn get_effective_sl_profit(&self, position: &Position) -> f64 {
        if position.current_sl <= Decimal::ZERO {
            return 0.0;
        }
        let Some(metadata) = self.broker.get_symbol_info(&position.symbol) else {
            return 0.0;
        };
        let corrected_size = self.corrector.corrected_size(
            &position.symbol,
            position.entry_price,
            position.volume,
            position.profit_usd,
            metadata.nominal_contract_size,
            Some(position),
        );
        let signed_diff = match position.direction {
            Direction::Buy => position.current_sl - position.entry_price,
            Direction::Sell => position.entry_price - position.current_sl,
        };
        (signed_diff * position.volume * corrected_size).to_f64().unwrap_or(0.0)
    }

    pub fn fail_safe_check(&self) -> FailSafePassReport {
        let auditor = FailSafeAuditor::new(self.broker.as_ref(), &self.config.risk, &self.corrector);
        auditor.run_pass()
    }

    /// Pure arbitration with no side effects.
    pub fn compute_authoritative_sl(&self, position: &Position) -> Option<Decision> {
        let metadata = self.broker.get_symbol_info(&position.symbol)?;
        let arbiter = Arbiter::new(&self.config.risk, &self.corrector);
        Some(arbiter.compute(position, &metadata))
    }

    pub fn start_worker(&self) {
        let mut guard = self.worker.lock().unwrap();
        if guard.is_some() {
            return; // idempotent
        }
        let Some(lock_events) = self.lock_event_rx.lock().unwrap().take() else {
            return; // a worker already consumed the lock-event receiver
        };
        let broker = self.broker.clone();
        let config = self.config.clone();
        let locks = self.locks.clone();
        let diagnostics = self.diagnostics.clone();

        let fail_safe_broker = self.broker.clone();
        let fail_safe_config = self.config.clone();
        let fail_safe_corrector = self.corrector.clone();
        let on_fail_safe = move || {
            let auditor = FailSafeAuditor::new(fail_safe_broker.as_ref(), &fail_safe_config.risk, &fail_safe_corrector);
            auditor.run_pass();
        };

        *guard = Some(worker::start_worker(broker, config, locks, diagnostics, lock_events, on_fail_safe, |_broker| {}));
    }

    pub fn stop_worker(&self) {
        let mut guard = self.worker.lock().unwrap();
        if let Some(handle) = guard.take() {
            handle.stop();
        }
    }

    pub fn get_worker_status(&self) -> Option<Heartbeat> {
        let guard = self.worker.lock().unwrap();
        guard.as_ref().map(|h| h.heartbeat())
    }

    pub fn get_timing_stats(&self) -> TimingStats {
        *self.timing.lock().unwrap()
    }

    pub fn get_verification_metrics(&self) -> VerificationMetricsSnapshot {
        VerificationMetricsSnapshot {
            attempts: self.metrics.attempts.load(Ordering::SeqCst),
            successes: self.metrics.successes.load(Ordering::SeqCst),
            failures: self.metrics.failures.load(Ordering::SeqCst),
            emergency_invocations: self.metrics.emergency_invocations.load(Ordering::SeqCst),
        }
    }

    pub fn reset_verification_metrics(&self) {
        self.metrics.attempts.store(0, Ordering::SeqCst);
        self.metrics.successes.store(0, Ordering::SeqCst);
        self.metrics.failures.store(0, Ordering::SeqCst);
        self.metrics.emergency_invocations.store(0, Ordering::SeqCst);
    }

    pub fn cleanup_closed_position(&self, ticket: u64) {
        self.tracking.cleanup(ticket);
        self.locks.cleanup(ticket);
    }

    pub fn disable_symbol(&self, symbol: &str) {
        self.disabled_symbols.insert(symbol.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::sim::SimBroker;
    use crate::config::RunMode;

    fn manager() -> SlmManager {
        let broker: Arc<dyn Broker> = Arc::new(SimBroker::new());
        let dir = std::env::temp_dir().join(format!("slm_manager_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let diagnostics = DiagnosticsSink::new_under(&dir, RunMode::Backtest).unwrap();
        SlmManager::new(broker, SlmConfig::test_config(), diagnostics)
    }

    #[test]
    fn update_sl_atomic_records_metrics() {
        let mgr = manager();
        let (success, _) = mgr.update_sl_atomic(1);
        assert!(!success); // no such position
        let metrics = mgr.get_verification_metrics();
        assert_eq!(metrics.attempts, 1);
        assert_eq!(metrics.failures, 1);
    }

    #[test]
    fn reset_verification_metrics_clears_counters() {
        let mgr = manager();
        let _ = mgr.update_sl_atomic(1);
        mgr.reset_verification_metrics();
        let metrics = mgr.get_verification_metrics();
        assert_eq!(metrics.attempts, 0);
    }

    #[test]
    fn start_stop_worker_is_idempotent() {
        let mgr = manager();
        mgr.start_worker();
        mgr.start_worker();
        assert!(mgr.get_worker_status().is_some());
        mgr.stop_worker();
        mgr.stop_worker();
    }

    #[test]
    fn cleanup_closed_position_removes_tracking_entry() {
        let mgr = manager();
        let _ = mgr.tracking.entry(5);
        assert_eq!(mgr.tracking.len(), 1);
        mgr.cleanup_closed_position(5);
        assert_eq!(mgr.tracking.len(), 0);
    }
}
