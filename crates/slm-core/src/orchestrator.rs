//! Atomic Update Orchestrator (`update_sl_atomic`).
//!
//! Composes the Arbiter, Lock Manager, Executor, Violation Detector, and the
//! per-ticket tracking table into the SLM's single mutating entry point.

use dashmap::DashSet;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::arbiter::Arbiter;
use crate::broker::Broker;
use crate::config::{ExecutionConfig, RiskConfig};
use crate::executor::{ExecuteOutcome, ExecuteRequest, Executor};
use crate::lock_manager::LockManager;
use crate::metadata_corrector::MetadataCorrector;
use crate::rate_limiter::{Admission, GlobalRateLimiter};
use crate::tracking::TrackingTable;
use crate::types::{Authority, Decision, Direction, Position};
use crate::violation;

const GUARANTEED_EXECUTION_BUDGET_MS: i64 = 250;
const PER_TICKET_MIN_INTERVAL_MS: i64 = 100;
const CIRCUIT_BREAKER_FAILURE_THRESHOLD: u32 = 10;
const CIRCUIT_BREAKER_BASE_SECS: i64 = 10;
const CIRCUIT_BREAKER_MAX_BUCKET: u32 = 3;

fn violation_reason(violations: &[violation::Violation]) -> String {
    if violations.iter().any(|v| matches!(v, violation::Violation::RegressionAttempt(_))) {
        "arbiter regression detected".to_string()
    } else if violations.iter().any(|v| matches!(v, violation::Violation::SlNotApplied)) {
        "guaranteed-execution window exceeded with an unfinished attempt".to_string()
    } else {
        "guaranteed-execution authority stalled without a successful update".to_string()
    }
}

pub struct Orchestrator<'a> {
    broker: &'a dyn Broker,
    risk_cfg: &'a RiskConfig,
    exec_cfg: &'a ExecutionConfig,
    locks: &'a LockManager,
    tracking: &'a TrackingTable,
    rate_limiter: &'a GlobalRateLimiter,
    corrector: &'a MetadataCorrector,
    disabled_symbols: &'a DashSet<String>,
}

impl<'a> Orchestrator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: &'a dyn Broker,
        risk_cfg: &'a RiskConfig,
        exec_cfg: &'a ExecutionConfig,
        locks: &'a LockManager,
        tracking: &'a TrackingTable,
        rate_limiter: &'a GlobalRateLimiter,
        corrector: &'a MetadataCorrector,
        disabled_symbols: &'a DashSet<String>,
    ) -> Self {
        Self {
            broker,
            risk_cfg,
            exec_cfg,
            locks,
            tracking,
            rate_limiter,
            corrector,
            disabled_symbols,
        }
    }

    pub fn update_sl_atomic(&self, ticket: u64) -> (bool, String) {
        let started = std::time::Instant::now();

        let Some(position) = self.broker.get_position_by_ticket(ticket) else {
            self.tracking.cleanup(ticket);
            self.locks.cleanup(ticket);
            return (false, "position not found".to_string());
        };
        if position.ticket == 0 {
            return (false, "invalid ticket".to_string());
        }

        let is_losing = position.profit_usd < Decimal::ZERO;
        if is_losing && self.disabled_symbols.contains(&position.symbol) {
            return (false, format!("symbol {} disabled", position.symbol));
        }

        let Some(metadata) = self.broker.get_symbol_info(&position.symbol) else {
            return (false, "symbol metadata unavailable".to_string());
        };

        let tracking_entry = self.tracking.entry(ticket);
        let now = chrono::Utc::now();

        let arbiter = Arbiter::new(self.risk_cfg, self.corrector);
        let decision = arbiter.compute(&position, &metadata);

        let (last_success_at, attempt_in_flight_since) = {
            let guard = tracking_entry.lock();
            (guard.last_sl_success_at, guard.attempt_in_flight_since)
        };
        let violations = violation::detect(ticket, &decision, last_success_at, attempt_in_flight_since, now);
        if !violations.is_empty() {
            return (false, violation_reason(&violations));
        }

        if !decision.is_actionable() {
            return (true, "no authority eligible, nothing to do".to_string());
        }

        let is_first_eligible = {
            let mut guard = tracking_entry.lock();
            let was_pending = guard.is_first_eligible_pending();
            guard.mark_first_eligible_if_new(decision.authority);
            was_pending || guard.is_first_eligible_pending()
        };
        let is_profit_locking = decision.is_profit_lock;
        let is_emergency_eligible = is_losing;

        if self.circuit_breaker_blocks(&tracking_entry, now, is_profit_locking, is_first_eligible) {
            return (false, "circuit breaker open".to_string());
        }

        if self.per_ticket_rate_limited(&tracking_entry, now, is_profit_locking, is_first_eligible, is_emergency_eligible)
        {
            return (false, "per-ticket rate limited".to_string());
        }

        let consecutive_failures = tracking_entry.lock().consecutive_failures;
        let is_emergency_rpc = is_emergency_eligible || consecutive_failures >= 2;
        match self.rate_limiter.admit(is_emergency_rpc) {
            Admission::Queued => return (false, "queued: global rate limit".to_string()),
            Admission::ProceedAfterBackoff(d) => std::thread::sleep(d),
            Admission::Proceed => {}
        }

        let guaranteed_authority = matches!(decision.authority, Authority::Trailing | Authority::ProfitLock)
            || is_first_eligible;
        let base_timeout = self.risk_cfg_lock_timeout(is_profit_locking);

        let _attempt_guard = self.tracking.start_attempt(ticket, now);
        let guard = self.locks.acquire(ticket, is_profit_locking, guaranteed_authority, base_timeout);

        let Some(guard) = guard else {
            if matches!(decision.authority, Authority::Hard) && is_losing {
                return self.emergency_lock_free(ticket, &metadata);
            }
            warn!(ticket, "LOCK TIMEOUT acquiring ticket lock");
            return (false, "LOCK TIMEOUT".to_string());
        };

        let result = self.run_executor(ticket, &position, &decision, &metadata, &tracking_entry, is_first_eligible);
        drop(guard);

        let elapsed_ms = started.elapsed().as_millis() as i64;
        if elapsed_ms > GUARANTEED_EXECUTION_BUDGET_MS {
            error!(ticket, elapsed_ms, "CRITICAL SL_NOT_APPLIED: guaranteed-execution window exceeded");
        }

        match result {
            ExecuteOutcome::Success { applied_sl, attempts } => {
                info!(ticket, %applied_sl, attempts, "sl update applied");
                (true, "applied".to_string())
            }
            ExecuteOutcome::Skipped { reason } => (true, reason),
            ExecuteOutcome::Failed { reason, circuit_breaker_tripped, .. } => {
                self.on_failure(&tracking_entry, circuit_breaker_tripped);
                (false, reason)
            }
        }
    }

    fn risk_cfg_lock_timeout(&self, is_profit_locking: bool) -> std::time::Duration {
        let secs = if is_profit_locking {
            self.risk_cfg.profit_locking_lock_timeout_seconds
        } else {
            self.risk_cfg.lock_acquisition_timeout_seconds
        };
        std::time::Duration::from_secs_f64(secs)
    }

    fn circuit_breaker_blocks(
        &self,
        tracking_entry: &std::sync::Arc<parking_lot::Mutex<crate::tracking::PerTicketTracking>>,
        now: chrono::DateTime<chrono::Utc>,
        is_profit_locking: bool,
        is_first_eligible: bool,
    ) -> bool {
        let guard = tracking_entry.lock();
        if !guard.circuit_breaker_active(now) {
            return false;
        }
        !(is_profit_locking || is_first_eligible)
    }

    fn per_ticket_rate_limited(
        &self,
        tracking_entry: &std::sync::Arc<parking_lot::Mutex<crate::tracking::PerTicketTracking>>,
        now: chrono::DateTime<chrono::Utc>,
        is_profit_locking: bool,
        is_first_eligible: bool,
        is_emergency: bool,
    ) -> bool {
        if is_profit_locking || is_first_eligible || is_emergency {
            return false;
        }
        let guard = tracking_entry.lock();
        match guard.last_sl_attempt_at {
            Some(last) => (now - last).num_milliseconds() < PER_TICKET_MIN_INTERVAL_MS,
            None => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_executor(
        &self,
        ticket: u64,
        position: &Position,
        decision: &Decision,
        metadata: &crate::types::InstrumentMetadata,
        tracking_entry: &std::sync::Arc<parking_lot::Mutex<crate::tracking::PerTicketTracking>>,
        is_first_eligible: bool,
    ) -> ExecuteOutcome {
        let Some(target_sl) = decision.target_price else {
            return ExecuteOutcome::Skipped { reason: "no target price".to_string() };
        };

        let executor = Executor::new(self.broker, self.exec_cfg, self.risk_cfg, self.corrector);
        let request = ExecuteRequest {
            ticket,
            symbol: position.symbol.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            volume: position.volume,
            target_sl,
            target_usd: decision.target_usd,
            reason: decision.reason.clone(),
            is_first_eligible,
            is_profit_locking: decision.is_profit_lock,
        };

        executor.execute(&request, metadata, tracking_entry)
    }

    fn on_failure(
        &self,
        tracking_entry: &std::sync::Arc<parking_lot::Mutex<crate::tracking::PerTicketTracking>>,
        already_circuit_broken: bool,
    ) {
        let guard = tracking_entry.lock();
        if guard.consecutive_failures >= CIRCUIT_BREAKER_FAILURE_THRESHOLD && !already_circuit_broken {
            let bucket = (guard.consecutive_failures - CIRCUIT_BREAKER_FAILURE_THRESHOLD).min(CIRCUIT_BREAKER_MAX_BUCKET);
            let cooldown_secs = CIRCUIT_BREAKER_BASE_SECS * 3i64.pow(bucket);
            drop(guard);
            tracking_entry
                .lock()
                .set_circuit_breaker(chrono::Utc::now() + chrono::Duration::seconds(cooldown_secs));
        }
    }

    /// Emergency Lock-Free Strict-Loss path, invoked only when ordinary lock
    /// acquisition fails for a losing HARD-authority position.
    fn emergency_lock_free(
        &self,
        ticket: u64,
        metadata: &crate::types::InstrumentMetadata,
    ) -> (bool, String) {
        let Some(fresh) = self.broker.get_position_by_ticket(ticket) else {
            return (false, "position closed before emergency path".to_string());
        };

        let arbiter = Arbiter::new(self.risk_cfg, self.corrector);
        let fresh_decision = arbiter.compute(&fresh, metadata);
        if matches!(fresh_decision.authority, Authority::Trailing | Authority::ProfitLock) {
            return (false, "emergency path aborted: higher authority now applies".to_string());
        }

        let max_risk = Decimal::try_from(self.risk_cfg.max_risk_per_trade_usd).unwrap_or(Decimal::new(2, 0));
        let corrected_size = self.corrector.corrected_size(
            &fresh.symbol,
            fresh.entry_price,
            fresh.volume,
            -max_risk,
            metadata.nominal_contract_size,
            Some(&fresh),
        );
        if corrected_size <= Decimal::ZERO || fresh.volume <= Decimal::ZERO {
            return (false, "emergency path aborted: no valid contract size".to_string());
        }

        let price_diff = max_risk / (fresh.volume * corrected_size);
        let candidate = match fresh.direction {
            Direction::Buy => fresh.entry_price - price_diff,
            Direction::Sell => fresh.entry_price + price_diff,
        };

        let adjusted = crate::constraint_adjuster::adjust(
            candidate,
            fresh.current_sl,
            fresh.direction,
            metadata,
            fresh.entry_price,
        );
        let Some(adjusted) = adjusted else {
            return (false, "emergency path aborted: candidate rejected by constraint adjuster".to_string());
        };

        if self.broker.modify_order(ticket, adjusted) {
            warn!(ticket, %adjusted, "emergency lock-free strict-loss modification submitted");
            (true, "emergency strict-loss applied lock-free".to_string())
        } else {
            (false, "emergency strict-loss broker rejection".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::sim::SimBroker;
    use crate::config::{ExecutionConfig, RiskConfig};
    use crate::types::InstrumentMetadata;

    fn metadata() -> InstrumentMetadata {
        InstrumentMetadata {
            symbol: "EURUSD".to_string(),
            point: Decimal::new(1, 5),
            digits: 5,
            nominal_contract_size: Decimal::new(100_000, 0),
            tick_value_usd: None,
            min_stops_distance: 0,
            bid: Decimal::new(119750, 5),
            ask: Decimal::new(119760, 5),
        }
    }

    fn losing_buy() -> Position {
        Position {
            ticket: 1,
            symbol: "EURUSD".to_string(),
            direction: Direction::Buy,
            entry_price: Decimal::new(120000, 5),
            current_price: Decimal::new(119750, 5),
            current_sl: Decimal::ZERO,
            volume: Decimal::new(1, 2),
            profit_usd: Decimal::new(-250, 2),
        }
    }

    #[test]
    fn applies_hard_cap_on_untouched_losing_position() {
        let broker = SimBroker::new();
        broker.seed_position(losing_buy());
        broker.seed_instrument(metadata());

        let risk_cfg = RiskConfig::default();
        let exec_cfg = ExecutionConfig::default();
        let locks = LockManager::new(None);
        let tracking = TrackingTable::new();
        let rate_limiter = GlobalRateLimiter::new(50);
        let corrector = MetadataCorrector::new();
        let disabled: DashSet<String> = DashSet::new();

        let orchestrator = Orchestrator::new(
            &broker, &risk_cfg, &exec_cfg, &locks, &tracking, &rate_limiter, &corrector, &disabled,
        );

        let (success, _reason) = orchestrator.update_sl_atomic(1);
        assert!(success);
        let applied = broker.get_position_by_ticket(1).unwrap().current_sl;
        assert!(applied > Decimal::ZERO);
        assert!(applied < Decimal::new(120000, 5));
    }

    #[test]
    fn disabled_symbol_blocks_losing_position() {
        let broker = SimBroker::new();
        broker.seed_position(losing_buy());
        broker.seed_instrument(metadata());

        let risk_cfg = RiskConfig::default();
        let exec_cfg = ExecutionConfig::default();
        let locks = LockManager::new(None);
        let tracking = TrackingTable::new();
        let rate_limiter = GlobalRateLimiter::new(50);
        let corrector = MetadataCorrector::new();
        let disabled: DashSet<String> = DashSet::new();
        disabled.insert("EURUSD".to_string());

        let orchestrator = Orchestrator::new(
            &broker, &risk_cfg, &exec_cfg, &locks, &tracking, &rate_limiter, &corrector, &disabled,
        );

        let (success, reason) = orchestrator.update_sl_atomic(1);
        assert!(!success);
        assert!(reason.contains("disabled"));
    }

    #[test]
    fn missing_position_cleans_up_tracking() {
        let broker = SimBroker::new();
        let risk_cfg = RiskConfig::default();
        let exec_cfg = ExecutionConfig::default();
        let locks = LockManager::new(None);
        let tracking = TrackingTable::new();
        let rate_limiter = GlobalRateLimiter::new(50);
        let corrector = MetadataCorrector::new();
        let disabled: DashSet<String> = DashSet::new();

        let orchestrator = Orchestrator::new(
            &broker, &risk_cfg, &exec_cfg, &locks, &tracking, &rate_limiter, &corrector, &disabled,
        );

        let (success, reason) = orchestrator.update_sl_atomic(99);
        assert!(!success);
        assert_eq!(reason, "position not found");
    }
}
