//! Apply-and-Verify Executor.
//!
//! Given a target stop-loss, either confirms the broker already holds it
//! (within tolerance), or drives a bounded retry loop that submits the
//! modification and re-reads the position to verify it stuck. Falls back to
//! a last-resort emergency nudge sequence when the ordinary retry loop is
//! exhausted on a losing position.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, warn};

use crate::broker::Broker;
use crate::config::{ExecutionConfig, RiskConfig};
use crate::metadata_corrector::MetadataCorrector;
use crate::tracking::PerTicketTracking;
use crate::types::{Direction, InstrumentMetadata};

const COOLDOWN_MS: i64 = 500;
const MAX_ATTEMPTS: u32 = 3;
const OSCILLATION_WINDOW_MS: i64 = 1_000;
const EMERGENCY_NUDGE_POINTS: [i64; 8] = [1, -1, 2, -2, 5, -5, 10, -10];
const EMERGENCY_TOLERANCE_USD: f64 = 0.30;
const EMERGENCY_MAX_ATTEMPTS_PER_EPISODE: u32 = 3;
const CIRCUIT_BREAKER_SECS: i64 = 60;

pub struct ExecuteRequest {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub volume: Decimal,
    pub target_sl: Decimal,
    pub target_usd: Decimal,
    pub reason: String,
    pub is_first_eligible: bool,
    pub is_profit_locking: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome {
    Success { applied_sl: Decimal, attempts: u32 },
    Skipped { reason: String },
    Failed { reason: String, attempts: u32, circuit_breaker_tripped: bool, manual_review: bool },
}

pub struct Executor<'a> {
    broker: &'a dyn Broker,
    exec_cfg: &'a ExecutionConfig,
    risk_cfg: &'a RiskConfig,
    corrector: &'a MetadataCorrector,
}

impl<'a> Executor<'a> {
    pub fn new(
        broker: &'a dyn Broker,
        exec_cfg: &'a ExecutionConfig,
        risk_cfg: &'a RiskConfig,
        corrector: &'a MetadataCorrector,
    ) -> Self {
        Self { broker, exec_cfg, risk_cfg, corrector }
    }

    pub fn execute(
        &self,
        req: &ExecuteRequest,
        metadata: &InstrumentMetadata,
        tracking: &Mutex<PerTicketTracking>,
    ) -> ExecuteOutcome {
        let now = chrono::Utc::now();

        let Some(current) = self.broker.get_position_by_ticket(req.ticket) else {
            return ExecuteOutcome::Failed {
                reason: "position no longer open".to_string(),
                attempts: 0,
                circuit_breaker_tripped: false,
                manual_review: false,
            };
        };

        if let Some(skip) = self.check_gates(req, &current, metadata, tracking, now) {
            return skip;
        }

        let tolerance = self.price_tolerance(req.entry_price, metadata);
        let usd_tolerance = if req.is_profit_locking {
            self.exec_cfg.verification.effective_profit_tolerance_usd * 2.0
        } else {
            self.exec_cfg.verification.effective_profit_tolerance_usd
        };

        for attempt in 0..MAX_ATTEMPTS {
            if self.broker.get_position_by_ticket(req.ticket).is_none() {
                return ExecuteOutcome::Failed {
                    reason: "position closed mid-retry".to_string(),
                    attempts: attempt,
                    circuit_breaker_tripped: false,
                    manual_review: false,
                };
            }

            let submitted = self.broker.modify_order(req.ticket, req.target_sl);

            let delay_ms = if req.is_first_eligible {
                50
            } else if req.is_profit_locking {
                200
            } else {
                100
            };
            std::thread::sleep(std::time::Duration::from_millis(delay_ms));

            if submitted {
                if let Some(verified) = self.broker.get_position_by_ticket(req.ticket) {
                    let price_delta = (verified.current_sl - req.target_sl).abs();
                    let effective_usd_delta =
                        self.effective_usd_delta(&verified, req, metadata);

                    if price_delta < tolerance && effective_usd_delta < Decimal::try_from(usd_tolerance).unwrap_or(Decimal::ONE) {
                        let mut guard = tracking.lock();
                        let cooldown = if req.is_first_eligible {
                            None
                        } else {
                            Some(now + chrono::Duration::milliseconds(COOLDOWN_MS))
                        };
                        guard.record_success(req.target_sl, &req.reason, cooldown);
                        return ExecuteOutcome::Success { applied_sl: req.target_sl, attempts: attempt + 1 };
                    }
                }
            }

            if req.is_first_eligible {
                // A single non-blocking attempt only; no retry block.
                break;
            }

            let backoff_ms = if self.exec_cfg.verification.use_exponential_backoff {
                100u64.saturating_mul(1u64 << attempt.min(10))
            } else {
                100
            };
            std::thread::sleep(std::time::Duration::from_millis(backoff_ms));
        }

        let consecutive_failures = {
            let mut guard = tracking.lock();
            guard.record_failure(&req.reason)
        };

        let eligible_for_emergency = current.profit_usd < Decimal::ZERO
            || consecutive_failures >= 2;

        if eligible_for_emergency {
            return self.emergency_strict_sl(req, metadata, tracking, consecutive_failures);
        }

        ExecuteOutcome::Failed {
            reason: format!("verification failed after {MAX_ATTEMPTS} attempts"),
            attempts: MAX_ATTEMPTS,
            circuit_breaker_tripped: false,
            manual_review: false,
        }
    }

    fn check_gates(
        &self,
        req: &ExecuteRequest,
        current: &crate::types::Position,
        metadata: &InstrumentMetadata,
        tracking: &Mutex<PerTicketTracking>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<ExecuteOutcome> {
        let guard = tracking.lock();

        if !req.is_first_eligible && guard.in_cooldown(now) {
            return Some(ExecuteOutcome::Skipped { reason: "cooldown".to_string() });
        }

        if guard.last_applied_sl_price > Decimal::ZERO && req.entry_price > Decimal::ZERO {
            let relative_delta =
                (req.target_sl - guard.last_applied_sl_price).abs() / req.entry_price;
            if relative_delta < Decimal::new(1, 4) {
                return Some(ExecuteOutcome::Skipped { reason: "below minimum delta".to_string() });
            }
        }

        if req.target_usd < Decimal::ZERO {
            if let Some(last_attempt) = guard.last_sl_attempt_at {
                let last_price = guard.last_applied_sl_price;
                let within_window = (now - last_attempt).num_milliseconds() < OSCILLATION_WINDOW_MS;
                let within_tolerance =
                    (req.target_sl - last_price).abs() < metadata.point * Decimal::from(10);
                if within_window && within_tolerance && last_price > Decimal::ZERO {
                    return Some(ExecuteOutcome::Skipped { reason: "oscillation debounce".to_string() });
                }
            }
        }

        drop(guard);

        if (current.current_sl - req.target_sl).abs() < metadata.point * Decimal::from(2) {
            return Some(ExecuteOutcome::Success { applied_sl: current.current_sl, attempts: 0 });
        }

        None
    }

    fn price_tolerance(&self, entry_price: Decimal, metadata: &InstrumentMetadata) -> Decimal {
        let base = metadata.point * Decimal::from(10);
        if metadata.looks_index_or_crypto_like(entry_price) {
            base.max(Decimal::ONE)
        } else {
            base
        }
    }

    fn effective_usd_delta(
        &self,
        verified: &crate::types::Position,
        req: &ExecuteRequest,
        metadata: &InstrumentMetadata,
    ) -> Decimal {
        let corrected_size = self.corrector.corrected_size(
            &req.symbol,
            req.entry_price,
            req.volume,
            req.target_usd,
            metadata.nominal_contract_size,
            Some(verified),
        );
        let signed_diff = match req.direction {
            Direction::Buy => verified.current_sl - req.entry_price,
            Direction::Sell => req.entry_price - verified.current_sl,
        };
        let implied_usd = signed_diff * req.volume * corrected_size;
        (implied_usd - req.target_usd).abs()
    }

    /// Last-resort direct modification after the ordinary retry loop fails
    /// on a losing position. No verify-retry cycle: the Fail-Safe Auditor
    /// corrects afterward if this also misses.
    fn emergency_strict_sl(
        &self,
        req: &ExecuteRequest,
        metadata: &InstrumentMetadata,
        tracking: &Mutex<PerTicketTracking>,
        consecutive_failures: u32,
    ) -> ExecuteOutcome {
        let max_risk = Decimal::try_from(self.risk_cfg.max_risk_per_trade_usd).unwrap_or(Decimal::new(2, 0));

        let corrected_size = self.corrector.corrected_size(
            &req.symbol,
            req.entry_price,
            req.volume,
            -max_risk,
            metadata.nominal_contract_size,
            self.broker.get_position_by_ticket(req.ticket).as_ref(),
        );

        if corrected_size <= Decimal::ZERO || req.volume <= Decimal::ZERO {
            warn!(ticket = req.ticket, "emergency path aborted: non-positive contract size or volume");
            return self.give_up(req, tracking, consecutive_failures);
        }

        let price_diff = max_risk / (req.volume * corrected_size);
        let base_sl = match req.direction {
            Direction::Buy => req.entry_price - price_diff,
            Direction::Sell => req.entry_price + price_diff,
        };

        let mut attempts = 0u32;
        let mut candidates = vec![base_sl];
        for points in EMERGENCY_NUDGE_POINTS {
            candidates.push(base_sl + metadata.point * Decimal::from(points));
        }

        for candidate in candidates {
            if attempts >= EMERGENCY_MAX_ATTEMPTS_PER_EPISODE {
                break;
            }
            attempts += 1;
            if !self.broker.modify_order(req.ticket, candidate) {
                continue;
            }
            if let Some(verified) = self.broker.get_position_by_ticket(req.ticket) {
                let signed_diff = match req.direction {
                    Direction::Buy => verified.current_sl - req.entry_price,
                    Direction::Sell => req.entry_price - verified.current_sl,
                };
                let implied_usd = signed_diff * req.volume * corrected_size;
                let delta = (implied_usd - (-max_risk)).abs();
                if delta <= Decimal::try_from(EMERGENCY_TOLERANCE_USD).unwrap() {
                    let mut guard = tracking.lock();
                    guard.record_success(candidate, "emergency strict-sl", None);
                    return ExecuteOutcome::Success { applied_sl: candidate, attempts };
                }
            }
        }

        error!(ticket = req.ticket, "CRITICAL emergency strict-sl enforcement exhausted, flagging for manual review");
        self.give_up(req, tracking, consecutive_failures)
    }

    fn give_up(
        &self,
        req: &ExecuteRequest,
        tracking: &Mutex<PerTicketTracking>,
        consecutive_failures: u32,
    ) -> ExecuteOutcome {
        let mut guard = tracking.lock();
        guard.set_circuit_breaker(chrono::Utc::now() + chrono::Duration::seconds(CIRCUIT_BREAKER_SECS));
        guard.manual_review_flag = true;
        drop(guard);
        ExecuteOutcome::Failed {
            reason: format!("emergency strict-sl exhausted for ticket {}", req.ticket),
            attempts: consecutive_failures,
            circuit_breaker_tripped: true,
            manual_review: true,
        }
    }
}
