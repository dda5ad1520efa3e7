//! Fail-Safe Auditor.
//!
//! A periodic safety net independent of the Worker Loop's per-tick
//! Orchestrator calls: catches positions whose effective SL implies a loss
//! worse than the configured cap, and enforces strict-loss directly.

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::error;

use crate::broker::Broker;
use crate::config::RiskConfig;
use crate::metadata_corrector::MetadataCorrector;
use crate::types::{Direction, Position};

const IN_CYCLE_RETRIES: u32 = 3;
const RETRY_SPACING_MS: u64 = 200;
const LOG_DEBOUNCE_SECS: i64 = 1;
const LOG_EVICTION_SECS: i64 = 2;
const EFFECTIVE_LOSS_TOLERANCE_USD: f64 = 0.30;

pub struct FailSafeAuditor<'a> {
    broker: &'a dyn Broker,
    risk_cfg: &'a RiskConfig,
    corrector: &'a MetadataCorrector,
    recent_errors: DashMap<String, chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FailSafePassReport {
    pub scanned: usize,
    pub enforced: usize,
    pub failed: usize,
}

impl<'a> FailSafeAuditor<'a> {
    pub fn new(broker: &'a dyn Broker, risk_cfg: &'a RiskConfig, corrector: &'a MetadataCorrector) -> Self {
        Self {
            broker,
            risk_cfg,
            corrector,
            recent_errors: DashMap::new(),
        }
    }

    pub fn run_pass(&self) -> FailSafePassReport {
        let mut report = FailSafePassReport::default();
        let max_risk = Decimal::try_from(self.risk_cfg.max_risk_per_trade_usd).unwrap_or(Decimal::new(2, 0));

        for position in self.broker.get_open_positions() {
            if position.profit_usd >= Decimal::ZERO || position.ticket == 0 {
                continue;
            }
            report.scanned += 1;

            let Some(metadata) = self.broker.get_symbol_info(&position.symbol) else {
                self.log_debounced(&format!("metadata-unavailable:{}", position.symbol), "symbol metadata unavailable during fail-safe pass");
                report.failed += 1;
                continue;
            };

            let effective_sl_profit = self.effective_sl_profit(&position, &metadata);
            let breach = (effective_sl_profit - (-max_risk)) < -Decimal::try_from(EFFECTIVE_LOSS_TOLERANCE_USD).unwrap();
            if !breach {
                continue;
            }

            if self.enforce_strict_loss(&position, &metadata, max_risk) {
                report.enforced += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    fn effective_sl_profit(&self, position: &Position, metadata: &crate::types::InstrumentMetadata) -> Decimal {
        if position.current_sl <= Decimal::ZERO {
            return Decimal::ZERO;
        }
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
        signed_diff * position.volume * corrected_size
    }

    fn enforce_strict_loss(&self, position: &Position, metadata: &crate::types::InstrumentMetadata, max_risk: Decimal) -> bool {
        let corrected_size = self.corrector.corrected_size(
            &position.symbol,
            position.entry_price,
            position.volume,
            -max_risk,
            metadata.nominal_contract_size,
            Some(position),
        );
        if corrected_size <= Decimal::ZERO || position.volume <= Decimal::ZERO {
            self.log_debounced(&format!("no-contract-size:{}", position.symbol), "fail-safe could not derive contract size");
            return false;
        }

        let price_diff = max_risk / (position.volume * corrected_size);
        let candidate = match position.direction {
            Direction::Buy => position.entry_price - price_diff,
            Direction::Sell => position.entry_price + price_diff,
        };
        let Some(adjusted) =
            crate::constraint_adjuster::adjust(candidate, position.current_sl, position.direction, metadata, position.entry_price)
        else {
            self.log_debounced(&format!("adjuster-rejected:{}", position.symbol), "fail-safe candidate rejected by constraint adjuster");
            return false;
        };

        for attempt in 0..IN_CYCLE_RETRIES {
            if self.broker.modify_order(position.ticket, adjusted) {
                return true;
            }
            self.log_debounced(
                &format!("modify-rejected:{}:{}", position.ticket, attempt),
                "fail-safe broker modification rejected",
            );
            if attempt + 1 < IN_CYCLE_RETRIES {
                std::thread::sleep(std::time::Duration::from_millis(RETRY_SPACING_MS));
            }
        }
        false
    }

    /// At most one log line per unique error signature per second; entries
    /// older than 2s are evicted to bound memory.
    fn log_debounced(&self, signature: &str, message: &str) {
        let now = chrono::Utc::now();
        self.recent_errors.retain(|_, ts| (now - *ts).num_seconds() < LOG_EVICTION_SECS);

        let should_log = match self.recent_errors.get(signature) {
            Some(ts) => (now - *ts).num_seconds() >= LOG_DEBOUNCE_SECS,
            None => true,
        };
        if should_log {
            self.recent_errors.insert(signature.to_string(), now);
            error!(signature, "{}", message);
        }
    }
}
