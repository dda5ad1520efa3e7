//! Authoritative-SL Arbiter.
//!
//! Pure function `compute_authoritative_sl(position) → Decision`. No locks
//! acquired; consults only the instrument metadata, the price calculator,
//! and the constraint adjuster, all of which are themselves pure or
//! independently-mutexed.

use rust_decimal::Decimal;

use crate::config::RiskConfig;
use crate::constraint_adjuster;
use crate::metadata_corrector::MetadataCorrector;
use crate::price_calculator::{Intent, PriceCalculator};
use crate::types::{ArbiterState, Authority, Decision, Direction, InstrumentMetadata, Position};

pub struct Arbiter<'a> {
    risk: &'a RiskConfig,
    corrector: &'a MetadataCorrector,
}

impl<'a> Arbiter<'a> {
    pub fn new(risk: &'a RiskConfig, corrector: &'a MetadataCorrector) -> Self {
        Self { risk, corrector }
    }

    pub fn compute(&self, position: &Position, metadata: &InstrumentMetadata) -> Decision {
        let calc = PriceCalculator::new(self.corrector);
        let increment = Decimal::try_from(self.risk.trailing_stop_increment_usd).unwrap_or(Decimal::new(10, 2));
        let sweet_min = Decimal::try_from(self.risk.profit_locking_min_profit_threshold_usd).unwrap_or(Decimal::new(3, 2));
        let sweet_max = Decimal::try_from(self.risk.profit_locking_max_profit_threshold_usd).unwrap_or(Decimal::new(10, 2));
        let max_risk = Decimal::try_from(self.risk.max_risk_per_trade_usd).unwrap_or(Decimal::new(2, 0));

        let raw_decision = if position.profit_usd > increment {
            self.try_trailing(position, metadata, &calc, increment)
        } else if position.profit_usd >= sweet_min && position.profit_usd <= sweet_max {
            self.try_profit_lock(position, metadata, &calc, sweet_max)
        } else if position.profit_usd < Decimal::ZERO {
            self.try_hard(position, metadata, &calc, max_risk)
        } else {
            None
        };

        match raw_decision {
            Some((decision, raw_candidate)) => self.regression_check(decision, position, raw_candidate),
            None => Decision::none("no eligible authority for current profit"),
        }
    }

    fn try_trailing(
        &self,
        position: &Position,
        metadata: &InstrumentMetadata,
        calc: &PriceCalculator,
        increment: Decimal,
    ) -> Option<(Decision, Decimal)> {
        let steps = ((position.profit_usd - increment) / increment).floor();
        let profit_to_lock = (steps * increment).max(increment);
        let candidate = calc
            .calculate(
                position.entry_price,
                profit_to_lock,
                position.direction,
                position.volume,
                metadata,
                Some(position),
                Intent::ProfitLock,
            )
            .ok()?;
        let adjusted = constraint_adjuster::adjust(
            candidate,
            position.current_sl,
            position.direction,
            metadata,
            position.entry_price,
        )?;
        Some((
            Decision {
                target_price: Some(adjusted),
                target_usd: profit_to_lock,
                authority: Authority::Trailing,
                reason: format!("trailing stop locking ${profit_to_lock}"),
                state: ArbiterState::TrailingActive,
                is_trailing: true,
                is_profit_lock: false,
                violations: Vec::new(),
            },
            candidate,
        ))
    }

    fn try_profit_lock(
        &self,
        position: &Position,
        metadata: &InstrumentMetadata,
        calc: &PriceCalculator,
        sweet_max: Decimal,
    ) -> Option<(Decision, Decimal)> {
        let profit_to_lock = position.profit_usd.min(sweet_max);
        let candidate = calc
            .calculate(
                position.entry_price,
                profit_to_lock,
                position.direction,
                position.volume,
                metadata,
                Some(position),
                Intent::ProfitLock,
            )
            .ok()?;
        let adjusted = constraint_adjuster::adjust(
            candidate,
            position.current_sl,
            position.direction,
            metadata,
            position.entry_price,
        )?;
        Some((
            Decision {
                target_price: Some(adjusted),
                target_usd: profit_to_lock,
                authority: Authority::ProfitLock,
                reason: format!("sweet-spot locking ${profit_to_lock}"),
                state: ArbiterState::SweetSpot,
                is_trailing: false,
                is_profit_lock: true,
                violations: Vec::new(),
            },
            candidate,
        ))
    }

    fn try_hard(
        &self,
        position: &Position,
        metadata: &InstrumentMetadata,
        calc: &PriceCalculator,
        max_risk: Decimal,
    ) -> Option<(Decision, Decimal)> {
        let candidate = calc
            .calculate(
                position.entry_price,
                -max_risk,
                position.direction,
                position.volume,
                metadata,
                Some(position),
                Intent::LossProtection,
            )
            .ok()?;
        let adjusted = constraint_adjuster::adjust(
            candidate,
            position.current_sl,
            position.direction,
            metadata,
            position.entry_price,
        )?;
        Some((
            Decision {
                target_price: Some(adjusted),
                target_usd: -max_risk,
                authority: Authority::Hard,
                reason: "hard cap loss enforcement".to_string(),
                state: ArbiterState::Managing,
                is_trailing: false,
                is_profit_lock: false,
                violations: Vec::new(),
            },
            candidate,
        ))
    }

    /// Detects a genuine regression using the authority's raw candidate
    /// (before `constraint_adjuster` clamps it for minimum distance), since
    /// the adjuster's own fallback-to-`sl_now` already absorbs clamp-induced
    /// worsening that isn't actually a regression attempt by the authority.
    fn regression_check(&self, mut decision: Decision, position: &Position, raw_candidate: Decimal) -> Decision {
        if position.current_sl <= Decimal::ZERO {
            return decision;
        }
        let current_is_adverse = match position.direction {
            Direction::Buy => position.current_sl < position.entry_price,
            Direction::Sell => position.current_sl > position.entry_price,
        };
        let candidate_is_favorable = match position.direction {
            Direction::Buy => raw_candidate >= position.entry_price,
            Direction::Sell => raw_candidate <= position.entry_price,
        };
        if current_is_adverse && candidate_is_favorable {
            return decision;
        }
        let regresses = match position.direction {
            Direction::Buy => raw_candidate < position.current_sl,
            Direction::Sell => raw_candidate > position.current_sl,
        };
        if regresses {
            decision.violations.push(format!(
                "regression: candidate {raw_candidate} would move SL against monotonicity from {}",
                position.current_sl
            ));
            decision.target_price = None;
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;

    fn forex_metadata() -> InstrumentMetadata {
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

    fn buy_position(current: &str, profit: &str, sl: &str) -> Position {
        Position {
            ticket: 1,
            symbol: "EURUSD".to_string(),
            direction: Direction::Buy,
            entry_price: Decimal::new(120000, 5),
            current_price: current.parse().unwrap(),
            current_sl: sl.parse().unwrap(),
            volume: Decimal::new(1, 2),
            profit_usd: profit.parse().unwrap(),
        }
    }

    #[test]
    fn hard_cap_on_untouched_losing_buy() {
        let risk = RiskConfig::default();
        let corrector = MetadataCorrector::new();
        let arbiter = Arbiter::new(&risk, &corrector);
        let metadata = forex_metadata();
        let position = buy_position("1.19750", "-2.50", "0.0");
        let decision = arbiter.compute(&position, &metadata);
        assert_eq!(decision.authority, Authority::Hard);
        assert_eq!(decision.state, ArbiterState::Managing);
    }

    #[test]
    fn sweet_spot_lock_on_small_profit() {
        let risk = RiskConfig::default();
        let corrector = MetadataCorrector::new();
        let arbiter = Arbiter::new(&risk, &corrector);
        let metadata = InstrumentMetadata {
            bid: Decimal::new(120040, 5),
            ask: Decimal::new(120060, 5),
            ..forex_metadata()
        };
        let position = buy_position("1.20050", "0.05", "0.0");
        let decision = arbiter.compute(&position, &metadata);
        assert_eq!(decision.authority, Authority::ProfitLock);
        assert_eq!(decision.state, ArbiterState::SweetSpot);
    }

    #[test]
    fn trailing_on_profit_above_increment() {
        let risk = RiskConfig::default();
        let corrector = MetadataCorrector::new();
        let arbiter = Arbiter::new(&risk, &corrector);
        let metadata = InstrumentMetadata {
            bid: Decimal::new(119740, 5),
            ask: Decimal::new(119760, 5),
            ..forex_metadata()
        };
        let position = Position {
            direction: Direction::Sell,
            ..buy_position("1.19750", "0.25", "0.0")
        };
        let decision = arbiter.compute(&position, &metadata);
        assert_eq!(decision.authority, Authority::Trailing);
        assert_eq!(decision.target_usd, Decimal::new(10, 2));
    }

    #[test]
    fn no_decision_in_dead_zone_below_sweet_min() {
        let risk = RiskConfig::default();
        let corrector = MetadataCorrector::new();
        let arbiter = Arbiter::new(&risk, &corrector);
        let metadata = forex_metadata();
        let position = buy_position("1.20001", "0.01", "0.0");
        let decision = arbiter.compute(&position, &metadata);
        assert_eq!(decision.authority, Authority::None);
    }

    #[test]
    fn regression_is_cancelled_not_applied() {
        let risk = RiskConfig::default();
        let corrector = MetadataCorrector::new();
        let arbiter = Arbiter::new(&risk, &corrector);
        let metadata = forex_metadata();
        // Current SL already locks more profit than the new sweet-spot band would.
        let position = buy_position("1.20005", "0.05", "1.20060");
        let decision = arbiter.compute(&position, &metadata);
        assert!(decision.target_price.is_none());
        assert!(!decision.violations.is_empty());
    }
}
