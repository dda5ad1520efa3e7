//! SL Price Calculator.
//!
//! Produces a candidate stop-loss price from (entry, target USD, direction,
//! volume, corrected multiplier, broker quote) and sanity-gates the result.
//! Pure aside from its dependency on the Instrument Metadata Corrector's
//! cache.

use rust_decimal::Decimal;

use crate::error::{Result, SlmError};
use crate::metadata_corrector::MetadataCorrector;
use crate::types::{Direction, InstrumentMetadata, Position};

/// Whether the caller wants loss protection (SL must land on the adverse
/// side of entry) or profit locking (SL just needs to be positive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    LossProtection,
    ProfitLock,
}

pub struct PriceCalculator<'a> {
    corrector: &'a MetadataCorrector,
}

impl<'a> PriceCalculator<'a> {
    pub fn new(corrector: &'a MetadataCorrector) -> Self {
        Self { corrector }
    }

    /// `target_profit_usd` is signed: negative means loss.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate(
        &self,
        entry_price: Decimal,
        target_profit_usd: Decimal,
        direction: Direction,
        volume: Decimal,
        metadata: &InstrumentMetadata,
        position: Option<&Position>,
        intent: Intent,
    ) -> Result<Decimal> {
        let corrected_size = self.corrector.corrected_size(
            &metadata.symbol,
            entry_price,
            volume,
            target_profit_usd,
            metadata.nominal_contract_size,
            position,
        );

        let price_diff = if let Some(tick_value) = metadata.tick_value_usd {
            if tick_value > Decimal::ZERO && volume > Decimal::ZERO {
                let price_diff_points = target_profit_usd / (volume * tick_value);
                price_diff_points * metadata.point
            } else {
                self.reverse_or_fallback(entry_price, target_profit_usd, volume, metadata, position, corrected_size)?
            }
        } else if metadata.looks_index_or_crypto_like(entry_price) && position.is_some() {
            self.reverse_or_fallback(entry_price, target_profit_usd, volume, metadata, position, corrected_size)?
        } else {
            if volume <= Decimal::ZERO || corrected_size <= Decimal::ZERO {
                return Err(SlmError::InvalidSl("non-positive volume or contract size".into()));
            }
            target_profit_usd / (volume * corrected_size)
        };

        let signed_diff = match direction {
            Direction::Buy => price_diff,
            Direction::Sell => -price_diff,
        };

        let raw_sl = entry_price + signed_diff;
        let sl = self.normalize(raw_sl, metadata.point, metadata.digits);

        self.sanity_gate(sl, entry_price, direction, intent)?;
        Ok(sl)
    }

    fn reverse_or_fallback(
        &self,
        entry_price: Decimal,
        target_profit_usd: Decimal,
        volume: Decimal,
        metadata: &InstrumentMetadata,
        position: Option<&Position>,
        corrected_size: Decimal,
    ) -> Result<Decimal> {
        if let Some(pos) = position {
            let price_delta = (pos.current_price - pos.entry_price).abs();
            if pos.profit_usd != Decimal::ZERO && price_delta > Decimal::ZERO && volume > Decimal::ZERO {
                let m_star = pos.profit_usd.abs() / (price_delta * volume);
                if m_star >= Decimal::new(1, 1) {
                    return Ok(target_profit_usd / (volume * m_star));
                }
            }
        }
        if volume <= Decimal::ZERO || corrected_size <= Decimal::ZERO {
            return Err(SlmError::InvalidSl("non-positive volume or contract size".into()));
        }
        let _ = (entry_price, metadata);
        Ok(target_profit_usd / (volume * corrected_size))
    }

    fn normalize(&self, price: Decimal, point: Decimal, digits: u32) -> Decimal {
        if point > Decimal::ZERO {
            let ticks = (price / point).round();
            (ticks * point).round_dp(digits)
        } else {
            price.round_dp(digits)
        }
    }

    fn sanity_gate(
        &self,
        sl: Decimal,
        entry_price: Decimal,
        direction: Direction,
        intent: Intent,
    ) -> Result<()> {
        if sl <= Decimal::ZERO {
            return Err(SlmError::InvalidSl("non-positive stop-loss price".into()));
        }
        if entry_price > Decimal::ZERO {
            let displacement_pct = (sl - entry_price).abs() / entry_price;
            if displacement_pct > Decimal::new(10, 2) {
                return Err(SlmError::InvalidSl(format!(
                    "sl {sl} displaced {displacement_pct:.4} from entry {entry_price}, exceeds 10% sanity bound"
                )));
            }
        }
        if intent == Intent::LossProtection {
            let ok = match direction {
                Direction::Buy => sl < entry_price,
                Direction::Sell => sl > entry_price,
            };
            if !ok {
                return Err(SlmError::InvalidSl(
                    "loss-protection sl must sit on the adverse side of entry".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn forex_metadata() -> InstrumentMetadata {
        InstrumentMetadata {
            symbol: "EURUSD".to_string(),
            point: Decimal::new(1, 5),
            digits: 5,
            nominal_contract_size: Decimal::new(100_000, 0),
            tick_value_usd: None,
            min_stops_distance: 0,
            bid: Decimal::new(119800, 5),
            ask: Decimal::new(119810, 5),
        }
    }

    #[test]
    fn buy_loss_protection_displaces_below_entry() {
        let corrector = MetadataCorrector::new();
        let calc = PriceCalculator::new(&corrector);
        let metadata = forex_metadata();
        let sl = calc
            .calculate(
                Decimal::new(120000, 5),
                Decimal::new(-200, 2),
                Direction::Buy,
                Decimal::new(1, 2),
                &metadata,
                None,
                Intent::LossProtection,
            )
            .unwrap();
        assert!(sl < Decimal::new(120000, 5));
    }

    #[test]
    fn sell_profit_lock_displaces_below_entry_for_sell() {
        let corrector = MetadataCorrector::new();
        let calc = PriceCalculator::new(&corrector);
        let metadata = forex_metadata();
        let sl = calc
            .calculate(
                Decimal::new(120000, 5),
                Decimal::new(10, 2),
                Direction::Sell,
                Decimal::new(1, 2),
                &metadata,
                None,
                Intent::ProfitLock,
            )
            .unwrap();
        assert!(sl < Decimal::new(120000, 5));
    }

    #[test]
    fn rejects_displacement_over_ten_percent() {
        let corrector = MetadataCorrector::new();
        let calc = PriceCalculator::new(&corrector);
        let metadata = forex_metadata();
        let result = calc.calculate(
            Decimal::new(120000, 5),
            Decimal::new(-500000, 2),
            Direction::Buy,
            Decimal::new(1, 2),
            &metadata,
            None,
            Intent::LossProtection,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_positive_sl() {
        let corrector = MetadataCorrector::new();
        let calc = PriceCalculator::new(&corrector);
        let metadata = forex_metadata();
        let result = calc.calculate(
            Decimal::new(1, 5),
            Decimal::new(-200, 2),
            Direction::Buy,
            Decimal::new(100, 2),
            &metadata,
            None,
            Intent::LossProtection,
        );
        assert!(result.is_err());
    }
}
