//! Instrument Metadata Corrector.
//!
//! Brokers frequently report `nominal_contract_size = 1.0` for instruments
//! whose effective multiplier is 100, 1 000, or 10 000; using the reported
//! value places stops 10²–10⁴ times displaced from entry. This module
//! derives a corrected multiplier per symbol and caches it under a mutex
//! with a 6-hour TTL.

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::warn;

use crate::types::{CachedMultiplier, Position};

const CACHE_TTL_HOURS: i64 = 6;
const CANDIDATE_MULTIPLIERS: [i64; 4] = [10, 100, 1000, 10000];

pub struct MetadataCorrector {
    cache: Mutex<HashMap<String, CachedMultiplier>>,
    manual_overrides: Mutex<HashMap<String, Decimal>>,
}

impl MetadataCorrector {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            manual_overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_manual_override(&self, symbol: &str, contract_size: Decimal) {
        self.manual_overrides
            .lock()
            .insert(symbol.to_string(), contract_size);
    }

    /// Returns the corrected contract multiplier for `symbol`. Never fails:
    /// on total ambiguity it returns `reported_size` and logs a degradation
    /// warning.
    #[allow(clippy::too_many_arguments)]
    pub fn corrected_size(
        &self,
        symbol: &str,
        entry_price: Decimal,
        volume: Decimal,
        target_loss_usd: Decimal,
        reported_size: Decimal,
        position: Option<&Position>,
    ) -> Decimal {
        if let Some(size) = self.manual_overrides.lock().get(symbol).copied() {
            return size;
        }

        if let Some(cached) = self.cache.lock().get(symbol).copied() {
            if Utc::now() - cached.acquired_at < ChronoDuration::hours(CACHE_TTL_HOURS) {
                return cached.size;
            }
        }

        if volume > Decimal::ZERO && reported_size > Decimal::ZERO {
            let d_r = target_loss_usd.abs() / (volume * reported_size);
            if entry_price > Decimal::ZERO && d_r < entry_price * Decimal::new(10, 2) {
                self.cache_value(symbol, reported_size);
                return reported_size;
            }
        }

        if let Some(pos) = position {
            let price_delta = (pos.current_price - pos.entry_price).abs();
            if pos.profit_usd != Decimal::ZERO && price_delta > Decimal::ZERO && volume > Decimal::ZERO {
                let candidate = pos.profit_usd.abs() / (price_delta * volume);
                if candidate >= Decimal::new(1, 1) && candidate <= Decimal::new(1_000_000, 0) {
                    self.cache_value(symbol, candidate);
                    return candidate;
                }
            }
        }

        for &m in CANDIDATE_MULTIPLIERS.iter() {
            let multiplier = Decimal::from(m);
            if volume <= Decimal::ZERO || multiplier <= Decimal::ZERO {
                continue;
            }
            let d = target_loss_usd.abs() / (volume * multiplier);
            if entry_price > Decimal::ZERO && d < entry_price * Decimal::new(10, 2) {
                self.cache_value(symbol, multiplier);
                return multiplier;
            }
        }

        warn!(
            symbol,
            %reported_size,
            "instrument metadata corrector exhausted all strategies, falling back to reported size"
        );
        reported_size
    }

    fn cache_value(&self, symbol: &str, size: Decimal) {
        self.cache.lock().insert(
            symbol.to_string(),
            CachedMultiplier {
                size,
                acquired_at: Utc::now(),
            },
        );
    }
}

impl Default for MetadataCorrector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn position(entry: &str, current: &str, profit: &str, volume: &str) -> Position {
        Position {
            ticket: 1,
            symbol: "BTCXAUm".to_string(),
            direction: Direction::Buy,
            entry_price: entry.parse().unwrap(),
            current_price: current.parse().unwrap(),
            current_sl: Decimal::ZERO,
            volume: volume.parse().unwrap(),
            profit_usd: profit.parse().unwrap(),
        }
    }

    #[test]
    fn accepts_reported_size_when_displacement_small() {
        let corrector = MetadataCorrector::new();
        let size = corrector.corrected_size(
            "EURUSD",
            Decimal::new(120000, 5),
            Decimal::new(1, 2),
            Decimal::new(200, 2),
            Decimal::new(100_000, 0),
            None,
        );
        assert_eq!(size, Decimal::new(100_000, 0));
    }

    #[test]
    fn reverse_engineers_from_live_profit() {
        let corrector = MetadataCorrector::new();
        let pos = position("22.34929", "22.30000", "-2.00", "0.01");
        let size = corrector.corrected_size(
            "BTCXAUm",
            pos.entry_price,
            pos.volume,
            Decimal::new(200, 2),
            Decimal::ONE,
            Some(&pos),
        );
        assert!(size >= Decimal::new(1, 1));
        let displacement = (pos.current_price - pos.entry_price).abs();
        let implied = displacement * pos.volume * size;
        assert!((implied - Decimal::new(200, 2)).abs() < Decimal::new(5, 2));
    }

    #[test]
    fn tries_candidate_multipliers_without_position() {
        let corrector = MetadataCorrector::new();
        let size = corrector.corrected_size(
            "US30",
            Decimal::new(30000, 0),
            Decimal::ONE,
            Decimal::new(200, 2),
            Decimal::ONE,
            None,
        );
        assert!(CANDIDATE_MULTIPLIERS.iter().any(|&m| Decimal::from(m) == size));
    }

    #[test]
    fn caches_and_reuses_within_ttl() {
        let corrector = MetadataCorrector::new();
        corrector.set_manual_override("XAUUSD", Decimal::new(100, 0));
        let size = corrector.corrected_size(
            "XAUUSD",
            Decimal::new(2000, 0),
            Decimal::ONE,
            Decimal::new(200, 2),
            Decimal::ONE,
            None,
        );
        assert_eq!(size, Decimal::new(100, 0));
    }
}
