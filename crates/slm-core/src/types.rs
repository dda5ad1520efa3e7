//! Core data model: positions, instrument metadata, and arbitration decisions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

/// Read-only snapshot of an open broker position. The SLM never mutates
/// this; it mutates the broker, then re-reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    /// 0 = unset.
    pub current_sl: Decimal,
    pub volume: Decimal,
    pub profit_usd: Decimal,
}

impl Position {
    pub fn has_sl(&self) -> bool {
        self.current_sl > Decimal::ZERO
    }
}

/// Instrument metadata as reported by the broker, possibly corrected by the
/// Instrument Metadata Corrector (§4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMetadata {
    pub symbol: String,
    /// Minimal price increment.
    pub point: Decimal,
    pub digits: u32,
    pub nominal_contract_size: Decimal,
    pub tick_value_usd: Option<Decimal>,
    /// Integer points.
    pub min_stops_distance: i64,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl InstrumentMetadata {
    /// Heuristic used by the SL Price Calculator (§4.2 step 3) to decide
    /// whether an instrument "looks like" an index or crypto contract.
    pub fn looks_index_or_crypto_like(&self, entry_price: Decimal) -> bool {
        let small_exp = Decimal::new(1, 4); // 10^-4
        self.point >= Decimal::new(1, 2) // point >= 0.01
            || (self.point < small_exp && entry_price > Decimal::new(100, 0))
            || self.tick_value_usd.is_some()
    }
}

/// A cached, possibly-corrected contract multiplier with its acquisition
/// time, for the Instrument Metadata Corrector's 6-hour TTL cache.
#[derive(Debug, Clone, Copy)]
pub struct CachedMultiplier {
    pub size: Decimal,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Authority {
    Trailing,
    ProfitLock,
    Hard,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArbiterState {
    SweetSpot,
    TrailingActive,
    ProfitLocked,
    Managing,
}

/// Output of the Authoritative-SL Arbiter (§4.5). Pure: produced from a
/// position snapshot with no locks acquired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub target_price: Option<Decimal>,
    pub target_usd: Decimal,
    pub authority: Authority,
    pub reason: String,
    pub state: ArbiterState,
    pub is_trailing: bool,
    pub is_profit_lock: bool,
    pub violations: Vec<String>,
}

impl Decision {
    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            target_price: None,
            target_usd: Decimal::ZERO,
            authority: Authority::None,
            reason: reason.into(),
            state: ArbiterState::Managing,
            is_trailing: false,
            is_profit_lock: false,
            violations: Vec::new(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.authority != Authority::None && self.violations.is_empty()
    }
}
