//! The `Broker` capability: the SLM's only dependency on the outside world.
//!
//! Modeled as a plain trait rather than an async trait: broker RPCs block
//! the calling thread, and the SLM's own threading takes care of not
//! holding a ticket-lock across one outside the Executor's short
//! apply-then-verify window.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{InstrumentMetadata, Position};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Polymorphic over at least two variants (a real MT5 transport and a
/// simulated backtest transport); the SLM depends only on this interface.
pub trait Broker: Send + Sync {
    fn get_open_positions(&self) -> Vec<Position>;
    fn get_position_by_ticket(&self, ticket: u64) -> Option<Position>;
    fn modify_order(&self, ticket: u64, stop_loss_price: Decimal) -> bool;
    fn get_symbol_info(&self, symbol: &str) -> Option<InstrumentMetadata>;
    fn get_symbol_info_tick(&self, symbol: &str) -> Option<Tick>;
}

/// In-memory simulated broker used by tests and backtest mode. Mutations go
/// straight to an in-process table; there is no latency or failure
/// injection here beyond what a test explicitly configures through
/// `fail_next_modify` / `reject_next_modify`.
pub mod sim {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    pub struct SimBroker {
        positions: Mutex<HashMap<u64, Position>>,
        instruments: Mutex<HashMap<String, InstrumentMetadata>>,
        reject_next_modify: Mutex<u32>,
    }

    impl SimBroker {
        pub fn new() -> Self {
            Self {
                positions: Mutex::new(HashMap::new()),
                instruments: Mutex::new(HashMap::new()),
                reject_next_modify: Mutex::new(0),
            }
        }

        pub fn seed_position(&self, position: Position) {
            self.positions.lock().insert(position.ticket, position);
        }

        pub fn seed_instrument(&self, meta: InstrumentMetadata) {
            self.instruments.lock().insert(meta.symbol.clone(), meta);
        }

        /// The next `n` calls to `modify_order` return `false` without
        /// mutating state, simulating a flaky broker.
        pub fn reject_next(&self, n: u32) {
            *self.reject_next_modify.lock() = n;
        }
    }

    impl Default for SimBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Broker for SimBroker {
        fn get_open_positions(&self) -> Vec<Position> {
            self.positions.lock().values().cloned().collect()
        }

        fn get_position_by_ticket(&self, ticket: u64) -> Option<Position> {
            self.positions.lock().get(&ticket).cloned()
        }

        fn modify_order(&self, ticket: u64, stop_loss_price: Decimal) -> bool {
            let mut reject = self.reject_next_modify.lock();
            if *reject > 0 {
                *reject -= 1;
                return false;
            }
            drop(reject);
            let mut positions = self.positions.lock();
            if let Some(pos) = positions.get_mut(&ticket) {
                pos.current_sl = stop_loss_price;
                true
            } else {
                false
            }
        }

        fn get_symbol_info(&self, symbol: &str) -> Option<InstrumentMetadata> {
            self.instruments.lock().get(symbol).cloned()
        }

        fn get_symbol_info_tick(&self, symbol: &str) -> Option<Tick> {
            self.instruments
                .lock()
                .get(symbol)
                .map(|m| Tick { bid: m.bid, ask: m.ask })
        }
    }
}
