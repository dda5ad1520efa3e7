//! Broker-Constraint Adjuster.
//!
//! Clamps a candidate SL price to honor minimum stops-distance and the
//! monotonicity rule, with the one permitted exception: transitioning a
//! stop from the loss side of entry to the profit side.

use rust_decimal::Decimal;

use crate::types::{Direction, InstrumentMetadata};

/// Returns the adjusted SL, or `None` if the candidate must be rejected
/// outright (distance cannot be honored without crossing entry the wrong
/// way).
pub fn adjust(
    candidate: Decimal,
    sl_now: Decimal,
    direction: Direction,
    metadata: &InstrumentMetadata,
    entry_price: Decimal,
) -> Option<Decimal> {
    let min_distance = metadata.point * Decimal::from(metadata.min_stops_distance);

    let distance_clamped = match direction {
        Direction::Buy => {
            let ceiling = metadata.bid - min_distance;
            candidate.min(ceiling)
        }
        Direction::Sell => {
            let floor = metadata.ask + min_distance;
            candidate.max(floor)
        }
    };

    if distance_clamped <= Decimal::ZERO {
        return None;
    }

    if sl_now <= Decimal::ZERO {
        return Some(distance_clamped);
    }

    // Loss-to-profit exception: current stop sits on the adverse side of
    // entry, and the raw candidate crosses to the favorable side. Checked
    // ahead of the ordinary monotonicity fast path below, since that path
    // would otherwise short-circuit whenever the distance-clamped candidate
    // already happens to be no worse than sl_now, silently skipping this
    // branch.
    let current_is_adverse = match direction {
        Direction::Buy => sl_now < entry_price,
        Direction::Sell => sl_now > entry_price,
    };
    let candidate_is_favorable = match direction {
        Direction::Buy => candidate >= entry_price,
        Direction::Sell => candidate <= entry_price,
    };
    if current_is_adverse && candidate_is_favorable {
        return Some(candidate);
    }

    let would_worsen = match direction {
        Direction::Buy => distance_clamped < sl_now,
        Direction::Sell => distance_clamped > sl_now,
    };

    if would_worsen {
        Some(sl_now)
    } else {
        Some(distance_clamped)
    }
}
