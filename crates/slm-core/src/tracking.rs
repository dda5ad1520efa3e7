//! Per-Ticket Tracking, mutated under a separate tracking mutex per
//! ticket — never the same mutex as the ticket lock, and always released
//! before the ticket lock is taken.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::types::Authority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstEligibleState {
    None,
    Pending,
    Applied,
}

#[derive(Debug, Clone)]
pub struct FirstEligibleUpdate {
    pub state: FirstEligibleState,
    pub authority: Authority,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProfitZoneEntry {
    pub entered_at: DateTime<Utc>,
    pub entry_profit: Decimal,
    pub sl_locked: bool,
    pub attempts: u32,
    pub last_reason: String,
}

#[derive(Debug, Clone)]
pub struct PerTicketTracking {
    pub last_sl_attempt_at: Option<DateTime<Utc>>,
    pub last_sl_success_at: Option<DateTime<Utc>>,
    pub last_applied_sl_price: Decimal,
    pub last_reason: String,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub profit_zone_entry: Option<ProfitZoneEntry>,
    pub first_eligible_update: FirstEligibleUpdate,
    pub emergency_enforcement_count: u32,
    pub circuit_breaker_disabled_until: Option<DateTime<Utc>>,
    pub manual_review_flag: bool,
    /// Set when a guaranteed-execution attempt begins, cleared when it
    /// completes (success or failure). Distinct from `last_sl_attempt_at`,
    /// which only ever records a *finished* attempt's timestamp.
    pub attempt_in_flight_since: Option<DateTime<Utc>>,
}

impl Default for PerTicketTracking {
    fn default() -> Self {
        Self {
            last_sl_attempt_at: None,
            last_sl_success_at: None,
            last_applied_sl_price: Decimal::ZERO,
            last_reason: String::new(),
            consecutive_failures: 0,
            cooldown_until: None,
            profit_zone_entry: None,
            first_eligible_update: FirstEligibleUpdate {
                state: FirstEligibleState::None,
                authority: Authority::None,
                first_seen_at: Utc::now(),
            },
            emergency_enforcement_count: 0,
            circuit_breaker_disabled_until: None,
            manual_review_flag: false,
            attempt_in_flight_since: None,
        }
    }
}

impl PerTicketTracking {
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|t| now < t)
    }

    pub fn circuit_breaker_active(&self, now: DateTime<Utc>) -> bool {
        self.circuit_breaker_disabled_until.is_some_and(|t| now < t)
    }

    pub fn is_first_eligible_pending(&self) -> bool {
        self.first_eligible_update.state == FirstEligibleState::Pending
    }

    pub fn on_profit_transition(&mut self, profit_usd: Decimal) {
        let now = Utc::now();
        if profit_usd > Decimal::ZERO && self.profit_zone_entry.is_none() {
            self.profit_zone_entry = Some(ProfitZoneEntry {
                entered_at: now,
                entry_profit: profit_usd,
                sl_locked: false,
                attempts: 0,
                last_reason: String::new(),
            });
        } else if profit_usd <= Decimal::ZERO {
            self.profit_zone_entry = None;
        }
    }

    pub fn mark_first_eligible_if_new(&mut self, authority: Authority) {
        if self.first_eligible_update.state == FirstEligibleState::None && authority != Authority::None {
            self.first_eligible_update = FirstEligibleUpdate {
                state: FirstEligibleState::Pending,
                authority,
                first_seen_at: Utc::now(),
            };
        }
    }

    pub fn record_success(&mut self, applied_sl: Decimal, reason: &str, cooldown: Option<DateTime<Utc>>) {
        let now = Utc::now();
        self.last_sl_attempt_at = Some(now);
        self.last_sl_success_at = Some(now);
        self.last_applied_sl_price = applied_sl;
        self.last_reason = reason.to_string();
        self.consecutive_failures = 0;
        self.attempt_in_flight_since = None;
        if self.is_first_eligible_pending() {
            self.first_eligible_update.state = FirstEligibleState::Applied;
        } else {
            self.cooldown_until = cooldown;
        }
    }

    pub fn record_failure(&mut self, reason: &str) -> u32 {
        self.last_sl_attempt_at = Some(Utc::now());
        self.last_reason = reason.to_string();
        self.consecutive_failures += 1;
        self.attempt_in_flight_since = None;
        self.consecutive_failures
    }

    pub fn set_circuit_breaker(&mut self, until: DateTime<Utc>) {
        self.circuit_breaker_disabled_until = Some(until);
    }

    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.attempt_in_flight_since = Some(now);
    }

    pub fn end_attempt(&mut self) {
        self.attempt_in_flight_since = None;
    }
}

/// Process-local map of ticket → tracking state, one independent mutex per
/// ticket rather than one global mutex, a `DashMap<Key, Value>` keyed on
/// per-entity state.
#[derive(Default)]
pub struct TrackingTable {
    inner: DashMap<u64, Arc<Mutex<PerTicketTracking>>>,
}

impl TrackingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, ticket: u64) -> Arc<Mutex<PerTicketTracking>> {
        self.inner
            .entry(ticket)
            .or_insert_with(|| Arc::new(Mutex::new(PerTicketTracking::default())))
            .clone()
    }

    /// Marks an attempt in flight for `ticket` until the returned guard is
    /// dropped, which happens on every exit path (success, failure, or an
    /// early return) without each caller having to remember to clear it.
    pub fn start_attempt(&self, ticket: u64, now: DateTime<Utc>) -> AttemptGuard {
        let entry = self.entry(ticket);
        entry.lock().begin_attempt(now);
        AttemptGuard { entry }
    }

    pub fn cleanup(&self, ticket: u64) {
        self.inner.remove(&ticket);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// RAII handle for an in-flight attempt; clears `attempt_in_flight_since` on drop.
pub struct AttemptGuard {
    entry: Arc<Mutex<PerTicketTracking>>,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.entry.lock().end_attempt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profit_transition_creates_and_clears_zone_entry() {
        let mut tracking = PerTicketTracking::default();
        tracking.on_profit_transition(Decimal::new(5, 2));
        assert!(tracking.profit_zone_entry.is_some());
        tracking.on_profit_transition(Decimal::new(-1, 2));
        assert!(tracking.profit_zone_entry.is_none());
    }

    #[test]
    fn first_eligible_marks_once_then_applies() {
        let mut tracking = PerTicketTracking::default();
        tracking.mark_first_eligible_if_new(Authority::Hard);
        assert!(tracking.is_first_eligible_pending());
        tracking.record_success(Decimal::ONE, "ok", None);
        assert_eq!(tracking.first_eligible_update.state, FirstEligibleState::Applied);
    }

    #[test]
    fn failure_increments_consecutive_counter() {
        let mut tracking = PerTicketTracking::default();
        assert_eq!(tracking.record_failure("x"), 1);
        assert_eq!(tracking.record_failure("x"), 2);
    }
}
