//! Violation Detector.
//!
//! Invoked after every arbitration. Emits CRITICAL log entries but never
//! mutates state.

use chrono::{DateTime, Utc};
use tracing::error;

use crate::types::Decision;

const GUARANTEED_EXECUTION_BUDGET_MS: i64 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    RegressionAttempt(String),
    SlNotMoving,
    SlNotApplied,
}

pub fn detect(
    ticket: u64,
    decision: &Decision,
    last_success_at: Option<DateTime<Utc>>,
    attempt_started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for v in &decision.violations {
        error!(ticket, violation = %v, "CRITICAL regression attempt detected by arbiter");
        violations.push(Violation::RegressionAttempt(v.clone()));
    }

    if (decision.is_trailing || decision.is_profit_lock) && decision.target_price.is_some() {
        if let Some(last) = last_success_at {
            if (now - last).num_milliseconds() > GUARANTEED_EXECUTION_BUDGET_MS {
                error!(ticket, "CRITICAL SL not moving: guaranteed-execution authority stalled");
                violations.push(Violation::SlNotMoving);
            }
        }
    }

    if decision.is_actionable() {
        if let Some(started) = attempt_started_at {
            if (now - started).num_milliseconds() > GUARANTEED_EXECUTION_BUDGET_MS {
                error!(ticket, "CRITICAL SL not applied: guaranteed-execution window exceeded");
                violations.push(Violation::SlNotApplied);
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArbiterState, Authority};
    use rust_decimal::Decimal;

    fn trailing_decision() -> Decision {
        Decision {
            target_price: Some(Decimal::ONE),
            target_usd: Decimal::new(10, 2),
            authority: Authority::Trailing,
            reason: "x".into(),
            state: ArbiterState::TrailingActive,
            is_trailing: true,
            is_profit_lock: false,
            violations: Vec::new(),
        }
    }

    #[test]
    fn flags_regression_from_arbiter() {
        let mut decision = trailing_decision();
        decision.violations.push("test regression".into());
        decision.target_price = None;
        let violations = detect(1, &decision, None, None, Utc::now());
        assert!(violations.iter().any(|v| matches!(v, Violation::RegressionAttempt(_))));
    }

    #[test]
    fn flags_stalled_trailing_update() {
        let decision = trailing_decision();
        let last_success = Utc::now() - chrono::Duration::milliseconds(400);
        let violations = detect(1, &decision, Some(last_success), None, Utc::now());
        assert!(violations.contains(&Violation::SlNotMoving));
    }

    #[test]
    fn no_violations_on_fresh_decision() {
        let decision = trailing_decision();
        let violations = detect(1, &decision, Some(Utc::now()), None, Utc::now());
        assert!(violations.is_empty());
    }
}
