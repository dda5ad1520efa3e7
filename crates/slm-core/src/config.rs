//! Configuration for the stop-loss manager.
//!
//! Oversize values are clamped at construction time (see `SlmConfig::clamp`)
//! rather than at first use, so a single `CONFIG_OVERRIDE` log line at
//! startup reflects every adjustment.

use serde::Deserialize;
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

/// `mode` selects the diagnostic log directory root (`logs/<mode>/...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Backtest,
    Live,
}

impl RunMode {
    pub fn as_dir_name(&self) -> &'static str {
        match self {
            RunMode::Backtest => "backtest",
            RunMode::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub max_risk_per_trade_usd: f64,
    pub trailing_stop_increment_usd: f64,
    pub profit_locking_min_profit_threshold_usd: f64,
    pub profit_locking_max_profit_threshold_usd: f64,
    pub trailing_cycle_interval_ms: u64,
    pub trailing_instant_trailing: bool,
    pub trailing_trigger_on_tick: bool,
    pub sl_update_min_interval_ms: u64,
    pub lock_acquisition_timeout_seconds: f64,
    pub profit_locking_lock_timeout_seconds: f64,
    pub disabled_symbols: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade_usd: 2.00,
            trailing_stop_increment_usd: 0.10,
            profit_locking_min_profit_threshold_usd: 0.03,
            profit_locking_max_profit_threshold_usd: 0.10,
            trailing_cycle_interval_ms: 500,
            trailing_instant_trailing: false,
            trailing_trigger_on_tick: false,
            sl_update_min_interval_ms: 100,
            lock_acquisition_timeout_seconds: 1.0,
            profit_locking_lock_timeout_seconds: 2.0,
            disabled_symbols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    pub effective_profit_tolerance_usd: f64,
    pub price_tolerance_multiplier: f64,
    pub use_exponential_backoff: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            effective_profit_tolerance_usd: 1.0,
            price_tolerance_multiplier: 10.0,
            use_exponential_backoff: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    pub order_max_retries: u32,
    pub order_retry_backoff_base_seconds: f64,
    pub sl_verification_delay_seconds: f64,
    pub global_rpc_max_per_second: u32,
    pub verification: VerificationConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_max_retries: 3,
            order_retry_backoff_base_seconds: 0.1,
            sl_verification_delay_seconds: 0.2,
            global_rpc_max_per_second: 50,
            verification: VerificationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SymbolOverride {
    pub contract_size: Option<f64>,
    pub verification_tolerance_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlmConfig {
    pub mode: RunMode,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub symbol_overrides: std::collections::HashMap<String, SymbolOverride>,
}

impl Default for SlmConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Backtest,
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            symbol_overrides: std::collections::HashMap::new(),
        }
    }
}

const LOCK_TIMEOUT_CEILING_SECONDS: f64 = 2.0;
const PROFIT_LOCK_TIMEOUT_CEILING_SECONDS: f64 = 3.0;

impl SlmConfig {
    /// Load configuration from environment variables, falling back to
    /// spec-mandated defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut cfg = Self {
            mode: match env::var("SLM_MODE").ok().as_deref() {
                Some("live") => RunMode::Live,
                _ => RunMode::Backtest,
            },
            risk: RiskConfig {
                max_risk_per_trade_usd: env_f64("SLM_RISK_MAX_RISK_PER_TRADE_USD", 2.00),
                trailing_stop_increment_usd: env_f64(
                    "SLM_RISK_TRAILING_STOP_INCREMENT_USD",
                    0.10,
                ),
                profit_locking_min_profit_threshold_usd: env_f64(
                    "SLM_RISK_PROFIT_LOCKING_MIN_PROFIT_THRESHOLD_USD",
                    0.03,
                ),
                profit_locking_max_profit_threshold_usd: env_f64(
                    "SLM_RISK_PROFIT_LOCKING_MAX_PROFIT_THRESHOLD_USD",
                    0.10,
                ),
                trailing_cycle_interval_ms: env_u64("SLM_RISK_TRAILING_CYCLE_INTERVAL_MS", 500),
                trailing_instant_trailing: env_bool("SLM_RISK_TRAILING_INSTANT_TRAILING", false),
                trailing_trigger_on_tick: env_bool("SLM_RISK_TRAILING_TRIGGER_ON_TICK", false),
                sl_update_min_interval_ms: env_u64("SLM_RISK_SL_UPDATE_MIN_INTERVAL_MS", 100),
                lock_acquisition_timeout_seconds: env_f64(
                    "SLM_RISK_LOCK_ACQUISITION_TIMEOUT_SECONDS",
                    1.0,
                ),
                profit_locking_lock_timeout_seconds: env_f64(
                    "SLM_RISK_PROFIT_LOCKING_LOCK_TIMEOUT_SECONDS",
                    2.0,
                ),
                disabled_symbols: env::var("SLM_RISK_DISABLED_SYMBOLS")
                    .ok()
                    .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
                    .unwrap_or_default(),
            },
            execution: ExecutionConfig {
                order_max_retries: env_u64("SLM_EXECUTION_ORDER_MAX_RETRIES", 3) as u32,
                order_retry_backoff_base_seconds: env_f64(
                    "SLM_EXECUTION_ORDER_RETRY_BACKOFF_BASE_SECONDS",
                    0.1,
                ),
                sl_verification_delay_seconds: env_f64(
                    "SLM_EXECUTION_SL_VERIFICATION_DELAY_SECONDS",
                    0.2,
                ),
                global_rpc_max_per_second: env_u64("SLM_EXECUTION_GLOBAL_RPC_MAX_PER_SECOND", 50)
                    as u32,
                verification: VerificationConfig {
                    effective_profit_tolerance_usd: env_f64(
                        "SLM_EXECUTION_VERIFICATION_EFFECTIVE_PROFIT_TOLERANCE_USD",
                        1.0,
                    ),
                    price_tolerance_multiplier: env_f64(
                        "SLM_EXECUTION_VERIFICATION_PRICE_TOLERANCE_MULTIPLIER",
                        10.0,
                    ),
                    use_exponential_backoff: env_bool(
                        "SLM_EXECUTION_VERIFICATION_USE_EXPONENTIAL_BACKOFF",
                        true,
                    ),
                },
            },
            symbol_overrides: std::collections::HashMap::new(),
        };

        cfg.clamp();
        Ok(cfg)
    }

    /// Caps configuration values to their ceilings, logging `CONFIG_OVERRIDE`
    /// for each adjustment made.
    fn clamp(&mut self) {
        if self.risk.lock_acquisition_timeout_seconds > LOCK_TIMEOUT_CEILING_SECONDS {
            warn!(
                event = "CONFIG_OVERRIDE",
                field = "risk.lock_acquisition_timeout_seconds",
                requested = self.risk.lock_acquisition_timeout_seconds,
                ceiling = LOCK_TIMEOUT_CEILING_SECONDS,
                "clamped oversize lock timeout"
            );
            self.risk.lock_acquisition_timeout_seconds = LOCK_TIMEOUT_CEILING_SECONDS;
        }
        if self.risk.profit_locking_lock_timeout_seconds > PROFIT_LOCK_TIMEOUT_CEILING_SECONDS {
            warn!(
                event = "CONFIG_OVERRIDE",
                field = "risk.profit_locking_lock_timeout_seconds",
                requested = self.risk.profit_locking_lock_timeout_seconds,
                ceiling = PROFIT_LOCK_TIMEOUT_CEILING_SECONDS,
                "clamped oversize profit-locking lock timeout"
            );
            self.risk.profit_locking_lock_timeout_seconds = PROFIT_LOCK_TIMEOUT_CEILING_SECONDS;
        }
        // Interval clamp: 0 means instant; 1..50 clamps to 50 unless instant-trailing forces 0.
        let interval = self.risk.trailing_cycle_interval_ms;
        if interval > 0 && interval < 50 && !self.trailing_is_instant() {
            warn!(
                event = "CONFIG_OVERRIDE",
                field = "risk.trailing_cycle_interval_ms",
                requested = interval,
                clamped = 50,
                "clamped sub-50ms worker interval"
            );
            self.risk.trailing_cycle_interval_ms = 50;
        }
    }

    pub fn trailing_is_instant(&self) -> bool {
        self.risk.trailing_cycle_interval_ms == 0
            || self.risk.trailing_instant_trailing
            || self.risk.trailing_trigger_on_tick
    }

    pub fn worker_interval(&self) -> Duration {
        if self.trailing_is_instant() {
            Duration::from_millis(0)
        } else {
            Duration::from_millis(self.risk.trailing_cycle_interval_ms)
        }
    }

    pub fn lock_timeout(&self, is_profit_locking: bool) -> Duration {
        let secs = if is_profit_locking {
            self.risk.profit_locking_lock_timeout_seconds
        } else {
            self.risk.lock_acquisition_timeout_seconds
        };
        Duration::from_secs_f64(secs)
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn test_config() -> Self {
        Self::default()
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = SlmConfig::default();
        assert_eq!(cfg.risk.max_risk_per_trade_usd, 2.00);
        assert_eq!(cfg.risk.trailing_stop_increment_usd, 0.10);
        assert_eq!(cfg.risk.profit_locking_min_profit_threshold_usd, 0.03);
        assert_eq!(cfg.risk.profit_locking_max_profit_threshold_usd, 0.10);
        assert_eq!(cfg.execution.order_max_retries, 3);
        assert_eq!(cfg.execution.global_rpc_max_per_second, 50);
    }

    #[test]
    fn clamp_caps_oversize_lock_timeouts() {
        let mut cfg = SlmConfig::default();
        cfg.risk.lock_acquisition_timeout_seconds = 20.0;
        cfg.risk.profit_locking_lock_timeout_seconds = 30.0;
        cfg.clamp();
        assert_eq!(cfg.risk.lock_acquisition_timeout_seconds, 2.0);
        assert_eq!(cfg.risk.profit_locking_lock_timeout_seconds, 3.0);
    }

    #[test]
    fn clamp_raises_sub_50ms_interval() {
        let mut cfg = SlmConfig::default();
        cfg.risk.trailing_cycle_interval_ms = 10;
        cfg.clamp();
        assert_eq!(cfg.risk.trailing_cycle_interval_ms, 50);
    }

    #[test]
    fn instant_trailing_bypasses_interval_clamp() {
        let mut cfg = SlmConfig::default();
        cfg.risk.trailing_cycle_interval_ms = 10;
        cfg.risk.trailing_instant_trailing = true;
        cfg.clamp();
        assert_eq!(cfg.risk.trailing_cycle_interval_ms, 10);
    }
}
