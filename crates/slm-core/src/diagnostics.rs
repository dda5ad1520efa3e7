//! Diagnostic persistence.
//!
//! Diagnostic only: the broker remains the sole source of truth for open
//! positions and their stops. These sinks exist for operators and post-hoc
//! tooling, not for SLM state recovery. Shaped like a `*Repository` type —
//! own a handle, expose `insert`-shaped methods — but targeting files
//! instead of a Postgres pool.

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::config::RunMode;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlUpdateRecord {
    pub ts: chrono::DateTime<Utc>,
    pub ticket: u64,
    pub symbol: String,
    pub entry_price: Decimal,
    pub target_sl: Decimal,
    pub applied_sl: Decimal,
    pub attempt_number: u32,
    pub retry_backoff_ms: u64,
    pub reason: String,
    pub broker_error_code: Option<String>,
    pub effective_profit_target: Decimal,
    pub effective_profit_applied: Decimal,
    pub success: bool,
    pub thread_id: String,
}

pub struct SlSummaryRow {
    pub timestamp: chrono::DateTime<Utc>,
    pub ticket: u64,
    pub symbol: String,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub profit: Decimal,
    pub target_sl: Decimal,
    pub applied_sl: Decimal,
    pub effective_sl_profit: Decimal,
    pub last_update_time: chrono::DateTime<Utc>,
    pub last_update_result: String,
    pub failure_reason: String,
    pub consecutive_failures: u32,
    pub thread_id: String,
}

const CSV_BATCH_SIZE: usize = 10;

/// Owns the three diagnostic sinks; each one has its own mutex.
pub struct DiagnosticsSink {
    lock_log: Mutex<File>,
    updates_log: Mutex<File>,
    summary_csv: Mutex<(File, Vec<SlSummaryRow>)>,
}

impl DiagnosticsSink {
    pub fn new(mode: RunMode) -> Result<Self> {
        Self::new_under(Path::new("logs"), mode)
    }

    /// Same as `new`, but rooted at an arbitrary directory instead of
    /// `./logs` — used by tests so they never touch the process's real
    /// working directory.
    pub fn new_under(logs_root: &Path, mode: RunMode) -> Result<Self> {
        let root = logs_root.join(mode.as_dir_name());
        let engine_dir = root.join("engine");
        let runtime_dir = logs_root.join("runtime");
        std::fs::create_dir_all(&engine_dir)?;
        std::fs::create_dir_all(&runtime_dir)?;

        let ts = Utc::now().format("%Y%m%dT%H%M%S");
        let lock_log = open_append(&engine_dir.join("lock_diagnostics.jsonl"))?;
        let updates_log = open_append(&runtime_dir.join(format!("sl_updates_{ts}.jsonl")))?;
        let summary_path = runtime_dir.join(format!("sl_summary_{ts}.csv"));
        let mut summary_file = open_append(&summary_path)?;
        if summary_file.metadata()?.len() == 0 {
            writeln!(
                summary_file,
                "timestamp,ticket,symbol,entry_price,current_price,profit,target_sl,applied_sl,effective_sl_profit,last_update_time,last_update_result,failure_reason,consecutive_failures,thread_id"
            )?;
        }

        Ok(Self {
            lock_log: Mutex::new(lock_log),
            updates_log: Mutex::new(updates_log),
            summary_csv: Mutex::new((summary_file, Vec::new())),
        })
    }

    pub fn record_lock_event(&self, event: &crate::lock_manager::LockEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut f = self.lock_log.lock();
        writeln!(f, "{line}")?;
        Ok(())
    }

    pub fn record_sl_update(&self, record: &SlUpdateRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut f = self.updates_log.lock();
        writeln!(f, "{line}")?;
        Ok(())
    }

    /// Buffers a summary row; flushes every `CSV_BATCH_SIZE` rows. The
    /// worker's background thread also calls `flush_summary` unconditionally
    /// every 500ms regardless of batch size.
    pub fn queue_summary_row(&self, row: SlSummaryRow) -> Result<()> {
        let mut guard = self.summary_csv.lock();
        guard.1.push(row);
        if guard.1.len() >= CSV_BATCH_SIZE {
            flush_locked(&mut guard)?;
        }
        Ok(())
    }

    pub fn flush_summary(&self) -> Result<()> {
        let mut guard = self.summary_csv.lock();
        flush_locked(&mut guard)
    }
}

fn flush_locked(guard: &mut (File, Vec<SlSummaryRow>)) -> Result<()> {
    let (file, rows) = guard;
    for row in rows.drain(..) {
        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            row.timestamp.to_rfc3339(),
            row.ticket,
            row.symbol,
            row.entry_price,
            row.current_price,
            row.profit,
            row.target_sl,
            row.applied_sl,
            row.effective_sl_profit,
            row.last_update_time.to_rfc3339(),
            row.last_update_result,
            row.failure_reason,
            row.consecutive_failures,
            row.thread_id,
        )?;
    }
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_row_flushes_at_batch_size() {
        let dir = std::env::temp_dir().join(format!(
            "slm_test_{}_{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        let sink = DiagnosticsSink::new_under(&dir, RunMode::Backtest).unwrap();
        for i in 0..CSV_BATCH_SIZE {
            sink.queue_summary_row(SlSummaryRow {
                timestamp: Utc::now(),
                ticket: i as u64,
                symbol: "EURUSD".to_string(),
                entry_price: Decimal::ONE,
                current_price: Decimal::ONE,
                profit: Decimal::ZERO,
                target_sl: Decimal::ZERO,
                applied_sl: Decimal::ZERO,
                effective_sl_profit: Decimal::ZERO,
                last_update_time: Utc::now(),
                last_update_result: "ok".to_string(),
                failure_reason: String::new(),
                consecutive_failures: 0,
                thread_id: "t".to_string(),
            })
            .unwrap();
        }
        let guard = sink.summary_csv.lock();
        assert!(guard.1.is_empty());
    }
}
