//! Per-Ticket Lock Manager.
//!
//! Reentrant ticket-scoped locks with bounded non-blocking acquisition, a
//! watchdog for stale/dead-thread holders, forced release, and a full
//! JSONL diagnostic trail. Built on `parking_lot::Mutex` + `Condvar` rather
//! than a plain `Mutex` because the lock must be acquirable recursively by
//! the same thread in backtest mode.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const STALE_PRE_RELEASE_MS: u64 = 50;
const WATCHDOG_STALE_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct HolderInfo {
    pub thread_id: ThreadId,
    pub thread_name: String,
    pub acquired_at: Instant,
    pub is_profit_locking: bool,
}

struct LockState {
    holder: Option<HolderInfo>,
    depth: u32,
}

struct TicketLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl TicketLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState { holder: None, depth: 0 }),
            cond: Condvar::new(),
        }
    }
}

/// A guard that releases the ticket lock on drop. Holding this guard across
/// a broker RPC is only ever done inside the Executor's short apply-verify
/// window.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    ticket: u64,
    thread_id: ThreadId,
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        self.manager.release(self.ticket, self.thread_id);
    }
}

/// Tracks which OS threads owned by this SLM instance are still running, so
/// the Lock Manager can distinguish a legitimately-slow holder from a
/// dead-thread orphan.
#[derive(Default)]
pub struct ThreadRegistry {
    alive: DashMap<ThreadId, Arc<AtomicBool>>,
}

pub struct ThreadRegistration {
    id: ThreadId,
    flag: Arc<AtomicBool>,
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ThreadId) -> ThreadRegistration {
        let flag = Arc::new(AtomicBool::new(true));
        self.alive.insert(id, flag.clone());
        ThreadRegistration { id, flag }
    }

    pub fn is_alive(&self, id: ThreadId) -> bool {
        // Unregistered threads (e.g. direct external callers) are presumed
        // alive since they are, by definition, the caller running this
        // check right now; only registered-and-flagged-dead threads count
        // as orphans.
        self.alive.get(&id).map(|f| f.load(Ordering::SeqCst)).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
    AcquireAttempt,
    Acquired,
    Released,
    ForcedRelease,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    pub ts: chrono::DateTime<Utc>,
    pub ticket: u64,
    pub event: LockEventKind,
    pub thread_name: String,
    pub thread_id: String,
    pub duration_ms: Option<u64>,
    pub is_profit_locking: bool,
    pub success: bool,
    pub holder_thread: Option<String>,
}

pub struct LockManager {
    locks: DashMap<u64, Arc<TicketLock>>,
    pub registry: ThreadRegistry,
    diag_tx: Option<crossbeam_channel::Sender<LockEvent>>,
}

impl LockManager {
    pub fn new(diag_tx: Option<crossbeam_channel::Sender<LockEvent>>) -> Self {
        Self {
            locks: DashMap::new(),
            registry: ThreadRegistry::new(),
            diag_tx,
        }
    }

    fn lock_for(&self, ticket: u64) -> Arc<TicketLock> {
        self.locks
            .entry(ticket)
            .or_insert_with(|| Arc::new(TicketLock::new()))
            .clone()
    }

    /// Removes bookkeeping for a ticket whose position has closed.
    pub fn cleanup(&self, ticket: u64) {
        self.locks.remove(&ticket);
    }

    fn emit(&self, event: LockEvent) {
        if let Some(tx) = &self.diag_tx {
            let _ = tx.try_send(event);
        }
    }

    /// Implements the full acquisition algorithm: a
    /// non-blocking attempt (optionally pre-releasing a stale holder), then
    /// up to two blocking attempts with a flat timeout and inter-attempt
    /// sleeps.
    pub fn acquire(
        &self,
        ticket: u64,
        is_profit_locking: bool,
        force_non_blocking_first: bool,
        base_timeout: Duration,
    ) -> Option<LockGuard<'_>> {
        let thread = std::thread::current();
        let thread_id = thread.id();
        let thread_name = thread.name().unwrap_or("unnamed").to_string();

        self.emit(LockEvent {
            ts: Utc::now(),
            ticket,
            event: LockEventKind::AcquireAttempt,
            thread_name: thread_name.clone(),
            thread_id: format!("{thread_id:?}"),
            duration_ms: None,
            is_profit_locking,
            success: false,
            holder_thread: None,
        });

        let lock = self.lock_for(ticket);

        if force_non_blocking_first {
            self.pre_release_if_stale(ticket, &lock, Duration::from_millis(STALE_PRE_RELEASE_MS));
        }

        if self.try_non_blocking(&lock, ticket, thread_id, &thread_name, is_profit_locking) {
            return Some(LockGuard { manager: self, ticket, thread_id });
        }

        // Dead-thread orphan check before committing to a blocking wait.
        if self.purge_if_dead_holder(ticket, &lock) {
            if self.try_non_blocking(&lock, ticket, thread_id, &thread_name, is_profit_locking) {
                return Some(LockGuard { manager: self, ticket, thread_id });
            }
        }

        for attempt in 1..=2u32 {
            std::thread::sleep(Duration::from_millis(10 * (attempt as u64 + 1)));
            if self.try_blocking(&lock, ticket, thread_id, &thread_name, is_profit_locking, base_timeout) {
                return Some(LockGuard { manager: self, ticket, thread_id });
            }
        }

        self.emit(LockEvent {
            ts: Utc::now(),
            ticket,
            event: LockEventKind::AcquireAttempt,
            thread_name,
            thread_id: format!("{thread_id:?}"),
            duration_ms: None,
            is_profit_locking,
            success: false,
            holder_thread: lock.state.lock().holder.as_ref().map(|h| h.thread_name.clone()),
        });
        None
    }

    fn try_non_blocking(
        &self,
        lock: &Arc<TicketLock>,
        ticket: u64,
        thread_id: ThreadId,
        thread_name: &str,
        is_profit_locking: bool,
    ) -> bool {
        let mut state = lock.state.lock();
        let acquired = match &state.holder {
            None => {
                state.holder = Some(HolderInfo {
                    thread_id,
                    thread_name: thread_name.to_string(),
                    acquired_at: Instant::now(),
                    is_profit_locking,
                });
                state.depth = 1;
                true
            }
            Some(h) if h.thread_id == thread_id => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        };
        drop(state);
        if acquired {
            self.emit(LockEvent {
                ts: Utc::now(),
                ticket,
                event: LockEventKind::Acquired,
                thread_name: thread_name.to_string(),
                thread_id: format!("{thread_id:?}"),
                duration_ms: Some(0),
                is_profit_locking,
                success: true,
                holder_thread: None,
            });
        }
        acquired
    }

    fn try_blocking(
        &self,
        lock: &Arc<TicketLock>,
        ticket: u64,
        thread_id: ThreadId,
        thread_name: &str,
        is_profit_locking: bool,
        timeout: Duration,
    ) -> bool {
        let start = Instant::now();
        let mut state = lock.state.lock();
        loop {
            match &state.holder {
                None => {
                    state.holder = Some(HolderInfo {
                        thread_id,
                        thread_name: thread_name.to_string(),
                        acquired_at: Instant::now(),
                        is_profit_locking,
                    });
                    state.depth = 1;
                    drop(state);
                    self.emit(LockEvent {
                        ts: Utc::now(),
                        ticket,
                        event: LockEventKind::Acquired,
                        thread_name: thread_name.to_string(),
                        thread_id: format!("{thread_id:?}"),
                        duration_ms: Some(start.elapsed().as_millis() as u64),
                        is_profit_locking,
                        success: true,
                        holder_thread: None,
                    });
                    return true;
                }
                Some(h) if h.thread_id == thread_id => {
                    state.depth += 1;
                    return true;
                }
                Some(_) => {
                    let remaining = timeout.checked_sub(start.elapsed());
                    let Some(remaining) = remaining else { return false };
                    if remaining.is_zero() {
                        return false;
                    }
                    let result = self.cond_wait(lock, state, remaining);
                    state = result;
                }
            }
        }
    }

    fn cond_wait<'b>(
        &self,
        lock: &'b Arc<TicketLock>,
        mut state: parking_lot::MutexGuard<'b, LockState>,
        timeout: Duration,
    ) -> parking_lot::MutexGuard<'b, LockState> {
        let _ = lock.cond.wait_for(&mut state, timeout);
        state
    }

    fn release(&self, ticket: u64, thread_id: ThreadId) {
        if let Some(lock) = self.locks.get(&ticket) {
            let mut state = lock.state.lock();
            let should_clear = matches!(&state.holder, Some(h) if h.thread_id == thread_id);
            if should_clear {
                state.depth = state.depth.saturating_sub(1);
                if state.depth == 0 {
                    state.holder = None;
                    lock.cond.notify_one();
                }
            }
            drop(state);
            self.emit(LockEvent {
                ts: Utc::now(),
                ticket,
                event: LockEventKind::Released,
                thread_name: std::thread::current().name().unwrap_or("unnamed").to_string(),
                thread_id: format!("{thread_id:?}"),
                duration_ms: None,
                is_profit_locking: false,
                success: true,
                holder_thread: None,
            });
        }
    }

    fn pre_release_if_stale(&self, ticket: u64, lock: &Arc<TicketLock>, threshold: Duration) {
        let mut state = lock.state.lock();
        if let Some(h) = &state.holder {
            if h.acquired_at.elapsed() > threshold {
                let holder_name = h.thread_name.clone();
                state.holder = None;
                state.depth = 0;
                lock.cond.notify_one();
                drop(state);
                warn!(ticket, holder = %holder_name, "force-released stale ticket lock before non-blocking retry");
                self.emit(LockEvent {
                    ts: Utc::now(),
                    ticket,
                    event: LockEventKind::ForcedRelease,
                    thread_name: std::thread::current().name().unwrap_or("unnamed").to_string(),
                    thread_id: format!("{:?}", std::thread::current().id()),
                    duration_ms: None,
                    is_profit_locking: false,
                    success: true,
                    holder_thread: Some(holder_name),
                });
            }
        }
    }

    fn purge_if_dead_holder(&self, ticket: u64, lock: &Arc<TicketLock>) -> bool {
        let mut state = lock.state.lock();
        if let Some(h) = &state.holder {
            if !self.registry.is_alive(h.thread_id) {
                let holder_name = h.thread_name.clone();
                state.holder = None;
                state.depth = 0;
                lock.cond.notify_one();
                drop(state);
                warn!(ticket, holder = %holder_name, "purged dead-thread lock orphan");
                self.emit(LockEvent {
                    ts: Utc::now(),
                    ticket,
                    event: LockEventKind::ForcedRelease,
                    thread_name: std::thread::current().name().unwrap_or("unnamed").to_string(),
                    thread_id: format!("{:?}", std::thread::current().id()),
                    duration_ms: None,
                    is_profit_locking: false,
                    success: true,
                    holder_thread: Some(holder_name),
                });
                return true;
            }
        }
        false
    }

    /// Opportunistic watchdog sweep invoked from the worker's background
    /// queue: any holder older than 200ms is classified stale and purged
    /// watchdog sweep.
    pub fn watchdog_sweep(&self) {
        for entry in self.locks.iter() {
            let ticket = *entry.key();
            let lock = entry.value().clone();
            let mut state = lock.state.lock();
            if let Some(h) = &state.holder {
                if h.acquired_at.elapsed() > Duration::from_millis(WATCHDOG_STALE_MS) {
                    debug!(ticket, "watchdog found stale lock holder, purging tracking");
                    state.holder = None;
                    state.depth = 0;
                    lock.cond.notify_one();
                }
            }
        }
    }

    pub fn held_ticket_count(&self) -> usize {
        self.locks
            .iter()
            .filter(|e| e.value().state.lock().holder.is_some())
            .count()
    }
}
