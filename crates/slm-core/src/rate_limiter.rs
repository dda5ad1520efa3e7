//! Global Rate Limiter.
//!
//! A system-wide cap on modification RPCs per second, with an
//! emergency-bypass corridor and short exponential backoff when emergencies
//! saturate that corridor. The sliding window is a `VecDeque` ring of
//! timestamps under its own mutex, the same shape used elsewhere for
//! rolling indicator windows (e.g. ATR's price history).

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);
const EMERGENCY_WINDOW: Duration = Duration::from_millis(100);
const EMERGENCY_BURST_THRESHOLD: usize = 5;
const EMERGENCY_BACKOFF_BASE_MS: u64 = 50;
const EMERGENCY_BACKOFF_CAP_MS: u64 = 400;

pub enum Admission {
    Proceed,
    ProceedAfterBackoff(Duration),
    Queued,
}

pub struct GlobalRateLimiter {
    max_per_second: u32,
    timestamps: Mutex<VecDeque<Instant>>,
    emergency_timestamps: Mutex<VecDeque<Instant>>,
}

impl GlobalRateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second,
            timestamps: Mutex::new(VecDeque::new()),
            emergency_timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// `is_emergency` covers both explicit emergency-path callers and
    /// repeated-failure callers (`consecutive_failures >= 2`).
    pub fn admit(&self, is_emergency: bool) -> Admission {
        let now = Instant::now();
        let mut timestamps = self.timestamps.lock();
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > WINDOW {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() < self.max_per_second as usize || is_emergency {
            if !is_emergency {
                timestamps.push_back(now);
                return Admission::Proceed;
            }
            drop(timestamps);
            let backoff = self.emergency_backoff(now);
            let mut timestamps = self.timestamps.lock();
            timestamps.push_back(now);
            return match backoff {
                Some(d) => Admission::ProceedAfterBackoff(d),
                None => Admission::Proceed,
            };
        }

        Admission::Queued
    }

    fn emergency_backoff(&self, now: Instant) -> Option<Duration> {
        let mut ring = self.emergency_timestamps.lock();
        while let Some(&front) = ring.front() {
            if now.duration_since(front) > EMERGENCY_WINDOW {
                ring.pop_front();
            } else {
                break;
            }
        }
        ring.push_back(now);
        let count = ring.len();
        if count > EMERGENCY_BURST_THRESHOLD {
            let k = (count - EMERGENCY_BURST_THRESHOLD) as u32;
            let ms = EMERGENCY_BACKOFF_BASE_MS.saturating_mul(1u64 << k.min(16));
            Some(Duration::from_millis(ms.min(EMERGENCY_BACKOFF_CAP_MS)))
        } else {
            None
        }
    }

    pub fn current_count(&self) -> usize {
        self.timestamps.lock().len()
    }
}
