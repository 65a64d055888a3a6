//! Backoff policies for workers that found no work.
//!
//! A worker calls `idle(0)` when an iteration produced nothing and
//! `idle(n)` after `n` units of work. Strategies trade latency for CPU; the
//! composite ramp escalates spin → yield → park and resets on any work.

use std::thread;
use std::time::Duration;

const BACKOFF_SPIN_ATTEMPTS: u32 = 64;
const BACKOFF_YIELD_ATTEMPTS: u32 = 64;
const BACKOFF_MIN_PARK_NANOS: u64 = 1_000;
const BACKOFF_MAX_PARK_NANOS: u64 = 1_000_000;

/// Worker backoff policy. Holds only latency-tuning state; correctness never
/// depends on it.
#[derive(Debug, Clone)]
pub enum IdleStrategy {
    /// Return immediately; lowest latency, one core pegged.
    BusySpin,
    /// Yield the time slice to the scheduler.
    Yield,
    /// Sleep a fixed number of nanoseconds.
    ParkNanos(u64),
    /// Spin, then yield, then park with doubling pauses; resets on work.
    Backoff { attempts: u32 },
}

impl IdleStrategy {
    pub const fn backoff() -> Self {
        Self::Backoff { attempts: 0 }
    }

    /// Invoke after an iteration that produced `work_count` units of work.
    #[inline]
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            if let Self::Backoff { attempts } = self {
                *attempts = 0;
            }
            return;
        }

        match self {
            Self::BusySpin => std::hint::spin_loop(),
            Self::Yield => thread::yield_now(),
            Self::ParkNanos(nanos) => thread::sleep(Duration::from_nanos(*nanos)),
            Self::Backoff { attempts } => {
                if *attempts < BACKOFF_SPIN_ATTEMPTS {
                    std::hint::spin_loop();
                } else if *attempts < BACKOFF_SPIN_ATTEMPTS + BACKOFF_YIELD_ATTEMPTS {
                    thread::yield_now();
                } else {
                    let exponent =
                        (*attempts - BACKOFF_SPIN_ATTEMPTS - BACKOFF_YIELD_ATTEMPTS).min(10);
                    let nanos =
                        (BACKOFF_MIN_PARK_NANOS << exponent).min(BACKOFF_MAX_PARK_NANOS);
                    thread::sleep(Duration::from_nanos(nanos));
                }
                *attempts = attempts.saturating_add(1);
            }
        }
    }
}
