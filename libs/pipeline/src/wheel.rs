//! Hashed timing wheel.
//!
//! Timeouts hash onto `ticks_per_wheel` spokes by deadline tick; expiring is
//! a walk of the spokes the clock has passed. Resolution is one tick, drift
//! from cooperative expiration is not corrected, and a callback fires at
//! most once. Callbacks receive the wheel itself so one-shot timers can
//! re-arm.

use std::time::{Duration, Instant};

use crate::error::{PipelineError, Result};

type TimerTask = Box<dyn FnOnce(&mut TimingWheel) + Send>;

struct Timeout {
    deadline_tick: u64,
    task: TimerTask,
}

/// Hashed wheel of one-shot timeouts.
pub struct TimingWheel {
    tick_duration: Duration,
    mask: u64,
    spokes: Vec<Vec<Timeout>>,
    start: Instant,
    current_tick: u64,
    scheduled: usize,
}

impl TimingWheel {
    /// `ticks_per_wheel` must be a power of two; `tick_duration` positive.
    pub fn new(tick_duration: Duration, ticks_per_wheel: usize) -> Result<Self> {
        if tick_duration.is_zero() {
            return Err(PipelineError::usage("tick duration must be positive"));
        }
        if ticks_per_wheel == 0 || !ticks_per_wheel.is_power_of_two() {
            return Err(PipelineError::usage(format!(
                "ticks per wheel must be a power of two, got {ticks_per_wheel}"
            )));
        }

        Ok(Self {
            tick_duration,
            mask: (ticks_per_wheel - 1) as u64,
            spokes: (0..ticks_per_wheel).map(|_| Vec::new()).collect(),
            start: Instant::now(),
            current_tick: 0,
            scheduled: 0,
        })
    }

    #[inline]
    fn tick_for(&self, elapsed: Duration) -> u64 {
        (elapsed.as_nanos() / self.tick_duration.as_nanos()) as u64
    }

    /// Schedule `task` to fire once `delay` from now, rounded up to the next
    /// tick boundary.
    pub fn schedule(
        &mut self,
        delay: Duration,
        task: impl FnOnce(&mut TimingWheel) + Send + 'static,
    ) {
        let deadline = self.start.elapsed() + delay;
        let deadline_tick = self
            .tick_for(deadline + self.tick_duration - Duration::from_nanos(1))
            .max(self.current_tick);

        let spoke = (deadline_tick & self.mask) as usize;
        self.spokes[spoke].push(Timeout {
            deadline_tick,
            task: Box::new(task),
        });
        self.scheduled += 1;
    }

    /// Fire every timeout whose deadline tick the clock has passed.
    /// Returns the number of timeouts fired.
    pub fn expire_timers(&mut self) -> usize {
        let now_tick = self.tick_for(self.start.elapsed());
        let mut expired = 0;

        while self.current_tick <= now_tick {
            let spoke = (self.current_tick & self.mask) as usize;

            let mut due = Vec::new();
            let entries = &mut self.spokes[spoke];
            let mut i = 0;
            while i < entries.len() {
                if entries[i].deadline_tick <= self.current_tick {
                    due.push(entries.swap_remove(i));
                } else {
                    i += 1;
                }
            }

            self.scheduled -= due.len();
            for timeout in due {
                (timeout.task)(self);
                expired += 1;
            }

            self.current_tick += 1;
        }

        expired
    }

    /// Timeouts currently armed.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }
}
