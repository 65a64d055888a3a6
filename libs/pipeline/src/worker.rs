//! Stage worker: one OS thread driving one poll step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::idle::IdleStrategy;
use crate::report::ReadCounters;

/// One pipeline step driven by a [`Worker`].
///
/// `poll` returns a unitless work count; zero means the iteration found
/// nothing. `on_close` runs once on the worker thread after the loop exits
/// and releases the step's resources (subscriptions, publications, files).
pub trait PollStep: Send + 'static {
    fn poll(&mut self) -> usize;

    fn on_close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Constructed,
    Running,
    Joined,
}

/// Owns one stage thread, its running flag and its read counters.
///
/// Lifecycle: `start` exactly once from `Constructed`, `close` joins the
/// thread and is idempotent afterwards. Starting twice or closing a worker
/// that never started is a usage error.
pub struct Worker {
    name: String,
    idle: IdleStrategy,
    running: Arc<AtomicBool>,
    counters: Arc<ReadCounters>,
    thread: Option<JoinHandle<()>>,
    state: WorkerState,
}

impl Worker {
    pub fn new(name: impl Into<String>, idle: IdleStrategy) -> Self {
        Self {
            name: name.into(),
            idle,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(ReadCounters::new()),
            thread: None,
            state: WorkerState::Constructed,
        }
    }

    /// The worker's running flag. Steps that retry inside their poll hold a
    /// clone so shutdown stays prompt.
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// The worker's poll counters.
    pub fn counters(&self) -> Arc<ReadCounters> {
        self.counters.clone()
    }

    /// Launch the thread and enter the poll loop.
    pub fn start(&mut self, step: Box<dyn PollStep>) -> Result<()> {
        if self.state != WorkerState::Constructed {
            return Err(PipelineError::usage(format!(
                "worker '{}' started twice",
                self.name
            )));
        }

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let counters = self.counters.clone();
        let mut idle = self.idle.clone();
        let name = self.name.clone();

        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let mut step = step;
                while running.load(Ordering::SeqCst) {
                    let work = step.poll();
                    if work == 0 {
                        counters.record_failure();
                        idle.idle(0);
                    } else {
                        counters.record_success();
                        idle.idle(work);
                    }
                }
                step.on_close();
                info!(
                    worker = %name,
                    read_failure_ratio = counters.failure_ratio(),
                    "worker stopped"
                );
            })?;

        self.thread = Some(handle);
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Clear the running flag and join the thread. Idempotent after the
    /// first completed call.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            WorkerState::Constructed => Err(PipelineError::usage(format!(
                "worker '{}' closed before start",
                self.name
            ))),
            WorkerState::Running => {
                self.running.store(false, Ordering::SeqCst);
                if let Some(handle) = self.thread.take() {
                    if handle.join().is_err() {
                        warn!(worker = %self.name, "worker thread panicked");
                    }
                }
                self.state = WorkerState::Joined;
                Ok(())
            }
            WorkerState::Joined => Ok(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running && self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingStep {
        polls: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        work_every_other: bool,
    }

    impl PollStep for CountingStep {
        fn poll(&mut self) -> usize {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if self.work_every_other && n % 2 == 0 {
                1
            } else {
                0
            }
        }

        fn on_close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn step(polls: &Arc<AtomicUsize>, closes: &Arc<AtomicUsize>) -> Box<CountingStep> {
        Box::new(CountingStep {
            polls: polls.clone(),
            closes: closes.clone(),
            work_every_other: true,
        })
    }

    #[test]
    fn poll_iterations_match_counter_sum() {
        let polls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let mut worker = Worker::new("counting", IdleStrategy::BusySpin);
        let counters = worker.counters();
        worker.start(step(&polls, &closes)).unwrap();

        while polls.load(Ordering::SeqCst) < 1000 {
            std::hint::spin_loop();
        }
        worker.close().unwrap();

        let total = counters.successful_reads() + counters.failed_reads();
        assert_eq!(total, polls.load(Ordering::SeqCst) as u64);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_start_is_a_usage_error() {
        let polls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let mut worker = Worker::new("doubled", IdleStrategy::BusySpin);
        worker.start(step(&polls, &closes)).unwrap();
        let err = worker.start(step(&polls, &closes)).unwrap_err();
        assert!(matches!(err, PipelineError::Usage(_)));
        worker.close().unwrap();
    }

    #[test]
    fn close_before_start_is_a_usage_error() {
        let mut worker = Worker::new("unstarted", IdleStrategy::BusySpin);
        assert!(matches!(
            worker.close().unwrap_err(),
            PipelineError::Usage(_)
        ));
    }

    #[test]
    fn second_close_is_a_no_op() {
        let polls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let mut worker = Worker::new("closer", IdleStrategy::BusySpin);
        worker.start(step(&polls, &closes)).unwrap();
        worker.close().unwrap();
        worker.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
