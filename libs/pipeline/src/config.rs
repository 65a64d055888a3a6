//! Pipeline configuration.
//!
//! Plain serde-derive structs with defaults and an explicit `validate()`
//! pass; invalid values are usage errors. Loading (files, CLI, env) happens
//! outside this crate.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::idle::IdleStrategy;
use crate::ring::MIN_CAPACITY;

/// Idle strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleKind {
    BusySpin,
    Yield,
    Park { nanos: u64 },
    Backoff,
}

impl IdleKind {
    /// Materialize the runtime strategy.
    pub fn strategy(self) -> IdleStrategy {
        match self {
            Self::BusySpin => IdleStrategy::BusySpin,
            Self::Yield => IdleStrategy::Yield,
            Self::Park { nanos } => IdleStrategy::ParkNanos(nanos),
            Self::Backoff => IdleStrategy::backoff(),
        }
    }
}

/// Journal file strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalStrategyKind {
    /// Seek to the write offset on one handle, then write.
    Seek,
    /// Positioned writes at an explicit offset.
    Positional,
}

/// Replica stream settings, used when `replica_enabled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub channel: String,
    pub stream_id: i32,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            stream_id: 0,
        }
    }
}

/// Journal settings, used when `journal_enabled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub strategy: JournalStrategyKind,
    pub dir: PathBuf,
    /// Bytes per journal file.
    pub journal_size: u64,
    /// Write granularity alignment; power of two.
    pub page_size: usize,
    /// Files rotated over before reuse.
    pub journal_count: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            strategy: JournalStrategyKind::Seek,
            dir: PathBuf::new(),
            journal_size: 64 * 1024 * 1024,
            page_size: 4 * 1024,
            journal_count: 2,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Node identifier stamped into administrative records.
    pub node_id: u16,

    pub replica_enabled: bool,
    pub replica: ReplicaConfig,

    pub journal_enabled: bool,
    pub journal_flushing_enabled: bool,
    pub journal: JournalConfig,

    /// Idle strategy of the ingress poll loop.
    pub subscriber_idle: IdleKind,
    /// Idle strategy of ring-write and publication retries.
    pub write_idle: IdleKind,

    /// Transport fragments processed per ingress poll.
    pub frame_count_limit: usize,

    /// Timing wheel resolution.
    pub tick_duration: Duration,
    /// Timing wheel spokes; power of two.
    pub ticks_per_wheel: usize,
    /// Interval between `SAVE_SNAPSHOT` injections.
    pub snapshot_interval: Duration,

    /// Data capacity of every ring; power of two.
    pub ring_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            replica_enabled: false,
            replica: ReplicaConfig::default(),
            journal_enabled: false,
            journal_flushing_enabled: false,
            journal: JournalConfig::default(),
            subscriber_idle: IdleKind::BusySpin,
            write_idle: IdleKind::BusySpin,
            frame_count_limit: 10,
            tick_duration: Duration::from_micros(100),
            ticks_per_wheel: 512,
            snapshot_interval: Duration::from_secs(1),
            ring_capacity: 16 * 1024,
        }
    }
}

impl PipelineConfig {
    /// Reject invalid settings before any resource is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.ring_capacity < MIN_CAPACITY || !self.ring_capacity.is_power_of_two() {
            return Err(PipelineError::usage(format!(
                "ring_capacity must be a power of two >= {MIN_CAPACITY}, got {}",
                self.ring_capacity
            )));
        }
        if self.frame_count_limit == 0 {
            return Err(PipelineError::usage("frame_count_limit must be positive"));
        }
        if self.tick_duration.is_zero() {
            return Err(PipelineError::usage("tick_duration must be positive"));
        }
        if self.ticks_per_wheel == 0 || !self.ticks_per_wheel.is_power_of_two() {
            return Err(PipelineError::usage(format!(
                "ticks_per_wheel must be a power of two, got {}",
                self.ticks_per_wheel
            )));
        }
        if self.snapshot_interval.is_zero() {
            return Err(PipelineError::usage("snapshot_interval must be positive"));
        }
        if self.replica_enabled && self.replica.channel.is_empty() {
            return Err(PipelineError::usage(
                "replica_enabled requires replica.channel",
            ));
        }
        if self.journal_enabled {
            if self.journal.dir.as_os_str().is_empty() {
                return Err(PipelineError::usage("journal_enabled requires journal.dir"));
            }
            if self.journal.journal_size == 0 {
                return Err(PipelineError::usage("journal.journal_size must be positive"));
            }
            if self.journal.page_size == 0 || !self.journal.page_size.is_power_of_two() {
                return Err(PipelineError::usage(format!(
                    "journal.page_size must be a power of two, got {}",
                    self.journal.page_size
                )));
            }
            if self.journal.journal_count == 0 {
                return Err(PipelineError::usage("journal.journal_count must be positive"));
            }
        }
        Ok(())
    }
}
