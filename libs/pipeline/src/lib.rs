//! Low-latency in-process message pipeline.
//!
//! A chain of single-producer/single-consumer byte rings wired together by
//! dedicated busy-spinning threads: transport → ingress ring → (replica
//! ring) → (journal ring) → service handler → output/event rings →
//! transport. Each arrow is crossed by exactly one worker thread that owns
//! the destination side, backpressure is bounded rings plus retrying
//! writes, and a hashed timing wheel injects periodic snapshot markers into
//! the ingress stream.
//!
//! The entry point is [`ServicePipeline`]: construct it against a
//! [`MessageBus`](mmb_transport::MessageBus) with a validated
//! [`PipelineConfig`] and a handler factory, register endpoints and event
//! channels, then `start()`. `close()` joins every thread the pipeline
//! created.

pub mod config;
pub mod egress;
pub mod error;
pub mod idle;
pub mod ingress;
pub mod journal;
pub mod pipeline;
pub mod replica;
pub mod report;
pub mod ring;
pub mod service;
pub mod snapshot;
pub mod wheel;
pub mod worker;

pub use config::{IdleKind, JournalConfig, JournalStrategyKind, PipelineConfig, ReplicaConfig};
pub use error::{PipelineError, Result};
pub use idle::IdleStrategy;
pub use pipeline::{AssociationHandler, AssociationSink, ServicePipeline};
pub use report::{RateReport, ReadCounters, ServiceReport};
pub use ring::{ring_buffer, RingConsumer, RingProducer};
pub use service::{RingBufferPool, ServiceHandler};
pub use snapshot::SnapshotTimer;
pub use wheel::TimingWheel;
pub use worker::{PollStep, Worker};
