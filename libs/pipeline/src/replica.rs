//! Replica stage: ingress ring → replica stream, then replica ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use mmb_transport::{Publication, PUBLICATION_CLOSED};

use crate::idle::IdleStrategy;
use crate::ring::{RingConsumer, RingProducer};
use crate::worker::PollStep;

const REPLICA_READ_BATCH: usize = 10;

/// Publishes every inbound record to the replica stream and then forwards
/// it locally, synchronously and in input order. Publish failures retry
/// under the idle strategy; the stage never skips a record. The forward
/// happens only after the publish succeeds, so a record is always on the
/// replica stream before any downstream stage can see it.
pub struct ReplicaStage {
    consumer: RingConsumer,
    publication: Box<dyn Publication>,
    forward: RingProducer,
    idle: IdleStrategy,
    running: Arc<AtomicBool>,
}

impl ReplicaStage {
    pub fn new(
        consumer: RingConsumer,
        publication: Box<dyn Publication>,
        forward: RingProducer,
        idle: IdleStrategy,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            consumer,
            publication,
            forward,
            idle,
            running,
        }
    }
}

impl PollStep for ReplicaStage {
    fn poll(&mut self) -> usize {
        let publication = &mut self.publication;
        let forward = &mut self.forward;
        let idle = &mut self.idle;
        let running = &self.running;

        self.consumer.read(
            &mut |msg_type_id, payload| {
                loop {
                    let outcome = publication.offer(payload);
                    if outcome >= 0 {
                        break;
                    }
                    if outcome == PUBLICATION_CLOSED {
                        error!("replica publication closed; replica stage shutting down");
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    idle.idle(0);
                }

                while !forward.write(msg_type_id, payload) {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    idle.idle(0);
                }
            },
            REPLICA_READ_BATCH,
        )
    }

    fn on_close(&mut self) {
        self.publication.close();
    }
}
