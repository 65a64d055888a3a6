//! Egress stage: output ring → transport publication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use mmb_transport::{is_transient, Publication, PUBLICATION_CLOSED};

use crate::idle::IdleStrategy;
use crate::ring::RingConsumer;
use crate::worker::PollStep;

/// Records drained from the ring per poll.
const EGRESS_READ_BATCH: usize = 10;

/// Drains one output ring onto one transport stream.
///
/// Transient offer outcomes spin under the idle strategy; a closed
/// publication is fatal — the stage reports the broken association and
/// closes itself. Each instance is bound to exactly one stream for life.
pub struct EgressProducer {
    consumer: RingConsumer,
    publication: Box<dyn Publication>,
    idle: IdleStrategy,
    running: Arc<AtomicBool>,
    on_broken: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl EgressProducer {
    pub fn new(
        consumer: RingConsumer,
        publication: Box<dyn Publication>,
        idle: IdleStrategy,
        running: Arc<AtomicBool>,
        on_broken: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        Self {
            consumer,
            publication,
            idle,
            running,
            on_broken,
        }
    }
}

impl PollStep for EgressProducer {
    fn poll(&mut self) -> usize {
        let publication = &mut self.publication;
        let idle = &mut self.idle;
        let running = &self.running;
        let on_broken = &self.on_broken;

        self.consumer.read(
            &mut |_msg_type_id, payload| loop {
                let outcome = publication.offer(payload);
                if outcome >= 0 {
                    break;
                }
                if outcome == PUBLICATION_CLOSED {
                    error!("publication closed; egress stage shutting down");
                    running.store(false, Ordering::SeqCst);
                    if let Some(on_broken) = on_broken {
                        on_broken();
                    }
                    break;
                }
                debug_assert!(is_transient(outcome));
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                idle.idle(0);
            },
            EGRESS_READ_BATCH,
        )
    }

    fn on_close(&mut self) {
        self.publication.close();
    }
}
