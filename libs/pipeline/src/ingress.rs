//! Ingress stage: transport subscriptions → ingress ring.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use mmb_transport::{Fragment, FragmentAssembler, Subscription};
use mmb_types::{AdminTemplate, ADMINISTRATIVE_MSG_ID, APPLICATION_MSG_ID};

use crate::idle::IdleStrategy;
use crate::ring::RingProducer;
use crate::snapshot::encode_admin_record;
use crate::worker::PollStep;

struct SubscriptionSlot {
    subscription: Box<dyn Subscription>,
    // One assembler per subscription, keyed by session inside, so fragment
    // boundaries survive interleaved remote producers.
    assembler: FragmentAssembler,
}

/// Drains one or more transport subscriptions into the ingress ring.
///
/// Reassembled records are written with retry under the idle strategy; a
/// full ring never drops traffic while the worker is running. The retry
/// loop re-checks the running flag so shutdown stays prompt — in-flight
/// records at shutdown may be dropped by design. Pending snapshot requests
/// are materialized here, at the top of each poll, keeping this worker the
/// ring's only producer.
pub struct IngressConsumer {
    subscriptions: Vec<SubscriptionSlot>,
    producer: RingProducer,
    retry_idle: IdleStrategy,
    frame_count_limit: usize,
    running: Arc<AtomicBool>,
    pending_snapshots: Arc<AtomicU64>,
    node_id: u16,
}

impl IngressConsumer {
    pub fn new(
        producer: RingProducer,
        retry_idle: IdleStrategy,
        frame_count_limit: usize,
        running: Arc<AtomicBool>,
        pending_snapshots: Arc<AtomicU64>,
        node_id: u16,
    ) -> Self {
        Self {
            subscriptions: Vec::new(),
            producer,
            retry_idle,
            frame_count_limit,
            running,
            pending_snapshots,
            node_id,
        }
    }

    /// Register one more input stream. Order across subscriptions is
    /// unspecified; order within each stream is preserved.
    pub fn add_subscription(&mut self, subscription: Box<dyn Subscription>) {
        self.subscriptions.push(SubscriptionSlot {
            subscription,
            assembler: FragmentAssembler::new(),
        });
    }

    /// Write the one-off `LOAD_SNAPSHOT` marker. Called before the worker
    /// starts, while the pipeline still owns this step.
    pub fn inject_load_snapshot(&mut self) {
        let body = encode_admin_record(AdminTemplate::LoadSnapshot, self.node_id);
        while !self.producer.write(ADMINISTRATIVE_MSG_ID, &body) {
            self.retry_idle.idle(0);
        }
    }

    fn drain_pending_snapshots(&mut self) -> usize {
        let pending = self.pending_snapshots.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return 0;
        }

        let body = encode_admin_record(AdminTemplate::SaveSnapshot, self.node_id);
        let mut written = 0;
        'outer: for _ in 0..pending {
            while !self.producer.write(ADMINISTRATIVE_MSG_ID, &body) {
                if !self.running.load(Ordering::SeqCst) {
                    break 'outer;
                }
                self.retry_idle.idle(0);
            }
            written += 1;
        }
        written
    }
}

impl PollStep for IngressConsumer {
    fn poll(&mut self) -> usize {
        let injected = self.drain_pending_snapshots();

        let producer = &mut self.producer;
        let retry_idle = &mut self.retry_idle;
        let running = &self.running;
        let frame_count_limit = self.frame_count_limit;
        let max_payload = producer.max_payload_length();

        let mut fragments = 0;
        for slot in &mut self.subscriptions {
            let SubscriptionSlot {
                subscription,
                assembler,
            } = slot;

            let mut on_fragment = |fragment: Fragment<'_>| {
                assembler.on_fragment(fragment, &mut |session_id, record| {
                    if record.is_empty() {
                        warn!(session_id, "dropping empty record");
                        return;
                    }
                    if record.len() > max_payload {
                        warn!(
                            session_id,
                            length = record.len(),
                            max = max_payload,
                            "dropping record larger than ring maximum"
                        );
                        return;
                    }
                    while !producer.write(APPLICATION_MSG_ID, record) {
                        if !running.load(Ordering::SeqCst) {
                            return;
                        }
                        retry_idle.idle(0);
                    }
                });
            };
            fragments += subscription.poll(&mut on_fragment, frame_count_limit);
        }

        fragments + injected
    }

    fn on_close(&mut self) {
        for slot in &mut self.subscriptions {
            slot.subscription.close();
        }
    }
}
