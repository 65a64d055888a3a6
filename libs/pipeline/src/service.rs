//! Service stage: the terminal ring feeding the user handler.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use mmb_transport::StreamEndpoint;

use crate::ring::{RingConsumer, RingProducer};
use crate::worker::PollStep;

const SERVICE_READ_BATCH: usize = 10;

/// The user handler invoked once per record, in arrival order.
///
/// Handlers emit responses and events through the [`RingBufferPool`] they
/// received at construction. Blocking inside `on_message` stalls the whole
/// pipeline; a panic is caught, logged, and the stage moves to the next
/// record.
pub trait ServiceHandler: Send + 'static {
    fn on_message(&mut self, msg_type_id: i32, payload: &[u8]);
}

/// Output and event ring producers, keyed by their response stream.
///
/// The pool is created before the handler and populated afterwards as
/// endpoints and event channels register, which breaks the handler/pool
/// construction cycle: the pool is the single source of truth, consulted at
/// call time. Only the service thread touches the producers once the
/// pipeline runs, so the interior locks are uncontended on the hot path.
#[derive(Default)]
pub struct RingBufferPool {
    outputs: Mutex<Vec<(StreamEndpoint, RingProducer)>>,
    events: Mutex<Vec<(StreamEndpoint, RingProducer)>>,
}

impl RingBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_output(&self, endpoint: StreamEndpoint, producer: RingProducer) {
        self.outputs.lock().push((endpoint, producer));
    }

    pub(crate) fn add_event(&self, endpoint: StreamEndpoint, producer: RingProducer) {
        self.events.lock().push((endpoint, producer));
    }

    pub fn output_count(&self) -> usize {
        self.outputs.lock().len()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Run `f` with the output ring bound to `endpoint`.
    pub fn with_output<R>(
        &self,
        endpoint: &StreamEndpoint,
        f: impl FnOnce(&mut RingProducer) -> R,
    ) -> Option<R> {
        let mut outputs = self.outputs.lock();
        outputs
            .iter_mut()
            .find(|(candidate, _)| candidate == endpoint)
            .map(|(_, producer)| f(producer))
    }

    /// Run `f` with the first registered output ring.
    pub fn with_first_output<R>(&self, f: impl FnOnce(&mut RingProducer) -> R) -> Option<R> {
        let mut outputs = self.outputs.lock();
        outputs.first_mut().map(|(_, producer)| f(producer))
    }

    /// Visit every registered output ring.
    pub fn for_each_output(&self, mut f: impl FnMut(&StreamEndpoint, &mut RingProducer)) {
        for (endpoint, producer) in self.outputs.lock().iter_mut() {
            f(endpoint, producer);
        }
    }

    /// Run `f` with the event ring bound to `endpoint`.
    pub fn with_event<R>(
        &self,
        endpoint: &StreamEndpoint,
        f: impl FnOnce(&mut RingProducer) -> R,
    ) -> Option<R> {
        let mut events = self.events.lock();
        events
            .iter_mut()
            .find(|(candidate, _)| candidate == endpoint)
            .map(|(_, producer)| f(producer))
    }

    /// Visit every registered event ring.
    pub fn for_each_event(&self, mut f: impl FnMut(&StreamEndpoint, &mut RingProducer)) {
        for (endpoint, producer) in self.events.lock().iter_mut() {
            f(endpoint, producer);
        }
    }
}

/// The service stage worker step, generic over the handler.
pub struct ServiceStage<H: ServiceHandler> {
    consumer: RingConsumer,
    handler: Arc<Mutex<H>>,
}

impl<H: ServiceHandler> ServiceStage<H> {
    pub fn new(consumer: RingConsumer, handler: Arc<Mutex<H>>) -> Self {
        Self { consumer, handler }
    }
}

impl<H: ServiceHandler> PollStep for ServiceStage<H> {
    fn poll(&mut self) -> usize {
        let handler = &self.handler;
        self.consumer.read(
            &mut |msg_type_id, payload| {
                let mut guard = handler.lock();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    guard.on_message(msg_type_id, payload);
                }));
                if outcome.is_err() {
                    error!(msg_type_id, "service handler panicked; continuing");
                }
            },
            SERVICE_READ_BATCH,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring_buffer;

    struct RecordingHandler {
        records: Vec<(i32, Vec<u8>)>,
        panic_on: Option<i32>,
    }

    impl ServiceHandler for RecordingHandler {
        fn on_message(&mut self, msg_type_id: i32, payload: &[u8]) {
            if self.panic_on == Some(msg_type_id) {
                panic!("handler fault");
            }
            self.records.push((msg_type_id, payload.to_vec()));
        }
    }

    #[test]
    fn handler_sees_records_in_order() {
        let (mut producer, consumer) = ring_buffer(16 * 1024).unwrap();
        let handler = Arc::new(Mutex::new(RecordingHandler {
            records: Vec::new(),
            panic_on: None,
        }));
        let mut stage = ServiceStage::new(consumer, handler.clone());

        for value in 0u64..24 {
            assert!(producer.write(1, &value.to_le_bytes()));
        }
        while stage.poll() > 0 {}

        let records = &handler.lock().records;
        assert_eq!(records.len(), 24);
        for (i, (msg_type_id, payload)) in records.iter().enumerate() {
            assert_eq!(*msg_type_id, 1);
            assert_eq!(u64::from_le_bytes(payload[..].try_into().unwrap()), i as u64);
        }
    }

    #[test]
    fn handler_panic_does_not_stop_the_stage() {
        let (mut producer, consumer) = ring_buffer(16 * 1024).unwrap();
        let handler = Arc::new(Mutex::new(RecordingHandler {
            records: Vec::new(),
            panic_on: Some(2),
        }));
        let mut stage = ServiceStage::new(consumer, handler.clone());

        assert!(producer.write(1, b"before"));
        assert!(producer.write(2, b"boom"));
        assert!(producer.write(3, b"after"));
        while stage.poll() > 0 {}

        let records = &handler.lock().records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 1);
        assert_eq!(records[1].0, 3);
    }

    #[test]
    fn pool_lookup_by_endpoint() {
        let pool = RingBufferPool::new();
        let (producer, _consumer) = ring_buffer(1024).unwrap();
        let endpoint = StreamEndpoint::new("mem:responses", 20);
        pool.add_output(endpoint.clone(), producer);

        assert_eq!(pool.output_count(), 1);
        let capacity = pool.with_output(&endpoint, |producer| producer.capacity());
        assert_eq!(capacity, Some(1024));
        assert!(pool
            .with_output(&StreamEndpoint::new("mem:other", 1), |_| ())
            .is_none());
    }
}
