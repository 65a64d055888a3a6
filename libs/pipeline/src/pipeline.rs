//! Pipeline assembly and lifecycle.
//!
//! Wires the stage graph off two booleans — `replica_enabled`,
//! `journal_enabled` — so the terminal ring feeding the service handler is
//! the journal ring if journaling is on, else the replica ring, else the
//! ingress ring. Start runs consumer-to-producer so no downstream stage
//! starts after work is admitted; close runs producer-to-consumer so every
//! drain target is still live while its upstream shuts down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use mmb_transport::{Image, ImageEventSink, MessageBus, StreamEndpoint};

use crate::config::PipelineConfig;
use crate::egress::EgressProducer;
use crate::error::{PipelineError, Result};
use crate::ingress::IngressConsumer;
use crate::journal::{create_journalling, JournalStage, JournalWriter};
use crate::replica::ReplicaStage;
use crate::report::ServiceReport;
use crate::ring::ring_buffer;
use crate::service::{RingBufferPool, ServiceHandler, ServiceStage};
use crate::snapshot::SnapshotTimer;
use crate::wheel::TimingWheel;
use crate::worker::Worker;

/// Callback fired when an association with a remote endpoint is
/// established or broken.
pub type AssociationHandler = Arc<dyn Fn() + Send + Sync>;

/// Forwards transport image events to the pipeline's association handlers
/// and tracks the connected-image count. Handlers may be absent; the
/// notifications are then no-ops.
pub struct AssociationSink {
    available: Mutex<Option<AssociationHandler>>,
    unavailable: Mutex<Option<AssociationHandler>>,
    connected: AtomicUsize,
}

impl AssociationSink {
    fn new() -> Self {
        Self {
            available: Mutex::new(None),
            unavailable: Mutex::new(None),
            connected: AtomicUsize::new(0),
        }
    }

    fn association_established(&self) {
        if let Some(handler) = self.available.lock().clone() {
            handler();
        }
    }

    fn association_broken(&self) {
        if let Some(handler) = self.unavailable.lock().clone() {
            handler();
        }
    }

    /// Images currently connected to the ingress side.
    pub fn connected_images(&self) -> usize {
        self.connected.load(Ordering::Acquire)
    }
}

impl ImageEventSink for AssociationSink {
    fn on_available_image(&self, image: &Image) {
        self.connected.fetch_add(1, Ordering::AcqRel);
        debug!(session_id = image.session_id, source = %image.source_identity, "image available");
        self.association_established();
    }

    fn on_unavailable_image(&self, image: &Image) {
        self.connected.fetch_sub(1, Ordering::AcqRel);
        debug!(session_id = image.session_id, source = %image.source_identity, "image unavailable");
        self.association_broken();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    Constructed,
    Started,
    Closed,
}

struct EgressSlot {
    worker: Worker,
    step: Option<EgressProducer>,
}

/// One service instance: the composed stage graph, its rings, workers,
/// timing wheel and snapshot timer. Owns every resource it creates and
/// releases each exactly once in [`close`](Self::close).
impl<H: ServiceHandler> std::fmt::Debug for ServicePipeline<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePipeline")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

pub struct ServicePipeline<H: ServiceHandler> {
    bus: Arc<dyn MessageBus>,
    config: PipelineConfig,
    state: PipelineState,

    pool: Arc<RingBufferPool>,
    handler: Arc<Mutex<H>>,
    sink: Arc<AssociationSink>,
    reports: Vec<ServiceReport>,

    ingress_worker: Worker,
    ingress_step: Option<IngressConsumer>,
    replica_worker: Option<Worker>,
    replica_step: Option<ReplicaStage>,
    journal_worker: Option<Worker>,
    journal_step: Option<JournalStage>,
    service_worker: Worker,
    service_step: Option<ServiceStage<H>>,
    egress: Vec<EgressSlot>,
    events: Vec<EgressSlot>,

    wheel: Arc<Mutex<TimingWheel>>,
    wheel_running: Arc<AtomicBool>,
    timer_thread: Option<JoinHandle<()>>,
    snapshot_timer: SnapshotTimer,
}

impl<H: ServiceHandler> ServicePipeline<H> {
    /// Build the stage graph. The handler factory receives the shared ring
    /// pool, which is populated later through endpoint registration.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        config: PipelineConfig,
        factory: impl FnOnce(Arc<RingBufferPool>) -> H,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(RingBufferPool::new());
        let handler = Arc::new(Mutex::new(factory(pool.clone())));
        let sink = Arc::new(AssociationSink::new());

        let wheel = Arc::new(Mutex::new(TimingWheel::new(
            config.tick_duration,
            config.ticks_per_wheel,
        )?));
        let snapshot_timer = SnapshotTimer::new(wheel.clone(), config.snapshot_interval);

        let (ingress_producer, ingress_consumer) = ring_buffer(config.ring_capacity)?;
        let mut terminal = ingress_consumer;

        let mut replica_worker = None;
        let mut replica_step = None;
        if config.replica_enabled {
            let (forward_producer, forward_consumer) = ring_buffer(config.ring_capacity)?;
            let endpoint =
                StreamEndpoint::new(config.replica.channel.clone(), config.replica.stream_id);
            let publication = bus.add_publication(&endpoint)?;

            let worker = Worker::new("replica", config.write_idle.strategy());
            replica_step = Some(ReplicaStage::new(
                terminal,
                publication,
                forward_producer,
                config.write_idle.strategy(),
                worker.running_handle(),
            ));
            replica_worker = Some(worker);
            terminal = forward_consumer;
        }

        let mut journal_worker = None;
        let mut journal_step = None;
        if config.journal_enabled {
            let (forward_producer, forward_consumer) = ring_buffer(config.ring_capacity)?;
            let writer = JournalWriter::new(
                create_journalling(&config.journal),
                config.journal_flushing_enabled,
            )
            .map_err(PipelineError::Journal)?;

            let worker = Worker::new("journal", config.write_idle.strategy());
            journal_step = Some(JournalStage::new(
                terminal,
                writer,
                forward_producer,
                config.write_idle.strategy(),
                worker.running_handle(),
            ));
            journal_worker = Some(worker);
            terminal = forward_consumer;
        }

        let service_worker = Worker::new("service", config.subscriber_idle.strategy());
        let service_step = Some(ServiceStage::new(terminal, handler.clone()));

        let ingress_worker = Worker::new("ingress", config.subscriber_idle.strategy());
        let ingress_step = Some(IngressConsumer::new(
            ingress_producer,
            config.write_idle.strategy(),
            config.frame_count_limit,
            ingress_worker.running_handle(),
            snapshot_timer.pending_handle(),
            config.node_id,
        ));

        Ok(Self {
            bus,
            config,
            state: PipelineState::Constructed,
            pool,
            handler,
            sink,
            reports: Vec::new(),
            ingress_worker,
            ingress_step,
            replica_worker,
            replica_step,
            journal_worker,
            journal_step,
            service_worker,
            service_step,
            egress: Vec::new(),
            events: Vec::new(),
            wheel,
            wheel_running: Arc::new(AtomicBool::new(false)),
            timer_thread: None,
            snapshot_timer,
        })
    }

    fn ensure_constructed(&self, operation: &str) -> Result<()> {
        if self.state != PipelineState::Constructed {
            return Err(PipelineError::usage(format!(
                "{operation} requires an unstarted pipeline"
            )));
        }
        Ok(())
    }

    /// Register a request/response endpoint: one more ingress subscription,
    /// a lazily allocated output ring, its egress producer, and a
    /// `ServiceReport` pairing the ingress and egress counters.
    pub fn add_end_point(
        &mut self,
        request_stream: StreamEndpoint,
        response_stream: StreamEndpoint,
    ) -> Result<&mut Self> {
        self.ensure_constructed("add_end_point")?;

        let sink: Arc<dyn ImageEventSink> = self.sink.clone();
        let subscription = self.bus.add_subscription(&request_stream, Some(sink))?;
        self.ingress_step
            .as_mut()
            .expect("constructed pipeline owns its ingress step")
            .add_subscription(subscription);

        let (producer, consumer) = ring_buffer(self.config.ring_capacity)?;
        self.pool.add_output(response_stream.clone(), producer);

        let publication = self.bus.add_publication(&response_stream)?;
        let worker = Worker::new(
            format!("egress-{}", self.egress.len()),
            self.config.write_idle.strategy(),
        );
        let sink = self.sink.clone();
        let step = EgressProducer::new(
            consumer,
            publication,
            self.config.write_idle.strategy(),
            worker.running_handle(),
            Some(Arc::new(move || sink.association_broken())),
        );

        self.reports.push(ServiceReport::new(
            self.ingress_worker.counters(),
            worker.counters(),
        ));
        self.egress.push(EgressSlot {
            worker,
            step: Some(step),
        });

        debug!(request = %request_stream, response = %response_stream, "endpoint added");
        Ok(self)
    }

    /// Register an event channel: a lazily allocated event ring and its
    /// producer onto the given stream.
    pub fn add_event_channel(&mut self, event_stream: StreamEndpoint) -> Result<&mut Self> {
        self.ensure_constructed("add_event_channel")?;

        let (producer, consumer) = ring_buffer(self.config.ring_capacity)?;
        self.pool.add_event(event_stream.clone(), producer);

        let publication = self.bus.add_publication(&event_stream)?;
        let worker = Worker::new(
            format!("event-{}", self.events.len()),
            self.config.write_idle.strategy(),
        );
        let sink = self.sink.clone();
        let step = EgressProducer::new(
            consumer,
            publication,
            self.config.write_idle.strategy(),
            worker.running_handle(),
            Some(Arc::new(move || sink.association_broken())),
        );
        self.events.push(EgressSlot {
            worker,
            step: Some(step),
        });

        debug!(event = %event_stream, "event channel added");
        Ok(self)
    }

    /// Install the established-association callback.
    pub fn available_association_handler(&mut self, handler: AssociationHandler) -> &mut Self {
        *self.sink.available.lock() = Some(handler);
        self
    }

    /// Install the broken-association callback.
    pub fn unavailable_association_handler(&mut self, handler: AssociationHandler) -> &mut Self {
        *self.sink.unavailable.lock() = Some(handler);
        self
    }

    /// Start every stage, consumer to producer, then the timer thread and
    /// the snapshot timer. The `LOAD_SNAPSHOT` marker is written to the
    /// ingress ring immediately before the ingress worker launches.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_constructed("start")?;

        if let Err(error) = self.start_stages() {
            self.abort_start();
            return Err(error);
        }

        self.state = PipelineState::Started;
        info!(
            replica = self.config.replica_enabled,
            journal = self.config.journal_enabled,
            endpoints = self.egress.len(),
            events = self.events.len(),
            "pipeline started"
        );
        Ok(())
    }

    fn start_stages(&mut self) -> Result<()> {
        self.service_worker.start(Box::new(
            self.service_step.take().expect("constructed state"),
        ))?;
        if let Some(worker) = &mut self.journal_worker {
            worker.start(Box::new(self.journal_step.take().expect("journal step")))?;
        }
        if let Some(worker) = &mut self.replica_worker {
            worker.start(Box::new(self.replica_step.take().expect("replica step")))?;
        }
        for slot in &mut self.egress {
            slot.worker
                .start(Box::new(slot.step.take().expect("egress step")))?;
        }
        for slot in &mut self.events {
            slot.worker
                .start(Box::new(slot.step.take().expect("event step")))?;
        }

        let mut ingress_step = self.ingress_step.take().expect("ingress step");
        ingress_step.inject_load_snapshot();
        self.ingress_worker.start(Box::new(ingress_step))?;

        self.wheel_running.store(true, Ordering::SeqCst);
        let wheel = self.wheel.clone();
        let wheel_running = self.wheel_running.clone();
        self.timer_thread = Some(
            std::thread::Builder::new()
                .name("timer-wheel".into())
                .spawn(move || {
                    while wheel_running.load(Ordering::SeqCst) {
                        if wheel.lock().expire_timers() == 0 {
                            std::hint::spin_loop();
                        }
                    }
                })?,
        );
        self.snapshot_timer.start();
        Ok(())
    }

    /// Best-effort unwind of a partially started pipeline.
    fn abort_start(&mut self) {
        self.snapshot_timer.close();
        self.wheel_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.timer_thread.take() {
            let _ = thread.join();
        }
        for worker in self.workers_mut() {
            if worker.is_running() {
                quiet_close(worker);
            }
        }
    }

    fn workers_mut(&mut self) -> impl Iterator<Item = &mut Worker> + '_ {
        std::iter::once(&mut self.ingress_worker)
            .chain(self.egress.iter_mut().map(|slot| &mut slot.worker))
            .chain(self.events.iter_mut().map(|slot| &mut slot.worker))
            .chain(self.journal_worker.iter_mut())
            .chain(self.replica_worker.iter_mut())
            .chain(std::iter::once(&mut self.service_worker))
    }

    /// Stop the snapshot timer and timer thread, then close stages producer
    /// to consumer, joining every worker. Quiet: per-stage errors are
    /// logged, not returned. Idempotent after the first completed call.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Closed => return Ok(()),
            PipelineState::Constructed => {
                return Err(PipelineError::usage("close requires a started pipeline"));
            }
            PipelineState::Started => {}
        }

        self.snapshot_timer.close();
        self.wheel_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.timer_thread.take() {
            if thread.join().is_err() {
                warn!("timer thread panicked");
            }
        }

        // workers_mut yields producer-to-consumer order: ingress, egress,
        // events, journal, replica, service.
        for worker in self.workers_mut() {
            quiet_close(worker);
        }

        self.state = PipelineState::Closed;
        info!("pipeline closed");
        Ok(())
    }

    /// The user handler, shared with the service thread.
    pub fn handler(&self) -> Arc<Mutex<H>> {
        self.handler.clone()
    }

    /// One report per registered endpoint.
    pub fn report_list(&self) -> &[ServiceReport] {
        &self.reports
    }

    /// The shared output/event ring pool.
    pub fn pool(&self) -> Arc<RingBufferPool> {
        self.pool.clone()
    }

    /// Association bookkeeping (connected image count).
    pub fn associations(&self) -> Arc<AssociationSink> {
        self.sink.clone()
    }
}

fn quiet_close(worker: &mut Worker) {
    if let Err(error) = worker.close() {
        warn!(worker = worker.name(), error = %error, "error closing worker");
    }
}

impl<H: ServiceHandler> Drop for ServicePipeline<H> {
    fn drop(&mut self) {
        if self.state == PipelineState::Started {
            let _ = self.close();
        }
    }
}
