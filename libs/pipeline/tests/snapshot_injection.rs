//! Snapshot injection under steady idle ingress.
//!
//! With a 10 ms snapshot interval the handler must observe one
//! load-snapshot marker at start and then save-snapshot markers at the
//! configured rate — at least 95 within the first second of idling.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mmb_pipeline::{PipelineConfig, RingBufferPool, ServiceHandler, ServicePipeline};
use mmb_transport::mem::MemBus;
use mmb_transport::StreamEndpoint;
use mmb_types::{is_administrative, AdminMessage, AdminTemplate};

struct SnapshotCountingHandler {
    loads: u64,
    saves: u64,
    first_was_load: Option<bool>,
}

impl SnapshotCountingHandler {
    fn new(_pool: Arc<RingBufferPool>) -> Self {
        Self {
            loads: 0,
            saves: 0,
            first_was_load: None,
        }
    }
}

impl ServiceHandler for SnapshotCountingHandler {
    fn on_message(&mut self, msg_type_id: i32, payload: &[u8]) {
        assert!(
            is_administrative(msg_type_id),
            "idle pipeline delivered an application record"
        );
        let message = AdminMessage::decode(payload).unwrap();
        assert_eq!(message.node_id, 5);
        match message.template {
            AdminTemplate::LoadSnapshot => {
                if self.first_was_load.is_none() {
                    self.first_was_load = Some(true);
                }
                self.loads += 1;
            }
            AdminTemplate::SaveSnapshot => {
                if self.first_was_load.is_none() {
                    self.first_was_load = Some(false);
                }
                self.saves += 1;
            }
        }
    }
}

#[test]
fn idle_pipeline_delivers_snapshots_at_the_configured_rate() {
    let bus = MemBus::default();
    let request = StreamEndpoint::new("mem:snap.requests", 10);
    let response = StreamEndpoint::new("mem:snap.responses", 11);

    // Backoff idles park the (empty) data path so the timer thread is never
    // starved of a core on small machines.
    let config = PipelineConfig {
        node_id: 5,
        snapshot_interval: Duration::from_millis(10),
        subscriber_idle: mmb_pipeline::IdleKind::Backoff,
        write_idle: mmb_pipeline::IdleKind::Backoff,
        ..PipelineConfig::default()
    };

    let mut pipeline =
        ServicePipeline::new(Arc::new(bus.clone()), config, SnapshotCountingHandler::new)
            .unwrap();
    pipeline.add_end_point(request, response).unwrap();

    let started = Instant::now();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_secs(1).saturating_sub(started.elapsed()));

    let handler = pipeline.handler();
    let (loads, saves, first_was_load) = {
        let handler = handler.lock();
        (handler.loads, handler.saves, handler.first_was_load)
    };
    pipeline.close().unwrap();

    assert_eq!(loads, 1, "exactly one load-snapshot");
    assert_eq!(first_was_load, Some(true), "load-snapshot arrives first");
    assert!(
        saves >= 95,
        "expected at least 95 save-snapshots in one second, saw {saves}"
    );
}
