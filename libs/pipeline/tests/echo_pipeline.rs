//! End-to-end echo: transport in, handler echo, transport out.
//!
//! One endpoint, no replica, no journal, busy-spin idle. A million 8-byte
//! records go in; the handler must observe every one in order and the
//! response stream must carry a million echoes back out.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mmb_pipeline::{
    IdleStrategy, PipelineConfig, RingBufferPool, ServiceHandler, ServicePipeline,
};
use mmb_transport::mem::MemBus;
use mmb_transport::{is_transient, MessageBus, StreamEndpoint};
use mmb_types::{is_administrative, AdminMessage, AdminTemplate, APPLICATION_MSG_ID};

const RECORD_COUNT: u64 = 1_000_000;

struct EchoHandler {
    pool: Arc<RingBufferPool>,
    idle: IdleStrategy,
    application_records: u64,
    out_of_order: u64,
    last_value: Option<u64>,
    loads: u64,
}

impl EchoHandler {
    fn new(pool: Arc<RingBufferPool>) -> Self {
        Self {
            pool,
            idle: IdleStrategy::BusySpin,
            application_records: 0,
            out_of_order: 0,
            last_value: None,
            loads: 0,
        }
    }
}

impl ServiceHandler for EchoHandler {
    fn on_message(&mut self, msg_type_id: i32, payload: &[u8]) {
        if is_administrative(msg_type_id) {
            if AdminMessage::decode(payload).unwrap().template == AdminTemplate::LoadSnapshot {
                self.loads += 1;
            }
            return;
        }

        let value = u64::from_le_bytes(payload.try_into().unwrap());
        if let Some(last) = self.last_value {
            if value <= last {
                self.out_of_order += 1;
            }
        }
        self.last_value = Some(value);
        self.application_records += 1;

        let idle = &mut self.idle;
        self.pool.with_first_output(|producer| {
            while !producer.write(APPLICATION_MSG_ID, payload) {
                idle.idle(0);
            }
        });
    }
}

#[test]
fn echo_round_trips_one_million_records_in_order() {
    let _ = tracing_subscriber::fmt().try_init();

    let bus = MemBus::default();
    let request = StreamEndpoint::new("mem:echo.requests", 10);
    let response = StreamEndpoint::new("mem:echo.responses", 11);

    let config = PipelineConfig {
        snapshot_interval: Duration::from_secs(10),
        ..PipelineConfig::default()
    };

    let mut pipeline =
        ServicePipeline::new(Arc::new(bus.clone()), config, EchoHandler::new).unwrap();
    pipeline
        .add_end_point(request.clone(), response.clone())
        .unwrap();

    let mut response_subscription = bus.add_subscription(&response, None).unwrap();

    pipeline.start().unwrap();

    let mut publication = bus.add_publication(&request).unwrap();
    let publisher = thread::spawn(move || {
        for value in 0..RECORD_COUNT {
            let payload = value.to_le_bytes();
            loop {
                let outcome = publication.offer(&payload);
                if outcome >= 0 {
                    break;
                }
                assert!(is_transient(outcome), "unexpected offer outcome {outcome}");
                std::hint::spin_loop();
            }
        }
    });

    let mut expected = 0u64;
    let deadline = Instant::now() + Duration::from_secs(120);
    while expected < RECORD_COUNT {
        assert!(
            Instant::now() < deadline,
            "timed out after {expected} echoed records"
        );
        let polled = response_subscription.poll(
            &mut |fragment| {
                let value = u64::from_le_bytes(fragment.payload.try_into().unwrap());
                assert_eq!(value, expected, "response stream out of order");
                expected += 1;
            },
            128,
        );
        if polled == 0 {
            std::hint::spin_loop();
        }
    }
    publisher.join().unwrap();

    let handler = pipeline.handler();
    {
        let handler = handler.lock();
        assert_eq!(handler.application_records, RECORD_COUNT);
        assert_eq!(handler.out_of_order, 0);
        assert_eq!(handler.loads, 1, "exactly one load-snapshot at start");
    }

    let reports = pipeline.report_list();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    use mmb_pipeline::RateReport;
    let (in_success, _in_failed) = report.inbound();
    let (out_success, _out_failed) = report.outbound();
    assert!(in_success > 0);
    assert!(out_success > 0);

    pipeline.close().unwrap();
    // Idempotent.
    pipeline.close().unwrap();
}
