//! Journal and replica pipelines over a million records.
//!
//! With journaling on, every record must hit the journal in order before
//! the handler sees it; with replication on as well, every record must hit
//! the replica stream too, and the journal only ever trails the replica.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mmb_pipeline::journal::JOURNAL_FRAME_LENGTH;
use mmb_pipeline::{
    IdleKind, JournalStrategyKind, PipelineConfig, RingBufferPool, ServiceHandler,
    ServicePipeline,
};
use mmb_transport::mem::MemBus;
use mmb_transport::{is_transient, MessageBus, StreamEndpoint};
use mmb_types::is_administrative;

const RECORD_COUNT: u64 = 1_000_000;

struct CountingHandler {
    application_records: u64,
    out_of_order: u64,
    last_value: Option<u64>,
}

impl CountingHandler {
    fn new(_pool: Arc<RingBufferPool>) -> Self {
        Self {
            application_records: 0,
            out_of_order: 0,
            last_value: None,
        }
    }
}

impl ServiceHandler for CountingHandler {
    fn on_message(&mut self, msg_type_id: i32, payload: &[u8]) {
        if is_administrative(msg_type_id) {
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
    }
}

fn publish_records(bus: &MemBus, endpoint: &StreamEndpoint) -> thread::JoinHandle<()> {
    let mut publication = bus.add_publication(endpoint).unwrap();
    thread::spawn(move || {
        for value in 0..RECORD_COUNT {
            let payload = value.to_le_bytes();
            loop {
                let outcome = publication.offer(&payload);
                if outcome >= 0 {
                    break;
                }
                assert!(is_transient(outcome));
                thread::yield_now();
            }
        }
    })
}

fn await_handler_count(pipeline: &ServicePipeline<CountingHandler>) {
    let handler = pipeline.handler();
    let deadline = Instant::now() + Duration::from_secs(120);
    loop {
        {
            let handler = handler.lock();
            if handler.application_records >= RECORD_COUNT {
                assert_eq!(handler.application_records, RECORD_COUNT);
                assert_eq!(handler.out_of_order, 0);
                return;
            }
        }
        assert!(Instant::now() < deadline, "handler never saw all records");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Walk the journal frames and check the application records appear as a
/// strictly increasing sequence starting at zero. Administrative frames
/// (the load-snapshot marker) are skipped.
fn verify_journal(dir: &std::path::Path) {
    let contents = std::fs::read(dir.join("journal-0.log")).unwrap();
    let mut offset = 0;
    let mut expected = 0u64;
    while expected < RECORD_COUNT {
        let length =
            u32::from_le_bytes(contents[offset..offset + 4].try_into().unwrap()) as usize;
        let msg_type_id =
            i32::from_le_bytes(contents[offset + 4..offset + 8].try_into().unwrap());
        let payload = &contents[offset + 8..offset + 8 + length];
        if !is_administrative(msg_type_id) {
            let value = u64::from_le_bytes(payload.try_into().unwrap());
            assert_eq!(value, expected, "journal out of order");
            expected += 1;
        }
        offset += JOURNAL_FRAME_LENGTH + length;
    }
}

#[test]
fn journal_receives_every_record_in_order() {
    let bus = MemBus::default();
    let journal_dir = tempfile::tempdir().unwrap();
    let request = StreamEndpoint::new("mem:journal.requests", 10);
    let response = StreamEndpoint::new("mem:journal.responses", 11);

    let mut config = PipelineConfig {
        journal_enabled: true,
        snapshot_interval: Duration::from_secs(10),
        subscriber_idle: IdleKind::Backoff,
        write_idle: IdleKind::Backoff,
        ..PipelineConfig::default()
    };
    config.journal.dir = journal_dir.path().to_path_buf();
    config.journal.strategy = JournalStrategyKind::Seek;
    config.journal.journal_size = 64 * 1024 * 1024;
    config.journal.journal_count = 1;

    let mut pipeline =
        ServicePipeline::new(Arc::new(bus.clone()), config, CountingHandler::new).unwrap();
    pipeline.add_end_point(request.clone(), response).unwrap();
    pipeline.start().unwrap();

    let publisher = publish_records(&bus, &request);
    await_handler_count(&pipeline);
    publisher.join().unwrap();
    pipeline.close().unwrap();

    verify_journal(journal_dir.path());
}

#[test]
fn replica_stream_and_journal_both_see_every_record() {
    let bus = MemBus::default();
    let journal_dir = tempfile::tempdir().unwrap();
    let request = StreamEndpoint::new("mem:chain.requests", 10);
    let response = StreamEndpoint::new("mem:chain.responses", 11);
    let replica = StreamEndpoint::new("mem:chain.replica", 12);

    let mut config = PipelineConfig {
        replica_enabled: true,
        journal_enabled: true,
        snapshot_interval: Duration::from_secs(10),
        subscriber_idle: IdleKind::Backoff,
        write_idle: IdleKind::Backoff,
        ..PipelineConfig::default()
    };
    config.replica.channel = replica.channel.clone();
    config.replica.stream_id = replica.stream_id;
    config.journal.dir = journal_dir.path().to_path_buf();
    config.journal.strategy = JournalStrategyKind::Positional;
    config.journal.journal_size = 64 * 1024 * 1024;
    config.journal.journal_count = 1;

    // The replica subscription must exist before records flow or the
    // replica stage spins on NOT_CONNECTED.
    let mut replica_subscription = bus.add_subscription(&replica, None).unwrap();
    let replica_drainer = thread::spawn(move || {
        let mut expected = 0u64;
        let deadline = Instant::now() + Duration::from_secs(120);
        while expected < RECORD_COUNT {
            assert!(Instant::now() < deadline, "replica stream stalled");
            let polled = replica_subscription.poll(
                &mut |fragment| {
                    if fragment.payload.len() == 8 {
                        let value =
                            u64::from_le_bytes(fragment.payload.try_into().unwrap());
                        assert_eq!(value, expected, "replica stream out of order");
                        expected += 1;
                    }
                    // Other lengths are administrative records; ignore.
                },
                128,
            );
            if polled == 0 {
                thread::yield_now();
            }
        }
    });

    let mut pipeline =
        ServicePipeline::new(Arc::new(bus.clone()), config, CountingHandler::new).unwrap();
    pipeline.add_end_point(request.clone(), response).unwrap();
    pipeline.start().unwrap();

    let publisher = publish_records(&bus, &request);
    await_handler_count(&pipeline);
    publisher.join().unwrap();
    replica_drainer.join().unwrap();
    pipeline.close().unwrap();

    verify_journal(journal_dir.path());
}
