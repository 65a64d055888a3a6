//! Snapshot marker injection.
//!
//! Two administrative records flow through the pipeline: `LOAD_SNAPSHOT`,
//! written once at start, and `SAVE_SNAPSHOT`, injected periodically by the
//! [`SnapshotTimer`]. The timer itself never touches the ingress ring — it
//! records pending saves in a shared counter and the ingress worker, the
//! ring's only producer, materializes them. The direct write helpers below
//! retry under an idle strategy and are also usable against any ring
//! producer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use mmb_types::{AdminMessage, AdminTemplate, ADMINISTRATIVE_MSG_ID, ADMIN_MESSAGE_LENGTH};

use crate::idle::IdleStrategy;
use crate::ring::RingProducer;
use crate::wheel::TimingWheel;

/// Encode the body of an administrative record.
pub fn encode_admin_record(template: AdminTemplate, node_id: u16) -> [u8; ADMIN_MESSAGE_LENGTH] {
    let mut body = [0u8; ADMIN_MESSAGE_LENGTH];
    AdminMessage::new(template, node_id)
        .encode(&mut body)
        .expect("buffer sized for the admin message");
    body
}

fn write_admin_message(
    producer: &mut RingProducer,
    idle: &mut IdleStrategy,
    template: AdminTemplate,
    node_id: u16,
) {
    let body = encode_admin_record(template, node_id);
    while !producer.write(ADMINISTRATIVE_MSG_ID, &body) {
        idle.idle(0);
    }
}

/// Write one `LOAD_SNAPSHOT` record, retrying under `idle` until accepted.
pub fn write_load_message(producer: &mut RingProducer, idle: &mut IdleStrategy, node_id: u16) {
    write_admin_message(producer, idle, AdminTemplate::LoadSnapshot, node_id);
}

/// Write one `SAVE_SNAPSHOT` record, retrying under `idle` until accepted.
pub fn write_save_message(producer: &mut RingProducer, idle: &mut IdleStrategy, node_id: u16) {
    write_admin_message(producer, idle, AdminTemplate::SaveSnapshot, node_id);
}

/// Periodic `SAVE_SNAPSHOT` scheduler.
///
/// Arms a one-shot timeout on the wheel; each expiry bumps the pending-save
/// counter and re-arms at the configured interval until closed.
pub struct SnapshotTimer {
    wheel: Arc<Mutex<TimingWheel>>,
    interval: Duration,
    pending: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl SnapshotTimer {
    pub fn new(wheel: Arc<Mutex<TimingWheel>>, interval: Duration) -> Self {
        Self {
            wheel,
            interval,
            pending: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The counter of save requests not yet materialized. The ingress
    /// worker drains it with `swap(0)`.
    pub fn pending_handle(&self) -> Arc<AtomicU64> {
        self.pending.clone()
    }

    /// Arm the first timeout. Idempotent while running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(interval_us = self.interval.as_micros() as u64, "snapshot timer armed");
        let mut wheel = self.wheel.lock();
        arm(
            &mut wheel,
            self.interval,
            self.pending.clone(),
            self.running.clone(),
        );
    }

    /// Disarm: the in-flight timeout fires once more but neither records a
    /// save nor re-arms.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn arm(
    wheel: &mut TimingWheel,
    interval: Duration,
    pending: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
) {
    wheel.schedule(interval, move |wheel| {
        if running.load(Ordering::SeqCst) {
            pending.fetch_add(1, Ordering::Release);
            arm(wheel, interval, pending, running);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring_buffer;
    use mmb_types::is_administrative;
    use std::time::Instant;

    fn read_admin(consumer: &mut crate::ring::RingConsumer) -> Vec<AdminMessage> {
        let mut records = Vec::new();
        consumer.read(
            &mut |msg_type_id, payload| {
                assert!(is_administrative(msg_type_id));
                records.push(AdminMessage::decode(payload).unwrap());
            },
            usize::MAX,
        );
        records
    }

    #[test]
    fn load_message_round_trips() {
        let (mut producer, mut consumer) = ring_buffer(16 * 1024).unwrap();
        let mut idle = IdleStrategy::BusySpin;
        write_load_message(&mut producer, &mut idle, 0);

        let records = read_admin(&mut consumer);
        assert_eq!(
            records,
            vec![AdminMessage::new(AdminTemplate::LoadSnapshot, 0)]
        );
    }

    #[test]
    fn save_message_round_trips() {
        let (mut producer, mut consumer) = ring_buffer(16 * 1024).unwrap();
        let mut idle = IdleStrategy::BusySpin;
        write_save_message(&mut producer, &mut idle, 3);

        let records = read_admin(&mut consumer);
        assert_eq!(
            records,
            vec![AdminMessage::new(AdminTemplate::SaveSnapshot, 3)]
        );
    }

    #[test]
    fn timer_accumulates_pending_saves_until_closed() {
        let wheel = Arc::new(Mutex::new(
            TimingWheel::new(Duration::from_millis(1), 512).unwrap(),
        ));
        let timer = SnapshotTimer::new(wheel.clone(), Duration::from_millis(5));
        let pending = timer.pending_handle();

        timer.start();
        let deadline = Instant::now() + Duration::from_secs(2);
        while pending.load(Ordering::Acquire) < 3 && Instant::now() < deadline {
            wheel.lock().expire_timers();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(pending.load(Ordering::Acquire) >= 3);

        timer.close();
        // The armed timeout may fire once more; it must not re-arm.
        std::thread::sleep(Duration::from_millis(10));
        wheel.lock().expire_timers();
        let settled = pending.load(Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(10));
        wheel.lock().expire_timers();
        assert_eq!(pending.load(Ordering::Acquire), settled);
        assert_eq!(wheel.lock().scheduled_count(), 0);
    }
}
