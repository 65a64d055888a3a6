//! Bounded single-producer/single-consumer ring buffer of framed records.
//!
//! The ring is a power-of-two byte region with the producer and consumer
//! cursors kept alongside it in cache-line-padded atomic cells. Each record
//! is framed with an 8-byte header (record length, then message type id,
//! native endian) and aligned to 8 bytes. A record that would straddle the
//! end of the region is preceded by a padding record (`type = -1`) covering
//! the remaining tail; the real record lands at offset zero.
//!
//! Publish protocol: the producer writes header and payload with plain
//! stores, then advances its cursor with a release store; the consumer
//! acquires the producer cursor before reading and releases its own cursor
//! after each record, so the producer never reclaims bytes a handler may
//! still be borrowing. Exactly one writer thread and one reader thread per
//! instance — enforced by the split [`RingProducer`] / [`RingConsumer`]
//! handles, which are `Send` but not `Clone`.
//!
//! Neither `write` nor `read` blocks or allocates.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mmb_types::{is_valid_msg_type_id, PADDING_MSG_TYPE_ID};

use crate::error::{PipelineError, Result};

/// Bytes of framing in front of every record payload.
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Records are aligned to this many bytes inside the ring.
pub const RECORD_ALIGNMENT: usize = 8;

/// Smallest accepted data-region capacity.
pub const MIN_CAPACITY: usize = 128;

#[inline]
const fn align_record(length: usize) -> usize {
    (length + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

#[repr(align(64))]
struct CachePadded<T>(T);

struct RingShared {
    data: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    mask: u64,
    max_payload_length: usize,
    producer: CachePadded<AtomicU64>,
    consumer: CachePadded<AtomicU64>,
}

// One thread writes through `data` ahead of the producer cursor, one thread
// reads behind it; the release/acquire cursor protocol orders every access.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    #[inline]
    unsafe fn put_header(&self, index: usize, record_length: i32, msg_type_id: i32) {
        let base = self.data.as_ptr() as *mut u8;
        (base.add(index) as *mut i32).write_unaligned(record_length);
        (base.add(index + 4) as *mut i32).write_unaligned(msg_type_id);
    }

    #[inline]
    unsafe fn get_header(&self, index: usize) -> (i32, i32) {
        let base = self.data.as_ptr() as *const u8;
        let record_length = (base.add(index) as *const i32).read_unaligned();
        let msg_type_id = (base.add(index + 4) as *const i32).read_unaligned();
        (record_length, msg_type_id)
    }

    #[inline]
    fn size(&self) -> usize {
        let producer = self.producer.0.load(Ordering::Acquire);
        let consumer = self.consumer.0.load(Ordering::Acquire);
        (producer - consumer) as usize
    }
}

/// Create one SPSC ring with `capacity` data bytes (power of two,
/// at least [`MIN_CAPACITY`]). The maximum accepted payload is
/// `capacity / 8`.
pub fn ring_buffer(capacity: usize) -> Result<(RingProducer, RingConsumer)> {
    if capacity < MIN_CAPACITY || !capacity.is_power_of_two() {
        return Err(PipelineError::usage(format!(
            "ring capacity must be a power of two >= {MIN_CAPACITY}, got {capacity}"
        )));
    }

    let shared = Arc::new(RingShared {
        data: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        capacity,
        mask: (capacity - 1) as u64,
        max_payload_length: capacity / 8,
        producer: CachePadded(AtomicU64::new(0)),
        consumer: CachePadded(AtomicU64::new(0)),
    });

    Ok((
        RingProducer {
            shared: shared.clone(),
        },
        RingConsumer { shared },
    ))
}

/// The write side of a ring. Owned by exactly one thread for the ring's
/// lifetime.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Frame and publish one record.
    ///
    /// Returns `false` when the free span between the cursors cannot hold
    /// the record (including any end-of-buffer padding); the caller retries
    /// under its idle strategy.
    ///
    /// # Panics
    ///
    /// On reserved message type ids (`<= 0`), zero-length payloads, and
    /// payloads beyond [`max_payload_length`](Self::max_payload_length) —
    /// these are usage bugs, not flow control.
    pub fn write(&mut self, msg_type_id: i32, payload: &[u8]) -> bool {
        assert!(
            is_valid_msg_type_id(msg_type_id),
            "reserved message type id: {msg_type_id}"
        );
        assert!(!payload.is_empty(), "zero-length record rejected");
        assert!(
            payload.len() <= self.shared.max_payload_length,
            "record of {} bytes exceeds ring maximum {}",
            payload.len(),
            self.shared.max_payload_length
        );

        let shared = &*self.shared;
        let record_length = RECORD_HEADER_LENGTH + payload.len();
        let aligned = align_record(record_length);

        let producer = shared.producer.0.load(Ordering::Relaxed);
        let consumer = shared.consumer.0.load(Ordering::Acquire);
        let available = shared.capacity - (producer - consumer) as usize;

        let index = (producer & shared.mask) as usize;
        let tail_room = shared.capacity - index;
        let (padding, write_index) = if aligned > tail_room {
            (tail_room, 0)
        } else {
            (0, index)
        };

        if padding + aligned > available {
            return false;
        }

        // SAFETY: the span [producer, producer + padding + aligned) is ahead
        // of the consumer cursor (checked above) and owned by this sole
        // writer until the release store below publishes it.
        unsafe {
            if padding > 0 {
                shared.put_header(index, padding as i32, PADDING_MSG_TYPE_ID);
            }
            shared.put_header(write_index, record_length as i32, msg_type_id);
            let base = shared.data.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                base.add(write_index + RECORD_HEADER_LENGTH),
                payload.len(),
            );
        }

        shared
            .producer
            .0
            .store(producer + (padding + aligned) as u64, Ordering::Release);
        true
    }

    /// Largest payload a single record may carry.
    pub fn max_payload_length(&self) -> usize {
        self.shared.max_payload_length
    }

    /// Bytes currently buffered.
    pub fn size(&self) -> usize {
        self.shared.size()
    }

    /// Data-region capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// The read side of a ring. Owned by exactly one thread for the ring's
/// lifetime.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    /// Consume up to `limit` records, invoking `handler` with each record's
    /// type id and payload. The payload borrow is only valid inside the
    /// callback; the consumer cursor advances with release ordering after
    /// each record. Returns the number of bytes consumed, padding included.
    pub fn read(&mut self, handler: &mut dyn FnMut(i32, &[u8]), limit: usize) -> usize {
        let shared = &*self.shared;
        let mut position = shared.consumer.0.load(Ordering::Relaxed);
        let producer = shared.producer.0.load(Ordering::Acquire);

        let mut bytes = 0usize;
        let mut records = 0usize;

        while records < limit && position < producer {
            let index = (position & shared.mask) as usize;
            // SAFETY: the span [consumer, producer) was published by the
            // producer's release store and acquired above; this sole reader
            // owns it until the release store that advances the cursor.
            let (record_length, msg_type_id) = unsafe { shared.get_header(index) };
            let record_length = record_length as usize;

            if msg_type_id == PADDING_MSG_TYPE_ID {
                position += record_length as u64;
                bytes += record_length;
                shared.consumer.0.store(position, Ordering::Release);
                continue;
            }

            let payload_length = record_length - RECORD_HEADER_LENGTH;
            // SAFETY: see above; the payload is contiguous because writes
            // never straddle the wrap point.
            let payload = unsafe {
                std::slice::from_raw_parts(
                    (shared.data.as_ptr() as *const u8).add(index + RECORD_HEADER_LENGTH),
                    payload_length,
                )
            };
            handler(msg_type_id, payload);

            let aligned = align_record(record_length);
            position += aligned as u64;
            bytes += aligned;
            records += 1;
            shared.consumer.0.store(position, Ordering::Release);
        }

        bytes
    }

    /// Bytes currently buffered.
    pub fn size(&self) -> usize {
        self.shared.size()
    }

    /// Data-region capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}
