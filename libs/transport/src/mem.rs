//! In-process reference transport.
//!
//! [`MemBus`] implements the full transport contract over bounded in-memory
//! fragment queues: reliable, ordered per stream, MTU-fragmenting, with
//! backpressure surfaced through the `offer` outcome codes and image
//! availability fired on subscriber/publisher matches. It exists so the
//! pipeline can be exercised end to end in one process; it is interface
//! conformance, not a production transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::fragment::{Fragment, FrameFlags};
use crate::stream::StreamEndpoint;
use crate::{
    Image, ImageEventSink, MessageBus, Publication, Subscription, TransportError, BACK_PRESSURED,
    NOT_CONNECTED, PUBLICATION_CLOSED,
};

/// Tuning for a [`MemBus`].
#[derive(Debug, Clone)]
pub struct MemBusConfig {
    /// Maximum payload bytes per fragment.
    pub mtu: usize,
    /// Queue depth per stream, in fragments. Offers that would exceed it
    /// are back-pressured.
    pub channel_capacity: usize,
}

impl Default for MemBusConfig {
    fn default() -> Self {
        Self {
            mtu: 1408,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug)]
struct OwnedFragment {
    session_id: i32,
    flags: FrameFlags,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct ChannelState {
    fragments: Mutex<VecDeque<OwnedFragment>>,
    subscribed: AtomicBool,
    events: Mutex<Option<Arc<dyn ImageEventSink>>>,
    /// Images of currently open publications on this stream.
    publishers: Mutex<Vec<Image>>,
}

impl ChannelState {
    fn notify_available(&self, image: &Image) {
        if let Some(events) = self.events.lock().clone() {
            events.on_available_image(image);
        }
    }

    fn notify_unavailable(&self, image: &Image) {
        if let Some(events) = self.events.lock().clone() {
            events.on_unavailable_image(image);
        }
    }
}

/// In-memory [`MessageBus`].
///
/// Cloning is cheap; all clones share the same streams.
#[derive(Clone)]
pub struct MemBus {
    config: MemBusConfig,
    channels: Arc<Mutex<HashMap<StreamEndpoint, Arc<ChannelState>>>>,
    next_session_id: Arc<AtomicI32>,
}

impl MemBus {
    pub fn new(config: MemBusConfig) -> Self {
        Self {
            config,
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: Arc::new(AtomicI32::new(1)),
        }
    }

    fn channel(&self, endpoint: &StreamEndpoint) -> Arc<ChannelState> {
        self.channels
            .lock()
            .entry(endpoint.clone())
            .or_default()
            .clone()
    }
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new(MemBusConfig::default())
    }
}

impl MessageBus for MemBus {
    fn add_subscription(
        &self,
        endpoint: &StreamEndpoint,
        events: Option<Arc<dyn ImageEventSink>>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let state = self.channel(endpoint);
        if state.subscribed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadySubscribed(endpoint.clone()));
        }
        *state.events.lock() = events;

        // Publications opened before the subscriber are connected now.
        for image in state.publishers.lock().iter() {
            state.notify_available(image);
        }

        debug!(endpoint = %endpoint, "mem subscription added");
        Ok(Box::new(MemSubscription {
            endpoint: endpoint.clone(),
            state,
            closed: false,
        }))
    }

    fn add_publication(
        &self,
        endpoint: &StreamEndpoint,
    ) -> Result<Box<dyn Publication>, TransportError> {
        let state = self.channel(endpoint);
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let image = Image {
            session_id,
            source_identity: format!("mem:{endpoint}"),
        };

        state.publishers.lock().push(image.clone());
        if state.subscribed.load(Ordering::Acquire) {
            state.notify_available(&image);
        }

        debug!(endpoint = %endpoint, session_id, "mem publication added");
        Ok(Box::new(MemPublication {
            state,
            image,
            mtu: self.config.mtu,
            capacity: self.config.channel_capacity,
            position: 0,
            closed: false,
        }))
    }
}

struct MemSubscription {
    endpoint: StreamEndpoint,
    state: Arc<ChannelState>,
    closed: bool,
}

impl Subscription for MemSubscription {
    fn poll(&mut self, handler: &mut dyn FnMut(Fragment<'_>), fragment_limit: usize) -> usize {
        if self.closed {
            return 0;
        }

        let mut polled = 0;
        while polled < fragment_limit {
            // Pop under the lock, deliver outside it: the handler may spin
            // waiting for downstream space and must not hold up publishers.
            let Some(fragment) = self.state.fragments.lock().pop_front() else {
                break;
            };
            handler(Fragment {
                session_id: fragment.session_id,
                flags: fragment.flags,
                payload: &fragment.bytes,
            });
            polled += 1;
        }
        polled
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.subscribed.store(false, Ordering::Release);
            *self.state.events.lock() = None;
            debug!(endpoint = %self.endpoint, "mem subscription closed");
        }
    }
}

impl Drop for MemSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemPublication {
    state: Arc<ChannelState>,
    image: Image,
    mtu: usize,
    capacity: usize,
    position: i64,
    closed: bool,
}

impl Publication for MemPublication {
    fn offer(&mut self, buf: &[u8]) -> i64 {
        if self.closed {
            return PUBLICATION_CLOSED;
        }
        if !self.state.subscribed.load(Ordering::Acquire) {
            return NOT_CONNECTED;
        }

        let fragment_count = if buf.len() <= self.mtu {
            1
        } else {
            buf.len().div_ceil(self.mtu)
        };

        let mut fragments = self.state.fragments.lock();
        if fragments.len() + fragment_count > self.capacity {
            return BACK_PRESSURED;
        }

        if fragment_count == 1 {
            fragments.push_back(OwnedFragment {
                session_id: self.image.session_id,
                flags: FrameFlags::unfragmented(),
                bytes: buf.to_vec(),
            });
        } else {
            for (index, chunk) in buf.chunks(self.mtu).enumerate() {
                let flags = if index == 0 {
                    FrameFlags::begin()
                } else if index == fragment_count - 1 {
                    FrameFlags::end()
                } else {
                    FrameFlags::middle()
                };
                fragments.push_back(OwnedFragment {
                    session_id: self.image.session_id,
                    flags,
                    bytes: chunk.to_vec(),
                });
            }
        }

        self.position += buf.len() as i64;
        self.position
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state
                .publishers
                .lock()
                .retain(|image| image.session_id != self.image.session_id);
            if self.state.subscribed.load(Ordering::Acquire) {
                self.state.notify_unavailable(&self.image);
            }
        }
    }
}

impl Drop for MemPublication {
    fn drop(&mut self) {
        self.close();
    }
}
