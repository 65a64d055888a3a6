//! Transport contract consumed by the MMB pipeline.
//!
//! The pipeline does not know how bytes move between processes. It consumes
//! this small surface: a [`MessageBus`] hands out [`Subscription`]s and
//! [`Publication`]s for [`StreamEndpoint`]s, subscriptions deliver
//! MTU-bounded [`fragment::Fragment`]s, and publications accept whole
//! records with numeric outcome codes (`offer`). Remote producers appear and
//! disappear as [`Image`]s, reported through an [`ImageEventSink`].
//!
//! [`mem::MemBus`] is the in-process reference implementation used by tests
//! and demos; production transports implement the same traits out of tree.

pub mod fragment;
pub mod mem;
pub mod stream;

pub use fragment::{Fragment, FragmentAssembler, FrameFlags};
pub use stream::StreamEndpoint;

use std::sync::Arc;

/// `offer` outcome: the stream has no connected subscriber yet. Transient;
/// retried under the idle strategy.
pub const NOT_CONNECTED: i64 = -1;

/// `offer` outcome: the subscriber cannot currently accept more. Transient.
pub const BACK_PRESSURED: i64 = -2;

/// `offer` outcome: the transport is performing internal maintenance.
/// Transient.
pub const ADMIN_ACTION: i64 = -3;

/// `offer` outcome: the publication has been closed. Fatal.
pub const PUBLICATION_CLOSED: i64 = -4;

/// Whether an `offer` outcome is worth retrying.
#[inline]
pub const fn is_transient(outcome: i64) -> bool {
    matches!(outcome, NOT_CONNECTED | BACK_PRESSURED | ADMIN_ACTION)
}

/// One remote producer observed on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub session_id: i32,
    pub source_identity: String,
}

/// Receives image availability transitions for a subscription.
///
/// Implementations must be cheap and non-blocking; the transport may invoke
/// them from registration call sites.
pub trait ImageEventSink: Send + Sync {
    fn on_available_image(&self, image: &Image);
    fn on_unavailable_image(&self, image: &Image);
}

/// One direction of an inbound message path.
pub trait Subscription: Send {
    /// Poll for up to `fragment_limit` fragments, invoking `handler` for
    /// each. Returns the number of fragments processed. Never blocks.
    fn poll(&mut self, handler: &mut dyn FnMut(Fragment<'_>), fragment_limit: usize) -> usize;

    /// Release the subscription. Idempotent.
    fn close(&mut self);
}

impl std::fmt::Debug for dyn Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Subscription").finish_non_exhaustive()
    }
}

/// One direction of an outbound message path.
pub trait Publication: Send {
    /// Offer one whole record. Non-negative results are the stream position
    /// after the record; negative results are the outcome codes defined in
    /// this crate. Never blocks.
    fn offer(&mut self, buf: &[u8]) -> i64;

    /// Release the publication. Idempotent.
    fn close(&mut self);
}

/// Factory handle for subscriptions and publications.
pub trait MessageBus: Send + Sync {
    fn add_subscription(
        &self,
        endpoint: &StreamEndpoint,
        events: Option<Arc<dyn ImageEventSink>>,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    fn add_publication(
        &self,
        endpoint: &StreamEndpoint,
    ) -> Result<Box<dyn Publication>, TransportError>;
}

/// Transport-level errors. Backpressure is not an error; it is an `offer`
/// outcome code.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("stream already has a subscriber: {0}")]
    AlreadySubscribed(StreamEndpoint),

    #[error("record of {length} bytes exceeds transport maximum {max}")]
    RecordTooLarge { length: usize, max: usize },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}
