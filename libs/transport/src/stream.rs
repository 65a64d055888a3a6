//! Stream endpoint naming.

use std::fmt;

/// A (channel URI, stream id) pair identifying one direction of a unicast
/// message path on a [`MessageBus`](crate::MessageBus).
///
/// Endpoints are plain names; the resources behind them (subscription or
/// publication) are created at pipeline assembly and released on close.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamEndpoint {
    pub channel: String,
    pub stream_id: i32,
}

impl StreamEndpoint {
    pub fn new(channel: impl Into<String>, stream_id: i32) -> Self {
        Self {
            channel: channel.into(),
            stream_id,
        }
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.stream_id)
    }
}
