//! Fragmented frame protocol and reassembly.
//!
//! The transport is permitted to split one record across MTU-sized
//! fragments. Each fragment carries begin/end flags and the session id of
//! the remote producer. [`FragmentAssembler`] stitches fragments back into
//! whole records, keeping one in-progress buffer per session so interleaved
//! sessions cannot corrupt each other's boundaries.

use std::collections::HashMap;

/// Begin/end markers on a fragment. An unfragmented record carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    const BEGIN: u8 = 0x01;
    const END: u8 = 0x02;

    pub const fn begin() -> Self {
        Self(Self::BEGIN)
    }

    pub const fn middle() -> Self {
        Self(0)
    }

    pub const fn end() -> Self {
        Self(Self::END)
    }

    pub const fn unfragmented() -> Self {
        Self(Self::BEGIN | Self::END)
    }

    #[inline]
    pub const fn is_begin(self) -> bool {
        self.0 & Self::BEGIN != 0
    }

    #[inline]
    pub const fn is_end(self) -> bool {
        self.0 & Self::END != 0
    }

    #[inline]
    pub const fn is_unfragmented(self) -> bool {
        self.0 == Self::BEGIN | Self::END
    }
}

/// One fragment as delivered by a subscription poll.
#[derive(Debug)]
pub struct Fragment<'a> {
    pub session_id: i32,
    pub flags: FrameFlags,
    pub payload: &'a [u8],
}

/// Reassembles fragments into whole records.
///
/// Owned by exactly one ingress worker; never shared. In-progress buffers
/// are keyed by session id and retain their allocation across records, so
/// steady-state reassembly does not allocate.
#[derive(Debug, Default)]
pub struct FragmentAssembler {
    sessions: HashMap<i32, Vec<u8>>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; invokes `on_record` with the session id and the
    /// complete record once its final fragment arrives. Unfragmented records
    /// pass through without copying.
    pub fn on_fragment(&mut self, fragment: Fragment<'_>, on_record: &mut dyn FnMut(i32, &[u8])) {
        if fragment.flags.is_unfragmented() {
            on_record(fragment.session_id, fragment.payload);
            return;
        }

        let buffer = self.sessions.entry(fragment.session_id).or_default();
        if fragment.flags.is_begin() {
            buffer.clear();
        }
        buffer.extend_from_slice(fragment.payload);

        if fragment.flags.is_end() {
            on_record(fragment.session_id, buffer);
            // Keep the allocation; the session will fragment again.
            buffer.clear();
        }
    }
}
