//! Fixed pool of reusable request slots.
//!
//! Each slot owns a header and a payload buffer built once from a
//! [`SlotTemplate`]. The pipeline resends a slot by handing the same buffers
//! back to the transport, so nothing is allocated after [`SlotPool::allocate`].

use crate::transport::{Outbound, Response};

use std::time::{Duration, Instant};

const DEFAULT_HEADER: &str = "hello world header request";
const DEFAULT_PAYLOAD: &str = "hello world iovec request";

/// Shape of every request in the pool: one header and one payload segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTemplate {
    header: Vec<u8>,
    payload: Vec<u8>,
    /// Total payload buffer size; bytes past `payload.len()` stay zeroed.
    payload_size: usize,
}

impl SlotTemplate {
    pub fn new(header: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        let header = header.into();
        let payload = payload.into();
        let payload_size = payload.len();
        Self {
            header,
            payload,
            payload_size,
        }
    }

    /// Pad the payload buffer with zeros up to `size` bytes. Sizes smaller
    /// than the payload text are ignored.
    pub fn with_payload_size(mut self, size: usize) -> Self {
        self.payload_size = size.max(self.payload.len());
        self
    }

    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    pub fn payload_len(&self) -> usize {
        self.payload_size
    }
}

impl Default for SlotTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER, DEFAULT_PAYLOAD)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pipeline depth must be at least 1")]
    ZeroDepth,
    #[error("out of memory allocating {bytes} bytes for slot {slot}")]
    OutOfMemory { slot: usize, bytes: usize },
}

/// Transport-populated view of the last response for a slot.
///
/// Filled while a response is being processed and zeroed before the slot is
/// sent again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inbound {
    pub sn: Option<u64>,
    pub header_len: usize,
    pub payload_len: usize,
}

/// One pipeline position.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    sn: u64,
    header: Box<[u8]>,
    payload: Box<[u8]>,
    in_flight: bool,
    sent_at: Option<Instant>,
    sends: u64,
    inbound: Inbound,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Sequence number of the current (or next) request from this slot.
    pub fn sn(&self) -> u64 {
        self.sn
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Number of times this slot has been handed to the transport.
    pub fn sends(&self) -> u64 {
        self.sends
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn inbound(&self) -> &Inbound {
        &self.inbound
    }

    pub(crate) fn outbound(&self) -> Outbound<'_> {
        Outbound {
            sn: self.sn,
            header: &self.header,
            payload: &self.payload,
        }
    }

    /// Move to the next sequence number for this slot. Every sequence number
    /// a slot uses is congruent to its index modulo `depth`.
    pub(crate) fn advance(&mut self, depth: usize) {
        if self.sends > 0 {
            self.sn += depth as u64;
        }
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        debug_assert!(!self.in_flight, "slot {} sent twice", self.index);
        self.in_flight = true;
        self.sent_at = Some(now);
        self.sends += 1;
    }

    /// Record the arrival of `response`. Returns the request latency.
    pub(crate) fn complete(&mut self, response: &Response, now: Instant) -> Option<Duration> {
        self.in_flight = false;
        self.inbound = Inbound {
            sn: Some(response.sn),
            header_len: response.header.len(),
            payload_len: response.payload.len(),
        };
        self.sent_at.take().map(|at| now.saturating_duration_since(at))
    }

    pub(crate) fn clear_inbound(&mut self) {
        self.inbound = Inbound::default();
    }

    /// Forget an outstanding request that can no longer complete.
    pub(crate) fn abandon(&mut self) -> bool {
        self.sent_at = None;
        std::mem::replace(&mut self.in_flight, false)
    }
}

/// Fixed-size collection of slots, indexed `0..depth`.
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Slot>,
}

impl SlotPool {
    /// Build `depth` slots from `template`.
    ///
    /// On failure every slot built so far is dropped before the error is
    /// returned.
    pub fn allocate(depth: usize, template: &SlotTemplate) -> Result<Self, PoolError> {
        if depth == 0 {
            return Err(PoolError::ZeroDepth);
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(depth)
            .map_err(|_| PoolError::OutOfMemory {
                slot: 0,
                bytes: depth * std::mem::size_of::<Slot>(),
            })?;

        for index in 0..depth {
            let header = zeroed_buffer(index, template.header_len(), &template.header)?;
            let payload = zeroed_buffer(index, template.payload_len(), &template.payload)?;
            slots.push(Slot {
                index,
                sn: index as u64,
                header,
                payload,
                in_flight: false,
                sent_at: None,
                sends: 0,
                inbound: Inbound::default(),
            });
        }

        tracing::debug!(
            depth,
            header_len = template.header_len(),
            payload_len = template.payload_len(),
            "slot pool allocated"
        );
        Ok(Self { slots })
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }

    /// Number of slots with a request outstanding.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.in_flight).count()
    }

    /// Free every slot's buffers. Returns the number of slots released.
    ///
    /// Consumes the pool, so it can only happen once and only after whoever
    /// borrowed the pool (the running loop) is done with it.
    pub fn release_all(self) -> usize {
        let stale = self.in_flight();
        if stale > 0 {
            tracing::warn!(stale, "releasing slot pool with requests still marked in flight");
        }
        let released = self.slots.len();
        drop(self.slots);
        tracing::debug!(released, "slot pool released");
        released
    }
}

fn zeroed_buffer(slot: usize, len: usize, content: &[u8]) -> Result<Box<[u8]>, PoolError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| PoolError::OutOfMemory { slot, bytes: len })?;
    buf.resize(len, 0);
    buf[..content.len()].copy_from_slice(content);
    Ok(buf.into_boxed_slice())
}
