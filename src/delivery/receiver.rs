//! Inbound side of a channel.
//!
//! Each delivery mode owns its own sequence space and reassembly state, so a
//! sender switching modes mid-stream never mixes fragments of different
//! messages.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::fragment::{Parcel, Reception};
use crate::core::{ChannelMode, DeliveryError, MAX_RECEPTIONS};
use crate::transport::Ack;

/// Receptions of one sub-receiver, keyed by sequence.
#[derive(Debug, Default)]
struct Receptions {
    live: BTreeMap<u64, Reception>,
}

enum Insert {
    Complete(Bytes),
    Pending,
    Duplicate,
    Refused,
}

impl Receptions {
    /// Add a fragment. When the cap is reached a new reception either
    /// evicts the oldest one or, with `evict == false`, is refused.
    fn insert(&mut self, parcel: Parcel, now: Instant, evict: bool) -> Result<Insert, DeliveryError> {
        let sequence = parcel.sequence;
        if !self.live.contains_key(&sequence) && self.live.len() >= MAX_RECEPTIONS {
            if !evict {
                return Ok(Insert::Refused);
            }
            self.live.pop_first();
        }

        let reception = self
            .live
            .entry(sequence)
            .or_insert_with(|| Reception::new(&parcel, now));
        if !reception.insert(parcel, now)? {
            return Ok(Insert::Duplicate);
        }
        if !reception.is_complete() {
            return Ok(Insert::Pending);
        }

        match self.live.remove(&sequence) {
            Some(reception) => Ok(Insert::Complete(reception.assemble())),
            None => Ok(Insert::Pending),
        }
    }

    fn discard_through(&mut self, sequence: u64) {
        self.live = self.live.split_off(&sequence.saturating_add(1));
    }

    fn expire(&mut self, now: Instant, timeout: Duration) {
        self.live.retain(|_, reception| !reception.is_stale(now, timeout));
    }

    fn len(&self) -> usize {
        self.live.len()
    }
}

/// Delivers every completed message, duplicates included.
#[derive(Debug, Default)]
struct UnreliableReceiver {
    receptions: Receptions,
}

impl UnreliableReceiver {
    fn receive(&mut self, parcel: Parcel, now: Instant, out: &mut Vec<Bytes>) -> Result<(), DeliveryError> {
        if parcel.is_whole() {
            out.push(parcel.payload);
        } else if let Insert::Complete(message) = self.receptions.insert(parcel, now, true)? {
            out.push(message);
        }
        Ok(())
    }
}

/// Delivers only messages newer than the last delivered one.
#[derive(Debug, Default)]
struct SequencedReceiver {
    last_delivered: u64,
    receptions: Receptions,
}

impl SequencedReceiver {
    fn receive(&mut self, parcel: Parcel, now: Instant, out: &mut Vec<Bytes>) -> Result<(), DeliveryError> {
        let sequence = parcel.sequence;
        if sequence <= self.last_delivered {
            return Ok(());
        }

        let message = if parcel.is_whole() {
            parcel.payload
        } else {
            match self.receptions.insert(parcel, now, true)? {
                Insert::Complete(message) => message,
                _ => return Ok(()),
            }
        };

        self.last_delivered = sequence;
        self.receptions.discard_through(sequence);
        out.push(message);
        Ok(())
    }
}

/// Delivers every message exactly once, in sequence order.
#[derive(Debug)]
struct ReliableReceiver {
    next_expected: u64,
    window: u64,
    ready: BTreeMap<u64, Bytes>,
    receptions: Receptions,
}

impl ReliableReceiver {
    fn new(window: u64) -> Self {
        Self {
            next_expected: 1,
            window,
            ready: BTreeMap::new(),
            receptions: Receptions::default(),
        }
    }

    fn receive(
        &mut self,
        parcel: Parcel,
        now: Instant,
        out: &mut Vec<Bytes>,
    ) -> Result<Option<Ack>, DeliveryError> {
        let sequence = parcel.sequence;
        if sequence >= self.next_expected.saturating_add(self.window) {
            return Err(DeliveryError::GapExceeded {
                sequence,
                expected: self.next_expected,
            });
        }

        let ack = Ack {
            channel: parcel.channel,
            sequence,
            fragment_index: parcel.fragment_index,
        };
        if sequence < self.next_expected || self.ready.contains_key(&sequence) {
            return Ok(Some(ack));
        }

        if parcel.is_whole() {
            self.ready.insert(sequence, parcel.payload);
        } else {
            match self.receptions.insert(parcel, now, false)? {
                Insert::Complete(message) => {
                    self.ready.insert(sequence, message);
                }
                Insert::Refused => return Ok(None),
                Insert::Pending | Insert::Duplicate => {}
            }
        }

        while let Some(message) = self.ready.remove(&self.next_expected) {
            out.push(message);
            self.next_expected += 1;
        }
        Ok(Some(ack))
    }
}

/// Per-channel receiver with independent state for each mode.
#[derive(Debug)]
pub struct ChannelReceiver {
    unreliable: UnreliableReceiver,
    sequenced: SequencedReceiver,
    reliable: ReliableReceiver,
}

impl ChannelReceiver {
    /// Create a receiver whose reliable state accepts sequences up to
    /// `window` ahead of the next expected one.
    pub fn new(window: u64) -> Self {
        Self {
            unreliable: UnreliableReceiver::default(),
            sequenced: SequencedReceiver::default(),
            reliable: ReliableReceiver::new(window),
        }
    }

    /// Accept a parcel, pushing any messages it completes into `out`.
    ///
    /// Returns the acknowledgement owed for reliable parcels.
    pub fn receive(
        &mut self,
        parcel: Parcel,
        now: Instant,
        out: &mut Vec<Bytes>,
    ) -> Result<Option<Ack>, DeliveryError> {
        match parcel.mode {
            ChannelMode::Unreliable => self.unreliable.receive(parcel, now, out).map(|()| None),
            ChannelMode::Sequenced => self.sequenced.receive(parcel, now, out).map(|()| None),
            ChannelMode::Reliable => self.reliable.receive(parcel, now, out),
        }
    }

    /// Drop receptions idle for `timeout`.
    ///
    /// Reliable receptions are kept: their fragments were acknowledged and
    /// will not be sent again.
    pub fn expire_receptions(&mut self, now: Instant, timeout: Duration) {
        self.unreliable.receptions.expire(now, timeout);
        self.sequenced.receptions.expire(now, timeout);
    }

    /// Live receptions across all modes.
    pub fn receptions(&self) -> usize {
        self.unreliable.receptions.len()
            + self.sequenced.receptions.len()
            + self.reliable.receptions.len()
    }

    /// Complete reliable messages waiting for an earlier sequence.
    pub fn buffered(&self) -> usize {
        self.reliable.ready.len()
    }
}
