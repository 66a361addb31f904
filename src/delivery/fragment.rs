//! Fragmentation of messages into parcels and their reassembly.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::core::{ChannelMode, DeliveryError, MAX_FRAGMENTS};

/// A wire-sized slice of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    /// Channel index.
    pub channel: u8,
    /// Delivery mode the sender used; selects the receiver state.
    pub mode: ChannelMode,
    /// Message sequence within (channel, mode).
    pub sequence: u64,
    /// Position of this fragment.
    pub fragment_index: u16,
    /// Total fragments of the message.
    pub fragment_count: u16,
    /// Fragment bytes.
    pub payload: Bytes,
}

impl Parcel {
    /// Whether the message fits in this single parcel.
    pub fn is_whole(&self) -> bool {
        self.fragment_count == 1
    }
}

/// Split `payload` into parcels of at most `max_payload` bytes.
///
/// An empty payload still yields one (empty) parcel.
pub fn split(
    channel: u8,
    mode: ChannelMode,
    sequence: u64,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<Parcel>, DeliveryError> {
    let count = payload.len().div_ceil(max_payload).max(1);
    if count > MAX_FRAGMENTS {
        return Err(DeliveryError::MessageTooLarge(payload.len()));
    }

    let data = Bytes::copy_from_slice(payload);
    let parcels = (0..count)
        .map(|index| {
            let start = index * max_payload;
            let end = (start + max_payload).min(data.len());
            Parcel {
                channel,
                mode,
                sequence,
                fragment_index: index as u16,
                fragment_count: count as u16,
                payload: data.slice(start..end),
            }
        })
        .collect();
    Ok(parcels)
}

/// Fragments of one message awaiting completion.
#[derive(Debug)]
pub struct Reception {
    sequence: u64,
    fragments: Vec<Option<Bytes>>,
    received: usize,
    last_update: Instant,
}

impl Reception {
    /// Start a reception for the message `parcel` belongs to.
    pub fn new(parcel: &Parcel, now: Instant) -> Self {
        Self {
            sequence: parcel.sequence,
            fragments: vec![None; parcel.fragment_count as usize],
            received: 0,
            last_update: now,
        }
    }

    /// Sequence being reassembled.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Store a fragment. Returns false for a duplicate.
    pub fn insert(&mut self, parcel: Parcel, now: Instant) -> Result<bool, DeliveryError> {
        if parcel.fragment_count as usize != self.fragments.len() {
            return Err(DeliveryError::MalformedParcel("fragment count changed"));
        }
        let slot = self
            .fragments
            .get_mut(parcel.fragment_index as usize)
            .ok_or(DeliveryError::MalformedParcel("fragment index out of range"))?;
        if slot.is_some() {
            return Ok(false);
        }

        *slot = Some(parcel.payload);
        self.received += 1;
        self.last_update = now;
        Ok(true)
    }

    /// Whether every fragment arrived.
    pub fn is_complete(&self) -> bool {
        self.received == self.fragments.len()
    }

    /// Whether the reception saw no progress for `timeout`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_update) >= timeout
    }

    /// Concatenate the fragments. Only meaningful once complete.
    pub fn assemble(self) -> Bytes {
        if self.fragments.len() == 1 {
            return self.fragments.into_iter().flatten().next().unwrap_or_default();
        }

        let total = self.fragments.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for fragment in self.fragments.into_iter().flatten() {
            out.extend_from_slice(&fragment);
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_small_message() {
        let parcels = split(2, ChannelMode::Reliable, 7, b"tiny", 960).unwrap();
        assert_eq!(parcels.len(), 1);
        assert!(parcels[0].is_whole());
        assert_eq!(parcels[0].channel, 2);
        assert_eq!(parcels[0].sequence, 7);
        assert_eq!(&parcels[0].payload[..], b"tiny");
    }

    #[test]
    fn test_split_empty_message() {
        let parcels = split(0, ChannelMode::Unreliable, 1, b"", 960).unwrap();
        assert_eq!(parcels.len(), 1);
        assert!(parcels[0].payload.is_empty());
    }

    #[test]
    fn test_split_boundaries() {
        let data = vec![0xAB; 25];
        let parcels = split(0, ChannelMode::Reliable, 1, &data, 10).unwrap();
        let sizes: Vec<_> = parcels.iter().map(|p| p.payload.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert!(parcels.iter().all(|p| p.fragment_count == 3));

        assert_eq!(split(0, ChannelMode::Reliable, 1, &data[..20], 10).unwrap().len(), 2);
    }

    #[test]
    fn test_split_too_large() {
        let data = vec![0u8; MAX_FRAGMENTS * 4 + 1];
        assert_eq!(
            split(0, ChannelMode::Reliable, 1, &data, 4),
            Err(DeliveryError::MessageTooLarge(data.len()))
        );
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let now = Instant::now();
        let data: Vec<u8> = (0..=255).collect();
        let mut parcels = split(0, ChannelMode::Reliable, 3, &data, 100).unwrap();
        parcels.reverse();

        let mut reception = Reception::new(&parcels[0], now);
        for parcel in parcels.iter().cloned() {
            assert!(!reception.is_complete());
            assert!(reception.insert(parcel, now).unwrap());
        }
        assert!(reception.is_complete());
        assert_eq!(reception.sequence(), 3);
        assert_eq!(&reception.assemble()[..], &data[..]);
    }

    #[test]
    fn test_reassembly_duplicates_and_mismatch() {
        let now = Instant::now();
        let parcels = split(0, ChannelMode::Reliable, 3, &[1u8; 30], 10).unwrap();
        let mut reception = Reception::new(&parcels[0], now);

        assert!(reception.insert(parcels[1].clone(), now).unwrap());
        assert!(!reception.insert(parcels[1].clone(), now).unwrap());

        let mut bad = parcels[2].clone();
        bad.fragment_count = 4;
        assert!(reception.insert(bad, now).is_err());

        let mut out_of_range = parcels[2].clone();
        out_of_range.fragment_index = 3;
        assert!(reception.insert(out_of_range, now).is_err());
    }

    #[test]
    fn test_reception_staleness() {
        let now = Instant::now();
        let parcels = split(0, ChannelMode::Unreliable, 1, &[0u8; 20], 10).unwrap();
        let mut reception = Reception::new(&parcels[0], now);
        reception.insert(parcels[0].clone(), now).unwrap();

        assert!(!reception.is_stale(now + Duration::from_secs(1), Duration::from_secs(5)));
        assert!(reception.is_stale(now + Duration::from_secs(5), Duration::from_secs(5)));
    }
}
