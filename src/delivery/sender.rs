//! Outbound side of a channel.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::fragment::{Parcel, split};
use crate::core::{ChannelMode, DeliveryError, MAX_RTO};
use crate::transport::Ack;

#[derive(Debug)]
struct InFlight {
    parcel: Parcel,
    sent_at: Instant,
    retries: u32,
    acked: bool,
}

/// A reliable message retained until every fragment is acknowledged.
#[derive(Debug)]
pub struct Transmission {
    fragments: Vec<InFlight>,
    unacked: usize,
}

impl Transmission {
    fn new(parcels: &[Parcel], now: Instant) -> Self {
        Self {
            fragments: parcels
                .iter()
                .map(|parcel| InFlight {
                    parcel: parcel.clone(),
                    sent_at: now,
                    retries: 0,
                    acked: false,
                })
                .collect(),
            unacked: parcels.len(),
        }
    }

    /// Fragments still awaiting acknowledgement.
    pub fn unacked(&self) -> usize {
        self.unacked
    }

    fn is_done(&self) -> bool {
        self.unacked == 0
    }
}

/// Per-channel sender: sequence counters for each mode and the reliable
/// transmissions in flight.
#[derive(Debug)]
pub struct ChannelSender {
    channel: u8,
    next_sequence: [u64; 3],
    transmissions: BTreeMap<u64, Transmission>,
    window: u64,
    max_retransmits: u32,
}

impl ChannelSender {
    /// Create a sender for `channel`.
    pub fn new(channel: u8, window: u64, max_retransmits: u32) -> Self {
        Self {
            channel,
            next_sequence: [1; 3],
            transmissions: BTreeMap::new(),
            window,
            max_retransmits,
        }
    }

    /// Fragment `payload` into parcels stamped with the next sequence of
    /// `mode`. Reliable parcels are retained for retransmission.
    pub fn send(
        &mut self,
        mode: ChannelMode,
        payload: &[u8],
        max_payload: usize,
        now: Instant,
    ) -> Result<Vec<Parcel>, DeliveryError> {
        let slot = mode.index();
        let sequence = self.next_sequence[slot];

        if mode == ChannelMode::Reliable {
            let oldest = self.transmissions.keys().next().copied().unwrap_or(sequence);
            if sequence - oldest >= self.window {
                return Err(DeliveryError::WindowFull(self.channel as usize));
            }
        }

        let parcels = split(self.channel, mode, sequence, payload, max_payload)?;
        self.next_sequence[slot] += 1;

        if mode == ChannelMode::Reliable {
            self.transmissions
                .insert(sequence, Transmission::new(&parcels, now));
        }
        Ok(parcels)
    }

    /// Apply an acknowledgement.
    ///
    /// Returns an RTT sample when the fragment was acked on its first
    /// transmission.
    pub fn on_ack(&mut self, ack: &Ack, now: Instant) -> Option<Duration> {
        let transmission = self.transmissions.get_mut(&ack.sequence)?;
        let fragment = transmission.fragments.get_mut(ack.fragment_index as usize)?;
        if fragment.acked {
            return None;
        }

        fragment.acked = true;
        transmission.unacked -= 1;
        let sample = (fragment.retries == 0).then(|| now.saturating_duration_since(fragment.sent_at));

        if transmission.is_done() {
            self.transmissions.remove(&ack.sequence);
        }
        sample
    }

    /// Queue every unacked fragment whose backoff elapsed into `out`.
    ///
    /// A fragment waits `rto * 2^retries`, capped at [`MAX_RTO`].
    pub fn poll_retransmits(
        &mut self,
        now: Instant,
        rto: Duration,
        out: &mut Vec<Parcel>,
    ) -> Result<(), DeliveryError> {
        for (&sequence, transmission) in self.transmissions.iter_mut() {
            for fragment in transmission.fragments.iter_mut().filter(|f| !f.acked) {
                let backoff = rto.saturating_mul(1 << fragment.retries.min(16)).min(MAX_RTO);
                if now.saturating_duration_since(fragment.sent_at) < backoff {
                    continue;
                }
                if fragment.retries >= self.max_retransmits {
                    return Err(DeliveryError::RetransmitLimit {
                        channel: self.channel as usize,
                        sequence,
                    });
                }
                fragment.retries += 1;
                fragment.sent_at = now;
                out.push(fragment.parcel.clone());
            }
        }
        Ok(())
    }

    /// Reliable messages in flight.
    pub fn transmissions(&self) -> usize {
        self.transmissions.len()
    }

    /// Reliable fragments awaiting acknowledgement.
    pub fn unacked_parcels(&self) -> usize {
        self.transmissions.values().map(Transmission::unacked).sum()
    }

    /// Drop all retained transmissions.
    pub fn clear(&mut self) {
        self.transmissions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MAX_PARCEL_PAYLOAD, MAX_RETRANSMITS, RELIABLE_WINDOW};

    fn sender() -> ChannelSender {
        ChannelSender::new(0, RELIABLE_WINDOW, MAX_RETRANSMITS)
    }

    fn ack(sequence: u64, fragment_index: u16) -> Ack {
        Ack {
            channel: 0,
            sequence,
            fragment_index,
        }
    }

    #[test]
    fn test_sequences_are_per_mode() {
        let now = Instant::now();
        let mut sender = sender();
        let a = sender.send(ChannelMode::Reliable, b"a", MAX_PARCEL_PAYLOAD, now).unwrap();
        let b = sender.send(ChannelMode::Unreliable, b"b", MAX_PARCEL_PAYLOAD, now).unwrap();
        let c = sender.send(ChannelMode::Reliable, b"c", MAX_PARCEL_PAYLOAD, now).unwrap();

        assert_eq!(a[0].sequence, 1);
        assert_eq!(b[0].sequence, 1);
        assert_eq!(c[0].sequence, 2);
        assert_eq!(sender.transmissions(), 2);
    }

    #[test]
    fn test_ack_completes_transmission() {
        let now = Instant::now();
        let mut sender = sender();
        sender.send(ChannelMode::Reliable, &[0u8; 25], 10, now).unwrap();
        assert_eq!(sender.unacked_parcels(), 3);

        let later = now + Duration::from_millis(30);
        assert_eq!(sender.on_ack(&ack(1, 1), later), Some(Duration::from_millis(30)));
        assert_eq!(sender.on_ack(&ack(1, 1), later), None);
        sender.on_ack(&ack(1, 0), later);
        assert_eq!(sender.transmissions(), 1);
        sender.on_ack(&ack(1, 2), later);
        assert_eq!(sender.transmissions(), 0);
    }

    #[test]
    fn test_retransmit_backoff() {
        let now = Instant::now();
        let rto = Duration::from_millis(100);
        let mut sender = sender();
        sender.send(ChannelMode::Reliable, b"x", MAX_PARCEL_PAYLOAD, now).unwrap();

        let mut out = Vec::new();
        sender.poll_retransmits(now + Duration::from_millis(99), rto, &mut out).unwrap();
        assert!(out.is_empty());

        let first = now + rto;
        sender.poll_retransmits(first, rto, &mut out).unwrap();
        assert_eq!(out.len(), 1);

        // Second retry waits 2 * rto.
        out.clear();
        sender.poll_retransmits(first + Duration::from_millis(150), rto, &mut out).unwrap();
        assert!(out.is_empty());
        sender.poll_retransmits(first + Duration::from_millis(200), rto, &mut out).unwrap();
        assert_eq!(out.len(), 1);

        // Retransmitted fragments yield no RTT sample.
        assert_eq!(sender.on_ack(&ack(1, 0), first + Duration::from_millis(210)), None);
    }

    #[test]
    fn test_retransmit_limit() {
        let mut now = Instant::now();
        let mut sender = ChannelSender::new(3, RELIABLE_WINDOW, 2);
        sender.send(ChannelMode::Reliable, b"x", MAX_PARCEL_PAYLOAD, now).unwrap();

        let mut out = Vec::new();
        for _ in 0..2 {
            now += MAX_RTO;
            sender.poll_retransmits(now, MAX_RTO, &mut out).unwrap();
        }
        assert_eq!(out.len(), 2);

        now += MAX_RTO;
        assert_eq!(
            sender.poll_retransmits(now, MAX_RTO, &mut out),
            Err(DeliveryError::RetransmitLimit { channel: 3, sequence: 1 })
        );
    }

    #[test]
    fn test_window_full() {
        let now = Instant::now();
        let mut sender = ChannelSender::new(0, 4, MAX_RETRANSMITS);
        for _ in 0..4 {
            sender.send(ChannelMode::Reliable, b"m", MAX_PARCEL_PAYLOAD, now).unwrap();
        }
        assert_eq!(
            sender.send(ChannelMode::Reliable, b"m", MAX_PARCEL_PAYLOAD, now),
            Err(DeliveryError::WindowFull(0))
        );
        // Unreliable traffic is not windowed.
        assert!(sender.send(ChannelMode::Unreliable, b"m", MAX_PARCEL_PAYLOAD, now).is_ok());

        sender.on_ack(&ack(1, 0), now);
        assert!(sender.send(ChannelMode::Reliable, b"m", MAX_PARCEL_PAYLOAD, now).is_ok());
    }

    #[test]
    fn test_clear_drops_transmissions() {
        let now = Instant::now();
        let mut sender = sender();
        sender.send(ChannelMode::Reliable, b"m", MAX_PARCEL_PAYLOAD, now).unwrap();
        sender.clear();
        assert_eq!(sender.transmissions(), 0);

        let mut out = Vec::new();
        sender.poll_retransmits(now + MAX_RTO, MAX_RTO, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
