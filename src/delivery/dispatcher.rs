//! Per-peer channel pipes, outbound parcel queue and pending acks.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::fragment::Parcel;
use super::receiver::ChannelReceiver;
use super::sender::ChannelSender;
use crate::core::{ChannelMode, DeliveryError};
use crate::transport::Ack;

/// Delivery tuning shared by every dispatcher of a socket.
#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    /// Maximum unacked reliable span per channel.
    pub reliable_window: u64,
    /// Retransmissions before a reliable parcel faults the peer.
    pub max_retransmits: u32,
    /// Fragment payload size.
    pub max_payload: usize,
}

/// A message completed by the receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Channel it arrived on.
    pub channel: u8,
    /// Message bytes.
    pub payload: Bytes,
}

/// Owns the channel senders and receivers of one peer.
#[derive(Debug)]
pub struct Dispatcher {
    modes: Vec<ChannelMode>,
    senders: Vec<ChannelSender>,
    receivers: Vec<ChannelReceiver>,
    outbox: VecDeque<Parcel>,
    acks: VecDeque<Ack>,
    settings: DeliverySettings,
}

impl Dispatcher {
    /// Create one sender/receiver pair per entry of `modes`.
    pub fn new(modes: &[ChannelMode], settings: DeliverySettings) -> Self {
        Self {
            modes: modes.to_vec(),
            senders: (0..modes.len())
                .map(|channel| {
                    ChannelSender::new(channel as u8, settings.reliable_window, settings.max_retransmits)
                })
                .collect(),
            receivers: (0..modes.len())
                .map(|_| ChannelReceiver::new(settings.reliable_window))
                .collect(),
            outbox: VecDeque::new(),
            acks: VecDeque::new(),
            settings,
        }
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.modes.len()
    }

    /// Current mode of `channel`.
    pub fn mode(&self, channel: usize) -> Option<ChannelMode> {
        self.modes.get(channel).copied()
    }

    /// Change the mode of `channel`. Returns false for an invalid index.
    pub fn set_mode(&mut self, channel: usize, mode: ChannelMode) -> bool {
        match self.modes.get_mut(channel) {
            Some(slot) => {
                *slot = mode;
                true
            }
            None => false,
        }
    }

    /// Queue `payload` on `channel`. Returns the number of parcels queued.
    pub fn send(&mut self, channel: usize, payload: &[u8], now: Instant) -> Result<usize, DeliveryError> {
        let mode = self.mode(channel).ok_or(DeliveryError::InvalidChannel(channel))?;
        let sender = &mut self.senders[channel];
        let parcels = sender.send(mode, payload, self.settings.max_payload, now)?;
        let count = parcels.len();
        self.outbox.extend(parcels);
        Ok(count)
    }

    /// Route an inbound parcel, appending completed messages to `out`.
    pub fn on_parcel(
        &mut self,
        parcel: Parcel,
        now: Instant,
        out: &mut Vec<Delivered>,
    ) -> Result<(), DeliveryError> {
        let channel = parcel.channel;
        let receiver = self
            .receivers
            .get_mut(channel as usize)
            .ok_or(DeliveryError::MalformedParcel("unknown channel"))?;

        let mut messages = Vec::new();
        if let Some(ack) = receiver.receive(parcel, now, &mut messages)? {
            self.acks.push_back(ack);
        }
        out.extend(messages.into_iter().map(|payload| Delivered { channel, payload }));
        Ok(())
    }

    /// Apply acknowledgements. Returns the latest RTT sample they produced.
    pub fn on_acks(&mut self, acks: &[Ack], now: Instant) -> Option<Duration> {
        let mut sample = None;
        for ack in acks {
            if let Some(sender) = self.senders.get_mut(ack.channel as usize) {
                sample = sender.on_ack(ack, now).or(sample);
            }
        }
        sample
    }

    /// Queue reliable fragments whose retransmission timer elapsed.
    pub fn poll_retransmits(&mut self, now: Instant, rto: Duration) -> Result<(), DeliveryError> {
        let mut due = Vec::new();
        for sender in &mut self.senders {
            sender.poll_retransmits(now, rto, &mut due)?;
        }
        self.outbox.extend(due);
        Ok(())
    }

    /// Next parcel to put on the wire.
    pub fn next_parcel(&mut self) -> Option<Parcel> {
        self.outbox.pop_front()
    }

    /// Take up to `max` pending acks.
    pub fn take_acks(&mut self, max: usize) -> Vec<Ack> {
        let count = self.acks.len().min(max);
        self.acks.drain(..count).collect()
    }

    /// Whether acks are waiting to be sent.
    pub fn has_pending_acks(&self) -> bool {
        !self.acks.is_empty()
    }

    /// Drop idle receptions on every channel.
    pub fn expire_receptions(&mut self, now: Instant, timeout: Duration) {
        for receiver in &mut self.receivers {
            receiver.expire_receptions(now, timeout);
        }
    }

    /// Drop queued parcels, pending acks and reliable transmissions.
    pub fn clear(&mut self) {
        self.outbox.clear();
        self.acks.clear();
        for sender in &mut self.senders {
            sender.clear();
        }
    }

    /// Live receptions.
    pub fn receptions(&self) -> usize {
        self.receivers.iter().map(ChannelReceiver::receptions).sum()
    }

    /// Reliable transmissions in flight.
    pub fn transmissions(&self) -> usize {
        self.senders.iter().map(ChannelSender::transmissions).sum()
    }

    /// Parcels queued or awaiting acknowledgement.
    pub fn parcels(&self) -> usize {
        self.outbox.len() + self.senders.iter().map(ChannelSender::unacked_parcels).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MAX_ACKS_PER_PACKET, MAX_PARCEL_PAYLOAD, MAX_RETRANSMITS, RELIABLE_WINDOW};

    fn settings() -> DeliverySettings {
        DeliverySettings {
            reliable_window: RELIABLE_WINDOW,
            max_retransmits: MAX_RETRANSMITS,
            max_payload: MAX_PARCEL_PAYLOAD,
        }
    }

    fn pair() -> (Dispatcher, Dispatcher) {
        let modes = [ChannelMode::Reliable, ChannelMode::Sequenced, ChannelMode::Unreliable];
        (Dispatcher::new(&modes, settings()), Dispatcher::new(&modes, settings()))
    }

    #[test]
    fn test_send_invalid_channel() {
        let (mut a, _) = pair();
        assert_eq!(
            a.send(3, b"x", Instant::now()),
            Err(DeliveryError::InvalidChannel(3))
        );
    }

    #[test]
    fn test_modes() {
        let (mut a, _) = pair();
        assert_eq!(a.channel_count(), 3);
        assert_eq!(a.mode(1), Some(ChannelMode::Sequenced));
        assert!(a.set_mode(1, ChannelMode::Reliable));
        assert_eq!(a.mode(1), Some(ChannelMode::Reliable));
        assert!(!a.set_mode(9, ChannelMode::Reliable));
        assert_eq!(a.mode(9), None);
    }

    #[test]
    fn test_reliable_exchange_with_acks() {
        let now = Instant::now();
        let (mut a, mut b) = pair();

        assert_eq!(a.send(0, &vec![1u8; MAX_PARCEL_PAYLOAD + 1], now).unwrap(), 2);
        assert_eq!(a.transmissions(), 1);
        assert_eq!(a.parcels(), 4);

        let mut out = Vec::new();
        while let Some(parcel) = a.next_parcel() {
            b.on_parcel(parcel, now, &mut out).unwrap();
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].channel, 0);
        assert_eq!(out[0].payload.len(), MAX_PARCEL_PAYLOAD + 1);

        assert!(b.has_pending_acks());
        let acks = b.take_acks(MAX_ACKS_PER_PACKET);
        assert_eq!(acks.len(), 2);
        assert!(!b.has_pending_acks());

        let sample = a.on_acks(&acks, now + Duration::from_millis(20));
        assert_eq!(sample, Some(Duration::from_millis(20)));
        assert_eq!(a.transmissions(), 0);
        assert_eq!(a.parcels(), 0);
    }

    #[test]
    fn test_retransmit_after_loss() {
        let now = Instant::now();
        let rto = Duration::from_millis(100);
        let (mut a, mut b) = pair();
        a.send(0, b"lost", now).unwrap();
        assert!(a.next_parcel().is_some());

        a.poll_retransmits(now + rto, rto).unwrap();
        let parcel = a.next_parcel().unwrap();
        let mut out = Vec::new();
        b.on_parcel(parcel, now + rto, &mut out).unwrap();
        assert_eq!(out[0].payload, Bytes::from_static(b"lost"));
    }

    #[test]
    fn test_unknown_channel_parcel_is_fatal() {
        let (mut a, _) = pair();
        let parcel = Parcel {
            channel: 7,
            mode: ChannelMode::Reliable,
            sequence: 1,
            fragment_index: 0,
            fragment_count: 1,
            payload: Bytes::new(),
        };
        let err = a.on_parcel(parcel, Instant::now(), &mut Vec::new()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_clear() {
        let now = Instant::now();
        let (mut a, _) = pair();
        a.send(0, b"x", now).unwrap();
        a.send(2, b"y", now).unwrap();
        a.clear();
        assert!(a.next_parcel().is_none());
        assert_eq!(a.transmissions(), 0);
    }

    #[test]
    fn test_take_acks_bounded() {
        let now = Instant::now();
        let (mut a, mut b) = pair();
        for _ in 0..20 {
            a.send(0, b"m", now).unwrap();
        }
        let mut out = Vec::new();
        while let Some(parcel) = a.next_parcel() {
            b.on_parcel(parcel, now, &mut out).unwrap();
        }
        assert_eq!(b.take_acks(MAX_ACKS_PER_PACKET).len(), MAX_ACKS_PER_PACKET);
        assert_eq!(b.take_acks(MAX_ACKS_PER_PACKET).len(), 4);
    }
}
