//! Courier - Session facade
//!
//! [`Session`] and [`Channel`] are short-lived handles borrowed from a
//! socket. They name a session by ID and forward to the engine, so a handle
//! never outlives the state it points at.

use std::any::Any;
use std::net::SocketAddr;

use crate::buffer::Message;
use crate::core::{ChannelMode, SessionId};
#[cfg(doc)]
use crate::core::SocketListener;
use crate::socket::Engine;

pub use crate::transport::Rtt;

/// Handle to one session.
///
/// Listener callbacks receive one; outside callbacks, obtain one with
/// `Socket::session`. Once the session is disconnected, sends return 0 but
/// the ID, client ID, address and user data stay readable until the
/// [`SocketListener::on_disconnected`] callback returns.
pub struct Session<'a> {
    engine: &'a mut Engine,
    id: SessionId,
}

impl<'a> Session<'a> {
    pub(crate) fn new(engine: &'a mut Engine, id: SessionId) -> Self {
        Self { engine, id }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Client ID from the connect token.
    pub fn client_id(&self) -> u64 {
        match self.engine.peer(self.id) {
            Some(peer) => peer.client_id,
            None => self.engine.departed(self.id).map_or(0, |d| d.client_id),
        }
    }

    /// Whether the session is still live.
    pub fn is_connected(&self) -> bool {
        self.engine.peer(self.id).is_some()
    }

    /// Remote address.
    pub fn address(&self) -> Option<SocketAddr> {
        match self.engine.peer(self.id) {
            Some(peer) => Some(peer.address),
            None => self.engine.departed(self.id).map(|d| d.address),
        }
    }

    /// Send a message on `channel`.
    ///
    /// Returns the number of parcels queued; 0 when the session is gone,
    /// the channel does not exist, the message is too large or the reliable
    /// window is full.
    pub fn send(&mut self, channel: usize, message: &Message) -> usize {
        self.engine.send(self.id, channel, message.payload())
    }

    /// Change the delivery mode of `channel`. Takes effect on the next
    /// send; in-flight parcels keep their original mode.
    pub fn set_channel_mode(&mut self, channel: usize, mode: ChannelMode) -> bool {
        self.engine
            .peer_mut(self.id)
            .is_some_and(|peer| peer.dispatcher_mut().set_mode(channel, mode))
    }

    /// Delivery mode of `channel`.
    pub fn channel_mode(&self, channel: usize) -> Option<ChannelMode> {
        self.engine
            .peer(self.id)
            .and_then(|peer| peer.dispatcher().mode(channel))
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.engine
            .peer(self.id)
            .map_or(0, |peer| peer.dispatcher().channel_count())
    }

    /// Handle to one channel of this session.
    pub fn channel(&mut self, index: usize) -> Option<Channel<'_>> {
        if index < self.channel_count() {
            Some(Channel {
                engine: self.engine,
                session: self.id,
                index,
            })
        } else {
            None
        }
    }

    /// Close the session. Returns false when it was already closed.
    pub fn disconnect(&mut self) -> bool {
        self.engine.disconnect(self.id)
    }

    /// Smoothed round-trip time.
    pub fn rtt(&self) -> Rtt {
        match self.engine.peer(self.id) {
            Some(peer) => peer.heartbeat().rtt(),
            None => self.engine.departed(self.id).map_or_else(Rtt::default, |d| d.rtt),
        }
    }

    /// Application data attached to the session.
    pub fn data<T: Any>(&self) -> Option<&T> {
        let slot = match self.engine.peer(self.id) {
            Some(peer) => &peer.data,
            None => &self.engine.departed(self.id)?.data,
        };
        slot.as_deref()?.downcast_ref::<T>()
    }

    /// Mutable application data.
    pub fn data_mut<T: Any>(&mut self) -> Option<&mut T> {
        let id = self.id;
        let slot = if self.engine.peer(id).is_some() {
            &mut self.engine.peer_mut(id)?.data
        } else {
            &mut self.engine.departed_mut(id)?.data
        };
        slot.as_deref_mut()?.downcast_mut::<T>()
    }

    /// Attach application data, replacing any previous value.
    pub fn set_data<T: Any + Send>(&mut self, data: T) {
        if let Some(peer) = self.engine.peer_mut(self.id) {
            peer.data = Some(Box::new(data));
        } else if let Some(departed) = self.engine.departed_mut(self.id) {
            departed.data = Some(Box::new(data));
        }
    }

    /// Detach and return the application data.
    pub fn take_data(&mut self) -> Option<Box<dyn Any + Send>> {
        if let Some(peer) = self.engine.peer_mut(self.id) {
            return peer.data.take();
        }
        self.engine.departed_mut(self.id)?.data.take()
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Handle to one channel of a session.
pub struct Channel<'a> {
    engine: &'a mut Engine,
    session: SessionId,
    index: usize,
}

impl Channel<'_> {
    /// Channel index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current delivery mode.
    pub fn mode(&self) -> Option<ChannelMode> {
        self.engine
            .peer(self.session)
            .and_then(|peer| peer.dispatcher().mode(self.index))
    }

    /// Change the delivery mode.
    pub fn set_mode(&mut self, mode: ChannelMode) -> bool {
        let index = self.index;
        self.engine
            .peer_mut(self.session)
            .is_some_and(|peer| peer.dispatcher_mut().set_mode(index, mode))
    }

    /// Send a message on this channel. See [`Session::send`].
    pub fn send(&mut self, message: &Message) -> usize {
        self.engine.send(self.session, self.index, message.payload())
    }
}
