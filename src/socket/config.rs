//! Socket configuration.

use std::time::Duration;

use crate::core::{
    ChannelMode, ConfigError, HANDSHAKE_RESEND_INTERVAL, KEEPALIVE_INTERVAL, MAX_CHANNELS,
    MAX_PARCEL_PAYLOAD, MAX_RETRANSMITS, RECEPTION_TIMEOUT, RELIABLE_WINDOW, UPDATE_INTERVAL,
};
use crate::delivery::DeliverySettings;

/// Default receive buffer per endpoint.
pub const DEFAULT_RECV_BUFFER: usize = 2048;

/// Socket configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Initial mode of every channel; the length is the channel count.
    pub channel_modes: Vec<ChannelMode>,

    /// Period of the engine tick.
    pub update_interval: Duration,

    /// Idle time after which a keep-alive is sent.
    pub keepalive_interval: Duration,

    /// Period between client connection requests.
    pub handshake_resend_interval: Duration,

    /// Maximum unacked reliable span, and maximum reorder gap.
    pub reliable_window: u64,

    /// Retransmissions before a reliable parcel faults the session.
    pub max_retransmits: u32,

    /// Idle time after which incomplete receptions are dropped.
    pub reception_timeout: Duration,

    /// Receive buffer per endpoint.
    pub recv_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            channel_modes: vec![ChannelMode::Reliable],
            update_interval: UPDATE_INTERVAL,
            keepalive_interval: KEEPALIVE_INTERVAL,
            handshake_resend_interval: HANDSHAKE_RESEND_INTERVAL,
            reliable_window: RELIABLE_WINDOW,
            max_retransmits: MAX_RETRANSMITS,
            reception_timeout: RECEPTION_TIMEOUT,
            recv_buffer_size: DEFAULT_RECV_BUFFER,
        }
    }
}

impl SocketConfig {
    /// Configuration with the given channels and default timing.
    pub fn with_channels(channel_modes: impl Into<Vec<ChannelMode>>) -> Self {
        Self {
            channel_modes: channel_modes.into(),
            ..Self::default()
        }
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.channel_modes.len() {
            0 => return Err(ConfigError::NoChannels),
            n if n > MAX_CHANNELS => return Err(ConfigError::TooManyChannels(n)),
            _ => {}
        }

        for (name, interval) in [
            ("update_interval", self.update_interval),
            ("keepalive_interval", self.keepalive_interval),
            ("handshake_resend_interval", self.handshake_resend_interval),
            ("reception_timeout", self.reception_timeout),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if self.reliable_window == 0 || self.reliable_window > u64::from(u32::MAX) {
            return Err(ConfigError::InvalidWindow(self.reliable_window));
        }
        Ok(())
    }

    pub(crate) fn delivery(&self) -> DeliverySettings {
        DeliverySettings {
            reliable_window: self.reliable_window,
            max_retransmits: self.max_retransmits,
            max_payload: MAX_PARCEL_PAYLOAD,
        }
    }
}

/// Builder for [`SocketConfig`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use courier::core::ChannelMode;
/// use courier::socket::SocketBuilder;
///
/// let config = SocketBuilder::new()
///     .channels([ChannelMode::Reliable, ChannelMode::Unreliable])
///     .keepalive_interval(Duration::from_millis(250))
///     .build()
///     .unwrap();
/// assert_eq!(config.channel_modes.len(), 2);
/// ```
#[derive(Debug, Default)]
pub struct SocketBuilder {
    config: SocketConfig,
}

impl SocketBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel modes.
    pub fn channels(mut self, modes: impl IntoIterator<Item = ChannelMode>) -> Self {
        self.config.channel_modes = modes.into_iter().collect();
        self
    }

    /// Set the engine tick period.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.update_interval = interval;
        self
    }

    /// Set the keep-alive interval.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the connection request resend interval.
    pub fn handshake_resend_interval(mut self, interval: Duration) -> Self {
        self.config.handshake_resend_interval = interval;
        self
    }

    /// Set the reliable window.
    pub fn reliable_window(mut self, window: u64) -> Self {
        self.config.reliable_window = window;
        self
    }

    /// Set the retransmission limit.
    pub fn max_retransmits(mut self, max: u32) -> Self {
        self.config.max_retransmits = max;
        self
    }

    /// Set the reception timeout.
    pub fn reception_timeout(mut self, timeout: Duration) -> Self {
        self.config.reception_timeout = timeout;
        self
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = size;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<SocketConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
