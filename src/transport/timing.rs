//! RTT estimation and keep-alive bookkeeping.
//!
//! Smoothing follows the Jacobson estimator: `err = sample - mean`,
//! `mean += err / 8`, `variance += (|err| - variance) / 4`.

use std::time::{Duration, Instant};

use super::packet::{Ack, KeepAlive};
use crate::core::{INITIAL_RTO, MAX_RTO, MIN_RTO};

/// Smoothing constants.
pub mod constants {
    /// Gain for the mean (1/8).
    pub const MEAN_GAIN: f64 = 0.125;

    /// Gain for the variance (1/4).
    pub const VARIANCE_GAIN: f64 = 0.25;

    /// Variance multiplier in the retransmission timeout.
    pub const RTO_K: f64 = 4.0;

    /// Gain for the client clock offset (1/8).
    pub const OFFSET_GAIN: f64 = 0.125;
}

/// Round-trip time snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rtt {
    /// Smoothed round-trip time.
    pub mean: Duration,
    /// Smoothed mean deviation.
    pub variance: Duration,
}

/// RTT estimator.
///
/// Mean and variance are kept in nanoseconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    mean: f64,
    variance: f64,
    rto: Duration,
    initialized: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// Create an estimator with no samples.
    pub fn new() -> Self {
        Self {
            mean: 0.0,
            variance: 0.0,
            rto: INITIAL_RTO,
            initialized: false,
        }
    }

    /// Feed one RTT sample.
    ///
    /// The first sample seeds the mean and sets the variance to half of it.
    pub fn update(&mut self, sample: Duration) {
        let sample = sample.as_nanos() as f64;

        if !self.initialized {
            self.mean = sample;
            self.variance = sample / 2.0;
            self.initialized = true;
        } else {
            let err = sample - self.mean;
            self.mean += err * constants::MEAN_GAIN;
            self.variance += (err.abs() - self.variance) * constants::VARIANCE_GAIN;
        }

        let rto = Duration::from_nanos((self.mean + constants::RTO_K * self.variance) as u64);
        self.rto = rto.clamp(MIN_RTO, MAX_RTO);
    }

    /// Current mean and variance.
    pub fn rtt(&self) -> Rtt {
        Rtt {
            mean: Duration::from_nanos(self.mean as u64),
            variance: Duration::from_nanos(self.variance as u64),
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Whether at least one sample was seen.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

/// Per-peer liveness and timing state.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    estimator: RttEstimator,
    last_sent: Instant,
    last_received: Instant,
    /// Peer ping time to echo and when it arrived.
    pending_echo: Option<(u64, Instant)>,
    /// Newest echo accepted as a sample.
    last_echo_time: u64,
    /// Estimated `peer clock - local clock`, in nanoseconds.
    clock_offset: Option<f64>,
}

impl Heartbeat {
    /// Start tracking at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            estimator: RttEstimator::new(),
            last_sent: now,
            last_received: now,
            pending_echo: None,
            last_echo_time: 0,
            clock_offset: None,
        }
    }

    /// Record an outbound packet.
    pub fn on_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    /// Record an authenticated inbound packet.
    pub fn on_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Instant of the last authenticated inbound packet.
    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// Whether nothing was sent for `interval`.
    pub fn needs_keep_alive(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_sent) >= interval
    }

    /// Whether nothing was received for longer than `timeout`.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_received) > timeout
    }

    /// Build a keep-alive stamped with `local_time` (ns), consuming the
    /// pending echo.
    pub fn keep_alive(&mut self, now: Instant, local_time: u64, acks: Vec<Ack>) -> KeepAlive {
        let (echo_time, echo_delay) = match self.pending_echo.take() {
            Some((ping, at)) => (ping, now.saturating_duration_since(at).as_nanos() as u64),
            None => (0, 0),
        };
        KeepAlive {
            ping_time: local_time,
            echo_time,
            echo_delay,
            acks,
        }
    }

    /// Process a received keep-alive. Returns the RTT sample it produced.
    pub fn on_keep_alive(
        &mut self,
        now: Instant,
        local_time: u64,
        keep_alive: &KeepAlive,
    ) -> Option<Duration> {
        self.pending_echo = Some((keep_alive.ping_time, now));

        if keep_alive.echo_time == 0 || keep_alive.echo_time <= self.last_echo_time {
            return None;
        }
        self.last_echo_time = keep_alive.echo_time;

        let elapsed = local_time.checked_sub(keep_alive.echo_time)?;
        let sample = Duration::from_nanos(elapsed.saturating_sub(keep_alive.echo_delay));
        self.estimator.update(sample);
        Some(sample)
    }

    /// Feed an RTT sample from a reliable acknowledgement.
    pub fn record_sample(&mut self, sample: Duration) {
        self.estimator.update(sample);
    }

    /// Fold a peer clock reading into the offset estimate.
    ///
    /// The reading is assumed to be half a round trip old.
    pub fn observe_peer_clock(&mut self, peer_time: u64, local_time: u64) {
        let half_rtt = self.estimator.rtt().mean.as_nanos() as f64 / 2.0;
        let observed = peer_time as f64 + half_rtt - local_time as f64;
        self.clock_offset = Some(match self.clock_offset {
            Some(offset) => offset + (observed - offset) * constants::OFFSET_GAIN,
            None => observed,
        });
    }

    /// Estimated `peer clock - local clock` in nanoseconds.
    pub fn clock_offset(&self) -> i64 {
        self.clock_offset.unwrap_or(0.0) as i64
    }

    /// Current RTT snapshot.
    pub fn rtt(&self) -> Rtt {
        self.estimator.rtt()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.estimator.rto()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_estimator_initial() {
        let estimator = RttEstimator::new();
        assert!(!estimator.is_initialized());
        assert_eq!(estimator.rto(), INITIAL_RTO);
        assert_eq!(estimator.rtt(), Rtt::default());
    }

    #[test]
    fn test_rtt_estimator_first_sample() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));

        assert!(estimator.is_initialized());
        assert_eq!(estimator.rtt().mean, Duration::from_millis(100));
        assert_eq!(estimator.rtt().variance, Duration::from_millis(50));
        assert_eq!(estimator.rto(), Duration::from_millis(300));
    }

    #[test]
    fn test_rtt_estimator_smoothing() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_millis(100));
        estimator.update(Duration::from_millis(180));

        // mean += 80/8, variance += (80 - 50)/4
        assert_eq!(estimator.rtt().mean, Duration::from_millis(110));
        assert_eq!(estimator.rtt().variance, Duration::from_micros(57_500));
    }

    #[test]
    fn test_rtt_estimator_rto_bounds() {
        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_micros(100));
        assert_eq!(estimator.rto(), MIN_RTO);

        let mut estimator = RttEstimator::new();
        estimator.update(Duration::from_secs(30));
        assert_eq!(estimator.rto(), MAX_RTO);
    }

    #[test]
    fn test_heartbeat_echo_sample() {
        let start = Instant::now();
        let mut client = Heartbeat::new(start);
        let mut server = Heartbeat::new(start);

        // Client pings at t=1ms (local 1_000_000 ns).
        let ping = client.keep_alive(start, 1_000_000, Vec::new());
        assert_eq!((ping.echo_time, ping.echo_delay), (0, 0));

        // Server receives at t=21ms and replies 5ms later.
        let at = start + Duration::from_millis(21);
        assert_eq!(server.on_keep_alive(at, 500, &ping), None);
        let pong = server.keep_alive(at + Duration::from_millis(5), 600, Vec::new());
        assert_eq!(pong.echo_time, 1_000_000);
        assert_eq!(pong.echo_delay, 5_000_000);

        // Client receives at local 47ms: sample = 46ms - 5ms.
        let sample = client
            .on_keep_alive(start + Duration::from_millis(47), 47_000_000, &pong)
            .unwrap();
        assert_eq!(sample, Duration::from_millis(41));
        assert_eq!(client.rtt().mean, Duration::from_millis(41));
    }

    #[test]
    fn test_heartbeat_echo_used_once() {
        let now = Instant::now();
        let mut heartbeat = Heartbeat::new(now);
        heartbeat.on_keep_alive(now, 0, &KeepAlive { ping_time: 7, ..Default::default() });

        assert_eq!(heartbeat.keep_alive(now, 10, Vec::new()).echo_time, 7);
        assert_eq!(heartbeat.keep_alive(now, 20, Vec::new()).echo_time, 0);
    }

    #[test]
    fn test_heartbeat_stale_echo_ignored() {
        let now = Instant::now();
        let mut heartbeat = Heartbeat::new(now);
        let echo = KeepAlive {
            ping_time: 1,
            echo_time: 100,
            echo_delay: 0,
            acks: Vec::new(),
        };
        assert!(heartbeat.on_keep_alive(now, 200, &echo).is_some());
        assert!(heartbeat.on_keep_alive(now, 300, &echo).is_none());
    }

    #[test]
    fn test_heartbeat_liveness() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(start);
        let interval = Duration::from_millis(100);

        assert!(!heartbeat.needs_keep_alive(start + Duration::from_millis(50), interval));
        assert!(heartbeat.needs_keep_alive(start + interval, interval));
        heartbeat.on_sent(start + interval);
        assert!(!heartbeat.needs_keep_alive(start + interval, interval));

        let timeout = Duration::from_secs(5);
        assert!(!heartbeat.is_timed_out(start + timeout, timeout));
        assert!(heartbeat.is_timed_out(start + timeout + Duration::from_millis(1), timeout));
        heartbeat.on_received(start + timeout);
        assert!(!heartbeat.is_timed_out(start + timeout + Duration::from_millis(1), timeout));
        assert_eq!(heartbeat.last_received(), start + timeout);
    }

    #[test]
    fn test_clock_offset_smoothing() {
        let now = Instant::now();
        let mut heartbeat = Heartbeat::new(now);
        assert_eq!(heartbeat.clock_offset(), 0);

        heartbeat.observe_peer_clock(5_000, 1_000);
        assert_eq!(heartbeat.clock_offset(), 4_000);

        heartbeat.observe_peer_clock(13_000, 1_000);
        assert_eq!(heartbeat.clock_offset(), 5_000);
    }
}
