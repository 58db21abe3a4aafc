//! [`ProbeTracker`] – liveness of the control channel.
//!
//! While connected the connection manager periodically sends a ping probe and
//! expects the matching pong within a timeout.  The tracker remembers the
//! single outstanding probe and reports when its deadline has passed.

use std::time::Duration;

use tokio::time::Instant;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state of the channel as seen by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeHealth {
    /// No probe outstanding.
    Idle,
    /// A probe was sent and its deadline has not passed yet.
    Awaiting,
    /// The outstanding probe was not answered in time.
    TimedOut,
}

// ────────────────────────────────────────────────────────────────────────────
// ProbeTracker
// ────────────────────────────────────────────────────────────────────────────

/// Tracks one ping/pong round trip at a time.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tokio::time::Instant;
/// use custodian_middleware::health::{ProbeHealth, ProbeTracker};
///
/// let mut probe = ProbeTracker::new(Duration::from_secs(10));
/// let now = Instant::now();
/// let payload = probe.start(now);
/// assert_eq!(probe.health(now), ProbeHealth::Awaiting);
/// assert!(probe.on_pong(&payload, now));
/// assert_eq!(probe.health(now), ProbeHealth::Idle);
/// ```
#[derive(Debug)]
pub struct ProbeTracker {
    timeout: Duration,
    next_seq: u64,
    outstanding: Option<(u64, Instant)>,
    last_rtt: Option<Duration>,
}

impl ProbeTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_seq: 0,
            outstanding: None,
            last_rtt: None,
        }
    }

    /// Record a probe sent at `now` and return the payload to put on the wire.
    ///
    /// Starting a probe while one is outstanding replaces it.
    pub fn start(&mut self, now: Instant) -> Vec<u8> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding = Some((seq, now));
        seq.to_be_bytes().to_vec()
    }

    /// Match a pong against the outstanding probe.  Returns `true` when it
    /// answers the current probe; stale or foreign pongs are ignored.
    pub fn on_pong(&mut self, payload: &[u8], now: Instant) -> bool {
        let Some((seq, sent_at)) = self.outstanding else {
            return false;
        };
        if payload != seq.to_be_bytes().as_slice() {
            return false;
        }
        self.outstanding = None;
        self.last_rtt = Some(now.saturating_duration_since(sent_at));
        true
    }

    /// Deadline of the outstanding probe, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding.map(|(_, sent_at)| sent_at + self.timeout)
    }

    pub fn health(&self, now: Instant) -> ProbeHealth {
        match self.deadline() {
            None => ProbeHealth::Idle,
            Some(deadline) if now <= deadline => ProbeHealth::Awaiting,
            Some(_) => ProbeHealth::TimedOut,
        }
    }

    pub fn is_awaiting(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Round-trip time of the last answered probe.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Forget any outstanding probe (used when the channel is torn down).
    pub fn reset(&mut self) {
        self.outstanding = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_until_probe_started() {
        let probe = ProbeTracker::new(Duration::from_secs(1));
        assert_eq!(probe.health(Instant::now()), ProbeHealth::Idle);
        assert!(probe.deadline().is_none());
    }

    #[test]
    fn times_out_after_deadline() {
        let mut probe = ProbeTracker::new(Duration::from_millis(100));
        let t0 = Instant::now();
        probe.start(t0);
        assert_eq!(probe.health(t0 + Duration::from_millis(50)), ProbeHealth::Awaiting);
        assert_eq!(probe.health(t0 + Duration::from_millis(150)), ProbeHealth::TimedOut);
    }

    #[test]
    fn stale_pong_is_ignored() {
        let mut probe = ProbeTracker::new(Duration::from_secs(1));
        let t0 = Instant::now();
        let first = probe.start(t0);
        let second = probe.start(t0);
        assert!(!probe.on_pong(&first, t0));
        assert!(probe.is_awaiting());
        assert!(probe.on_pong(&second, t0 + Duration::from_millis(20)));
        assert_eq!(probe.last_rtt(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn pong_without_probe_is_ignored() {
        let mut probe = ProbeTracker::new(Duration::from_secs(1));
        assert!(!probe.on_pong(&[0; 8], Instant::now()));
    }

    #[test]
    fn reset_clears_outstanding() {
        let mut probe = ProbeTracker::new(Duration::from_secs(1));
        probe.start(Instant::now());
        probe.reset();
        assert!(!probe.is_awaiting());
    }
}
