//! Ping/pong liveness tracking
//!
//! Pure bookkeeping: the connection task passes in the current time, sends
//! the pings this yields, and sleeps until [`LivenessMonitor::next_deadline`].

use std::time::Duration;
use tokio::time::Instant;

/// What the connection task should do now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Send a `PingRequest` carrying this value
    SendPing(u32),
    Wait,
    /// The outstanding ping went unanswered for the full timeout
    Expired,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    interval: Duration,
    timeout: Duration,
    started: Instant,
    next_ping: Instant,
    /// Nonce and send time of the unanswered ping
    outstanding: Option<(u32, Instant)>,
    last_nonce: Option<u32>,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            started: now,
            next_ping: now + interval,
            outstanding: None,
            last_nonce: None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> LivenessAction {
        if let Some((_, sent_at)) = self.outstanding {
            if now >= sent_at + self.timeout {
                return LivenessAction::Expired;
            }
            return LivenessAction::Wait;
        }

        if now < self.next_ping {
            return LivenessAction::Wait;
        }

        let nonce = self.make_nonce(now);
        self.outstanding = Some((nonce, now));
        self.last_nonce = Some(nonce);
        self.next_ping = now + self.interval;
        LivenessAction::SendPing(nonce)
    }

    /// Record a `PingResponse`; returns true when it answered the outstanding ping
    pub fn on_pong(&mut self, nonce: u32) -> bool {
        match self.outstanding {
            Some((expected, _)) if expected == nonce => {
                self.outstanding = None;
                true
            }
            _ => false,
        }
    }

    /// When [`LivenessMonitor::poll`] next has something to do
    pub fn next_deadline(&self) -> Instant {
        match self.outstanding {
            Some((_, sent_at)) => sent_at + self.timeout,
            None => self.next_ping,
        }
    }

    /// Latest instant a blocked write may finish by.
    ///
    /// A write stuck past the unanswered ping's timeout, or past a full
    /// timeout after the next ping is due, means the peer is not draining.
    pub fn write_deadline(&self, now: Instant) -> Instant {
        match self.outstanding {
            Some((_, sent_at)) => sent_at + self.timeout,
            None => self.next_ping.max(now) + self.timeout,
        }
    }

    /// Milliseconds since the monitor started, kept distinct from the previous ping
    fn make_nonce(&self, now: Instant) -> u32 {
        let nonce = now.duration_since(self.started).as_millis() as u32;
        match self.last_nonce {
            Some(last) if last == nonce => nonce.wrapping_add(1),
            _ => nonce,
        }
    }
}
