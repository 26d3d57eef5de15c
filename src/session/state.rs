//! Session state machine
//!
//! Tracks an RTMP session from accept to disconnect. The phase only moves
//! through [`SessionPhase::apply`], which rejects every transition not
//! listed there.

use std::net::SocketAddr;
use std::time::Instant;

use crate::error::ProtocolError;
use crate::protocol::message::ConnectParams;
use crate::registry::StreamKey;

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Handshaking,
    /// Handshake done; commands accepted
    Connected,
    Publishing,
    Playing,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the socket or sent an orderly close
    Disconnected,
    ProtocolViolation,
    /// Publisher ended its stream
    Unpublished,
    /// The stream this subscriber was playing ended
    EndOfStream,
    LivenessTimeout,
    /// Subscriber queue overflowed
    ResourceLimit,
    HandshakeFailed,
}

/// Inputs to the phase machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    HandshakeComplete,
    /// Registry accepted the publisher
    Publish,
    Play,
    Close(CloseReason),
}

impl SessionPhase {
    pub fn name(self) -> &'static str {
        match self {
            SessionPhase::Handshaking => "Handshaking",
            SessionPhase::Connected => "Connected",
            SessionPhase::Publishing => "Publishing",
            SessionPhase::Playing => "Playing",
            SessionPhase::Closed => "Closed",
        }
    }

    /// Next phase for `event`, or an error for a transition that is not allowed
    pub fn apply(self, event: SessionEvent) -> Result<SessionPhase, ProtocolError> {
        use SessionEvent::*;
        use SessionPhase::*;

        match (self, event) {
            (Handshaking, HandshakeComplete) => Ok(Connected),
            (Connected, Publish) => Ok(Publishing),
            (Connected, Play) => Ok(Playing),
            // Closing twice is a no-op
            (_, Close(_)) => Ok(Closed),
            (from, event) => Err(ProtocolError::InvalidTransition {
                from: from.name(),
                event: event.name(),
            }),
        }
    }
}

impl SessionEvent {
    pub fn name(self) -> &'static str {
        match self {
            SessionEvent::HandshakeComplete => "HandshakeComplete",
            SessionEvent::Publish => "Publish",
            SessionEvent::Play => "Play",
            SessionEvent::Close(_) => "Close",
        }
    }
}

/// Per-connection bookkeeping owned by the connection task
#[derive(Debug)]
pub struct SessionState {
    pub id: u64,
    pub peer_addr: SocketAddr,
    phase: SessionPhase,
    close_reason: Option<CloseReason>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub connect_params: Option<ConnectParams>,
    pub stream_key: Option<StreamKey>,
    /// Message stream id the publish/play happened on
    pub media_stream_id: u32,
    next_stream_id: u32,

    pub window_ack_size: u32,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    last_ack_sequence: u64,
}

impl SessionState {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer_addr,
            phase: SessionPhase::Handshaking,
            close_reason: None,
            connected_at: now,
            last_activity: now,
            connect_params: None,
            stream_key: None,
            media_stream_id: 0,
            // Stream 0 is the NetConnection
            next_stream_id: 1,
            window_ack_size: 0,
            bytes_received: 0,
            bytes_sent: 0,
            last_ack_sequence: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Drive the phase machine; the first close reason wins
    pub fn transition(&mut self, event: SessionEvent) -> Result<SessionPhase, ProtocolError> {
        let next = self.phase.apply(event)?;
        if let SessionEvent::Close(reason) = event {
            self.close_reason.get_or_insert(reason);
        }
        self.phase = next;
        Ok(next)
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    pub fn app(&self) -> Option<&str> {
        self.connect_params.as_ref().map(|p| p.app.as_str())
    }

    /// Allocate a message stream id for `createStream`
    pub fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    /// Count received bytes; returns the sequence number to acknowledge
    /// once a full window has arrived since the last acknowledgement
    pub fn add_bytes_received(&mut self, bytes: usize, now: Instant) -> Option<u32> {
        self.bytes_received += bytes as u64;
        self.last_activity = now;

        if self.window_ack_size == 0 {
            return None;
        }
        if self.bytes_received - self.last_ack_sequence >= self.window_ack_size as u64 {
            self.last_ack_sequence = self.bytes_received;
            // Sequence numbers wrap at 32 bits
            Some(self.bytes_received as u32)
        } else {
            None
        }
    }

    pub fn add_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn state() -> SessionState {
        SessionState::new(1, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000))
    }

    #[test]
    fn test_publisher_lifecycle() {
        let mut s = state();
        assert_eq!(s.phase(), SessionPhase::Handshaking);

        s.transition(SessionEvent::HandshakeComplete).unwrap();
        s.transition(SessionEvent::Publish).unwrap();
        assert_eq!(s.phase(), SessionPhase::Publishing);

        s.transition(SessionEvent::Close(CloseReason::Unpublished))
            .unwrap();
        assert!(s.is_closed());
        assert_eq!(s.close_reason(), Some(CloseReason::Unpublished));
    }

    #[test]
    fn test_player_lifecycle() {
        let mut s = state();
        s.transition(SessionEvent::HandshakeComplete).unwrap();
        s.transition(SessionEvent::Play).unwrap();
        assert_eq!(s.phase(), SessionPhase::Playing);
    }

    #[test]
    fn test_invalid_transitions() {
        use SessionEvent::*;
        use SessionPhase::*;

        let invalid = [
            (Handshaking, Publish),
            (Handshaking, Play),
            (Connected, HandshakeComplete),
            (Publishing, Play),
            (Publishing, Publish),
            (Playing, Publish),
            (Closed, HandshakeComplete),
            (Closed, Play),
        ];
        for (phase, event) in invalid {
            let err = phase.apply(event).unwrap_err();
            assert_eq!(
                err,
                ProtocolError::InvalidTransition {
                    from: phase.name(),
                    event: event.name(),
                }
            );
        }
    }

    #[test]
    fn test_close_from_any_phase() {
        for phase in [
            SessionPhase::Handshaking,
            SessionPhase::Connected,
            SessionPhase::Publishing,
            SessionPhase::Playing,
            SessionPhase::Closed,
        ] {
            assert_eq!(
                phase.apply(SessionEvent::Close(CloseReason::Disconnected)),
                Ok(SessionPhase::Closed)
            );
        }
    }

    #[test]
    fn test_double_close_keeps_first_reason() {
        let mut s = state();
        s.transition(SessionEvent::Close(CloseReason::LivenessTimeout))
            .unwrap();
        s.transition(SessionEvent::Close(CloseReason::Disconnected))
            .unwrap();
        assert_eq!(s.close_reason(), Some(CloseReason::LivenessTimeout));
    }

    #[test]
    fn test_stream_allocation() {
        let mut s = state();
        assert_eq!(s.allocate_stream_id(), 1);
        assert_eq!(s.allocate_stream_id(), 2);
    }

    #[test]
    fn test_acknowledgement_window() {
        let mut s = state();
        let now = Instant::now();
        assert_eq!(s.add_bytes_received(5000, now), None);

        s.window_ack_size = 4096;
        assert_eq!(s.add_bytes_received(100, now), Some(5100));
        assert_eq!(s.add_bytes_received(4000, now), None);
        assert_eq!(s.add_bytes_received(96, now), Some(9196));
    }
}
