//! Simple RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (version) + C1 (1536) ----->|
//!   |<------ S0 (version) + S1 + S2 --------|
//!   |------- C2 (echo of S1) -------------->|
//! ```
//!
//! Only the simple (digest-less) variant is spoken. Echo contents are not
//! verified; common encoders send echoes that do not match byte for byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::HandshakeError;
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Lowest C0/S0 version accepted; higher values up to 31 are tolerated
const MIN_PEER_VERSION: u8 = 3;
const MAX_PEER_VERSION: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    /// Waiting for C0C1 (server) or S0S1S2 (client)
    AwaitPeerHello,
    /// Server only: waiting for C2
    AwaitPeerEcho,
    Done,
}

/// Handshake state machine, fed raw bytes from the socket
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    stage: Stage,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            stage: Stage::Start,
        }
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Bytes that must be buffered before [`Handshake::process`] can advance
    pub fn bytes_needed(&self) -> usize {
        match (self.stage, self.role) {
            (Stage::AwaitPeerHello, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (Stage::AwaitPeerHello, HandshakeRole::Client) => 1 + 2 * HANDSHAKE_SIZE,
            (Stage::AwaitPeerEcho, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// Start the handshake. Clients get C0C1 to send; servers get nothing.
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.stage != Stage::Start {
            return None;
        }
        self.stage = Stage::AwaitPeerHello;

        match self.role {
            HandshakeRole::Client => {
                let mut out = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                out.put_u8(RTMP_VERSION);
                out.put_slice(&hello_packet());
                Some(out.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Consume peer bytes. Returns the bytes to write back, if any.
    ///
    /// Leaves `data` untouched when it does not yet hold a full packet.
    pub fn process(&mut self, data: &mut Bytes) -> Result<Option<Bytes>, HandshakeError> {
        if data.remaining() < self.bytes_needed() {
            return Ok(None);
        }

        match (self.stage, self.role) {
            (Stage::AwaitPeerHello, HandshakeRole::Server) => {
                check_version(data.get_u8())?;
                let c1 = data.split_to(HANDSHAKE_SIZE);

                let mut out = BytesMut::with_capacity(1 + 2 * HANDSHAKE_SIZE);
                out.put_u8(RTMP_VERSION);
                out.put_slice(&hello_packet());
                out.put_slice(&echo_packet(&c1));

                self.stage = Stage::AwaitPeerEcho;
                Ok(Some(out.freeze()))
            }
            (Stage::AwaitPeerHello, HandshakeRole::Client) => {
                check_version(data.get_u8())?;
                let s1 = data.split_to(HANDSHAKE_SIZE);
                data.advance(HANDSHAKE_SIZE);

                self.stage = Stage::Done;
                Ok(Some(Bytes::copy_from_slice(&echo_packet(&s1))))
            }
            (Stage::AwaitPeerEcho, _) => {
                data.advance(HANDSHAKE_SIZE);
                self.stage = Stage::Done;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

fn check_version(version: u8) -> Result<(), HandshakeError> {
    if (MIN_PEER_VERSION..=MAX_PEER_VERSION).contains(&version) {
        Ok(())
    } else {
        Err(HandshakeError::InvalidVersion(version))
    }
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// C1/S1: time, four zero bytes, random fill
fn hello_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    packet[0..4].copy_from_slice(&now_millis().to_be_bytes());
    rand::thread_rng().fill_bytes(&mut packet[8..]);
    packet
}

/// C2/S2: the peer's packet with bytes 4..8 replaced by our read time
fn echo_packet(peer: &[u8]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = [0u8; HANDSHAKE_SIZE];
    echo.copy_from_slice(&peer[..HANDSHAKE_SIZE]);
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c0c1(version: u8) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        buf.put_u8(version);
        buf.put_slice(&hello_packet());
        buf.freeze()
    }

    #[test]
    fn test_client_server_handshake() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        let mut c0c1 = client.generate_initial().unwrap();
        assert_eq!(c0c1.len(), 1 + HANDSHAKE_SIZE);
        assert!(server.generate_initial().is_none());

        let mut s0s1s2 = server.process(&mut c0c1).unwrap().unwrap();
        assert_eq!(s0s1s2.len(), 1 + 2 * HANDSHAKE_SIZE);
        assert_eq!(s0s1s2[0], RTMP_VERSION);
        assert!(c0c1.is_empty());

        let mut c2 = client.process(&mut s0s1s2).unwrap().unwrap();
        assert_eq!(c2.len(), HANDSHAKE_SIZE);
        assert!(client.is_done());

        assert!(server.process(&mut c2).unwrap().is_none());
        assert!(server.is_done());
    }

    #[test]
    fn test_s2_echoes_c1() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut hello = c0c1(RTMP_VERSION);
        let c1 = hello.slice(1..);
        let response = server.process(&mut hello).unwrap().unwrap();

        let s2 = &response[1 + HANDSHAKE_SIZE..];
        assert_eq!(&s2[0..4], &c1[0..4]);
        assert_eq!(&s2[8..], &c1[8..]);
    }

    #[test]
    fn test_partial_input_not_consumed() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut partial = c0c1(RTMP_VERSION).slice(..100);
        assert!(server.process(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 100);
        assert_eq!(server.bytes_needed(), 1 + HANDSHAKE_SIZE);
    }

    #[test]
    fn test_version_below_three_rejected() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let err = server.process(&mut c0c1(2)).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidVersion(2)));
    }

    #[test]
    fn test_higher_versions_tolerated() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();
        assert!(server.process(&mut c0c1(31)).unwrap().is_some());

        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();
        assert!(server.process(&mut c0c1(32)).is_err());
    }

    #[test]
    fn test_generate_initial_once() {
        let mut client = Handshake::new(HandshakeRole::Client);
        assert!(client.generate_initial().is_some());
        assert!(client.generate_initial().is_none());
    }

    #[test]
    fn test_process_before_start_is_noop() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut buf = Bytes::from(vec![3u8; 1 + 2 * HANDSHAKE_SIZE]);
        assert!(client.process(&mut buf).unwrap().is_none());
        assert!(!client.is_done());
    }

    #[test]
    fn test_hello_packet_layout() {
        let packet = hello_packet();
        assert_eq!(&packet[4..8], &[0, 0, 0, 0]);
        assert_ne!(&packet[8..72], &[0u8; 64][..]);
    }
}
