//! RTMP wire protocol: handshake, chunk framing, message classification

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder, RtmpChunk};
pub use handshake::{Handshake, HandshakeRole};
pub use message::{Command, DataMessage, RtmpMessage, UserControlEvent};
