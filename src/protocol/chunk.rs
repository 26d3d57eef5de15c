//! Chunk stream framing
//!
//! Messages travel as one or more chunks no larger than the sender's chunk
//! size. Each chunk starts with a basic header (format + chunk stream id) and
//! a message header whose size depends on the format:
//!
//! ```text
//! fmt 0: timestamp(3) length(3) type(1) stream id(4, LE)   11 bytes
//! fmt 1: delta(3)     length(3) type(1)                     7 bytes
//! fmt 2: delta(3)                                           3 bytes
//! fmt 3: (inherits everything)                              0 bytes
//! ```
//!
//! A 24-bit timestamp of `0xFFFFFF` is followed by a 32-bit extended
//! timestamp, which is repeated on every fmt 3 chunk of the same message.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FramingError;
use crate::protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE, EXTENDED_TIMESTAMP_MARKER, MAX_CHUNK_SIZE,
};

/// Upper bound on chunk streams tracked per connection
pub const MAX_CHUNK_STREAMS: usize = 256;

const MESSAGE_HEADER_LEN: [usize; 4] = [11, 7, 3, 0];

/// A reassembled message together with the chunk stream it arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpChunk {
    /// Chunk stream id
    pub csid: u32,
    /// Absolute timestamp in milliseconds
    pub timestamp: u32,
    /// Message type id
    pub message_type: u8,
    /// Message stream id
    pub stream_id: u32,
    /// Complete message payload
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
struct MessageHeader {
    timestamp: u32,
    /// Last timestamp field: absolute for fmt 0, delta for fmt 1/2
    timestamp_delta: u32,
    length: u32,
    message_type: u8,
    stream_id: u32,
    extended: bool,
}

#[derive(Debug, Default)]
struct ChunkStream {
    header: MessageHeader,
    partial: BytesMut,
}

enum Progress {
    NeedMore,
    Partial,
    Complete(RtmpChunk),
}

/// Incremental chunk stream decoder
///
/// Consumes whole chunks only, so it can be called again with the same
/// buffer after more bytes arrive.
#[derive(Debug)]
pub struct ChunkDecoder {
    chunk_size: u32,
    max_message_size: u32,
    streams: HashMap<u32, ChunkStream>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a decoder that rejects messages longer than `max_message_size`
    pub fn with_max_message_size(max_message_size: u32) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size,
            streams: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Apply a peer's SetChunkSize
    pub fn set_chunk_size(&mut self, size: u32) -> Result<(), FramingError> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(FramingError::InvalidChunkSize(size));
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Discard the partially received message on `csid`
    pub fn abort(&mut self, csid: u32) {
        if let Some(stream) = self.streams.get_mut(&csid) {
            stream.partial.clear();
        }
    }

    /// Decode the next complete message from `buf`
    ///
    /// Returns `Ok(None)` when `buf` holds no further complete message.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RtmpChunk>, FramingError> {
        loop {
            match self.decode_chunk(buf)? {
                Progress::NeedMore => return Ok(None),
                Progress::Partial => continue,
                Progress::Complete(chunk) => return Ok(Some(chunk)),
            }
        }
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<Progress, FramingError> {
        let data = &buf[..];
        if data.is_empty() {
            return Ok(Progress::NeedMore);
        }

        let fmt = (data[0] >> 6) as usize;
        let (csid, mut pos) = match data[0] & 0x3F {
            0 if data.len() >= 2 => (64 + data[1] as u32, 2),
            1 if data.len() >= 3 => (64 + data[1] as u32 + ((data[2] as u32) << 8), 3),
            0 | 1 => return Ok(Progress::NeedMore),
            id => (id as u32, 1),
        };

        if data.len() < pos + MESSAGE_HEADER_LEN[fmt] {
            return Ok(Progress::NeedMore);
        }

        let (mut header, partial_len) = match self.streams.get(&csid) {
            Some(stream) => (stream.header, stream.partial.len()),
            None if fmt != 0 => return Err(FramingError::MissingPreviousHeader(csid)),
            None if self.streams.len() >= MAX_CHUNK_STREAMS => {
                return Err(FramingError::TooManyChunkStreams(MAX_CHUNK_STREAMS))
            }
            None => (MessageHeader::default(), 0),
        };

        // A full or partial header always starts a new message
        let starts_message = fmt != 3 || partial_len == 0;

        let timestamp_field = if fmt < 3 { read_u24(&data[pos..]) } else { 0 };
        if fmt < 2 {
            header.length = read_u24(&data[pos + 3..]);
            header.message_type = data[pos + 6];
        }
        if fmt == 0 {
            header.stream_id = u32::from_le_bytes([
                data[pos + 7],
                data[pos + 8],
                data[pos + 9],
                data[pos + 10],
            ]);
        }
        pos += MESSAGE_HEADER_LEN[fmt];

        if fmt < 3 {
            header.extended = timestamp_field == EXTENDED_TIMESTAMP_MARKER;
        }
        let timestamp_value = if header.extended {
            if data.len() < pos + 4 {
                return Ok(Progress::NeedMore);
            }
            let value = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            pos += 4;
            value
        } else {
            timestamp_field
        };

        match fmt {
            0 => {
                header.timestamp = timestamp_value;
                header.timestamp_delta = timestamp_value;
            }
            1 | 2 => {
                header.timestamp_delta = timestamp_value;
                header.timestamp = header.timestamp.wrapping_add(timestamp_value);
            }
            _ if starts_message => {
                header.timestamp = header.timestamp.wrapping_add(header.timestamp_delta);
            }
            _ => {}
        }

        if header.length > self.max_message_size {
            return Err(FramingError::MessageTooLarge {
                size: header.length,
                limit: self.max_message_size,
            });
        }

        let received = if starts_message { 0 } else { partial_len as u32 };
        let take = (header.length - received).min(self.chunk_size) as usize;
        if data.len() < pos + take {
            return Ok(Progress::NeedMore);
        }

        buf.advance(pos);
        let piece = buf.split_to(take);

        let stream = self.streams.entry(csid).or_default();
        if starts_message {
            stream.partial.clear();
        }
        stream.header = header;
        stream.partial.extend_from_slice(&piece);

        if stream.partial.len() < header.length as usize {
            return Ok(Progress::Partial);
        }

        Ok(Progress::Complete(RtmpChunk {
            csid,
            timestamp: header.timestamp,
            message_type: header.message_type,
            stream_id: header.stream_id,
            payload: stream.partial.split().freeze(),
        }))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunk stream encoder
///
/// Every message is written as a fmt 0 chunk followed by fmt 3
/// continuations, so the output depends only on the message and the chunk
/// size.
#[derive(Debug)]
pub struct ChunkEncoder {
    chunk_size: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Set the outbound chunk size (announce it to the peer first)
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
    }

    /// Append the chunks of `chunk` to `buf`
    pub fn encode(&self, chunk: &RtmpChunk, buf: &mut BytesMut) {
        let extended = chunk.timestamp >= EXTENDED_TIMESTAMP_MARKER;
        let payload = &chunk.payload[..];

        buf.reserve(payload.len() + 18);
        write_basic_header(buf, 0, chunk.csid);
        put_u24(buf, chunk.timestamp.min(EXTENDED_TIMESTAMP_MARKER));
        put_u24(buf, payload.len() as u32);
        buf.put_u8(chunk.message_type);
        buf.put_u32_le(chunk.stream_id);
        if extended {
            buf.put_u32(chunk.timestamp);
        }

        let mut pieces = payload.chunks(self.chunk_size as usize);
        if let Some(first) = pieces.next() {
            buf.put_slice(first);
        }
        for piece in pieces {
            write_basic_header(buf, 3, chunk.csid);
            if extended {
                buf.put_u32(chunk.timestamp);
            }
            buf.put_slice(piece);
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    let fmt = fmt << 6;
    match csid {
        0..=63 => buf.put_u8(fmt | csid as u8),
        64..=319 => {
            buf.put_u8(fmt);
            buf.put_u8((csid - 64) as u8);
        }
        _ => {
            let id = csid - 64;
            buf.put_u8(fmt | 1);
            buf.put_u8((id & 0xFF) as u8);
            buf.put_u8(((id >> 8) & 0xFF) as u8);
        }
    }
}

fn read_u24(data: &[u8]) -> u32 {
    ((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}
