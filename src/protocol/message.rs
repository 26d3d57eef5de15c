//! RTMP message classification
//!
//! Turns reassembled chunks into typed messages and back. Audio and video
//! payloads are passed through untouched; commands and data messages are
//! AMF0 decoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{amf0, AmfValue};
use crate::error::{FramingError, ProtocolError, Result};
use crate::protocol::chunk::RtmpChunk;
use crate::protocol::constants::*;

/// A classified RTMP message
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Abort { csid: u32 },
    Acknowledgement { sequence: u32 },
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
    Audio { timestamp: u32, data: Bytes },
    Video { timestamp: u32, data: Bytes },
    Command(Command),
    Data(DataMessage),
    Unknown { message_type: u8, payload: Bytes },
}

/// User control events (message type 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown(u16),
}

/// AMF command (`connect`, `publish`, `_result`, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub command_object: AmfValue,
    pub arguments: Vec<AmfValue>,
    /// Message stream the command arrived on / is sent on
    pub stream_id: u32,
}

/// AMF data message (`@setDataFrame`, `onMetaData`)
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub name: String,
    pub values: Vec<AmfValue>,
    pub stream_id: u32,
}

/// Parameters of the `connect` command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub app: String,
    pub tc_url: Option<String>,
    pub flash_ver: Option<String>,
    pub object_encoding: f64,
}

/// Parameters of the `publish` command
#[derive(Debug, Clone, PartialEq)]
pub struct PublishParams {
    pub stream_key: String,
    pub publish_type: String,
    pub stream_id: u32,
}

/// Parameters of the `play` command
#[derive(Debug, Clone, PartialEq)]
pub struct PlayParams {
    pub stream_name: String,
    pub reset: bool,
    pub stream_id: u32,
}

impl RtmpMessage {
    /// Classify a reassembled chunk
    pub fn from_chunk(chunk: &RtmpChunk) -> Result<Self> {
        let mut payload = chunk.payload.clone();
        let message_type = chunk.message_type;

        let need = |len: usize| -> Result<()> {
            if chunk.payload.len() < len {
                Err(FramingError::TruncatedPayload {
                    message_type,
                    len: chunk.payload.len(),
                }
                .into())
            } else {
                Ok(())
            }
        };

        let message = match message_type {
            MSG_SET_CHUNK_SIZE => {
                need(4)?;
                // Top bit is reserved and must be ignored
                RtmpMessage::SetChunkSize(payload.get_u32() & MAX_CHUNK_SIZE)
            }
            MSG_ABORT => {
                need(4)?;
                RtmpMessage::Abort {
                    csid: payload.get_u32(),
                }
            }
            MSG_ACKNOWLEDGEMENT => {
                need(4)?;
                RtmpMessage::Acknowledgement {
                    sequence: payload.get_u32(),
                }
            }
            MSG_USER_CONTROL => {
                need(2)?;
                RtmpMessage::UserControl(UserControlEvent::parse(&mut payload, message_type)?)
            }
            MSG_WINDOW_ACK_SIZE => {
                need(4)?;
                RtmpMessage::WindowAckSize(payload.get_u32())
            }
            MSG_SET_PEER_BANDWIDTH => {
                need(5)?;
                RtmpMessage::SetPeerBandwidth {
                    size: payload.get_u32(),
                    limit_type: payload.get_u8(),
                }
            }
            MSG_AUDIO => RtmpMessage::Audio {
                timestamp: chunk.timestamp,
                data: payload,
            },
            MSG_VIDEO => RtmpMessage::Video {
                timestamp: chunk.timestamp,
                data: payload,
            },
            MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3 => {
                if message_type == MSG_COMMAND_AMF3 && payload.has_remaining() {
                    payload.advance(1);
                }
                RtmpMessage::Command(Command::decode(payload, chunk.stream_id)?)
            }
            MSG_DATA_AMF0 | MSG_DATA_AMF3 => {
                if message_type == MSG_DATA_AMF3 && payload.has_remaining() {
                    payload.advance(1);
                }
                RtmpMessage::Data(DataMessage::decode(payload, chunk.stream_id)?)
            }
            other => RtmpMessage::Unknown {
                message_type: other,
                payload,
            },
        };

        Ok(message)
    }

    /// Encode into `(message type, payload)`
    pub fn encode(&self) -> (u8, Bytes) {
        let mut buf = BytesMut::new();
        let message_type = match self {
            RtmpMessage::SetChunkSize(size) => {
                buf.put_u32(*size & MAX_CHUNK_SIZE);
                MSG_SET_CHUNK_SIZE
            }
            RtmpMessage::Abort { csid } => {
                buf.put_u32(*csid);
                MSG_ABORT
            }
            RtmpMessage::Acknowledgement { sequence } => {
                buf.put_u32(*sequence);
                MSG_ACKNOWLEDGEMENT
            }
            RtmpMessage::UserControl(event) => {
                event.encode(&mut buf);
                MSG_USER_CONTROL
            }
            RtmpMessage::WindowAckSize(size) => {
                buf.put_u32(*size);
                MSG_WINDOW_ACK_SIZE
            }
            RtmpMessage::SetPeerBandwidth { size, limit_type } => {
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                MSG_SET_PEER_BANDWIDTH
            }
            RtmpMessage::Audio { data, .. } => return (MSG_AUDIO, data.clone()),
            RtmpMessage::Video { data, .. } => return (MSG_VIDEO, data.clone()),
            RtmpMessage::Command(cmd) => return (MSG_COMMAND_AMF0, cmd.encode()),
            RtmpMessage::Data(data) => return (MSG_DATA_AMF0, data.encode()),
            RtmpMessage::Unknown {
                message_type,
                payload,
            } => return (*message_type, payload.clone()),
        };
        (message_type, buf.freeze())
    }
}

impl UserControlEvent {
    fn parse(payload: &mut Bytes, message_type: u8) -> Result<Self> {
        let event_type = payload.get_u16();
        let truncated = |len: usize| FramingError::TruncatedPayload { message_type, len };

        let event = match event_type {
            UC_SET_BUFFER_LENGTH => {
                if payload.remaining() < 8 {
                    return Err(truncated(payload.remaining() + 2).into());
                }
                UserControlEvent::SetBufferLength {
                    stream_id: payload.get_u32(),
                    buffer_ms: payload.get_u32(),
                }
            }
            UC_STREAM_BEGIN | UC_STREAM_EOF | UC_STREAM_DRY | UC_STREAM_IS_RECORDED
            | UC_PING_REQUEST | UC_PING_RESPONSE => {
                if payload.remaining() < 4 {
                    return Err(truncated(payload.remaining() + 2).into());
                }
                let value = payload.get_u32();
                match event_type {
                    UC_STREAM_BEGIN => UserControlEvent::StreamBegin(value),
                    UC_STREAM_EOF => UserControlEvent::StreamEof(value),
                    UC_STREAM_DRY => UserControlEvent::StreamDry(value),
                    UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(value),
                    UC_PING_REQUEST => UserControlEvent::PingRequest(value),
                    _ => UserControlEvent::PingResponse(value),
                }
            }
            other => UserControlEvent::Unknown(other),
        };
        Ok(event)
    }

    fn encode(&self, buf: &mut BytesMut) {
        let (event_type, value) = match *self {
            UserControlEvent::StreamBegin(id) => (UC_STREAM_BEGIN, id),
            UserControlEvent::StreamEof(id) => (UC_STREAM_EOF, id),
            UserControlEvent::StreamDry(id) => (UC_STREAM_DRY, id),
            UserControlEvent::StreamIsRecorded(id) => (UC_STREAM_IS_RECORDED, id),
            UserControlEvent::PingRequest(ts) => (UC_PING_REQUEST, ts),
            UserControlEvent::PingResponse(ts) => (UC_PING_RESPONSE, ts),
            UserControlEvent::SetBufferLength {
                stream_id,
                buffer_ms,
            } => {
                buf.put_u16(UC_SET_BUFFER_LENGTH);
                buf.put_u32(stream_id);
                buf.put_u32(buffer_ms);
                return;
            }
            UserControlEvent::Unknown(event_type) => {
                buf.put_u16(event_type);
                return;
            }
        };
        buf.put_u16(event_type);
        buf.put_u32(value);
    }
}

impl Command {
    fn decode(payload: Bytes, stream_id: u32) -> Result<Self> {
        let mut values = amf0::decode_all(payload)?.into_iter();

        let name = match values.next() {
            Some(AmfValue::String(name)) => name,
            _ => return Err(ProtocolError::MissingCommandName.into()),
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let command_object = values.next().unwrap_or(AmfValue::Null);

        Ok(Self {
            name,
            transaction_id,
            command_object,
            arguments: values.collect(),
            stream_id,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut encoder = amf0::Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode(&AmfValue::Number(self.transaction_id));
        encoder.encode(&self.command_object);
        encoder.encode_all(&self.arguments);
        encoder.finish()
    }

    /// `_result` reply
    pub fn result(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Self {
            name: CMD_RESULT.to_string(),
            transaction_id,
            command_object: properties,
            arguments: vec![info],
            stream_id: 0,
        }
    }

    /// `_error` reply
    pub fn error(transaction_id: f64, properties: AmfValue, info: AmfValue) -> Self {
        Self {
            name: CMD_ERROR.to_string(),
            ..Self::result(transaction_id, properties, info)
        }
    }

    /// `onStatus` notification on a message stream
    pub fn on_status(stream_id: u32, level: &str, code: &str, description: &str) -> Self {
        let info = AmfValue::object([
            ("level", AmfValue::from(level)),
            ("code", AmfValue::from(code)),
            ("description", AmfValue::from(description)),
        ]);
        Self {
            name: CMD_ON_STATUS.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![info],
            stream_id,
        }
    }

    /// Bare notification such as `onFCPublish`
    pub fn notify(name: &str, code: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            transaction_id: 0.0,
            command_object: AmfValue::Null,
            arguments: vec![AmfValue::object([
                ("code", AmfValue::from(code)),
                ("description", AmfValue::from(description)),
            ])],
            stream_id: 0,
        }
    }

    /// First string argument, e.g. the stream name of `publish`/`play`
    pub fn first_string_arg(&self) -> Option<&str> {
        self.arguments.first().and_then(AmfValue::as_str)
    }
}

impl DataMessage {
    fn decode(payload: Bytes, stream_id: u32) -> Result<Self> {
        let mut values = amf0::decode_all(payload)?;
        let name = match values.first() {
            Some(AmfValue::String(_)) => match values.remove(0) {
                AmfValue::String(name) => name,
                _ => String::new(),
            },
            _ => String::new(),
        };
        Ok(Self {
            name,
            values,
            stream_id,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut encoder = amf0::Amf0Encoder::new();
        encoder.encode(&AmfValue::String(self.name.clone()));
        encoder.encode_all(&self.values);
        encoder.finish()
    }

    /// Normalize `@setDataFrame onMetaData {..}` to `onMetaData {..}`
    ///
    /// Returns `None` for data messages that are not stream metadata.
    pub fn into_metadata(self) -> Option<DataMessage> {
        match self.name.as_str() {
            CMD_ON_METADATA => Some(self),
            CMD_SET_DATA_FRAME => {
                let mut values = self.values.into_iter();
                match values.next() {
                    Some(AmfValue::String(name)) if name == CMD_ON_METADATA => Some(DataMessage {
                        name,
                        values: values.collect(),
                        stream_id: self.stream_id,
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl ConnectParams {
    pub fn from_amf(obj: &AmfValue) -> Self {
        Self {
            app: obj
                .get_string("app")
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            tc_url: obj.get_string("tcUrl").map(str::to_string),
            flash_ver: obj.get_string("flashVer").map(str::to_string),
            object_encoding: obj.get_number("objectEncoding").unwrap_or(0.0),
        }
    }
}

impl PublishParams {
    pub fn from_command(cmd: &Command) -> Self {
        Self {
            stream_key: strip_query(cmd.first_string_arg().unwrap_or_default()),
            publish_type: cmd
                .arguments
                .get(1)
                .and_then(AmfValue::as_str)
                .unwrap_or("live")
                .to_string(),
            stream_id: cmd.stream_id,
        }
    }
}

impl PlayParams {
    pub fn from_command(cmd: &Command) -> Self {
        Self {
            stream_name: strip_query(cmd.first_string_arg().unwrap_or_default()),
            reset: cmd
                .arguments
                .get(3)
                .and_then(AmfValue::as_bool)
                .unwrap_or(true),
            stream_id: cmd.stream_id,
        }
    }
}

/// Stream names may carry a `?token=...` suffix; the key is the part before it
fn strip_query(name: &str) -> String {
    name.split('?').next().unwrap_or_default().to_string()
}
