//! AMF0 (Action Message Format) support
//!
//! Command (type 20) and data (type 18) messages are sequences of AMF0
//! values. AMF3-flavoured messages (types 15 and 17) carry an AMF0 body
//! behind a one-byte prefix, so AMF0 is all the relay needs.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfObject, AmfValue};
