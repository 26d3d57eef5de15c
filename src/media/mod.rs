//! Media handling for the relay
//!
//! - Frame classification (keyframes, sequence headers) and FLV muxing
//! - GOP caching for late joiners

pub mod flv;
pub mod gop;

pub use flv::{FrameKind, MediaFrame};
pub use gop::GopCache;
