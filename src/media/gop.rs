//! GOP (Group of Pictures) cache for late-joiner support
//!
//! A subscriber that joins mid-stream needs, in order:
//! 1. The stream metadata (`onMetaData`)
//! 2. The codec sequence headers (AVC/HEVC config, AAC AudioSpecificConfig)
//! 3. The most recent keyframe and every frame since
//!
//! Metadata and sequence headers are kept separately from the frame window
//! so they are available even when GOP caching is disabled.

use super::flv::{FrameKind, MediaFrame};

/// Per-stream GOP cache
#[derive(Debug)]
pub struct GopCache {
    enabled: bool,
    max_bytes: Option<usize>,
    max_frames: Option<usize>,
    /// Frames since the last keyframe; empty or starts with a keyframe
    frames: Vec<MediaFrame>,
    size: usize,
    /// A cap was hit; nothing more is appended until the next keyframe
    sealed: bool,
    metadata: Option<MediaFrame>,
    video_header: Option<MediaFrame>,
    audio_header: Option<MediaFrame>,
}

impl GopCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            max_bytes: None,
            max_frames: None,
            frames: Vec::new(),
            size: 0,
            sealed: false,
            metadata: None,
            video_header: None,
            audio_header: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: Option<usize>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_max_frames(mut self, max_frames: Option<usize>) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Feed one frame published on the stream
    pub fn on_message(&mut self, frame: &MediaFrame) {
        if frame.kind == FrameKind::Metadata {
            self.metadata = Some(frame.clone());
            return;
        }
        if frame.is_sequence_header() {
            match frame.kind {
                FrameKind::Video => self.video_header = Some(frame.clone()),
                _ => self.audio_header = Some(frame.clone()),
            }
            return;
        }
        if !self.enabled {
            return;
        }

        if frame.is_keyframe() {
            self.clear_frames();
            if self.fits(frame) {
                self.push(frame);
            }
            return;
        }

        // Dependent frame with no open window
        if self.frames.is_empty() || self.sealed {
            return;
        }
        if self.fits(frame) {
            self.push(frame);
        } else {
            self.sealed = true;
        }
    }

    fn fits(&self, frame: &MediaFrame) -> bool {
        let bytes_ok = self
            .max_bytes
            .map_or(true, |max| self.size + frame.size() <= max);
        let frames_ok = self
            .max_frames
            .map_or(true, |max| self.frames.len() < max);
        bytes_ok && frames_ok
    }

    fn push(&mut self, frame: &MediaFrame) {
        self.size += frame.size();
        self.frames.push(frame.clone());
    }

    fn clear_frames(&mut self) {
        self.frames.clear();
        self.size = 0;
        self.sealed = false;
    }

    /// Current window, oldest first; empty when disabled or no keyframe seen
    pub fn snapshot(&self) -> Vec<MediaFrame> {
        self.frames.clone()
    }

    /// Everything a late joiner needs before live frames
    pub fn catchup(&self) -> Vec<MediaFrame> {
        let mut out = Vec::with_capacity(self.frames.len() + 3);
        out.extend(self.metadata.iter().cloned());
        out.extend(self.video_header.iter().cloned());
        out.extend(self.audio_header.iter().cloned());
        out.extend(self.frames.iter().cloned());
        out
    }

    /// Drop the window and all cached headers
    pub fn clear(&mut self) {
        self.clear_frames();
        self.metadata = None;
        self.video_header = None;
        self.audio_header = None;
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn has_video_header(&self) -> bool {
        self.video_header.is_some()
    }

    pub fn has_audio_header(&self) -> bool {
        self.audio_header.is_some()
    }
}
