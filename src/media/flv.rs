//! Media frames and FLV muxing
//!
//! RTMP audio and video message bodies are FLV tag bodies, so the same
//! frame value is relayed to RTMP subscribers and, wrapped in an FLV tag
//! header, to HTTP-FLV subscribers.
//!
//! Video body:
//! ```text
//! +-----------+----------+----------------+
//! | FrameType | CodecID  | AVCPacketType  | ...
//! | (4 bits)  | (4 bits) | (8 bits)       |
//! +-----------+----------+----------------+
//! ```
//!
//! Audio body:
//! ```text
//! +-------------+--------------------+-----------------+
//! | SoundFormat | rate/size/channels | AACPacketType   | ...
//! | (4 bits)    | (4 bits)           | (8 bits)        |
//! +-------------+--------------------+-----------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

const FLV_TAG_AUDIO: u8 = 8;
const FLV_TAG_VIDEO: u8 = 9;
const FLV_TAG_SCRIPT: u8 = 18;
const FLV_TAG_HEADER_SIZE: usize = 11;

/// Enhanced RTMP sets the top bit of the first video byte
const VIDEO_EX_HEADER: u8 = 0x80;

/// Kind of relayed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Audio,
    Video,
    /// `onMetaData`, AMF0 encoded
    Metadata,
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x07 {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Legacy video codec ids that carry an AVC-style packet type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Avc = 7,
    Hevc = 12,
    Av1 = 13,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            13 => Some(VideoCodec::Av1),
            _ => None,
        }
    }
}

/// Audio sound format (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3 = 2,
    Aac = 10,
    Speex = 11,
    Other = 0xFF,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Self {
        match b >> 4 {
            2 => AudioFormat::Mp3,
            10 => AudioFormat::Aac,
            11 => AudioFormat::Speex,
            _ => AudioFormat::Other,
        }
    }
}

/// One relayed unit: an audio/video message body or stream metadata
///
/// Cloning is cheap; the payload is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub kind: FrameKind,
    /// Milliseconds, as carried in the RTMP message header
    pub timestamp: u32,
    pub data: Bytes,
}

impl MediaFrame {
    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            kind: FrameKind::Audio,
            timestamp,
            data,
        }
    }

    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            kind: FrameKind::Video,
            timestamp,
            data,
        }
    }

    pub fn metadata(data: Bytes) -> Self {
        Self {
            kind: FrameKind::Metadata,
            timestamp: 0,
            data,
        }
    }

    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        match (self.kind, self.data.first()) {
            (FrameKind::Video, Some(&b)) => VideoFrameType::from_byte(b),
            _ => None,
        }
    }

    /// Video frame that starts a new group of pictures
    pub fn is_keyframe(&self) -> bool {
        self.video_frame_type()
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false)
    }

    /// Decoder configuration (AVC/HEVC/AV1 sequence header, AAC config)
    pub fn is_sequence_header(&self) -> bool {
        let (Some(&first), Some(&second)) = (self.data.first(), self.data.get(1)) else {
            return false;
        };
        match self.kind {
            FrameKind::Video if first & VIDEO_EX_HEADER != 0 => {
                // Enhanced RTMP: packet type in the low nibble, 0 = SequenceStart
                first & 0x0F == 0
            }
            FrameKind::Video => VideoCodec::from_byte(first).is_some() && second == 0,
            FrameKind::Audio => AudioFormat::from_byte(first) == AudioFormat::Aac && second == 0,
            FrameKind::Metadata => false,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// 9-byte FLV file header followed by the zero PreviousTagSize
pub fn flv_header(has_audio: bool, has_video: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(b"FLV");
    buf.put_u8(1);
    let mut flags = 0u8;
    if has_audio {
        flags |= 0x04;
    }
    if has_video {
        flags |= 0x01;
    }
    buf.put_u8(flags);
    buf.put_u32(9);
    buf.put_u32(0);
    buf.freeze()
}

/// Wrap a frame in an FLV tag header and trailing PreviousTagSize
pub fn flv_tag(frame: &MediaFrame) -> Bytes {
    let tag_type = match frame.kind {
        FrameKind::Audio => FLV_TAG_AUDIO,
        FrameKind::Video => FLV_TAG_VIDEO,
        FrameKind::Metadata => FLV_TAG_SCRIPT,
    };
    let data_size = frame.data.len();

    let mut buf = BytesMut::with_capacity(FLV_TAG_HEADER_SIZE + data_size + 4);
    buf.put_u8(tag_type);
    buf.put_uint(data_size as u64, 3);
    buf.put_uint((frame.timestamp & 0x00FF_FFFF) as u64, 3);
    buf.put_u8((frame.timestamp >> 24) as u8);
    buf.put_uint(0, 3);
    buf.put_slice(&frame.data);
    buf.put_u32((FLV_TAG_HEADER_SIZE + data_size) as u32);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame_type() {
        assert_eq!(
            VideoFrameType::from_byte(0x17),
            Some(VideoFrameType::Keyframe)
        );
        assert_eq!(
            VideoFrameType::from_byte(0x27),
            Some(VideoFrameType::InterFrame)
        );
        assert_eq!(VideoFrameType::from_byte(0x07), None);
        assert!(VideoFrameType::GeneratedKeyframe.is_keyframe());
        assert!(!VideoFrameType::DisposableInterFrame.is_keyframe());
    }

    #[test]
    fn test_keyframe_detection() {
        let key = MediaFrame::video(0, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]));
        let inter = MediaFrame::video(33, Bytes::from_static(&[0x27, 0x01, 0, 0, 0]));
        let audio = MediaFrame::audio(0, Bytes::from_static(&[0x17, 0x01]));

        assert!(key.is_keyframe());
        assert!(!inter.is_keyframe());
        assert!(!audio.is_keyframe());
        assert!(!MediaFrame::video(0, Bytes::new()).is_keyframe());
    }

    #[test]
    fn test_avc_sequence_header() {
        let header = MediaFrame::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0]));
        assert!(header.is_sequence_header());
        assert!(header.is_keyframe());

        let nalu = MediaFrame::video(0, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]));
        assert!(!nalu.is_sequence_header());
    }

    #[test]
    fn test_enhanced_sequence_start() {
        // IsExHeader | keyframe, packet type SequenceStart, fourcc hvc1
        let header = MediaFrame::video(0, Bytes::from_static(&[0x90, b'h', b'v', b'c', b'1']));
        assert!(header.is_sequence_header());

        let coded = MediaFrame::video(0, Bytes::from_static(&[0x91, b'h', b'v', b'c', b'1']));
        assert!(!coded.is_sequence_header());
        assert!(coded.is_keyframe());
    }

    #[test]
    fn test_aac_sequence_header() {
        let header = MediaFrame::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(header.is_sequence_header());

        let raw = MediaFrame::audio(0, Bytes::from_static(&[0xAF, 0x01, 0x21, 0x00]));
        assert!(!raw.is_sequence_header());

        let mp3 = MediaFrame::audio(0, Bytes::from_static(&[0x2F, 0x00]));
        assert!(!mp3.is_sequence_header());
    }

    #[test]
    fn test_flv_header() {
        let header = flv_header(true, true);
        assert_eq!(&header[..], &[b'F', b'L', b'V', 1, 0x05, 0, 0, 0, 9, 0, 0, 0, 0]);
        assert_eq!(flv_header(false, true)[4], 0x01);
    }

    #[test]
    fn test_flv_tag_layout() {
        let frame = MediaFrame::video(0x0123_4567, Bytes::from_static(&[0x17, 0x01, 0xAA]));
        let tag = flv_tag(&frame);

        assert_eq!(tag.len(), 11 + 3 + 4);
        assert_eq!(tag[0], 9);
        assert_eq!(&tag[1..4], &[0, 0, 3]);
        assert_eq!(&tag[4..7], &[0x23, 0x45, 0x67]);
        assert_eq!(tag[7], 0x01);
        assert_eq!(&tag[8..11], &[0, 0, 0]);
        assert_eq!(&tag[11..14], &[0x17, 0x01, 0xAA]);
        assert_eq!(&tag[14..], &14u32.to_be_bytes());
    }

    #[test]
    fn test_metadata_tag_type() {
        let tag = flv_tag(&MediaFrame::metadata(Bytes::from_static(&[0x02])));
        assert_eq!(tag[0], 18);
    }
}
