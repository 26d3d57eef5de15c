//! Stream identity and the events relayed to subscribers

use serde::Serialize;

use crate::media::MediaFrame;

/// Unique identifier for a stream (app + stream name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StreamKey {
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name (e.g., "alpha")
    pub name: String,
}

impl StreamKey {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}

/// What a subscriber queue carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Frame(MediaFrame),
    /// The publisher left; nothing follows
    EndOfStream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_display() {
        assert_eq!(StreamKey::new("live", "alpha").to_string(), "live/alpha");
    }
}
