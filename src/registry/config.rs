//! Registry configuration

/// Per-stream settings applied when a stream task is created
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Keep the most recent GOP for late joiners
    pub gop_cache: bool,
    pub gop_max_bytes: Option<usize>,
    pub gop_max_frames: Option<usize>,
    /// Live frames a subscriber may fall behind before it is dropped
    pub subscriber_queue: usize,
    /// Commands buffered towards a stream task
    pub command_queue: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            gop_cache: true,
            gop_max_bytes: None,
            gop_max_frames: None,
            subscriber_queue: 1024,
            command_queue: 256,
        }
    }
}

impl RegistryConfig {
    pub fn gop_cache(mut self, enabled: bool) -> Self {
        self.gop_cache = enabled;
        self
    }

    pub fn gop_max_bytes(mut self, max: Option<usize>) -> Self {
        self.gop_max_bytes = max;
        self
    }

    pub fn gop_max_frames(mut self, max: Option<usize>) -> Self {
        self.gop_max_frames = max;
        self
    }

    pub fn subscriber_queue(mut self, capacity: usize) -> Self {
        self.subscriber_queue = capacity.max(1);
        self
    }
}
