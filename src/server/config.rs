//! Server configuration
//!
//! [`Settings`] is the file/environment surface (`rtmp.*`, `http.*`);
//! [`ServerConfig`] and [`HttpConfig`] are the resolved runtime forms.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::constants::*;
use crate::registry::RegistryConfig;

/// Settings as loaded from defaults, an optional file and the environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rtmp: RtmpSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpSettings {
    pub host: String,
    pub port: u16,
    pub chunk_size: u32,
    pub gop_cache: bool,
    /// Seconds between pings
    pub ping: u64,
    /// Seconds to wait for a ping response
    pub ping_timeout: u64,
    pub max_message_size: u32,
    pub subscriber_queue: usize,
    pub gop_max_bytes: Option<usize>,
    pub gop_max_frames: Option<usize>,
    /// Seconds allowed for the handshake
    pub handshake_timeout: u64,
}

impl Default for RtmpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1935,
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            gop_cache: true,
            ping: 30,
            ping_timeout: 60,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            subscriber_queue: 1024,
            gop_max_bytes: None,
            gop_max_frames: None,
            handshake_timeout: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    /// `*` for any origin, otherwise one exact origin
    pub allow_origin: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allow_origin: "*".to_string(),
        }
    }
}

impl Settings {
    /// Load settings. Later sources win:
    /// 1. Defaults
    /// 2. Config file, if given (format from its extension)
    /// 3. Environment variables (`RELAY__RTMP__PORT=1936`, ...)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn server_config(&self) -> Result<ServerConfig> {
        let rtmp = &self.rtmp;
        Ok(ServerConfig::default()
            .bind(socket_addr(&rtmp.host, rtmp.port)?)
            .chunk_size(rtmp.chunk_size)
            .gop_cache(rtmp.gop_cache)
            .gop_max_bytes(rtmp.gop_max_bytes)
            .gop_max_frames(rtmp.gop_max_frames)
            .ping(
                Duration::from_secs(rtmp.ping),
                Duration::from_secs(rtmp.ping_timeout),
            )
            .max_message_size(rtmp.max_message_size)
            .subscriber_queue(rtmp.subscriber_queue)
            .handshake_timeout(Duration::from_secs(rtmp.handshake_timeout)))
    }

    pub fn http_config(&self) -> Result<HttpConfig> {
        Ok(HttpConfig {
            bind_addr: socket_addr(&self.http.host, self.http.port)?,
            allow_origin: self.http.allow_origin.clone(),
        })
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| Error::Config(format!("invalid host address: {host}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// RTMP listener and session configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Chunk size announced to every peer
    pub chunk_size: u32,

    pub window_ack_size: u32,
    pub peer_bandwidth: u32,

    /// Handshake must complete within this time
    pub handshake_timeout: Duration,

    pub ping_interval: Duration,
    pub ping_timeout: Duration,

    /// Largest reassembled message accepted from a peer
    pub max_message_size: u32,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Application-level read buffer size
    pub read_buffer_size: usize,

    pub gop_cache: bool,
    pub gop_max_bytes: Option<usize>,
    pub gop_max_frames: Option<usize>,
    pub subscriber_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1935)),
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            peer_bandwidth: DEFAULT_PEER_BANDWIDTH,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(60),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tcp_nodelay: true,
            read_buffer_size: 64 * 1024,
            gop_cache: true,
            gop_max_bytes: None,
            gop_max_frames: None,
            subscriber_queue: 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set chunk size, clamped to the protocol range
    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

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

    /// Set the ping interval and how long an unanswered ping is tolerated
    pub fn ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size.max(1);
        self
    }

    pub fn subscriber_queue(mut self, capacity: usize) -> Self {
        self.subscriber_queue = capacity.max(1);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Per-stream settings for the registry
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .gop_cache(self.gop_cache)
            .gop_max_bytes(self.gop_max_bytes)
            .gop_max_frames(self.gop_max_frames)
            .subscriber_queue(self.subscriber_queue)
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_addr: SocketAddr,
    pub allow_origin: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            allow_origin: "*".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.rtmp.port, 1935);
        assert_eq!(settings.rtmp.chunk_size, 60_000);
        assert!(settings.rtmp.gop_cache);
        assert_eq!(settings.rtmp.ping, 30);
        assert_eq!(settings.rtmp.ping_timeout, 60);
        assert_eq!(settings.http.port, 8080);
        assert_eq!(settings.http.allow_origin, "*");
    }

    #[test]
    fn test_settings_to_runtime_config() {
        let settings = Settings::default();
        let config = settings.server_config().unwrap();

        assert_eq!(config.bind_addr.port(), 1935);
        assert_eq!(config.chunk_size, RECOMMENDED_CHUNK_SIZE);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.ping_timeout, Duration::from_secs(60));
        assert!(config.gop_cache);

        let http = settings.http_config().unwrap();
        assert_eq!(http.bind_addr.port(), 8080);
    }

    #[test]
    fn test_invalid_host_rejected() {
        let mut settings = Settings::default();
        settings.rtmp.host = "not an address".to_string();
        assert!(matches!(settings.server_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("rtmp-relay-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("relay.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[rtmp]\nport = 1940\ngop_cache = false\nping = 5\n\n[http]\nallow_origin = \"https://example.com\""
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.rtmp.port, 1940);
        assert!(!settings.rtmp.gop_cache);
        assert_eq!(settings.rtmp.ping, 5);
        // Untouched keys keep their defaults
        assert_eq!(settings.rtmp.chunk_size, 60_000);
        assert_eq!(settings.http.allow_origin, "https://example.com");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/relay.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_chunk_size_clamped() {
        assert_eq!(ServerConfig::default().chunk_size(u32::MAX).chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(ServerConfig::default().chunk_size(0).chunk_size, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:1935".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .chunk_size(4096)
            .gop_cache(false)
            .ping(Duration::from_secs(1), Duration::from_secs(2))
            .subscriber_queue(0);

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.chunk_size, 4096);
        assert!(!config.gop_cache);
        assert_eq!(config.ping_timeout, Duration::from_secs(2));
        assert_eq!(config.subscriber_queue, 1);
        assert!(!config.registry_config().gop_cache);
    }
}
