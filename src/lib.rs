//! RTMP ingest and relay server
//!
//! Publishers push live audio/video over RTMP; any number of subscribers
//! receive it over RTMP or HTTP-FLV. A late joiner first gets the stream's
//! metadata, codec headers and the current GOP, then live frames.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtmp_relay::{RtmpServer, ServerConfig, ServerStats, StreamRegistry};
//!
//! #[tokio::main]
//! async fn main() -> rtmp_relay::Result<()> {
//!     let config = ServerConfig::default();
//!     let registry = Arc::new(StreamRegistry::with_config(config.registry_config()));
//!     let stats = Arc::new(ServerStats::new());
//!
//!     let server = RtmpServer::bind(config, registry, stats).await?;
//!     server.run().await
//! }
//! ```

pub mod amf;
pub mod error;
pub mod http;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
pub use http::HttpServer;
pub use registry::{StreamKey, StreamRegistry};
pub use server::{HttpConfig, RtmpServer, ServerConfig, Settings};
pub use stats::ServerStats;
