//! RTMP server: listener, per-connection driver and configuration

pub mod config;
pub mod connection;
pub mod listener;

pub use config::{HttpConfig, ServerConfig, Settings};
pub use connection::Connection;
pub use listener::RtmpServer;
