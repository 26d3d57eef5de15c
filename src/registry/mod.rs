//! Stream registry and relay dispatch
//!
//! The registry maps stream keys to per-stream tasks. Each task owns its
//! stream's publisher, subscriber queues and GOP cache, and fans published
//! frames out with `try_send` so one slow subscriber never stalls the rest.
//!
//! # Architecture
//!
//! ```text
//!                     Arc<StreamRegistry>
//!              ┌──────────────────────────────┐
//!              │ RwLock<HashMap<StreamKey,    │
//!              │   mpsc::Sender<StreamCommand>│
//!              │ >>                           │
//!              └──────────────┬───────────────┘
//!                             │ lookup / create / remove only
//!                             ▼
//!   [Publisher] ──Publish──► [StreamTask] ──try_send──► [Subscription] ──► TCP / HTTP-FLV
//!                             │  GopCache  ──try_send──► [Subscription] ──► TCP / HTTP-FLV
//! ```
//!
//! `bytes::Bytes` is reference counted, so every subscriber shares the
//! publisher's payload allocation.

pub mod config;
pub mod error;
pub mod frame;
pub mod store;
pub mod stream;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use frame::{RelayEvent, StreamKey};
pub use store::StreamRegistry;
pub use stream::{StreamHandle, StreamStats, Subscription};
