//! Registry error types

use super::frame::StreamKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Stream already has a publisher; the existing registration is untouched
    #[error("stream already publishing: {0}")]
    AlreadyPublishing(StreamKey),

    /// The stream task went away before answering
    #[error("stream task closed: {0}")]
    StreamClosed(StreamKey),
}

impl From<RegistryError> for crate::error::Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyPublishing(key) => crate::error::Error::AlreadyPublishing(key),
            RegistryError::StreamClosed(_) => crate::error::Error::ConnectionClosed,
        }
    }
}
