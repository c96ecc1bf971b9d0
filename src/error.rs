//! Error types for wallet-discovery.

use crate::message::DecodeError;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// Only environment-level failures surface here. Protocol noise on the
/// medium (malformed announcements, foreign traffic, duplicate instance ids)
/// is filtered locally and never reaches the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No broadcast medium to publish on or subscribe to.
    #[error("broadcast medium unavailable")]
    MediumUnavailable,

    /// The announcer was handed a descriptor that would be rejected by every registry.
    #[error("invalid provider info: {0}")]
    InvalidInfo(#[from] DecodeError),
}

impl Error {
    /// Whether this error means discovery cannot happen at all.
    pub fn is_medium_unavailable(&self) -> bool {
        matches!(self, Self::MediumUnavailable)
    }
}
