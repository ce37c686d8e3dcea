//! Error types for the lace wire protocol.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Failures while decoding data received from the wire.
///
/// Every variant describes malformed input. Callers drop the offending
/// datagram or frame; none of these are fatal to a node.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope was not valid JSON or did not match the message schema.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// The clock field was not valid base64.
    #[error("malformed clock encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The datagram was shorter than the integrity prefix.
    #[error("datagram too short ({len} bytes)")]
    Truncated {
        /// Length of the datagram actually received.
        len: usize,
    },

    /// The integrity prefix did not match the payload.
    #[error("checksum mismatch")]
    Checksum,

    /// A fragment header was inconsistent (zero count, index out of range,
    /// or a count that disagrees with earlier pieces of the same group).
    #[error("invalid fragment header: {0}")]
    Fragment(&'static str),
}

impl ProtocolError {
    /// Get a static label for log fields.
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Base64(_) => "base64",
            Self::Truncated { .. } => "truncated",
            Self::Checksum => "checksum",
            Self::Fragment(_) => "fragment",
        }
    }
}
