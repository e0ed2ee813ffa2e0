//! Error types for persistore.
//!
//! All errors are strongly typed using thiserror. Codec failures carry the
//! durable key they occurred on so callers can tell which binding produced
//! malformed data.

use thiserror::Error;

use crate::engine::StorageError;

/// Codec failures raised while translating between application values and
/// their durable textual form.
///
/// Decode failures are never swallowed: they surface from hydration (the
/// `listen`/`subscribe` call that triggered it) and from external-change
/// dispatch (the notifier's caller). A codec must be total over the domain
/// the application actually writes, or the application must catch these
/// errors itself.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encoding a value to its durable text failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Decoding durable text back into a value failed.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Top-level error type for all persistore operations.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The durable storage engine reported a failure.
    #[error("storage engine error: {0}")]
    Storage(#[from] StorageError),

    /// A codec failed for a specific durable key.
    #[error("codec failure for key '{key}': {source}")]
    Codec {
        /// The durable key whose value could not be encoded or decoded.
        key: String,
        /// The underlying codec failure.
        #[source]
        source: CodecError,
    },
}

impl PersistError {
    pub(crate) fn codec(key: impl Into<String>, source: CodecError) -> Self {
        Self::Codec {
            key: key.into(),
            source,
        }
    }
}

/// Convenience result alias used throughout the crate.
pub type PersistResult<T> = Result<T, PersistError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_carries_key() {
        let err = PersistError::codec("settings:theme", CodecError::Decode("bad json".to_string()));
        let text = err.to_string();
        assert!(text.contains("settings:theme"));
        assert!(text.contains("decode failed"));
    }

    #[test]
    fn storage_error_converts() {
        let err: PersistError = StorageError::Backend("disk full".to_string()).into();
        assert!(err.to_string().contains("disk full"));
    }
}
