use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error type for contract violations and loader failures.
///
/// Malformed metadata is never reported through this type: detection misses
/// and unparseable payloads degrade to an `Unknown` record instead.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Alpha buffer length is not `width * height`.
    #[error("alpha plane {width}x{height} does not match buffer of {len} values")]
    InvalidDimensions {
        /// Declared plane width.
        width: u32,
        /// Declared plane height.
        height: u32,
        /// Actual buffer length.
        len: usize,
    },
    /// File is neither a readable image nor a carrier of metadata.
    #[error("image '{path}' could not be decoded: {reason}")]
    Decode {
        /// File that failed to decode.
        path: PathBuf,
        /// Decoder message.
        reason: String,
    },
    /// The service was shut down or its worker exited.
    #[error("extraction service is shut down")]
    ServiceStopped,
    /// Underlying filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
