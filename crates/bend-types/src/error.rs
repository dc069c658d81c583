//! Error types for data parsing in bend-types.

use thiserror::Error;

/// Errors that can occur when decoding or validating sensor data.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in bend-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The buffer is shorter than the fixed layout requires.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Number of bytes the layout needs.
        expected: usize,
        /// Number of bytes actually received.
        actual: usize,
    },

    /// A sample rate outside the supported set was requested.
    #[error("Unsupported sample rate: {0} Hz (supported: 1, 10, 20, 50, 100, 200, 333, 500)")]
    UnsupportedSampleRate(u32),

    /// A value was decoded but is not usable.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Generic malformed input.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using bend-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
