//! Error types for bend-core.
//!
//! # Propagation
//!
//! | Error | Where it surfaces |
//! |-------|-------------------|
//! | [`Error::NoDeviceSelected`] | `connect`, synchronously |
//! | [`Error::ConnectionFailed`] | `connect`, after retries are exhausted or the attempt is superseded |
//! | [`Error::CharacteristicNotFound`] | reads and writes, never retried |
//! | [`Error::NotificationStartFailed`] | logged by the session, which stays connected without live data |
//! | [`Error::ServiceUninitialized`] | reads and writes with no active link |
//! | [`Error::NotPaired`] | `disconnect` while disconnected |
//!
//! Link loss is not surfaced as an error. It is recovered through the
//! reconnection path, and only exhaustion is reported, asynchronously, as a
//! [`crate::SessionEvent::ReconnectFailed`].

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while talking to an ADS sensor.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The host has no Bluetooth adapter.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// Device selection returned nothing.
    #[error("No device selected")]
    NoDeviceSelected,

    /// Connection could not be established.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// The endpoint does not exist on the connected peripheral.
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound {
        /// Service that was searched.
        service: Uuid,
        /// Characteristic that was requested.
        characteristic: Uuid,
    },

    /// Value-change notifications could not be started.
    #[error("Failed to start notifications on {characteristic}: {reason}")]
    NotificationStartFailed {
        /// The characteristic UUID.
        characteristic: Uuid,
        /// Why the start failed.
        reason: String,
    },

    /// A characteristic operation was attempted with no active link.
    #[error("Service not initialized: no active connection")]
    ServiceUninitialized,

    /// Disconnect was requested with no active session.
    #[error("Bluetooth is not paired")]
    NotPaired,

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The requested sample rate is not one the firmware accepts.
    #[error("Unsupported sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),

    /// Data received from the device could not be used.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Every attempt in the retry budget failed.
    RetriesExhausted {
        /// Total attempts made, including the first.
        attempts: u32,
        /// Display form of the final error.
        last_error: String,
    },
    /// A newer connect or an explicit disconnect superseded the attempt.
    Cancelled,
    /// The transport could not open a link to the device.
    LinkUnavailable,
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempts: {last_error}"),
            Self::Cancelled => write!(f, "attempt cancelled"),
            Self::LinkUnavailable => write!(f, "link unavailable"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(service: Uuid, characteristic: Uuid) -> Self {
        Self::CharacteristicNotFound {
            service,
            characteristic,
        }
    }

    /// Create a notification start failure.
    pub fn notification_start_failed(characteristic: Uuid, reason: impl Into<String>) -> Self {
        Self::NotificationStartFailed {
            characteristic,
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// True for plain cancellation and for a connect that was superseded.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::ConnectionFailed {
                    reason: ConnectionFailureReason::Cancelled,
                    ..
                }
        )
    }
}

impl From<bend_types::ParseError> for Error {
    fn from(err: bend_types::ParseError) -> Self {
        match err {
            bend_types::ParseError::UnsupportedSampleRate(hz) => Error::UnsupportedSampleRate(hz),
            bend_types::ParseError::InvalidValue(msg) | bend_types::ParseError::InvalidData(msg) => {
                Error::InvalidData(msg)
            }
            // Handle future ParseError variants (non_exhaustive)
            _ => Error::InvalidData(err.to_string()),
        }
    }
}

/// Result type alias using bend-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
