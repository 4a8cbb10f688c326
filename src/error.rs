//! Error types for dipa-link

use std::time::Duration;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// dipa-link error types
///
/// Grouped by when they occur:
/// - Usage errors are rejected before any I/O and never retried
/// - Transport errors surface to the caller and may trigger the
///   reconnection controller
/// - Protocol/codec errors are fatal to the single operation
/// - Timeout errors fire after fixed retry budgets are exhausted
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // === Usage errors ===
    /// Requested timeout is below the minimum for the operation kind
    #[error("Invalid timeout: {0:?} is below the minimum for this operation")]
    InvalidTimeout(Duration),

    /// Requested scan window is below the minimum
    #[error("Invalid scan period: {0:?}")]
    InvalidScanPeriod(Duration),

    /// A selection call is already in flight
    #[error("Selection already in progress")]
    SelectingInProgress,

    /// A connect call is already in flight
    #[error("Connection already in progress")]
    ConnectingInProgress,

    // === Transport errors ===
    /// No device matched the selection criteria before the timeout
    #[error("Selection failed: {0}")]
    SelectionFailed(String),

    /// Physical channel could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The device dropped the connection
    #[error("Device disconnected")]
    DeviceDisconnected,

    /// Low-level write was rejected after exhausting retries
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Reliable multi-packet send failed
    #[error("Deliver failed: {0}")]
    DeliverFailed(String),

    /// Best-effort single-attempt send failed
    #[error("Transmit failed: {0}")]
    TransmitFailed(String),

    /// Request/response exchange failed
    #[error("Request failed: {0}")]
    RequestFailed(String),

    // === Protocol / codec errors ===
    /// Codec cursor operation out of the buffer's bounds
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Frame CRC did not match
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected CRC32 value
        expected: u32,
        /// Actual CRC32 value
        actual: u32,
    },

    /// Response carried a different opcode than the request
    #[error("Invalid response flag: expected {expected:#04x}, got {actual:#04x}")]
    InvalidResponseFlag {
        /// Opcode the request was sent with
        expected: u8,
        /// Opcode found in the response
        actual: u8,
    },

    /// Response correlation id did not match the request
    #[error("Response correlation mismatch: expected id {expected}, got {actual}")]
    InvalidResponseUuid {
        /// Request id that was sent
        expected: u32,
        /// Request id echoed back
        actual: u32,
    },

    /// Node reported a non-zero error code in a response frame
    #[error("Node error: {0:#04x}")]
    NodeError(u8),

    // === Timeout errors ===
    /// Connect did not complete within the timeout
    #[error("Connect timeout")]
    ConnectTimeout,

    /// No acknowledgement or reply arrived within the budget
    #[error("Response timeout")]
    ResponseTimeout,

    /// Clock register read failed after all retries
    #[error("Clock read failed after retries")]
    ClockReadFailed,

    /// Clock register write failed after all retries
    #[error("Clock write failed after retries")]
    ClockWriteFailed,

    // === Lifecycle ===
    /// A newer queued command of the same kind replaced this one
    #[error("Command superseded by a newer command of the same kind")]
    Superseded,

    /// Operation requires a connector but none is attached
    #[error("No connector attached")]
    NoConnectorAttached,

    /// Scheduler worker has shut down
    #[error("Scheduler is shut down")]
    ShutDown,

    // === Wrappers ===
    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}

// Outcome channels carry errors by value; a merged Execute batch resolves
// every member with the same failure, so errors must be cloneable. The
// non-cloneable wrapped sources degrade to their message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::InvalidTimeout(d) => Error::InvalidTimeout(*d),
            Error::InvalidScanPeriod(d) => Error::InvalidScanPeriod(*d),
            Error::SelectingInProgress => Error::SelectingInProgress,
            Error::ConnectingInProgress => Error::ConnectingInProgress,
            Error::SelectionFailed(s) => Error::SelectionFailed(s.clone()),
            Error::ConnectionFailed(s) => Error::ConnectionFailed(s.clone()),
            Error::DeviceDisconnected => Error::DeviceDisconnected,
            Error::WriteFailed(s) => Error::WriteFailed(s.clone()),
            Error::DeliverFailed(s) => Error::DeliverFailed(s.clone()),
            Error::TransmitFailed(s) => Error::TransmitFailed(s.clone()),
            Error::RequestFailed(s) => Error::RequestFailed(s.clone()),
            Error::OutOfRange(s) => Error::OutOfRange(s.clone()),
            Error::ChecksumMismatch { expected, actual } => Error::ChecksumMismatch {
                expected: *expected,
                actual: *actual,
            },
            Error::InvalidResponseFlag { expected, actual } => Error::InvalidResponseFlag {
                expected: *expected,
                actual: *actual,
            },
            Error::InvalidResponseUuid { expected, actual } => Error::InvalidResponseUuid {
                expected: *expected,
                actual: *actual,
            },
            Error::NodeError(c) => Error::NodeError(*c),
            Error::ConnectTimeout => Error::ConnectTimeout,
            Error::ResponseTimeout => Error::ResponseTimeout,
            Error::ClockReadFailed => Error::ClockReadFailed,
            Error::ClockWriteFailed => Error::ClockWriteFailed,
            Error::Superseded => Error::Superseded,
            Error::NoConnectorAttached => Error::NoConnectorAttached,
            Error::ShutDown => Error::ShutDown,
            Error::Serial(e) => Error::Other(format!("Serial port error: {}", e)),
            Error::Io(e) => Error::Other(format!("I/O error: {}", e)),
            Error::Config(s) => Error::Config(s.clone()),
            Error::Other(s) => Error::Other(s.clone()),
        }
    }
}
