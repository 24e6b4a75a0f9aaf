use thiserror::Error;
use uuid::Uuid;

/// Errors raised while decoding frames received from the tracker
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload does not have the length required by the frame type
    #[error("Invalid frame length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required length in bytes
        expected: usize,
        /// Received length in bytes
        actual: usize,
    },

    /// Session record ends before it starts
    #[error("Invalid session interval: stop {stop} is before start {start}")]
    InvalidInterval {
        /// Decoded start (epoch seconds)
        start: u32,
        /// Decoded stop (epoch seconds)
        stop: u32,
    },
}

/// Errors that can occur when talking to a tracker or a session store
#[derive(Error, Debug)]
pub enum SyncError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this host
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// The requested device was never discovered by this link
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation requires an active connection
    #[error("Not connected to a device")]
    NotConnected,

    /// Link has no event sink bound for the current run
    #[error("Device link is not bound to a sync run")]
    NotBound,

    /// Characteristic is not exposed by the connected device
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// Session store rejected or failed a commit
    #[error("Session store error: {0}")]
    Store(String),

    /// Sync run was cancelled before it produced a result
    #[error("Sync run cancelled")]
    Cancelled,
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::NoAdapter | Self::DeviceNotFound(_) | Self::NotConnected
        )
    }

    /// Check if retrying the same operation may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
