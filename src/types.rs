use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

use crate::{
    link::RunId, ACK_CHAR_UUID, DEVICE_TIME_CHAR_UUID, PHONE_TIME_CHAR_UUID,
    SESSION_DATA_CHAR_UUID, TRACKER_SERVICE_UUID,
};

/// One recorded walking interval
///
/// Sessions are decoded from the 12-byte records the tracker emits and are
/// never mutated afterwards. `(start, stop)` identifies a session for
/// deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    /// Start of the walk (epoch seconds)
    pub start: u32,
    /// End of the walk (epoch seconds)
    pub stop: u32,
    /// Steps counted during the walk
    pub steps: u32,
}

impl Session {
    /// Create a new session
    #[must_use]
    pub const fn new(start: u32, stop: u32, steps: u32) -> Self {
        Self { start, stop, steps }
    }

    /// Deduplication key
    #[must_use]
    pub const fn key(&self) -> (u32, u32) {
        (self.start, self.stop)
    }

    /// Length of the walk in seconds
    #[must_use]
    pub const fn duration_secs(&self) -> u32 {
        self.stop.saturating_sub(self.start)
    }

    /// Human readable one-line summary, e.g. `01/15/2025 9:30:00, 25 min for 3100 steps`
    #[must_use]
    pub fn summary(&self) -> String {
        let started = DateTime::from_timestamp(i64::from(self.start), 0).map_or_else(
            || self.start.to_string(),
            |date| date.format("%m/%d/%Y %-H:%M:%S").to_string(),
        );
        format!(
            "{started}, {} for {} steps",
            humanize_duration(self.duration_secs()),
            self.steps
        )
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Format a duration as `45 sec`, `12 min`, `2h` or `1h 5min`
#[must_use]
pub fn humanize_duration(seconds: u32) -> String {
    if seconds < 60 {
        return format!("{seconds} sec");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes} min");
    }
    let hours = minutes / 60;
    let remaining = minutes % 60;
    if remaining == 0 {
        format!("{hours}h")
    } else {
        format!("{hours}h {remaining}min")
    }
}

/// Source of the phone's current epoch time
pub trait Clock: Send + Sync {
    /// Current time in epoch seconds
    fn now_epoch(&self) -> u32;
}

/// Clock backed by [`SystemTime`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| {
                u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX)
            })
    }
}

/// Clock frozen at a fixed epoch, for simulations and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedClock(pub u32);

impl Clock for FixedClock {
    fn now_epoch(&self) -> u32 {
        self.0
    }
}

/// Difference between the tracker's clock and the phone's clock at handshake time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockDrift {
    /// `device_epoch - phone_epoch` in seconds
    pub offset_secs: i64,
    /// Offset exceeded the configured warning threshold
    pub warning: bool,
}

impl ClockDrift {
    /// Measure drift between the two clocks against a warning threshold
    #[must_use]
    pub fn measure(device_epoch: u32, phone_epoch: u32, threshold_secs: u32) -> Self {
        let offset_secs = i64::from(device_epoch) - i64::from(phone_epoch);
        Self {
            offset_secs,
            warning: offset_secs.unsigned_abs() > u64::from(threshold_secs),
        }
    }
}

/// Platform identifier of a discovered device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// GATT layout the tracker firmware exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattProfile {
    /// Service advertised by the tracker
    pub service: Uuid,
    /// Indicate/notify characteristic carrying session records
    pub session_data: Uuid,
    /// Write characteristic receiving record acknowledgements
    pub ack: Uuid,
    /// Read characteristic exposing the tracker's clock
    pub device_time: Uuid,
    /// Write characteristic receiving the phone's clock
    pub phone_time: Uuid,
}

impl GattProfile {
    /// Characteristics a run cannot proceed without
    #[must_use]
    pub fn required_characteristics(&self) -> Vec<Uuid> {
        vec![
            self.session_data,
            self.ack,
            self.device_time,
            self.phone_time,
        ]
    }
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: TRACKER_SERVICE_UUID,
            session_data: SESSION_DATA_CHAR_UUID,
            ack: ACK_CHAR_UUID,
            device_time: DEVICE_TIME_CHAR_UUID,
            phone_time: PHONE_TIME_CHAR_UUID,
        }
    }
}

/// Sync run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Discovery window in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection attempt timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Timeout for service discovery, reads and handshake writes in milliseconds
    pub operation_timeout_ms: u64,
    /// Maximum silence between frames while draining, in milliseconds
    pub stream_inactivity_timeout_ms: u64,
    /// Clock drift above this many seconds raises a warning
    pub drift_warning_threshold_secs: u32,
    /// Attempts made to persist a batch before giving up
    pub commit_retry_attempts: u32,
    /// Delay between commit attempts in milliseconds
    pub commit_retry_delay_ms: u64,
    /// GATT layout of the tracker
    pub gatt: GattProfile,
}

impl SyncConfig {
    /// Discovery window
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Connection attempt timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-operation timeout
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Stream inactivity timeout
    #[must_use]
    pub const fn stream_inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_inactivity_timeout_ms)
    }

    /// Delay between commit attempts
    #[must_use]
    pub const fn commit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.commit_retry_delay_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 5_000,
            stream_inactivity_timeout_ms: 30_000,
            drift_warning_threshold_secs: 300,
            commit_retry_attempts: 3,
            commit_retry_delay_ms: 500,
            gatt: GattProfile::default(),
        }
    }
}

/// Device link operation, used to attribute failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Scanning for advertisements
    Scan,
    /// Connecting to a peripheral
    Connect,
    /// Discovering services
    DiscoverServices,
    /// Discovering characteristics
    DiscoverCharacteristics,
    /// Reading a characteristic
    Read,
    /// Writing a characteristic
    Write,
    /// Subscribing to notifications
    Subscribe,
    /// Tearing down the connection
    Disconnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan => write!(f, "scan"),
            Self::Connect => write!(f, "connect"),
            Self::DiscoverServices => write!(f, "service discovery"),
            Self::DiscoverCharacteristics => write!(f, "characteristic discovery"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Subscribe => write!(f, "subscribe"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// Why a sync run ended early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// No tracker advertised within the discovery window
    NoDeviceFound,
    /// Connection attempt failed or timed out
    ConnectFailed(String),
    /// Connected peripheral does not expose the tracker service
    ServiceMissing,
    /// Required characteristics are missing
    CharacteristicMissing(Vec<Uuid>),
    /// No frame arrived within the inactivity timeout
    StreamStalled,
    /// Device disconnected before the stream completed
    Disconnected,
    /// A write was rejected or never confirmed
    WriteFailed(String),
    /// Session store could not accept the batch
    StoreCommitFailed(String),
    /// Bluetooth is off, missing or unauthorized
    BluetoothUnavailable(String),
    /// A link operation reported an error
    OperationFailed {
        /// Operation that failed
        operation: Operation,
        /// Platform error description
        reason: String,
    },
    /// A link operation did not complete in time
    OperationTimedOut(Operation),
    /// Run was superseded or cancelled by the caller
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDeviceFound => write!(f, "No treadmill found"),
            Self::ConnectFailed(reason) => write!(f, "Failed to connect: {reason}"),
            Self::ServiceMissing => write!(f, "Treadmill service not found"),
            Self::CharacteristicMissing(missing) => {
                let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
                write!(f, "Missing characteristics: {}", names.join(", "))
            }
            Self::StreamStalled => write!(f, "Treadmill stopped sending sessions"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::WriteFailed(reason) => write!(f, "Write failed: {reason}"),
            Self::StoreCommitFailed(reason) => write!(f, "Saving sessions failed: {reason}"),
            Self::BluetoothUnavailable(reason) => write!(f, "Bluetooth not ready: {reason}"),
            Self::OperationFailed { operation, reason } => {
                write!(f, "Error during {operation}: {reason}")
            }
            Self::OperationTimedOut(operation) => write!(f, "Timed out during {operation}"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Sub-step of the time-sync handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStep {
    /// Reading the tracker's clock
    ReadingDeviceTime,
    /// Writing the phone's clock to the tracker
    WritingPhoneTime,
}

/// State of a sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// No activity; also the terminal state of a successful run
    Idle,
    /// Waiting for a tracker advertisement
    Scanning,
    /// Connecting to the discovered tracker
    Connecting,
    /// Looking for the tracker service
    DiscoveringServices,
    /// Looking for the required characteristics
    DiscoveringCharacteristics,
    /// Exchanging clocks with the tracker
    TimeHandshake(HandshakeStep),
    /// Waiting for the next frame
    AwaitingRecord,
    /// Waiting for the acknowledgement write to be confirmed
    Acknowledging,
    /// Completion marker received
    DrainingComplete,
    /// Handing sessions to the store
    Committing,
    /// Run ended early
    Failed(FailureReason),
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "Discovering characteristics"),
            Self::TimeHandshake(HandshakeStep::ReadingDeviceTime) => {
                write!(f, "Reading device time")
            }
            Self::TimeHandshake(HandshakeStep::WritingPhoneTime) => {
                write!(f, "Writing phone time")
            }
            Self::AwaitingRecord => write!(f, "Awaiting record"),
            Self::Acknowledging => write!(f, "Acknowledging"),
            Self::DrainingComplete => write!(f, "Draining complete"),
            Self::Committing => write!(f, "Committing"),
            Self::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

/// Aggregate result of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    /// Stream completed and every session was persisted or already present
    Synced,
    /// Stream completed but some sessions could not be persisted
    PartiallyStored,
    /// Run failed after collecting at least one session
    PartialSync(FailureReason),
    /// Run failed before collecting any session
    NoData(FailureReason),
}

/// Immutable snapshot of a run, published on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Run this snapshot belongs to
    pub run: RunId,
    /// Current state
    pub state: SyncState,
    /// Name of the tracker, once discovered
    pub device_name: Option<String>,
    /// Sessions collected so far
    pub sessions_received: usize,
    /// Clock drift measured during the handshake
    pub drift: Option<ClockDrift>,
    /// Sessions persisted by the store (new or already present)
    pub sessions_saved: Option<usize>,
    /// Final outcome, once the run has finished
    pub outcome: Option<SyncOutcome>,
    /// Human readable status line
    pub message: String,
}

impl SyncStatus {
    /// Status of an engine that has not run yet
    #[must_use]
    pub fn idle() -> Self {
        Self {
            run: RunId::default(),
            state: SyncState::Idle,
            device_name: None,
            sessions_received: 0,
            drift: None,
            sessions_saved: None,
            outcome: None,
            message: "Idle".to_string(),
        }
    }

    /// Whether the snapshot carries a clock drift warning
    #[must_use]
    pub fn has_drift_warning(&self) -> bool {
        self.drift.is_some_and(|drift| drift.warning)
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_humanize_duration() {
        assert_eq!(humanize_duration(0), "0 sec");
        assert_eq!(humanize_duration(59), "59 sec");
        assert_eq!(humanize_duration(60), "1 min");
        assert_eq!(humanize_duration(3599), "59 min");
        assert_eq!(humanize_duration(7200), "2h");
        assert_eq!(humanize_duration(3900), "1h 5min");
    }

    #[test]
    fn test_session_summary() {
        // 2025-01-15 09:30:00 UTC
        let session = Session::new(1_736_933_400, 1_736_933_400 + 25 * 60, 3100);
        assert_eq!(session.duration_secs(), 1500);
        assert_eq!(session.summary(), "01/15/2025 9:30:00, 25 min for 3100 steps");
        assert_eq!(session.to_string(), session.summary());
    }

    #[test]
    fn test_clock_drift_threshold() {
        let far = ClockDrift::measure(1_700_001_000, 1_700_000_000, 300);
        assert_eq!(far.offset_secs, 1000);
        assert!(far.warning);

        let near = ClockDrift::measure(1_699_999_990, 1_700_000_000, 300);
        assert_eq!(near.offset_secs, -10);
        assert!(!near.warning);

        let behind = ClockDrift::measure(1_000, 2_000, 300);
        assert_eq!(behind.offset_secs, -1000);
        assert!(behind.warning);
    }

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();

        assert_eq!(config.scan_timeout_ms, 10_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.stream_inactivity_timeout_ms, 30_000);
        assert_eq!(config.drift_warning_threshold_secs, 300);
        assert_eq!(config.commit_retry_attempts, 3);
        assert_eq!(config.scan_timeout(), Duration::from_secs(10));
        assert_eq!(config.gatt.required_characteristics().len(), 4);
    }

    #[test]
    fn test_failure_reason_display() {
        let reason = FailureReason::OperationFailed {
            operation: Operation::Read,
            reason: "gatt error".to_string(),
        };
        assert_eq!(reason.to_string(), "Error during read: gatt error");
        assert_eq!(FailureReason::NoDeviceFound.to_string(), "No treadmill found");
    }
}
