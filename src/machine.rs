//! Sync run state machine.
//!
//! [`SyncSession`] holds no I/O: every input (link events, timer expiry,
//! commit results, cancellation) goes through one method that performs the
//! transition and returns the [`Command`]s the driver must execute. The
//! driver feeds inputs strictly one at a time, in arrival order.

use bytes::Bytes;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::SyncError,
    link::{LinkEvent, LinkRequest, RunId, ScanRequest},
    protocol::{decode_device_time, encode_ack, encode_time, Control, Frame},
    store::CommitReport,
    types::{
        ClockDrift, Clock, DeviceId, FailureReason, HandshakeStep, Operation, Session,
        SyncConfig, SyncOutcome, SyncState, SyncStatus,
    },
};

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Submit a request to the device link
    Link(LinkRequest),
    /// (Re)arm the run's single timer
    StartTimer(Duration),
    /// Disarm the timer
    CancelTimer,
    /// Hand the collected sessions to the store
    Commit(Vec<Session>),
}

/// State machine for one sync attempt
pub struct SyncSession {
    run: RunId,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    state: SyncState,
    device: Option<DeviceId>,
    device_name: Option<String>,
    sessions: Vec<Session>,
    deferred: VecDeque<Bytes>,
    drift: Option<ClockDrift>,
    failure: Option<FailureReason>,
    link_open: bool,
    awaiting_commit: bool,
    commit: Option<CommitReport>,
    commit_error: Option<String>,
    outcome: Option<SyncOutcome>,
}

impl SyncSession {
    /// Create the state machine for a new run
    #[must_use]
    pub fn new(run: RunId, config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            run,
            config,
            clock,
            state: SyncState::Idle,
            device: None,
            device_name: None,
            sessions: Vec::new(),
            deferred: VecDeque::new(),
            drift: None,
            failure: None,
            link_open: false,
            awaiting_commit: false,
            commit: None,
            commit_error: None,
            outcome: None,
        }
    }

    /// Run identity
    #[must_use]
    pub const fn run(&self) -> RunId {
        self.run
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> &SyncState {
        &self.state
    }

    /// Sessions collected so far, in emission order
    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Drift measured during the handshake
    #[must_use]
    pub const fn drift(&self) -> Option<ClockDrift> {
        self.drift
    }

    /// Store report, once the commit finished
    #[must_use]
    pub const fn commit_report(&self) -> Option<&CommitReport> {
        self.commit.as_ref()
    }

    /// Final outcome, once the run finished
    #[must_use]
    pub const fn outcome(&self) -> Option<&SyncOutcome> {
        self.outcome.as_ref()
    }

    /// Whether the run reached a terminal state
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Begin the run by scanning for the tracker
    pub fn start(&mut self) -> Vec<Command> {
        if self.state != SyncState::Idle || self.is_finished() {
            warn!(run = %self.run, state = %self.state, "Run already started");
            return Vec::new();
        }

        info!(run = %self.run, "Scanning for treadmill");
        self.state = SyncState::Scanning;
        vec![
            Command::Link(LinkRequest::StartScan(ScanRequest {
                service: self.config.gatt.service,
            })),
            Command::StartTimer(self.config.scan_timeout()),
        ]
    }

    /// Process one event from the device link
    pub fn handle(&mut self, event: LinkEvent) -> Vec<Command> {
        if self.is_finished()
            || matches!(
                self.state,
                SyncState::Idle
                    | SyncState::DrainingComplete
                    | SyncState::Committing
                    | SyncState::Failed(_)
            )
        {
            debug!(run = %self.run, state = %self.state, ?event, "Ignoring event outside active phase");
            return Vec::new();
        }

        match event {
            LinkEvent::DeviceDiscovered { id, name } => self.on_device_discovered(id, name),
            LinkEvent::Connected => self.on_connected(),
            LinkEvent::ConnectFailed { reason } if self.state == SyncState::Connecting => {
                self.fail(FailureReason::ConnectFailed(reason))
            }
            LinkEvent::ServicesDiscovered { services } => self.on_services_discovered(&services),
            LinkEvent::CharacteristicsDiscovered { characteristics } => {
                self.on_characteristics_discovered(&characteristics)
            }
            LinkEvent::ValueRead {
                characteristic,
                value,
            } => self.on_value_read(characteristic, &value),
            LinkEvent::WriteConfirmed { characteristic } => self.on_write_confirmed(characteristic),
            LinkEvent::WriteFailed {
                characteristic,
                reason,
            } => self.on_write_failed(characteristic, reason),
            LinkEvent::Subscribed { characteristic } => {
                debug!(run = %self.run, %characteristic, "Notifications enabled");
                Vec::new()
            }
            LinkEvent::ValueUpdated {
                characteristic,
                value,
            } if characteristic == self.config.gatt.session_data => self.on_frame(value),
            LinkEvent::Disconnected { reason } if self.state == SyncState::Connecting => {
                self.link_open = false;
                self.fail(FailureReason::ConnectFailed(
                    reason.unwrap_or_else(|| "disconnected while connecting".to_string()),
                ))
            }
            LinkEvent::Disconnected { reason } => {
                warn!(run = %self.run, ?reason, "Treadmill disconnected");
                self.link_open = false;
                self.fail(FailureReason::Disconnected)
            }
            LinkEvent::Error { operation, reason } => self.on_link_error(operation, reason),
            other => {
                debug!(run = %self.run, state = %self.state, event = ?other, "Unexpected event");
                Vec::new()
            }
        }
    }

    /// Process expiry of the timer armed by the last [`Command::StartTimer`]
    pub fn on_timeout(&mut self) -> Vec<Command> {
        let reason = match &self.state {
            SyncState::Scanning => FailureReason::NoDeviceFound,
            SyncState::Connecting => FailureReason::ConnectFailed("connection timed out".to_string()),
            SyncState::DiscoveringServices => {
                FailureReason::OperationTimedOut(Operation::DiscoverServices)
            }
            SyncState::DiscoveringCharacteristics => {
                FailureReason::OperationTimedOut(Operation::DiscoverCharacteristics)
            }
            SyncState::TimeHandshake(HandshakeStep::ReadingDeviceTime) => {
                FailureReason::OperationTimedOut(Operation::Read)
            }
            SyncState::TimeHandshake(HandshakeStep::WritingPhoneTime) => {
                FailureReason::OperationTimedOut(Operation::Write)
            }
            SyncState::AwaitingRecord => FailureReason::StreamStalled,
            SyncState::Acknowledging => {
                FailureReason::WriteFailed("acknowledgement not confirmed".to_string())
            }
            _ => {
                debug!(run = %self.run, state = %self.state, "Timer expired outside a waiting state");
                return Vec::new();
            }
        };
        self.fail(reason)
    }

    /// Process a link request that never returned within its time limit
    ///
    /// A stuck teardown is abandoned without failing the run, so sessions
    /// already collected still reach the store.
    pub fn on_link_timeout(&mut self, operation: Operation) -> Vec<Command> {
        if self.is_finished() || matches!(self.state, SyncState::Failed(_)) {
            debug!(run = %self.run, %operation, "Link request timed out after the run ended");
            self.link_open = false;
            return Vec::new();
        }

        match operation {
            Operation::Scan if self.state == SyncState::Scanning => self.fail(
                FailureReason::BluetoothUnavailable("scan did not start".to_string()),
            ),
            Operation::Scan | Operation::Disconnect => {
                warn!(run = %self.run, %operation, "Abandoning stuck link request");
                if operation == Operation::Disconnect {
                    self.link_open = false;
                }
                Vec::new()
            }
            Operation::Connect => {
                self.fail(FailureReason::ConnectFailed("connection timed out".to_string()))
            }
            _ => self.fail(FailureReason::OperationTimedOut(operation)),
        }
    }

    /// Mark the start of the store commit issued by [`Command::Commit`]
    pub fn enter_committing(&mut self) {
        if self.awaiting_commit {
            self.state = SyncState::Committing;
        }
    }

    /// Record the store's answer and finish the run
    pub fn on_commit(&mut self, result: Result<CommitReport, SyncError>) -> Vec<Command> {
        if !self.awaiting_commit {
            return Vec::new();
        }
        self.awaiting_commit = false;

        match (self.failure.clone(), result) {
            (None, Ok(report)) => {
                let outcome = if report.is_complete() {
                    SyncOutcome::Synced
                } else {
                    SyncOutcome::PartiallyStored
                };
                info!(
                    run = %self.run,
                    stored = report.stored,
                    duplicates = report.duplicates,
                    failed = report.failed.len(),
                    "Sync finished"
                );
                self.commit = Some(report);
                self.state = SyncState::Idle;
                self.outcome = Some(outcome);
            }
            (None, Err(e)) => {
                let reason = FailureReason::StoreCommitFailed(e.to_string());
                warn!(run = %self.run, %reason, "Sessions received but not saved");
                self.commit_error = Some(e.to_string());
                self.failure = Some(reason.clone());
                self.state = SyncState::Failed(reason.clone());
                self.outcome = Some(SyncOutcome::PartialSync(reason));
            }
            (Some(reason), result) => {
                match result {
                    Ok(report) => {
                        info!(run = %self.run, saved = report.saved(), "Partial sync saved");
                        self.commit = Some(report);
                    }
                    Err(e) => {
                        warn!(run = %self.run, "Partial sync not saved: {e}");
                        self.commit_error = Some(e.to_string());
                    }
                }
                self.state = SyncState::Failed(reason.clone());
                self.outcome = Some(SyncOutcome::PartialSync(reason));
            }
        }
        Vec::new()
    }

    /// Abandon the run without committing
    pub fn cancel(&mut self) -> Vec<Command> {
        if self.is_finished() {
            return Vec::new();
        }
        self.sessions.clear();
        self.fail(FailureReason::Cancelled)
    }

    /// Snapshot of the run for observers
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            run: self.run,
            state: self.state.clone(),
            device_name: self.device_name.clone(),
            sessions_received: self.sessions.len(),
            drift: self.drift,
            sessions_saved: self.commit.as_ref().map(CommitReport::saved),
            outcome: self.outcome.clone(),
            message: self.message(),
        }
    }

    fn on_device_discovered(&mut self, id: DeviceId, name: Option<String>) -> Vec<Command> {
        if self.state != SyncState::Scanning {
            debug!(run = %self.run, %id, "Ignoring discovery after scan");
            return Vec::new();
        }

        info!(run = %self.run, %id, ?name, "Discovered treadmill");
        self.state = SyncState::Connecting;
        self.device = Some(id.clone());
        self.device_name = name;
        self.link_open = true;
        vec![
            Command::Link(LinkRequest::StopScan),
            Command::Link(LinkRequest::Connect(id)),
            Command::StartTimer(self.config.connect_timeout()),
        ]
    }

    fn on_connected(&mut self) -> Vec<Command> {
        if self.state != SyncState::Connecting {
            return self.unexpected("connected");
        }

        info!(run = %self.run, device = ?self.device, "Connected");
        self.state = SyncState::DiscoveringServices;
        vec![
            Command::Link(LinkRequest::DiscoverServices(self.config.gatt.service)),
            Command::StartTimer(self.config.operation_timeout()),
        ]
    }

    fn on_services_discovered(&mut self, services: &[Uuid]) -> Vec<Command> {
        if self.state != SyncState::DiscoveringServices {
            return self.unexpected("services discovered");
        }
        if !services.contains(&self.config.gatt.service) {
            return self.fail(FailureReason::ServiceMissing);
        }

        debug!(run = %self.run, "Treadmill service found");
        self.state = SyncState::DiscoveringCharacteristics;
        vec![
            Command::Link(LinkRequest::DiscoverCharacteristics(
                self.config.gatt.required_characteristics(),
            )),
            Command::StartTimer(self.config.operation_timeout()),
        ]
    }

    fn on_characteristics_discovered(&mut self, found: &[Uuid]) -> Vec<Command> {
        if self.state != SyncState::DiscoveringCharacteristics {
            return self.unexpected("characteristics discovered");
        }

        let missing: Vec<Uuid> = self
            .config
            .gatt
            .required_characteristics()
            .into_iter()
            .filter(|uuid| !found.contains(uuid))
            .collect();
        if !missing.is_empty() {
            return self.fail(FailureReason::CharacteristicMissing(missing));
        }

        debug!(run = %self.run, "Reading device time");
        self.state = SyncState::TimeHandshake(HandshakeStep::ReadingDeviceTime);
        vec![
            Command::Link(LinkRequest::Read(self.config.gatt.device_time)),
            Command::StartTimer(self.config.operation_timeout()),
        ]
    }

    fn on_value_read(&mut self, characteristic: Uuid, value: &[u8]) -> Vec<Command> {
        if self.state != SyncState::TimeHandshake(HandshakeStep::ReadingDeviceTime)
            || characteristic != self.config.gatt.device_time
        {
            return self.unexpected("value read");
        }

        let phone_epoch = self.clock.now_epoch();
        match decode_device_time(value) {
            Ok(device_epoch) => {
                let drift = ClockDrift::measure(
                    device_epoch,
                    phone_epoch,
                    self.config.drift_warning_threshold_secs,
                );
                if drift.warning {
                    warn!(run = %self.run, offset_secs = drift.offset_secs, "Treadmill clock drift above threshold");
                } else {
                    debug!(run = %self.run, offset_secs = drift.offset_secs, "Treadmill clock drift");
                }
                self.drift = Some(drift);
            }
            Err(e) => warn!(run = %self.run, "Unreadable device time: {e}"),
        }

        self.state = SyncState::TimeHandshake(HandshakeStep::WritingPhoneTime);
        vec![
            Command::Link(LinkRequest::Write {
                characteristic: self.config.gatt.phone_time,
                data: encode_time(phone_epoch),
                with_response: true,
            }),
            Command::StartTimer(self.config.operation_timeout()),
        ]
    }

    fn on_write_confirmed(&mut self, characteristic: Uuid) -> Vec<Command> {
        let gatt = &self.config.gatt;
        match self.state {
            SyncState::TimeHandshake(HandshakeStep::WritingPhoneTime)
                if characteristic == gatt.phone_time =>
            {
                info!(run = %self.run, "Clock synchronized, fetching sessions");
                self.state = SyncState::AwaitingRecord;
                vec![
                    Command::Link(LinkRequest::Subscribe(gatt.session_data)),
                    Command::StartTimer(self.config.stream_inactivity_timeout()),
                ]
            }
            SyncState::Acknowledging if characteristic == gatt.ack => {
                debug!(run = %self.run, acknowledged = self.sessions.len(), "Acknowledgement confirmed");
                self.state = SyncState::AwaitingRecord;
                let mut commands = vec![Command::StartTimer(
                    self.config.stream_inactivity_timeout(),
                )];
                while self.state == SyncState::AwaitingRecord {
                    let Some(frame) = self.deferred.pop_front() else {
                        break;
                    };
                    commands.extend(self.on_frame(frame));
                }
                commands
            }
            _ => self.unexpected("write confirmed"),
        }
    }

    fn on_write_failed(&mut self, characteristic: Uuid, reason: String) -> Vec<Command> {
        let gatt = &self.config.gatt;
        let expected = match self.state {
            SyncState::TimeHandshake(HandshakeStep::WritingPhoneTime) => gatt.phone_time,
            SyncState::Acknowledging => gatt.ack,
            _ => return self.unexpected("write failed"),
        };
        if characteristic != expected {
            return self.unexpected("write failed");
        }
        self.fail(FailureReason::WriteFailed(reason))
    }

    fn on_frame(&mut self, value: Bytes) -> Vec<Command> {
        match self.state {
            SyncState::Acknowledging => {
                debug!(run = %self.run, len = value.len(), "Frame before acknowledgement confirmed, deferring");
                self.deferred.push_back(value);
                return Vec::new();
            }
            SyncState::AwaitingRecord => {}
            _ => return self.unexpected("frame"),
        }

        let inactivity = Command::StartTimer(self.config.stream_inactivity_timeout());
        match Frame::parse(&value) {
            Ok(Frame::Session(session)) => {
                self.sessions.push(session);
                info!(
                    run = %self.run,
                    start = session.start,
                    stop = session.stop,
                    steps = session.steps,
                    received = self.sessions.len(),
                    "Session received"
                );
                self.state = SyncState::Acknowledging;
                vec![
                    Command::Link(LinkRequest::Write {
                        characteristic: self.config.gatt.ack,
                        data: encode_ack(),
                        with_response: true,
                    }),
                    Command::StartTimer(self.config.operation_timeout()),
                ]
            }
            Ok(Frame::Control(Control::StreamComplete)) => self.on_stream_complete(),
            Ok(Frame::Control(Control::Unrecognized(byte))) => {
                warn!(run = %self.run, "Ignoring unrecognized control frame 0x{byte:02X}");
                vec![inactivity]
            }
            Err(e) => {
                warn!(run = %self.run, frame = ?value, "Ignoring malformed frame: {e}");
                vec![inactivity]
            }
        }
    }

    fn on_stream_complete(&mut self) -> Vec<Command> {
        info!(run = %self.run, sessions = self.sessions.len(), "Stream complete");
        self.state = SyncState::DrainingComplete;
        self.link_open = false;

        let mut commands = vec![Command::CancelTimer, Command::Link(LinkRequest::Disconnect)];
        if self.sessions.is_empty() {
            self.state = SyncState::Idle;
            self.outcome = Some(SyncOutcome::Synced);
        } else {
            self.awaiting_commit = true;
            commands.push(Command::Commit(self.sessions.clone()));
        }
        commands
    }

    fn on_link_error(&mut self, operation: Operation, reason: String) -> Vec<Command> {
        match operation {
            Operation::Scan if self.state == SyncState::Scanning => {
                self.fail(FailureReason::BluetoothUnavailable(reason))
            }
            Operation::Scan | Operation::Disconnect => {
                debug!(run = %self.run, %operation, %reason, "Ignoring link error");
                Vec::new()
            }
            Operation::Connect => self.fail(FailureReason::ConnectFailed(reason)),
            Operation::Write => self.fail(FailureReason::WriteFailed(reason)),
            _ => self.fail(FailureReason::OperationFailed { operation, reason }),
        }
    }

    fn unexpected(&self, what: &str) -> Vec<Command> {
        debug!(run = %self.run, state = %self.state, "Ignoring unexpected {what}");
        Vec::new()
    }

    fn fail(&mut self, reason: FailureReason) -> Vec<Command> {
        warn!(
            run = %self.run,
            state = %self.state,
            sessions = self.sessions.len(),
            %reason,
            "Sync run failed"
        );

        let mut commands = vec![Command::CancelTimer];
        if self.state == SyncState::Scanning {
            commands.push(Command::Link(LinkRequest::StopScan));
        }
        if self.link_open {
            self.link_open = false;
            commands.push(Command::Link(LinkRequest::Disconnect));
        }

        self.deferred.clear();
        self.failure = Some(reason.clone());
        self.state = SyncState::Failed(reason.clone());

        if self.sessions.is_empty() {
            self.outcome = Some(SyncOutcome::NoData(reason));
        } else {
            self.awaiting_commit = true;
            commands.push(Command::Commit(self.sessions.clone()));
        }
        commands
    }

    fn message(&self) -> String {
        let name = self.device_name.as_deref().unwrap_or("Treadmill");
        let received = self.sessions.len();

        let message = match &self.state {
            SyncState::Idle => match (&self.outcome, &self.commit) {
                (Some(SyncOutcome::Synced), _) if received == 0 => {
                    format!("No new sessions on {name}")
                }
                (Some(SyncOutcome::Synced), _) => format!("Synced {received} sessions"),
                (Some(SyncOutcome::PartiallyStored), Some(report)) => format!(
                    "Saved {} of {received} sessions; {} could not be saved",
                    report.saved(),
                    report.failed.len()
                ),
                _ => "Idle".to_string(),
            },
            SyncState::Scanning => "Scanning for Treadmill...".to_string(),
            SyncState::Connecting => format!("Connecting to {name}..."),
            SyncState::DiscoveringServices | SyncState::DiscoveringCharacteristics => {
                format!("Connected to {name}")
            }
            SyncState::TimeHandshake(_) => "Synchronizing treadmill clock...".to_string(),
            SyncState::AwaitingRecord if received == 0 => "Fetching sessions...".to_string(),
            SyncState::AwaitingRecord => format!("Fetching sessions... ({received} received)"),
            SyncState::Acknowledging => "Session acknowledged, waiting for next...".to_string(),
            SyncState::DrainingComplete => format!("All {received} sessions received"),
            SyncState::Committing => format!("Saving {received} sessions..."),
            SyncState::Failed(reason) => match (&self.outcome, &self.commit) {
                (Some(SyncOutcome::NoData(_)), _) => format!("No data synced: {reason}"),
                (_, Some(report)) => format!(
                    "Partial sync: {} of {received} sessions saved ({reason})",
                    report.saved()
                ),
                (_, None) => match &self.commit_error {
                    Some(error) => format!("Partial sync: {received} sessions not saved ({error})"),
                    None => format!("Partial sync: {received} sessions received ({reason})"),
                },
            },
        };

        match self.drift {
            Some(drift) if drift.warning => format!(
                "{message} (treadmill clock off by {}s)",
                drift.offset_secs
            ),
            _ => message,
        }
    }
}
