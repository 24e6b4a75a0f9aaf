//! Device link capability consumed by the sync engine.
//!
//! A [`DeviceLink`] accepts requests and returns as soon as they are
//! submitted. Completion is reported later as a [`LinkEvent`] pushed into the
//! [`EventSink`] bound for the current run, from whatever task or thread the
//! platform uses for BLE callbacks.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{DeviceId, Operation},
};

/// Identity of one sync run; events carry it so stale ones can be dropped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run#{}", self.0)
    }
}

/// Asynchronous completion reported by a device link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A peripheral matching the scan request advertised
    DeviceDiscovered {
        /// Platform identifier
        id: DeviceId,
        /// Advertised local name
        name: Option<String>,
    },
    /// Connection established
    Connected,
    /// Connection attempt failed
    ConnectFailed {
        /// Platform error description
        reason: String,
    },
    /// Service discovery finished
    ServicesDiscovered {
        /// Services exposed by the peripheral
        services: Vec<Uuid>,
    },
    /// Characteristic discovery finished
    CharacteristicsDiscovered {
        /// Requested characteristics that were found
        characteristics: Vec<Uuid>,
    },
    /// Characteristic read completed
    ValueRead {
        /// Characteristic read
        characteristic: Uuid,
        /// Value returned by the peripheral
        value: Bytes,
    },
    /// Write with response confirmed by the peripheral
    WriteConfirmed {
        /// Characteristic written
        characteristic: Uuid,
    },
    /// Write rejected by the peripheral or the platform
    WriteFailed {
        /// Characteristic written
        characteristic: Uuid,
        /// Platform error description
        reason: String,
    },
    /// Notifications enabled
    Subscribed {
        /// Characteristic subscribed to
        characteristic: Uuid,
    },
    /// Notification or indication received
    ValueUpdated {
        /// Characteristic that changed
        characteristic: Uuid,
        /// Notified value
        value: Bytes,
    },
    /// Connection lost
    Disconnected {
        /// Platform error description, if any
        reason: Option<String>,
    },
    /// Any other operation failure
    Error {
        /// Operation that failed
        operation: Operation,
        /// Platform error description
        reason: String,
    },
}

/// Event tagged with the run that bound the sink it came through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEvent {
    /// Run the event belongs to
    pub run: RunId,
    /// Reported completion
    pub event: LinkEvent,
}

/// Per-run handle a link uses to report completions
#[derive(Debug, Clone)]
pub struct EventSink {
    run: RunId,
    sender: mpsc::UnboundedSender<RunEvent>,
}

impl EventSink {
    /// Create a sink tagging events with `run`
    #[must_use]
    pub const fn new(run: RunId, sender: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { run, sender }
    }

    /// Run this sink belongs to
    #[must_use]
    pub const fn run(&self) -> RunId {
        self.run
    }

    /// Report an event; returns `false` once the engine is gone
    pub fn emit(&self, event: LinkEvent) -> bool {
        trace!(run = %self.run, ?event, "link event");
        self.sender
            .send(RunEvent {
                run: self.run,
                event,
            })
            .is_ok()
    }
}

/// Scan parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    /// Service the tracker advertises
    pub service: Uuid,
}

/// BLE capability of the host platform
///
/// Every request method only submits work: it returns `Err` when the request
/// cannot be issued at all, and otherwise reports completion through the
/// bound [`EventSink`].
#[async_trait]
pub trait DeviceLink: Send {
    /// Bind the sink used for all subsequent events, replacing any previous one
    fn bind(&mut self, sink: EventSink);

    /// Start scanning; emits [`LinkEvent::DeviceDiscovered`] for each match
    async fn start_scan(&mut self, request: &ScanRequest) -> Result<()>;

    /// Stop scanning
    async fn stop_scan(&mut self) -> Result<()>;

    /// Connect; emits [`LinkEvent::Connected`] or [`LinkEvent::ConnectFailed`]
    async fn connect(&mut self, device: &DeviceId) -> Result<()>;

    /// Discover services; emits [`LinkEvent::ServicesDiscovered`]
    async fn discover_services(&mut self, service: Uuid) -> Result<()>;

    /// Discover characteristics; emits [`LinkEvent::CharacteristicsDiscovered`]
    async fn discover_characteristics(&mut self, characteristics: &[Uuid]) -> Result<()>;

    /// Read a characteristic; emits [`LinkEvent::ValueRead`]
    async fn read(&mut self, characteristic: Uuid) -> Result<()>;

    /// Write a characteristic; emits [`LinkEvent::WriteConfirmed`] or
    /// [`LinkEvent::WriteFailed`]
    async fn write(&mut self, characteristic: Uuid, data: Bytes, with_response: bool)
        -> Result<()>;

    /// Subscribe to notifications; emits [`LinkEvent::Subscribed`] then
    /// [`LinkEvent::ValueUpdated`] per notification
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<()>;

    /// Tear down the connection and any pending operations
    async fn disconnect(&mut self) -> Result<()>;
}

/// Link request issued by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    /// See [`DeviceLink::start_scan`]
    StartScan(ScanRequest),
    /// See [`DeviceLink::stop_scan`]
    StopScan,
    /// See [`DeviceLink::connect`]
    Connect(DeviceId),
    /// See [`DeviceLink::discover_services`]
    DiscoverServices(Uuid),
    /// See [`DeviceLink::discover_characteristics`]
    DiscoverCharacteristics(Vec<Uuid>),
    /// See [`DeviceLink::read`]
    Read(Uuid),
    /// See [`DeviceLink::write`]
    Write {
        /// Target characteristic
        characteristic: Uuid,
        /// Payload
        data: Bytes,
        /// Ask the peripheral to confirm the write
        with_response: bool,
    },
    /// See [`DeviceLink::subscribe`]
    Subscribe(Uuid),
    /// See [`DeviceLink::disconnect`]
    Disconnect,
}

impl LinkRequest {
    /// Operation this request performs
    #[must_use]
    pub const fn operation(&self) -> Operation {
        match self {
            Self::StartScan(_) | Self::StopScan => Operation::Scan,
            Self::Connect(_) => Operation::Connect,
            Self::DiscoverServices(_) => Operation::DiscoverServices,
            Self::DiscoverCharacteristics(_) => Operation::DiscoverCharacteristics,
            Self::Read(_) => Operation::Read,
            Self::Write { .. } => Operation::Write,
            Self::Subscribe(_) => Operation::Subscribe,
            Self::Disconnect => Operation::Disconnect,
        }
    }

    /// Submit this request to a link
    ///
    /// # Errors
    ///
    /// Propagates the link's submission error.
    pub async fn apply<L: DeviceLink + ?Sized>(self, link: &mut L) -> Result<()> {
        match self {
            Self::StartScan(request) => link.start_scan(&request).await,
            Self::StopScan => link.stop_scan().await,
            Self::Connect(device) => link.connect(&device).await,
            Self::DiscoverServices(service) => link.discover_services(service).await,
            Self::DiscoverCharacteristics(ids) => link.discover_characteristics(&ids).await,
            Self::Read(characteristic) => link.read(characteristic).await,
            Self::Write {
                characteristic,
                data,
                with_response,
            } => link.write(characteristic, data, with_response).await,
            Self::Subscribe(characteristic) => link.subscribe(characteristic).await,
            Self::Disconnect => link.disconnect().await,
        }
    }
}
