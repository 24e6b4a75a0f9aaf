#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Treadsync 🏃‍♂️
//!
//! Session sync for BLE treadmill step trackers.
//!
//! A small tracker clipped to the treadmill records walking sessions while the
//! phone is away. This library pairs with the tracker over Bluetooth Low
//! Energy, synchronizes its clock, drains the queue of recorded sessions and
//! hands them to a durable store without losing or duplicating any of them.
//!
//! ## Protocol
//!
//! The tracker exposes one GATT service with four characteristics:
//!
//! - **Session data** (notify): one 12-byte big-endian record per session
//!   (`start`, `stop`, `steps`), or the single byte `0xFF` once the queue is empty
//! - **Ack** (write): the phone writes `0x01` after each record; the tracker
//!   only dequeues a record once it sees the acknowledgement
//! - **Device time** (read): the tracker's clock as a 4-byte epoch
//! - **Phone time** (write): the phone's clock as a 4-byte epoch
//!
//! A record whose acknowledgement is lost is sent again on the next sync, so
//! stores deduplicate on `(start, stop)`.
//!
//! ## Architecture
//!
//! - [`machine::SyncSession`] is a pure state machine: link events in,
//!   [`machine::Command`]s out
//! - [`SyncEngine`] drives it from one task with an event queue, a timer and
//!   a cancellation signal, and publishes [`SyncStatus`] snapshots
//! - [`DeviceLink`] abstracts the platform BLE stack; [`BtleplugLink`] binds
//!   it to btleplug and [`SimulatedTreadmill`] scripts it for tests
//! - [`SessionStore`] is the persistence seam; [`MemorySessionStore`] keeps
//!   sessions in memory
//!
//! ## Quick Start
//!
//! ```no_run
//! use treadsync::{BtleplugLink, MemorySessionStore, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind the first Bluetooth adapter
//!     let link = BtleplugLink::new().await?;
//!     let store = MemorySessionStore::new();
//!     let engine = SyncEngine::new(link, store.clone(), SyncConfig::default());
//!
//!     // Scan, handshake, drain and commit
//!     let report = engine.sync().await?;
//!     println!("{}", report.message);
//!
//!     for session in store.sessions().await {
//!         println!("{}", session.summary());
//!     }
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy platform binding
pub mod ble;
/// Sync engine driver
pub mod engine;
/// Error types and handling
pub mod error;
/// Device link capability
pub mod link;
/// Sync run state machine
pub mod machine;
/// Wire codec for tracker frames
pub mod protocol;
/// Simulated tracker for tests and demos
pub mod sim;
/// Session store contract and retrying commit
pub mod store;
/// Type definitions and data structures
pub mod types;

use uuid::Uuid;

// Re-export the main types for convenient usage
pub use ble::BtleplugLink;
pub use engine::{RunHandle, SyncEngine, SyncReport};
pub use error::{DecodeError, Result, SyncError};
pub use link::{DeviceLink, EventSink, LinkEvent, RunId};
pub use sim::SimulatedTreadmill;
pub use store::{CommitReport, MemorySessionStore, RecordOutcome, SessionStore};
pub use types::{
    ClockDrift, FailureReason, GattProfile, Session, SyncConfig, SyncOutcome, SyncState,
    SyncStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tracker GATT service UUID
///
/// Advertised by the tracker and used as the scan filter.
pub const TRACKER_SERVICE_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def0);

/// Session data characteristic UUID (notify)
pub const SESSION_DATA_CHAR_UUID: Uuid =
    Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def1);

/// Acknowledgement characteristic UUID (write)
pub const ACK_CHAR_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def2);

/// Device time characteristic UUID (read)
pub const DEVICE_TIME_CHAR_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def3);

/// Phone time characteristic UUID (write)
pub const PHONE_TIME_CHAR_UUID: Uuid = Uuid::from_u128(0x1234_5678_1234_5678_1234_5678_9abc_def4);
