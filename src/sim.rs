//! Scripted tracker implementing [`DeviceLink`] without any radio.
//!
//! The simulator answers every request immediately through the bound sink
//! and plays back a script of notifications. After subscription, and after
//! each acknowledgement it confirms, it emits script steps until it has sent
//! something that waits for an answer: a valid session record, the
//! completion marker, a disconnect, or a stall.

use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{Result, SyncError},
    link::{DeviceLink, EventSink, LinkEvent, ScanRequest},
    protocol::{decode_session, encode_session, STREAM_COMPLETE},
    types::{DeviceId, GattProfile, Operation, Session},
};

/// One scripted notification behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimStep {
    /// Send a session record and wait for its acknowledgement
    Record(Session),
    /// Send raw bytes on the session-data characteristic
    Frame(Bytes),
    /// Send the completion marker
    Complete,
    /// Drop the connection
    Disconnect,
    /// Go silent
    Stall,
}

/// Write observed by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimWrite {
    /// Target characteristic
    pub characteristic: Uuid,
    /// Written payload
    pub data: Bytes,
}

/// Simulated tracker
#[derive(Debug)]
pub struct SimulatedTreadmill {
    gatt: GattProfile,
    id: DeviceId,
    name: Option<String>,
    advertising: bool,
    refuse_connection: bool,
    characteristics: Vec<Uuid>,
    device_time: u32,
    fail_ack_writes: bool,
    hang_on_disconnect: bool,
    script: VecDeque<SimStep>,
    sink: Option<EventSink>,
    connected: bool,
    writes: Arc<Mutex<Vec<SimWrite>>>,
}

impl SimulatedTreadmill {
    /// Advertising tracker exposing the full GATT profile and an empty script
    #[must_use]
    pub fn new(gatt: GattProfile, device_time: u32) -> Self {
        let characteristics = gatt.required_characteristics();
        Self {
            gatt,
            id: DeviceId::from("SIM:00:00:00:00:01"),
            name: Some("TreadSpan".to_string()),
            advertising: true,
            refuse_connection: false,
            characteristics,
            device_time,
            fail_ack_writes: false,
            hang_on_disconnect: false,
            script: VecDeque::new(),
            sink: None,
            connected: false,
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue session records, each waiting for an acknowledgement
    #[must_use]
    pub fn with_records<I: IntoIterator<Item = Session>>(mut self, sessions: I) -> Self {
        self.script
            .extend(sessions.into_iter().map(SimStep::Record));
        self
    }

    /// Queue one script step
    #[must_use]
    pub fn then(mut self, step: SimStep) -> Self {
        self.script.push_back(step);
        self
    }

    /// Queue the completion marker
    #[must_use]
    pub fn then_complete(self) -> Self {
        self.then(SimStep::Complete)
    }

    /// Stop advertising so scans never find the tracker
    #[must_use]
    pub const fn hidden(mut self) -> Self {
        self.advertising = false;
        self
    }

    /// Reject connection attempts
    #[must_use]
    pub const fn refusing_connections(mut self) -> Self {
        self.refuse_connection = true;
        self
    }

    /// Expose only the given characteristics
    #[must_use]
    pub fn with_characteristics(mut self, characteristics: Vec<Uuid>) -> Self {
        self.characteristics = characteristics;
        self
    }

    /// Reject every acknowledgement write
    #[must_use]
    pub const fn failing_acks(mut self) -> Self {
        self.fail_ack_writes = true;
        self
    }

    /// Never return from a disconnect request
    #[must_use]
    pub const fn hanging_disconnect(mut self) -> Self {
        self.hang_on_disconnect = true;
        self
    }

    /// Shared log of every write the simulator received
    #[must_use]
    pub fn write_log(&self) -> Arc<Mutex<Vec<SimWrite>>> {
        Arc::clone(&self.writes)
    }

    fn emit(&self, event: LinkEvent) -> Result<()> {
        let sink = self.sink.as_ref().ok_or(SyncError::NotBound)?;
        sink.emit(event);
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    /// Emit script steps until one waits for the phone
    fn pump(&mut self) -> Result<()> {
        while let Some(step) = self.script.pop_front() {
            debug!(?step, "Simulator step");
            match step {
                SimStep::Record(session) => {
                    return self.notify(encode_session(&session));
                }
                SimStep::Frame(data) => {
                    let awaits_ack = decode_session(&data).is_ok();
                    self.notify(data)?;
                    if awaits_ack {
                        return Ok(());
                    }
                }
                SimStep::Complete => {
                    return self.notify(Bytes::from_static(&[STREAM_COMPLETE]));
                }
                SimStep::Disconnect => {
                    self.connected = false;
                    return self.emit(LinkEvent::Disconnected {
                        reason: Some("simulated link loss".to_string()),
                    });
                }
                SimStep::Stall => return Ok(()),
            }
        }
        Ok(())
    }

    fn notify(&self, value: Bytes) -> Result<()> {
        self.emit(LinkEvent::ValueUpdated {
            characteristic: self.gatt.session_data,
            value,
        })
    }
}

#[async_trait]
impl DeviceLink for SimulatedTreadmill {
    fn bind(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    async fn start_scan(&mut self, request: &ScanRequest) -> Result<()> {
        if self.advertising && request.service == self.gatt.service {
            self.emit(LinkEvent::DeviceDiscovered {
                id: self.id.clone(),
                name: self.name.clone(),
            })?;
        }
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        Ok(())
    }

    async fn connect(&mut self, device: &DeviceId) -> Result<()> {
        if *device != self.id {
            return Err(SyncError::DeviceNotFound(device.to_string()));
        }
        if self.refuse_connection {
            return self.emit(LinkEvent::ConnectFailed {
                reason: "connection refused".to_string(),
            });
        }
        self.connected = true;
        self.emit(LinkEvent::Connected)
    }

    async fn discover_services(&mut self, _service: Uuid) -> Result<()> {
        self.ensure_connected()?;
        self.emit(LinkEvent::ServicesDiscovered {
            services: vec![self.gatt.service],
        })
    }

    async fn discover_characteristics(&mut self, characteristics: &[Uuid]) -> Result<()> {
        self.ensure_connected()?;
        let found = characteristics
            .iter()
            .copied()
            .filter(|uuid| self.characteristics.contains(uuid))
            .collect();
        self.emit(LinkEvent::CharacteristicsDiscovered {
            characteristics: found,
        })
    }

    async fn read(&mut self, characteristic: Uuid) -> Result<()> {
        self.ensure_connected()?;
        if characteristic != self.gatt.device_time {
            return self.emit(LinkEvent::Error {
                operation: Operation::Read,
                reason: format!("characteristic {characteristic} is not readable"),
            });
        }
        self.emit(LinkEvent::ValueRead {
            characteristic,
            value: Bytes::copy_from_slice(&self.device_time.to_be_bytes()),
        })
    }

    async fn write(
        &mut self,
        characteristic: Uuid,
        data: Bytes,
        with_response: bool,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.writes.lock().await.push(SimWrite {
            characteristic,
            data,
        });

        if characteristic == self.gatt.ack && self.fail_ack_writes {
            return self.emit(LinkEvent::WriteFailed {
                characteristic,
                reason: "simulated write error".to_string(),
            });
        }
        if with_response {
            self.emit(LinkEvent::WriteConfirmed { characteristic })?;
        }
        if characteristic == self.gatt.ack {
            self.pump()?;
        }
        Ok(())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<()> {
        self.ensure_connected()?;
        self.emit(LinkEvent::Subscribed { characteristic })?;
        if characteristic == self.gatt.session_data {
            self.pump()?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.hang_on_disconnect {
            std::future::pending::<()>().await;
        }
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{RunEvent, RunId};
    use tokio::sync::mpsc;

    fn bound(sim: &mut SimulatedTreadmill) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        sim.bind(EventSink::new(RunId(1), tx));
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(run_event) = rx.try_recv() {
            events.push(run_event.event);
        }
        events
    }

    #[tokio::test]
    async fn test_records_wait_for_acknowledgement() {
        let gatt = GattProfile::default();
        let first = Session::new(100, 200, 10);
        let mut sim = SimulatedTreadmill::new(gatt.clone(), 0)
            .then(SimStep::Frame(Bytes::from_static(&[0u8; 7])))
            .with_records([first])
            .then_complete();
        let mut rx = bound(&mut sim);

        sim.connect(&DeviceId::from("SIM:00:00:00:00:01"))
            .await
            .unwrap();
        sim.subscribe(gatt.session_data).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], LinkEvent::Connected);
        assert_eq!(
            events[3],
            LinkEvent::ValueUpdated {
                characteristic: gatt.session_data,
                value: encode_session(&first),
            }
        );

        sim.write(gatt.ack, Bytes::from_static(&[0x01]), true)
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                LinkEvent::WriteConfirmed {
                    characteristic: gatt.ack
                },
                LinkEvent::ValueUpdated {
                    characteristic: gatt.session_data,
                    value: Bytes::from_static(&[STREAM_COMPLETE]),
                },
            ]
        );
        assert_eq!(sim.write_log().lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unbound_simulator_rejects_requests() {
        let mut sim = SimulatedTreadmill::new(GattProfile::default(), 0);
        let err = sim
            .start_scan(&ScanRequest {
                service: GattProfile::default().service,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotBound));
    }

    #[tokio::test]
    async fn test_requests_require_connection() {
        let mut sim = SimulatedTreadmill::new(GattProfile::default(), 0);
        let _rx = bound(&mut sim);
        let err = sim.read(GattProfile::default().device_time).await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
