use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SyncError},
    link::{DeviceLink, EventSink, LinkEvent, ScanRequest},
    types::{DeviceId, Operation},
};

/// [`DeviceLink`] backed by the host Bluetooth adapter
///
/// Requests are submitted to btleplug from background tasks; their results
/// reach the engine through the bound [`EventSink`]. Rebinding aborts every
/// task started for the previous run.
pub struct BtleplugLink {
    adapter: Adapter,
    discovered: Arc<Mutex<HashMap<String, Peripheral>>>,
    peripheral: Option<Peripheral>,
    sink: Option<EventSink>,
    scan_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
    notify_task: Option<JoinHandle<()>>,
    operation: Option<JoinHandle<()>>,
}

impl BtleplugLink {
    /// Create a link on the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Ble`] if the Bluetooth manager cannot be initialized,
    /// or [`SyncError::NoAdapter`] if the host has no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SyncError::NoAdapter)?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {info}"),
            Err(e) => debug!("Adapter info unavailable: {e}"),
        }
        Ok(Self::with_adapter(adapter))
    }

    /// Create a link on a specific adapter
    #[must_use]
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            discovered: Arc::new(Mutex::new(HashMap::new())),
            peripheral: None,
            sink: None,
            scan_task: None,
            watch_task: None,
            notify_task: None,
            operation: None,
        }
    }

    fn sink(&self) -> Result<EventSink> {
        self.sink.clone().ok_or(SyncError::NotBound)
    }

    fn connected(&self) -> Result<Peripheral> {
        self.peripheral.clone().ok_or(SyncError::NotConnected)
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(SyncError::CharacteristicNotFound(uuid))
    }

    fn spawn_operation<F>(&mut self, operation: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.operation = Some(tokio::spawn(operation));
    }

    fn abort_tasks(&mut self) {
        for task in [
            self.scan_task.take(),
            self.watch_task.take(),
            self.notify_task.take(),
            self.operation.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }

    /// Report a disconnect of `watched` not requested by the engine
    async fn watch_disconnect(&mut self, watched: PeripheralId, sink: EventSink) -> Result<()> {
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }

        let mut events = self.adapter.events().await?;
        self.watch_task = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == watched {
                        warn!(device = %id, "Treadmill dropped the connection");
                        sink.emit(LinkEvent::Disconnected { reason: None });
                        break;
                    }
                }
            }
        }));
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[async_trait]
impl DeviceLink for BtleplugLink {
    fn bind(&mut self, sink: EventSink) {
        debug!(run = %sink.run(), "Binding BLE link");
        self.abort_tasks();
        self.sink = Some(sink);
    }

    async fn start_scan(&mut self, request: &ScanRequest) -> Result<()> {
        let sink = self.sink()?;
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        self.discovered.lock().await.clear();

        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![request.service],
            })
            .await?;
        info!(service = %request.service, "Scanning for treadmill");

        let adapter = self.adapter.clone();
        let discovered = Arc::clone(&self.discovered);
        let service = request.service;
        self.scan_task = Some(tokio::spawn(async move {
            let mut reported = HashSet::new();
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                if reported.contains(&id) {
                    continue;
                }

                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                if !advertises_service(&properties.services, service) {
                    trace!(device = %id, "Ignoring peripheral without tracker service");
                    continue;
                }

                let device = device_id(&id);
                info!(%device, name = ?properties.local_name, rssi = ?properties.rssi, "Found treadmill");
                discovered.lock().await.insert(device.0.clone(), peripheral);
                reported.insert(id);

                let event = LinkEvent::DeviceDiscovered {
                    id: device,
                    name: properties.local_name,
                };
                if !sink.emit(event) {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<()> {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        self.adapter.stop_scan().await?;
        debug!("Scan stopped");
        Ok(())
    }

    async fn connect(&mut self, device: &DeviceId) -> Result<()> {
        let sink = self.sink()?;
        let peripheral = self
            .discovered
            .lock()
            .await
            .get(&device.0)
            .cloned()
            .ok_or_else(|| SyncError::DeviceNotFound(device.to_string()))?;

        info!(%device, "Connecting to treadmill");
        self.peripheral = Some(peripheral.clone());
        self.watch_disconnect(peripheral.id(), sink.clone()).await?;

        self.spawn_operation(async move {
            let event = match peripheral.connect().await {
                Ok(()) => LinkEvent::Connected,
                Err(e) => LinkEvent::ConnectFailed {
                    reason: e.to_string(),
                },
            };
            sink.emit(event);
        });
        Ok(())
    }

    async fn discover_services(&mut self, service: Uuid) -> Result<()> {
        let peripheral = self.connected()?;
        let sink = self.sink()?;
        debug!(%service, "Discovering services");

        self.spawn_operation(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => LinkEvent::ServicesDiscovered {
                    services: peripheral.services().into_iter().map(|s| s.uuid).collect(),
                },
                Err(e) => LinkEvent::Error {
                    operation: Operation::DiscoverServices,
                    reason: e.to_string(),
                },
            };
            sink.emit(event);
        });
        Ok(())
    }

    async fn discover_characteristics(&mut self, characteristics: &[Uuid]) -> Result<()> {
        let peripheral = self.connected()?;
        let sink = self.sink()?;

        let available: HashSet<Uuid> = peripheral
            .characteristics()
            .into_iter()
            .map(|c| c.uuid)
            .collect();
        let found = characteristics
            .iter()
            .copied()
            .filter(|uuid| available.contains(uuid))
            .collect();
        sink.emit(LinkEvent::CharacteristicsDiscovered {
            characteristics: found,
        });
        Ok(())
    }

    async fn read(&mut self, characteristic: Uuid) -> Result<()> {
        let peripheral = self.connected()?;
        let sink = self.sink()?;
        let target = Self::characteristic(&peripheral, characteristic)?;

        self.spawn_operation(async move {
            let event = match peripheral.read(&target).await {
                Ok(value) => LinkEvent::ValueRead {
                    characteristic,
                    value: Bytes::from(value),
                },
                Err(e) => LinkEvent::Error {
                    operation: Operation::Read,
                    reason: e.to_string(),
                },
            };
            sink.emit(event);
        });
        Ok(())
    }

    async fn write(
        &mut self,
        characteristic: Uuid,
        data: Bytes,
        with_response: bool,
    ) -> Result<()> {
        let peripheral = self.connected()?;
        let sink = self.sink()?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        debug!(%characteristic, "Writing: {:02X?}", &data[..]);

        self.spawn_operation(async move {
            match peripheral
                .write(&target, &data, write_type(with_response))
                .await
            {
                Ok(()) if with_response => {
                    sink.emit(LinkEvent::WriteConfirmed { characteristic });
                }
                Ok(()) => {}
                Err(e) => {
                    sink.emit(LinkEvent::WriteFailed {
                        characteristic,
                        reason: e.to_string(),
                    });
                }
            }
        });
        Ok(())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<()> {
        let peripheral = self.connected()?;
        let sink = self.sink()?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }

        self.notify_task = Some(tokio::spawn(async move {
            let subscribed = async {
                let stream = peripheral.notifications().await?;
                peripheral.subscribe(&target).await?;
                Ok::<_, btleplug::Error>(stream)
            };
            let mut notifications = match subscribed.await {
                Ok(stream) => stream,
                Err(e) => {
                    sink.emit(LinkEvent::Error {
                        operation: Operation::Subscribe,
                        reason: e.to_string(),
                    });
                    return;
                }
            };
            sink.emit(LinkEvent::Subscribed { characteristic });

            while let Some(notification) = notifications.next().await {
                trace!(uuid = %notification.uuid, "Notification: {:02X?}", notification.value);
                let event = LinkEvent::ValueUpdated {
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                };
                if !sink.emit(event) {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        for task in [
            self.watch_task.take(),
            self.notify_task.take(),
            self.operation.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }

        if let Some(peripheral) = self.peripheral.take() {
            info!(device = %peripheral.id(), "Disconnecting from treadmill");
            peripheral.disconnect().await?;
        }
        Ok(())
    }
}

/// Whether an advertisement lists the tracker service
fn advertises_service(services: &[Uuid], service: Uuid) -> bool {
    services.contains(&service)
}

const fn write_type(with_response: bool) -> WriteType {
    if with_response {
        WriteType::WithResponse
    } else {
        WriteType::WithoutResponse
    }
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId(id.to_string())
}
