//! Production transport on top of btleplug.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::device::types::DeviceIdentity;
use crate::error::{ProviderError, TransportError};
use crate::transport::{
    GattCharacteristic, GattService, MidiTransport, TransportEvent, TransportEvents,
};

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * Single-write payload bound. btleplug does not expose the negotiated MTU,
 * so the BLE 4.0 minimum of 23 minus the 3-byte ATT header is assumed.
 */
pub const DEFAULT_PAYLOAD_LIMIT: usize = 20;

pub struct BtleTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<DeviceIdentity, Peripheral>>>,
    identities: Arc<Mutex<HashMap<PeripheralId, DeviceIdentity>>>,
    notify_tasks: Arc<Mutex<HashSet<DeviceIdentity>>>,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
}

impl BtleTransport {
    /// Binds to the first Bluetooth adapter. Fails synchronously when the
    /// host has no usable BLE stack or the radio is off.
    pub async fn new() -> Result<Self, ProviderError> {
        let manager = Manager::new()
            .await
            .map_err(|err| ProviderError::UnsupportedTransport { source: err.into() })?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|err| ProviderError::UnsupportedTransport { source: err.into() })?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(ProviderError::AdapterDisabled)?;

        // A powered-off radio fails this probe.
        let adapter_info = adapter
            .adapter_info()
            .await
            .map_err(|_| ProviderError::AdapterDisabled)?;
        info!("Using adapter {}", adapter_info);

        let central_events = adapter
            .events()
            .await
            .map_err(|err| ProviderError::UnsupportedTransport { source: err.into() })?;

        let (events_tx, events_rx) = unbounded();
        let transport = BtleTransport {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            identities: Arc::new(Mutex::new(HashMap::new())),
            notify_tasks: Arc::new(Mutex::new(HashSet::new())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        };
        transport.spawn_central_event_pump(central_events);

        Ok(transport)
    }

    fn spawn_central_event_pump(
        &self,
        mut central_events: futures::stream::BoxStream<'static, CentralEvent>,
    ) {
        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let identities = Arc::clone(&self.identities);
        let events_tx = self.events_tx.clone();

        spawn(async move {
            while let Some(event) = central_events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let peripheral = match adapter.peripheral(&id).await {
                            Ok(peripheral) => peripheral,
                            Err(err) => {
                                warn!("Could not resolve discovered peripheral: {:?}", err);
                                continue;
                            }
                        };

                        let identity = DeviceIdentity::new(peripheral.address().to_string());
                        let (advertised, name) = match peripheral.properties().await {
                            Ok(Some(properties)) => (properties.services, properties.local_name),
                            Ok(None) => (Vec::new(), None),
                            Err(err) => {
                                warn!("Could not query peripheral properties: {:?}", err);
                                (Vec::new(), None)
                            }
                        };

                        peripherals
                            .lock()
                            .expect("peripheral cache poisoned")
                            .insert(identity.clone(), peripheral);
                        identities
                            .lock()
                            .expect("identity cache poisoned")
                            .insert(id, identity.clone());

                        let _ = events_tx.unbounded_send(TransportEvent::Discovered {
                            identity,
                            advertised,
                            name,
                        });
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let identity = identities
                            .lock()
                            .expect("identity cache poisoned")
                            .get(&id)
                            .cloned();
                        if let Some(identity) = identity {
                            let _ = events_tx.unbounded_send(TransportEvent::Disconnected(identity));
                        }
                    }
                    _ => {}
                }
            }

            debug!("Central event stream ended");
        });
    }

    fn peripheral(&self, identity: &DeviceIdentity) -> Result<Peripheral, TransportError> {
        self.peripherals
            .lock()
            .expect("peripheral cache poisoned")
            .get(identity)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(identity.clone()))
    }

    fn characteristic(
        &self,
        peripheral: &Peripheral,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
    ) -> Result<btleplug::api::Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == *characteristic)
            .ok_or_else(|| TransportError::MissingCharacteristic {
                identity: identity.clone(),
                characteristic: *characteristic,
            })
    }

    fn spawn_notification_pump(&self, identity: &DeviceIdentity, characteristic: Uuid) {
        let mut running = self.notify_tasks.lock().expect("notify task set poisoned");
        if !running.insert(identity.clone()) {
            return; // one pump per device
        }
        drop(running);

        let peripheral = match self.peripheral(identity) {
            Ok(peripheral) => peripheral,
            Err(err) => {
                warn!("No peripheral to read notifications from: {}", err);
                return;
            }
        };
        let identity = identity.clone();
        let events_tx = self.events_tx.clone();
        let notify_tasks = Arc::clone(&self.notify_tasks);

        spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Failed to open notification stream: {:?}", err);
                    notify_tasks
                        .lock()
                        .expect("notify task set poisoned")
                        .remove(&identity);
                    return;
                }
            };

            // The stream ends when the peripheral disconnects.
            while let Some(data) = notifications.next().await {
                if data.uuid == characteristic {
                    let _ = events_tx.unbounded_send(TransportEvent::Notification {
                        identity: identity.clone(),
                        payload: data.value,
                    });
                }
            }

            notify_tasks
                .lock()
                .expect("notify task set poisoned")
                .remove(&identity);
            debug!("Notification stream for {} ended", identity);
        });
    }
}

#[async_trait::async_trait]
impl MidiTransport for BtleTransport {
    async fn events(&self) -> Result<TransportEvents, TransportError> {
        let receiver = self
            .events_rx
            .lock()
            .expect("event receiver poisoned")
            .take()
            .ok_or(TransportError::EventsTaken)?;
        Ok(receiver.boxed())
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError> {
        let filter = ScanFilter {
            services: services.to_vec(),
        };
        self.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> Result<(), TransportError> {
        let peripheral = self.peripheral(identity)?;
        match peripheral.connect().await {
            Ok(()) => {
                let _ = self
                    .events_tx
                    .unbounded_send(TransportEvent::Connected(identity.clone()));
            }
            Err(err) => {
                warn!("Connecting to {} failed: {:?}", identity, err);
                let _ = self
                    .events_tx
                    .unbounded_send(TransportEvent::ConnectFailed(identity.clone()));
            }
        }
        Ok(())
    }

    async fn disconnect(&self, identity: &DeviceIdentity) -> Result<(), TransportError> {
        let peripheral = self.peripheral(identity)?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn resolve_services(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Vec<GattService>, TransportError> {
        let peripheral = self.peripheral(identity)?;
        peripheral.discover_services().await?;

        let services = peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristic {
                        uuid: c.uuid,
                        can_notify: c.properties.contains(CharPropFlags::NOTIFY),
                        can_write: c.properties.contains(CharPropFlags::WRITE)
                            || c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    })
                    .collect(),
            })
            .collect();

        Ok(services)
    }

    async fn device_name(&self, identity: &DeviceIdentity) -> Option<String> {
        let peripheral = self.peripheral(identity).ok()?;
        match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            _ => None,
        }
    }

    async fn subscribe(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(identity)?;
        let target = self.characteristic(&peripheral, identity, characteristic)?;
        peripheral.subscribe(&target).await?;
        self.spawn_notification_pump(identity, *characteristic);
        Ok(())
    }

    async fn write(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(identity)?;
        let target = self.characteristic(&peripheral, identity, characteristic)?;

        // A write acknowledgment is the only backpressure signal, so writes
        // go out with response.
        let fut = peripheral.write(&target, payload, WriteType::WithResponse);

        tokio::select! {
            _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                warn!("Write to {} took too long", identity);
                Err(TransportError::WriteTimeout(identity.clone()))
            }
            result = fut => {
                result?;
                Ok(())
            }
        }
    }

    fn payload_limit(&self, _identity: &DeviceIdentity) -> usize {
        DEFAULT_PAYLOAD_LIMIT
    }
}
