use std::sync::Arc;

use futures::StreamExt;
use log::{debug, info};
use tokio::spawn;
use tokio_util::sync::CancellationToken;

use crate::central::events::{
    ConnectionStatusListener, DataListener, DeviceFoundListener, EventDispatcher,
    InputAttachedListener, InputDetachedListener, OutputAttachedListener, OutputDetachedListener,
    ScanStatusListener, WarningListener,
};
use crate::central::connection::ConnectionStateMachine;
use crate::central::registry::DeviceRegistry;
use crate::central::scan::ScanController;
use crate::device::types::{ConnectionState, DeviceIdentity, MidiInputDevice, MidiOutputDevice};
use crate::error::{ConnectError, ProviderError, ScanError, SendError};
use crate::midi::constants::UuidRegistry;
use crate::transport::{MidiTransport, TransportEvent};

/**
 * Client for BLE MIDI peripheral devices: discovers them, attaches to their
 * MIDI service and exchanges framed MIDI data. Explicitly constructed with
 * the transport it should use; multiple instances are independent.
 */
pub struct BleMidiCentral {
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<EventDispatcher>,
    scan: Arc<ScanController>,
    connections: Arc<ConnectionStateMachine>,
    pump_cancel: CancellationToken,
}

impl BleMidiCentral {
    /// Builds a central over the given transport with the well-known
    /// BLE-MIDI UUIDs.
    pub async fn new(transport: Arc<dyn MidiTransport>) -> Result<Self, ProviderError> {
        Self::with_uuids(transport, UuidRegistry::default()).await
    }

    /// Builds a central matching a caller-supplied UUID set.
    pub async fn with_uuids(
        transport: Arc<dyn MidiTransport>,
        uuids: UuidRegistry,
    ) -> Result<Self, ProviderError> {
        let events = transport
            .events()
            .await
            .map_err(|source| ProviderError::UnsupportedTransport { source })?;

        let registry = Arc::new(DeviceRegistry::new());
        let dispatcher = Arc::new(EventDispatcher::new());
        let scan = Arc::new(ScanController::new(
            Arc::clone(&transport),
            Arc::clone(&dispatcher),
            uuids.clone(),
        ));
        let connections = Arc::new(ConnectionStateMachine::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            uuids,
        ));

        let central = BleMidiCentral {
            registry,
            dispatcher,
            scan,
            connections,
            pump_cancel: CancellationToken::new(),
        };
        central.spawn_event_pump(events);
        Ok(central)
    }

    fn spawn_event_pump(&self, mut events: crate::transport::TransportEvents) {
        let scan = Arc::clone(&self.scan);
        let connections = Arc::clone(&self.connections);
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = self.pump_cancel.clone();

        spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    TransportEvent::Discovered {
                        identity,
                        advertised,
                        name,
                    } => {
                        let decision = scan.handle_discovered(&identity, &advertised);
                        if decision.report {
                            debug!(
                                "Found MIDI candidate {} ({})",
                                identity,
                                name.as_deref().unwrap_or("unnamed")
                            );
                            dispatcher.fire_device_found(&identity);
                        }
                        if decision.auto_connect
                            && connections.state(&identity) == ConnectionState::Idle
                        {
                            if let Err(err) = connections.connect(&identity) {
                                debug!("Skipping auto-connect: {}", err);
                            }
                        }
                    }
                    TransportEvent::Connected(identity) => {
                        connections.handle_connected(&identity).await;
                    }
                    TransportEvent::ConnectFailed(identity) => {
                        connections.handle_connect_failed(&identity);
                    }
                    TransportEvent::Disconnected(identity) => {
                        connections.handle_disconnected(&identity);
                    }
                    TransportEvent::Notification { identity, payload } => {
                        connections.handle_notification(&identity, &payload);
                    }
                }
            }

            debug!("Transport event pump stopped");
        });
    }

    /// Starts scanning for MIDI peripherals. `timeout_ms` of 0 disables the
    /// automatic stop.
    pub async fn start_scan(&self, timeout_ms: u64, auto_connect: bool) -> Result<(), ScanError> {
        self.scan.start_scan(timeout_ms, auto_connect).await
    }

    /// Stops scanning. Safe to call at any time.
    pub async fn stop_scan(&self) {
        self.scan.stop_scan().await;
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_scanning()
    }

    /// Begins connecting to a discovered peripheral.
    pub fn connect(&self, identity: &DeviceIdentity) -> Result<(), ConnectError> {
        self.connections.connect(identity)
    }

    /// Disconnects an attached peripheral. A no-op otherwise.
    pub async fn disconnect(&self, identity: &DeviceIdentity) {
        self.connections.disconnect(identity).await;
    }

    /// Frames one MIDI message and queues it for the device's output
    /// characteristic, honoring the transport's payload limit.
    pub fn send(&self, identity: &DeviceIdentity, message: &[u8]) -> Result<(), SendError> {
        self.connections.send(identity, message)
    }

    /// Stops scanning and tears down every connection.
    pub async fn terminate(&self) {
        info!("Terminating central");
        self.scan.stop_scan().await;
        self.connections.terminate().await;
    }

    pub fn connection_state(&self, identity: &DeviceIdentity) -> ConnectionState {
        self.connections.state(identity)
    }

    /// Snapshot of the currently attached input devices.
    pub fn input_devices(&self) -> Vec<MidiInputDevice> {
        self.registry.input_devices()
    }

    /// Snapshot of the currently attached output devices.
    pub fn output_devices(&self) -> Vec<MidiOutputDevice> {
        self.registry.output_devices()
    }

    pub fn on_device_found(&self, listener: DeviceFoundListener) {
        self.dispatcher.on_device_found(listener);
    }

    pub fn on_input_attached(&self, listener: InputAttachedListener) {
        self.dispatcher.on_input_attached(listener);
    }

    pub fn on_output_attached(&self, listener: OutputAttachedListener) {
        self.dispatcher.on_output_attached(listener);
    }

    pub fn on_input_detached(&self, listener: InputDetachedListener) {
        self.dispatcher.on_input_detached(listener);
    }

    pub fn on_output_detached(&self, listener: OutputDetachedListener) {
        self.dispatcher.on_output_detached(listener);
    }

    pub fn on_data(&self, listener: DataListener) {
        self.dispatcher.on_data(listener);
    }

    pub fn on_scan_status(&self, listener: ScanStatusListener) {
        self.dispatcher.on_scan_status(listener);
    }

    pub fn on_connection_status(&self, listener: ConnectionStatusListener) {
        self.dispatcher.on_connection_status(listener);
    }

    pub fn on_warning(&self, listener: WarningListener) {
        self.dispatcher.on_warning(listener);
    }
}

impl Drop for BleMidiCentral {
    fn drop(&mut self) {
        self.pump_cancel.cancel();
    }
}
