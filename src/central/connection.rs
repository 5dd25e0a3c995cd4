use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::central::events::EventDispatcher;
use crate::central::registry::DeviceRegistry;
use crate::codec::packet::{DecodedEvent, PacketDecoder, PacketEncoder};
use crate::device::types::{
    CentralWarning, ConnectionState, ConnectionStatus, DetachReason, DeviceIdentity,
    MidiInputDevice, MidiOutputDevice,
};
use crate::error::{ConnectError, SendError};
use crate::midi::constants::UuidRegistry;
use crate::midi::message::{self, MessageClass};
use crate::transport::MidiTransport;

/// Outbound queue of one attached output. Fragments are written one at a
/// time; the ack of each write releases the next.
struct WriterHandle {
    queue: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ConnectionEntry {
    state: ConnectionState,
    /// Bumped on every teardown so late completions of a torn-down attempt
    /// are discarded instead of applied.
    epoch: u64,
    decoder: PacketDecoder,
    input: Option<MidiInputDevice>,
    output: Option<MidiOutputDevice>,
    writer: Option<WriterHandle>,
}

/**
 * Drives each device from discovered through connecting, service
 * resolution, attached and back. Every public operation starts with a
 * state check, so redundant calls are safe. The connections table is the
 * single synchronization boundary; the lock is never held across an await.
 */
pub struct ConnectionStateMachine {
    transport: Arc<dyn MidiTransport>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<EventDispatcher>,
    uuids: UuidRegistry,
    encoder: PacketEncoder,
    connections: Mutex<HashMap<DeviceIdentity, ConnectionEntry>>,
}

impl ConnectionStateMachine {
    pub fn new(
        transport: Arc<dyn MidiTransport>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<EventDispatcher>,
        uuids: UuidRegistry,
    ) -> Self {
        ConnectionStateMachine {
            transport,
            registry,
            dispatcher,
            uuids,
            encoder: PacketEncoder::new(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, identity: &DeviceIdentity) -> ConnectionState {
        self.connections
            .lock()
            .expect("connection table poisoned")
            .get(identity)
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Idle)
    }

    /// Begins a connection attempt. Rejected without a state change when
    /// the identity is not idle.
    pub fn connect(self: &Arc<Self>, identity: &DeviceIdentity) -> Result<(), ConnectError> {
        {
            let mut connections = self.connections.lock().expect("connection table poisoned");
            let entry = connections.entry(identity.clone()).or_default();
            if entry.state != ConnectionState::Idle {
                return Err(ConnectError::AlreadyActive(identity.clone()));
            }
            entry.state = ConnectionState::Connecting;
            entry.epoch += 1;
        }

        info!("Connecting to {}", identity);
        self.dispatcher
            .fire_connection_status(identity, ConnectionStatus::Connecting);

        let machine = Arc::clone(self);
        let identity = identity.clone();
        spawn(async move {
            // completion arrives as a transport event; an early Err means
            // no event will follow
            if let Err(err) = machine.transport.connect(&identity).await {
                warn!("Could not start connecting to {}: {}", identity, err);
                machine.handle_connect_failed(&identity);
            }
        });

        Ok(())
    }

    /// The transport reports the link is up: resolve services, subscribe,
    /// and attach.
    pub(crate) async fn handle_connected(&self, identity: &DeviceIdentity) {
        let epoch = {
            let mut connections = self.connections.lock().expect("connection table poisoned");
            let Some(entry) = connections.get_mut(identity) else {
                return;
            };
            if entry.state != ConnectionState::Connecting {
                debug!("Discarding stale connect completion for {}", identity);
                return;
            }
            entry.state = ConnectionState::ServicesResolving;
            entry.epoch
        };

        debug!("Resolving services for {}", identity);
        let descriptor = match self.transport.resolve_services(identity).await {
            Ok(services) => self.uuids.resolve(&services),
            Err(err) => {
                warn!("Service discovery for {} failed: {}", identity, err);
                None
            }
        };
        let Some(descriptor) = descriptor else {
            self.fail_resolution(identity, epoch, DetachReason::NoMatchingService)
                .await;
            return;
        };

        // Subscribe before flipping to attached so no notification is lost.
        let mut input_char = descriptor.input;
        if let Some(characteristic) = descriptor.input {
            if let Err(err) = self.transport.subscribe(identity, &characteristic).await {
                warn!("Subscribing to {} input failed: {}", identity, err);
                input_char = None;
            }
        }
        if input_char.is_none() && descriptor.output.is_none() {
            self.fail_resolution(identity, epoch, DetachReason::NoMatchingService)
                .await;
            return;
        }

        let name = self
            .transport
            .device_name(identity)
            .await
            .unwrap_or_else(|| identity.to_string());

        let (input, output) = {
            let mut connections = self.connections.lock().expect("connection table poisoned");
            let Some(entry) = connections.get_mut(identity) else {
                return;
            };
            if entry.epoch != epoch || entry.state != ConnectionState::ServicesResolving {
                debug!("Discarding stale resolution for {}", identity);
                return;
            }

            let input = input_char.map(|characteristic| MidiInputDevice {
                identity: identity.clone(),
                characteristic,
                name: name.clone(),
            });
            let output = descriptor.output.map(|characteristic| MidiOutputDevice {
                identity: identity.clone(),
                characteristic,
                name: name.clone(),
            });

            entry.input = input.clone();
            entry.output = output.clone();
            entry.state = ConnectionState::Attached;
            entry.writer = output
                .as_ref()
                .map(|output| self.spawn_writer(identity, output.characteristic));
            (input, output)
        };

        // each direction attaches independently and is reported separately
        if let Some(input) = &input {
            self.registry.insert_input(input.clone());
            self.dispatcher.fire_input_attached(input);
        }
        if let Some(output) = &output {
            self.registry.insert_output(output.clone());
            self.dispatcher.fire_output_attached(output);
        }
        self.dispatcher
            .fire_connection_status(identity, ConnectionStatus::Connected);
        info!("Attached {} ({})", identity, name);
    }

    pub(crate) fn handle_connect_failed(&self, identity: &DeviceIdentity) {
        {
            let mut connections = self.connections.lock().expect("connection table poisoned");
            let Some(entry) = connections.get_mut(identity) else {
                return;
            };
            if !matches!(
                entry.state,
                ConnectionState::Connecting | ConnectionState::ServicesResolving
            ) {
                return;
            }
            entry.state = ConnectionState::Error(DetachReason::ConnectFailed);
        }

        warn!("Connection to {} failed", identity);
        self.dispatcher
            .fire_connection_status(identity, ConnectionStatus::Error);
        self.settle_idle(identity);
    }

    /// The transport reports the link is gone.
    pub(crate) fn handle_disconnected(&self, identity: &DeviceIdentity) {
        let state = self
            .connections
            .lock()
            .expect("connection table poisoned")
            .get(identity)
            .map(|entry| entry.state);

        match state {
            Some(ConnectionState::Attached) => {
                warn!("{} dropped the connection", identity);
                if let Some(taken) = self.begin_detach(identity) {
                    self.finish_detach(identity, taken);
                    self.settle_idle(identity);
                }
            }
            Some(ConnectionState::Connecting) | Some(ConnectionState::ServicesResolving) => {
                self.handle_connect_failed(identity);
            }
            _ => {} // duplicate or late; nothing to tear down
        }
    }

    /// Requested disconnect. A no-op on anything but an attached device.
    pub async fn disconnect(&self, identity: &DeviceIdentity) {
        let Some(taken) = self.begin_detach(identity) else {
            return;
        };
        info!("Disconnecting {}", identity);
        self.finish_detach(identity, taken);

        if let Err(err) = self.transport.disconnect(identity).await {
            debug!("Transport disconnect for {} failed: {}", identity, err);
        }
        self.settle_idle(identity);
    }

    /// Tears down every non-idle connection.
    pub async fn terminate(&self) {
        let identities: Vec<DeviceIdentity> = {
            let connections = self.connections.lock().expect("connection table poisoned");
            connections
                .iter()
                .filter(|(_, entry)| entry.state != ConnectionState::Idle)
                .map(|(identity, _)| identity.clone())
                .collect()
        };

        for identity in identities {
            match self.state(&identity) {
                ConnectionState::Attached => self.disconnect(&identity).await,
                ConnectionState::Idle => {}
                _ => {
                    // abandon the in-flight attempt; its completion will be
                    // discarded by the epoch check
                    self.settle_idle(&identity);
                    if let Err(err) = self.transport.disconnect(&identity).await {
                        debug!("Teardown disconnect for {} failed: {}", identity, err);
                    }
                }
            }
        }
    }

    /// Inbound notification payload for an attached input device.
    pub(crate) fn handle_notification(&self, identity: &DeviceIdentity, payload: &[u8]) {
        let (input, events) = {
            let mut connections = self.connections.lock().expect("connection table poisoned");
            let Some(entry) = connections.get_mut(identity) else {
                return;
            };
            if entry.state != ConnectionState::Attached {
                debug!("Discarding notification for detached {}", identity);
                return;
            }
            let Some(input) = entry.input.clone() else {
                return;
            };
            match entry.decoder.decode(payload) {
                Ok(events) => (input, events),
                Err(err) => {
                    warn!("Dropping malformed packet from {}: {}", identity, err);
                    return;
                }
            }
        };

        for event in events {
            match event {
                DecodedEvent::Message { bytes, .. } => {
                    self.dispatcher.fire_data(&input, &bytes);
                }
                DecodedEvent::SysexInterrupted { discarded } => {
                    warn!(
                        "Sysex from {} interrupted, {} buffered bytes discarded",
                        identity, discarded
                    );
                    self.dispatcher.fire_warning(&CentralWarning::SysexInterrupted {
                        identity: identity.clone(),
                        discarded,
                    });
                }
            }
        }
    }

    /// Frames and queues one MIDI message for an attached output device.
    pub fn send(&self, identity: &DeviceIdentity, message: &[u8]) -> Result<(), SendError> {
        let fragments = match message::classify(message) {
            MessageClass::Unsupported => {
                // accepted but not transmitted until a wire form is defined
                warn!(
                    "Dropping outbound message without a status byte ({} bytes)",
                    message.len()
                );
                return Ok(());
            }
            MessageClass::SystemExclusive => {
                let limit = self.transport.payload_limit(identity);
                self.encoder.encode_sysex(message, limit)?
            }
            _ => vec![self.encoder.encode_event(message)?],
        };

        let connections = self.connections.lock().expect("connection table poisoned");
        let writer = connections
            .get(identity)
            .filter(|entry| entry.state == ConnectionState::Attached)
            .and_then(|entry| entry.writer.as_ref())
            .ok_or_else(|| SendError::NotAttached(identity.clone()))?;

        for fragment in fragments {
            if writer.queue.send(fragment).is_err() {
                break; // writer already stopped; detach is in progress
            }
        }
        Ok(())
    }

    /// Moves an attached entry to Disconnecting and strips its devices.
    /// Returns None unless the entry was attached.
    fn begin_detach(
        &self,
        identity: &DeviceIdentity,
    ) -> Option<(
        Option<MidiInputDevice>,
        Option<MidiOutputDevice>,
        Option<WriterHandle>,
    )> {
        let mut connections = self.connections.lock().expect("connection table poisoned");
        let entry = connections.get_mut(identity)?;
        if entry.state != ConnectionState::Attached {
            return None;
        }
        entry.state = ConnectionState::Disconnecting;
        entry.epoch += 1;
        entry.decoder.reset(); // partial sysex dies with the connection
        Some((entry.input.take(), entry.output.take(), entry.writer.take()))
    }

    /// Unregisters devices and mirrors the attach events with detaches.
    fn finish_detach(
        &self,
        identity: &DeviceIdentity,
        (input, output, writer): (
            Option<MidiInputDevice>,
            Option<MidiOutputDevice>,
            Option<WriterHandle>,
        ),
    ) {
        if let Some(writer) = writer {
            writer.cancel.cancel();
        }
        if let Some(input) = input {
            self.registry.remove_input(identity);
            self.dispatcher.fire_input_detached(&input);
        }
        if let Some(output) = output {
            self.registry.remove_output(identity);
            self.dispatcher.fire_output_detached(&output);
        }
    }

    /// Service resolution came up empty or failed: report and tear down.
    async fn fail_resolution(&self, identity: &DeviceIdentity, epoch: u64, reason: DetachReason) {
        {
            let mut connections = self.connections.lock().expect("connection table poisoned");
            let Some(entry) = connections.get_mut(identity) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            entry.state = ConnectionState::Error(reason);
        }

        warn!("Connection to {} failed: {}", identity, reason);
        self.dispatcher
            .fire_connection_status(identity, ConnectionStatus::Error);

        if let Err(err) = self.transport.disconnect(identity).await {
            debug!("Teardown disconnect for {} failed: {}", identity, err);
        }
        self.settle_idle(identity);
    }

    fn settle_idle(&self, identity: &DeviceIdentity) {
        let mut connections = self.connections.lock().expect("connection table poisoned");
        if let Some(entry) = connections.get_mut(identity) {
            entry.state = ConnectionState::Idle;
            entry.epoch += 1;
            entry.decoder.reset();
        }
    }

    fn spawn_writer(&self, identity: &DeviceIdentity, characteristic: Uuid) -> WriterHandle {
        let (queue, mut pending) = mpsc::unbounded_channel::<Vec<u8>>();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let transport = Arc::clone(&self.transport);
        let dispatcher = Arc::clone(&self.dispatcher);
        let identity = identity.clone();

        spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    fragment = pending.recv() => {
                        let Some(fragment) = fragment else { break };
                        // one outstanding write; the ack releases the next fragment
                        if let Err(err) = transport.write(&identity, &characteristic, &fragment).await {
                            warn!("Write to {} failed: {}", identity, err);
                            while pending.try_recv().is_ok() {} // discard the queue
                            dispatcher.fire_warning(&CentralWarning::WriteFailed {
                                identity: identity.clone(),
                                reason: err.to_string(),
                            });
                        }
                    }
                }
            }
        });

        WriterHandle { queue, cancel }
    }
}
