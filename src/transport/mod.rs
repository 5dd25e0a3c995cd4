//! The platform BLE stack, modeled as a capability the core consumes.
//! Production code talks to btleplug through [`btle::BtleTransport`]; tests
//! script a transport of their own.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::device::types::DeviceIdentity;
use crate::error::TransportError;

pub mod btle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub can_notify: bool,
    pub can_write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peripheral appeared in a scan, with its advertised service UUIDs
    /// (possibly empty on platforms that omit them from scan results).
    Discovered {
        identity: DeviceIdentity,
        advertised: Vec<Uuid>,
        name: Option<String>,
    },
    Connected(DeviceIdentity),
    ConnectFailed(DeviceIdentity),
    Disconnected(DeviceIdentity),
    Notification {
        identity: DeviceIdentity,
        payload: Vec<u8>,
    },
}

pub type TransportEvents = BoxStream<'static, TransportEvent>;

/**
 * Capabilities of the platform BLE stack consumed by the central. All
 * completion is event-driven: `connect` reports success or failure through
 * [`TransportEvent::Connected`] / [`TransportEvent::ConnectFailed`]; an
 * `Err` return means the attempt could not even start and no event follows.
 *
 * Writes must be issued one at a time per device; `write` resolving is the
 * peripheral's acknowledgment and the caller's cue to send the next
 * fragment.
 */
#[async_trait]
pub trait MidiTransport: Send + Sync {
    /// The transport event stream. May be taken once.
    async fn events(&self) -> Result<TransportEvents, TransportError>;

    async fn start_scan(&self, services: &[Uuid]) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, identity: &DeviceIdentity) -> Result<(), TransportError>;

    async fn disconnect(&self, identity: &DeviceIdentity) -> Result<(), TransportError>;

    async fn resolve_services(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<Vec<GattService>, TransportError>;

    /// Human-readable peripheral name, when the platform knows one.
    async fn device_name(&self, identity: &DeviceIdentity) -> Option<String>;

    async fn subscribe(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
    ) -> Result<(), TransportError>;

    async fn write(
        &self,
        identity: &DeviceIdentity,
        characteristic: &Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Largest single-write payload for this device (bounded by the
    /// negotiated MTU).
    fn payload_limit(&self, identity: &DeviceIdentity) -> usize;
}
