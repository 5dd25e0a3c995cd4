use std::fmt;
use uuid::Uuid;

/**
 * Transport-level identifier of a physical peer. Stable for the lifetime of
 * a connection; whatever the platform BLE stack uses as an address or handle,
 * rendered to a string.
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(address: impl Into<String>) -> Self {
        DeviceIdentity(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(address: &str) -> Self {
        DeviceIdentity::new(address)
    }
}

/**
 * A matched MIDI service with its resolved characteristics. A peripheral may
 * expose only one direction.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service: Uuid,
    /// Characteristic the peripheral notifies MIDI data on.
    pub input: Option<Uuid>,
    /// Characteristic the central writes MIDI data to.
    pub output: Option<Uuid>,
}

impl ServiceDescriptor {
    pub fn has_endpoint(&self) -> bool {
        self.input.is_some() || self.output.is_some()
    }
}

/**
 * Logical MIDI input endpoint, bound to an identity and a resolved notify
 * characteristic. Only reachable while the owning connection is attached.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiInputDevice {
    pub identity: DeviceIdentity,
    pub characteristic: Uuid,
    pub name: String,
}

/**
 * Logical MIDI output endpoint, bound to an identity and a resolved write
 * characteristic.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiOutputDevice {
    pub identity: DeviceIdentity,
    pub characteristic: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    ConnectFailed,
    NoMatchingService,
    PeerDropped,
    Requested,
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            DetachReason::ConnectFailed => "transport connect failed",
            DetachReason::NoMatchingService => "no matching MIDI service",
            DetachReason::PeerDropped => "peer dropped the connection",
            DetachReason::Requested => "disconnect requested",
        };

        write!(f, "{}", result)
    }
}

/**
 * Lifecycle of one device connection. One instance per DeviceIdentity.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    ServicesResolving,
    Attached,
    Disconnecting,
    Error(DetachReason),
}

/**
 * Coarse status reported to connection-status listeners.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
}

/**
 * Non-fatal conditions reported through the warning listener channel.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralWarning {
    /// A sysex assembly buffer was discarded because a non-continuation
    /// status byte arrived before the terminator.
    SysexInterrupted {
        identity: DeviceIdentity,
        discarded: usize,
    },
    /// An outbound fragment was rejected; queued fragments for the device
    /// were dropped, the device stays attached.
    WriteFailed {
        identity: DeviceIdentity,
        reason: String,
    },
}
