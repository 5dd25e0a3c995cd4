use std::io;
use thiserror::Error;
use btleplug;
use serde_json;

use crate::device::types::DeviceIdentity;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with BLE stack (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No Bluetooth adapter is available")]
    NoAdapter,

    #[error("Peripheral {0} is not known to the transport")]
    UnknownPeripheral(DeviceIdentity),

    #[error("Characteristic {characteristic} is not present on {identity}")]
    MissingCharacteristic {
        identity: DeviceIdentity,
        characteristic: uuid::Uuid,
    },

    #[error("Write to {0} timed out")]
    WriteTimeout(DeviceIdentity),

    #[error("The transport event stream has already been taken")]
    EventsTaken,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Bluetooth LE is not usable on this host: {source}")]
    UnsupportedTransport { source: TransportError },

    #[error("The Bluetooth adapter is disabled or absent")]
    AdapterDisabled,
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to start scanning: {source}")]
    StartFailed { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("A connection for {0} is already in progress or established")]
    AlreadyActive(DeviceIdentity),
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("No attached MIDI output for {0}")]
    NotAttached(DeviceIdentity),

    #[error("Failed to frame outbound MIDI message: {source}")]
    Codec { #[from] source: CodecError },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Packet too short to carry a BLE-MIDI header")]
    ShortPacket,

    #[error("Invalid BLE-MIDI header byte {0:#04x}")]
    BadHeader(u8),

    #[error("Data byte without a preceding status byte")]
    OrphanedData,

    #[error("MIDI event truncated by end of packet")]
    TruncatedEvent,

    #[error("Message does not start with a MIDI status byte")]
    MissingStatus,

    #[error("System exclusive message does not end with 0xF7")]
    UnterminatedSysex,

    #[error("Transport payload limit {0} is too small for sysex framing")]
    LimitTooSmall(usize),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Config contains an invalid UUID {value:?}: {source}")]
    InvalidUuid { value: String, source: uuid::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
