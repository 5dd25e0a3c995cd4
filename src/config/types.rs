use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::midi::constants::{MIDI_IO_CHARACTERISTIC, MIDI_SERVICE, UuidRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CentralConfig {
    /// Service UUIDs that identify a MIDI peripheral.
    pub service_uuids: Vec<String>,
    /// Characteristic UUIDs accepted for the notify (input) direction.
    pub input_characteristic_uuids: Vec<String>,
    /// Characteristic UUIDs accepted for the write (output) direction.
    pub output_characteristic_uuids: Vec<String>,
    /// Connect to matching peripherals as they are discovered.
    pub auto_connect: bool,
    /// Scan timeout in milliseconds; 0 scans until stopped.
    pub scan_timeout_ms: u64,
}

impl Default for CentralConfig {
    fn default() -> Self {
        CentralConfig {
            service_uuids: vec![MIDI_SERVICE.to_string()],
            input_characteristic_uuids: vec![MIDI_IO_CHARACTERISTIC.to_string()],
            output_characteristic_uuids: vec![MIDI_IO_CHARACTERISTIC.to_string()],
            auto_connect: false,
            scan_timeout_ms: 5000,
        }
    }
}

impl CentralConfig {
    /// Parses the configured UUID strings into a registry.
    pub fn uuid_registry(&self) -> Result<UuidRegistry, ConfigError> {
        Ok(UuidRegistry {
            services: parse_uuids(&self.service_uuids)?,
            input_characteristics: parse_uuids(&self.input_characteristic_uuids)?,
            output_characteristics: parse_uuids(&self.output_characteristic_uuids)?,
        })
    }
}

fn parse_uuids(values: &[String]) -> Result<Vec<Uuid>, ConfigError> {
    values
        .iter()
        .map(|value| {
            Uuid::parse_str(value).map_err(|source| ConfigError::InvalidUuid {
                value: value.clone(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::constants::make_midi_service_uuid;

    #[test]
    fn default_config_matches_well_known_uuids() {
        let registry = CentralConfig::default().uuid_registry().unwrap();
        assert_eq!(registry, UuidRegistry::default());
        assert!(registry.matches_service(&make_midi_service_uuid()));
    }

    #[test]
    fn invalid_uuid_is_reported_with_its_value() {
        let mut config = CentralConfig::default();
        config.service_uuids = vec!["not-a-uuid".to_string()];
        match config.uuid_registry() {
            Err(ConfigError::InvalidUuid { value, .. }) => assert_eq!(value, "not-a-uuid"),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }
}
