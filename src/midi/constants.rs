use uuid::Uuid;

use crate::device::types::ServiceDescriptor;
use crate::transport::{GattCharacteristic, GattService};

/**
 * The UUID of the well-known BLE MIDI GATT service.
 */
pub const MIDI_SERVICE: &str = "03b80e5a-ede8-4b33-a751-6ce34ec4c700";

/**
 * The UUID of the well-known BLE MIDI I/O characteristic. The standard
 * exposes a single characteristic carrying both directions: notify for
 * input, write for output.
 */
pub const MIDI_IO_CHARACTERISTIC: &str = "7772e5db-3868-4112-a1a9-f2669d106bf3";

pub fn make_midi_service_uuid() -> Uuid {
    Uuid::parse_str(MIDI_SERVICE).unwrap()
}

pub fn make_midi_io_uuid() -> Uuid {
    Uuid::parse_str(MIDI_IO_CHARACTERISTIC).unwrap()
}

/**
 * The set of service/characteristic UUIDs that identify BLE-MIDI endpoints.
 * Used for scan filtering and for resolving a connected peripheral's GATT
 * table into a ServiceDescriptor. Defaults to the well-known UUIDs; vendors
 * that expose MIDI under their own UUIDs can be matched by extending the
 * lists.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidRegistry {
    pub services: Vec<Uuid>,
    pub input_characteristics: Vec<Uuid>,
    pub output_characteristics: Vec<Uuid>,
}

impl Default for UuidRegistry {
    fn default() -> Self {
        UuidRegistry {
            services: vec![make_midi_service_uuid()],
            input_characteristics: vec![make_midi_io_uuid()],
            output_characteristics: vec![make_midi_io_uuid()],
        }
    }
}

impl UuidRegistry {
    pub fn matches_service(&self, uuid: &Uuid) -> bool {
        self.services.contains(uuid)
    }

    /// True when any advertised service identifies a MIDI endpoint. An empty
    /// advertisement is accepted; some platforms omit service UUIDs from
    /// scan results and the match is re-checked after service discovery.
    pub fn matches_advertisement(&self, advertised: &[Uuid]) -> bool {
        advertised.is_empty() || advertised.iter().any(|uuid| self.matches_service(uuid))
    }

    /// Resolves a discovered GATT table to the first matching MIDI service
    /// and its input/output characteristics. Returns None when no service
    /// matches or the matched service exposes neither direction.
    pub fn resolve(&self, services: &[GattService]) -> Option<ServiceDescriptor> {
        for service in services {
            if !self.matches_service(&service.uuid) {
                continue;
            }

            let input = self
                .find_characteristic(&service.characteristics, &self.input_characteristics, |c| {
                    c.can_notify
                });
            let output = self
                .find_characteristic(&service.characteristics, &self.output_characteristics, |c| {
                    c.can_write
                });

            let descriptor = ServiceDescriptor {
                service: service.uuid,
                input,
                output,
            };

            if descriptor.has_endpoint() {
                return Some(descriptor);
            }
        }

        None
    }

    fn find_characteristic(
        &self,
        characteristics: &[GattCharacteristic],
        wanted: &[Uuid],
        capable: impl Fn(&GattCharacteristic) -> bool,
    ) -> Option<Uuid> {
        characteristics
            .iter()
            .find(|c| wanted.contains(&c.uuid) && capable(c))
            .map(|c| c.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn midi_gatt(can_notify: bool, can_write: bool) -> Vec<GattService> {
        vec![GattService {
            uuid: make_midi_service_uuid(),
            characteristics: vec![GattCharacteristic {
                uuid: make_midi_io_uuid(),
                can_notify,
                can_write,
            }],
        }]
    }

    #[test]
    fn resolves_both_directions() {
        let registry = UuidRegistry::default();
        let descriptor = registry.resolve(&midi_gatt(true, true)).unwrap();
        assert_eq!(descriptor.input, Some(make_midi_io_uuid()));
        assert_eq!(descriptor.output, Some(make_midi_io_uuid()));
    }

    #[test]
    fn resolves_single_direction() {
        let registry = UuidRegistry::default();
        let descriptor = registry.resolve(&midi_gatt(true, false)).unwrap();
        assert_eq!(descriptor.input, Some(make_midi_io_uuid()));
        assert_eq!(descriptor.output, None);
    }

    #[test]
    fn rejects_unrelated_service() {
        let registry = UuidRegistry::default();
        let services = vec![GattService {
            uuid: Uuid::parse_str("0000180f-0000-1000-8000-00805f9b34fb").unwrap(),
            characteristics: vec![],
        }];
        assert_eq!(registry.resolve(&services), None);
    }

    #[test]
    fn empty_advertisement_passes_filter() {
        let registry = UuidRegistry::default();
        assert!(registry.matches_advertisement(&[]));
        assert!(registry.matches_advertisement(&[make_midi_service_uuid()]));
        assert!(!registry.matches_advertisement(&[Uuid::nil()]));
    }
}
