use std::sync::Mutex;
use indexmap::IndexMap;

use crate::device::types::{DeviceIdentity, MidiInputDevice, MidiOutputDevice};

/**
 * The set of currently attached devices, keyed by transport identity.
 * Membership is exactly the set of identities whose connection is attached;
 * only the connection state machine mutates it.
 */
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inputs: Mutex<IndexMap<DeviceIdentity, MidiInputDevice>>,
    outputs: Mutex<IndexMap<DeviceIdentity, MidiOutputDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    pub(crate) fn insert_input(&self, device: MidiInputDevice) {
        self.inputs
            .lock()
            .expect("input registry poisoned")
            .insert(device.identity.clone(), device);
    }

    pub(crate) fn insert_output(&self, device: MidiOutputDevice) {
        self.outputs
            .lock()
            .expect("output registry poisoned")
            .insert(device.identity.clone(), device);
    }

    pub(crate) fn remove_input(&self, identity: &DeviceIdentity) -> Option<MidiInputDevice> {
        self.inputs
            .lock()
            .expect("input registry poisoned")
            .shift_remove(identity)
    }

    pub(crate) fn remove_output(&self, identity: &DeviceIdentity) -> Option<MidiOutputDevice> {
        self.outputs
            .lock()
            .expect("output registry poisoned")
            .shift_remove(identity)
    }

    /// Snapshot of the attached inputs, in attach order.
    pub fn input_devices(&self) -> Vec<MidiInputDevice> {
        self.inputs
            .lock()
            .expect("input registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of the attached outputs, in attach order.
    pub fn output_devices(&self) -> Vec<MidiOutputDevice> {
        self.outputs
            .lock()
            .expect("output registry poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn input(&self, identity: &DeviceIdentity) -> Option<MidiInputDevice> {
        self.inputs
            .lock()
            .expect("input registry poisoned")
            .get(identity)
            .cloned()
    }

    pub fn output(&self, identity: &DeviceIdentity) -> Option<MidiOutputDevice> {
        self.outputs
            .lock()
            .expect("output registry poisoned")
            .get(identity)
            .cloned()
    }

    pub fn contains(&self, identity: &DeviceIdentity) -> bool {
        self.input(identity).is_some() || self.output(identity).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn input(address: &str) -> MidiInputDevice {
        MidiInputDevice {
            identity: DeviceIdentity::from(address),
            characteristic: Uuid::nil(),
            name: address.to_string(),
        }
    }

    #[test]
    fn snapshots_preserve_attach_order() {
        let registry = DeviceRegistry::new();
        registry.insert_input(input("aa"));
        registry.insert_input(input("bb"));
        registry.insert_input(input("cc"));

        let names: Vec<String> = registry
            .input_devices()
            .into_iter()
            .map(|device| device.name)
            .collect();
        assert_eq!(names, vec!["aa", "bb", "cc"]);
    }

    #[test]
    fn remove_is_per_direction() {
        let registry = DeviceRegistry::new();
        let identity = DeviceIdentity::from("aa");
        registry.insert_input(input("aa"));
        registry.insert_output(MidiOutputDevice {
            identity: identity.clone(),
            characteristic: Uuid::nil(),
            name: "aa".to_string(),
        });

        assert!(registry.contains(&identity));
        assert!(registry.remove_input(&identity).is_some());
        assert!(registry.contains(&identity)); // output still attached
        assert!(registry.remove_output(&identity).is_some());
        assert!(!registry.contains(&identity));
        assert!(registry.remove_input(&identity).is_none());
    }
}
