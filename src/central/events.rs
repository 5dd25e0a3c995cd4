use std::sync::Mutex;

use crate::device::types::{
    CentralWarning, ConnectionStatus, DeviceIdentity, MidiInputDevice, MidiOutputDevice,
};

pub type DeviceFoundListener = Box<dyn Fn(&DeviceIdentity) + Send>;
pub type InputAttachedListener = Box<dyn Fn(&MidiInputDevice) + Send>;
pub type OutputAttachedListener = Box<dyn Fn(&MidiOutputDevice) + Send>;
pub type InputDetachedListener = Box<dyn Fn(&MidiInputDevice) + Send>;
pub type OutputDetachedListener = Box<dyn Fn(&MidiOutputDevice) + Send>;
pub type DataListener = Box<dyn Fn(&MidiInputDevice, &[u8]) + Send>;
pub type ScanStatusListener = Box<dyn Fn(bool) + Send>;
pub type ConnectionStatusListener = Box<dyn Fn(&DeviceIdentity, ConnectionStatus) + Send>;
pub type WarningListener = Box<dyn Fn(&CentralWarning) + Send>;

/**
 * Fan-out of central events to registered listeners. Listeners run in
 * registration order, synchronously with the triggering transition: the
 * transition is not complete until every listener returned. A listener must
 * not re-enter the central for the same identity; that re-entrancy is not
 * locked against.
 */
#[derive(Default)]
pub struct EventDispatcher {
    device_found: Mutex<Vec<DeviceFoundListener>>,
    input_attached: Mutex<Vec<InputAttachedListener>>,
    output_attached: Mutex<Vec<OutputAttachedListener>>,
    input_detached: Mutex<Vec<InputDetachedListener>>,
    output_detached: Mutex<Vec<OutputDetachedListener>>,
    data: Mutex<Vec<DataListener>>,
    scan_status: Mutex<Vec<ScanStatusListener>>,
    connection_status: Mutex<Vec<ConnectionStatusListener>>,
    warning: Mutex<Vec<WarningListener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher::default()
    }

    pub fn on_device_found(&self, listener: DeviceFoundListener) {
        self.device_found
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn on_input_attached(&self, listener: InputAttachedListener) {
        self.input_attached
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn on_output_attached(&self, listener: OutputAttachedListener) {
        self.output_attached
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn on_input_detached(&self, listener: InputDetachedListener) {
        self.input_detached
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn on_output_detached(&self, listener: OutputDetachedListener) {
        self.output_detached
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn on_data(&self, listener: DataListener) {
        self.data
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn on_scan_status(&self, listener: ScanStatusListener) {
        self.scan_status
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn on_connection_status(&self, listener: ConnectionStatusListener) {
        self.connection_status
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn on_warning(&self, listener: WarningListener) {
        self.warning
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub(crate) fn fire_device_found(&self, identity: &DeviceIdentity) {
        for listener in self
            .device_found
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(identity);
        }
    }

    pub(crate) fn fire_input_attached(&self, device: &MidiInputDevice) {
        for listener in self
            .input_attached
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(device);
        }
    }

    pub(crate) fn fire_output_attached(&self, device: &MidiOutputDevice) {
        for listener in self
            .output_attached
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(device);
        }
    }

    pub(crate) fn fire_input_detached(&self, device: &MidiInputDevice) {
        for listener in self
            .input_detached
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(device);
        }
    }

    pub(crate) fn fire_output_detached(&self, device: &MidiOutputDevice) {
        for listener in self
            .output_detached
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(device);
        }
    }

    pub(crate) fn fire_data(&self, device: &MidiInputDevice, message: &[u8]) {
        for listener in self.data.lock().expect("listener registry poisoned").iter() {
            listener(device, message);
        }
    }

    pub(crate) fn fire_scan_status(&self, scanning: bool) {
        for listener in self
            .scan_status
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(scanning);
        }
    }

    pub(crate) fn fire_connection_status(
        &self,
        identity: &DeviceIdentity,
        status: ConnectionStatus,
    ) {
        for listener in self
            .connection_status
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(identity, status);
        }
    }

    pub(crate) fn fire_warning(&self, warning: &CentralWarning) {
        for listener in self
            .warning
            .lock()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listeners_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            dispatcher.on_scan_status(Box::new(move |_| {
                order.lock().unwrap().push(tag);
            }));
        }

        dispatcher.fire_scan_status(true);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn every_registered_listener_sees_the_event() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            dispatcher.on_device_found(Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        dispatcher.fire_device_found(&DeviceIdentity::from("aa"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
