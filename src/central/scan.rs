use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::central::events::EventDispatcher;
use crate::device::types::DeviceIdentity;
use crate::error::ScanError;
use crate::midi::constants::UuidRegistry;
use crate::transport::MidiTransport;

/// Lives only between start-scan and stop-scan.
struct ScanSession {
    auto_connect: bool,
    /// Identities already reported this discovery cycle.
    seen: HashSet<DeviceIdentity>,
    stop_timer: CancellationToken,
}

/// What to do with a discovered candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiscoveryDecision {
    pub report: bool,
    pub auto_connect: bool,
}

impl DiscoveryDecision {
    const IGNORE: DiscoveryDecision = DiscoveryDecision {
        report: false,
        auto_connect: false,
    };
}

/**
 * Starts and stops discovery. Candidates are filtered through the UUID
 * registry and reported at most once per discovery cycle; an optional
 * timeout schedules one automatic stop. Scanning status changes are
 * reported exactly once per transition.
 */
pub struct ScanController {
    transport: Arc<dyn MidiTransport>,
    dispatcher: Arc<EventDispatcher>,
    uuids: UuidRegistry,
    session: Mutex<Option<ScanSession>>,
}

impl ScanController {
    pub fn new(
        transport: Arc<dyn MidiTransport>,
        dispatcher: Arc<EventDispatcher>,
        uuids: UuidRegistry,
    ) -> Self {
        ScanController {
            transport,
            dispatcher,
            uuids,
            session: Mutex::new(None),
        }
    }

    /// Starts discovery. `timeout_ms` of 0 means no timeout. Restarting
    /// while scanning replaces the pending stop timer and resets the
    /// found-once-per-cycle set without a scan-status transition.
    pub async fn start_scan(
        self: &Arc<Self>,
        timeout_ms: u64,
        auto_connect: bool,
    ) -> Result<(), ScanError> {
        self.transport.start_scan(&self.uuids.services).await?;

        let stop_timer = CancellationToken::new();
        let was_scanning = {
            let mut session = self.session.lock().expect("scan session poisoned");
            let previous = session.take();
            if let Some(previous) = &previous {
                previous.stop_timer.cancel();
            }
            *session = Some(ScanSession {
                auto_connect,
                seen: HashSet::new(),
                stop_timer: stop_timer.clone(),
            });
            previous.is_some()
        };

        info!("Scanning for MIDI peripherals (timeout {} ms)", timeout_ms);
        if !was_scanning {
            self.dispatcher.fire_scan_status(true);
        }

        if timeout_ms > 0 {
            let controller = Arc::clone(self);
            spawn(async move {
                tokio::select! {
                    _ = stop_timer.cancelled() => {}
                    _ = sleep(Duration::from_millis(timeout_ms)) => {
                        debug!("Scan timeout reached");
                        controller.stop_scan().await;
                    }
                }
            });
        }

        Ok(())
    }

    /// Stops discovery. Idempotent: a no-op while not scanning, and a
    /// transport failure to stop (radio already off) is treated as success.
    pub async fn stop_scan(&self) {
        let session = {
            let mut session = self.session.lock().expect("scan session poisoned");
            session.take()
        };
        let Some(session) = session else {
            return;
        };
        session.stop_timer.cancel();

        if let Err(err) = self.transport.stop_scan().await {
            // nothing meaningful left to cancel
            warn!("Ignoring scan stop failure: {}", err);
        }

        info!("Scanning stopped");
        self.dispatcher.fire_scan_status(false);
    }

    pub fn is_scanning(&self) -> bool {
        self.session
            .lock()
            .expect("scan session poisoned")
            .is_some()
    }

    /// Filters one discovery result against the UUID registry and the
    /// per-cycle dedup set.
    pub(crate) fn handle_discovered(
        &self,
        identity: &DeviceIdentity,
        advertised: &[Uuid],
    ) -> DiscoveryDecision {
        let mut session = self.session.lock().expect("scan session poisoned");
        let Some(session) = session.as_mut() else {
            return DiscoveryDecision::IGNORE; // not scanning
        };

        // Some platforms ignore the transport-level filter, so check again.
        if !self.uuids.matches_advertisement(advertised) {
            return DiscoveryDecision::IGNORE;
        }

        if !session.seen.insert(identity.clone()) {
            return DiscoveryDecision::IGNORE; // already reported this cycle
        }

        DiscoveryDecision {
            report: true,
            auto_connect: session.auto_connect,
        }
    }
}
