//! Device state bridge.
//!
//! The single writer of externally visible device state. Events arrive from
//! two independent sources (the cloud poll loop and the webhook listener)
//! and are merged here into one ordered, deduplicated stream per device.
//! Consumers subscribe to a broadcast bus and receive discovery, update, and
//! reachability events as they occur.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

/// Span within which a poll-reported and a webhook-reported event of the
/// same kind are considered the same physical occurrence.
const DEFAULT_DEDUP_TOLERANCE_SECS: i64 = 5;

const EVENT_BUS_CAPACITY: usize = 256;

// ── Event types ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Button,
    Motion,
    Other,
}

impl EventKind {
    /// Map a cloud activity event string (e.g. `device:sensor:button`) to a
    /// kind. Both the poll path and the webhook path use the same strings.
    pub fn from_activity(event: &str) -> Self {
        match event.rsplit(':').next() {
            Some("button") => Self::Button,
            Some("motion") => Self::Motion,
            _ => Self::Other,
        }
    }
}

/// Which source produced an event. Webhook events carry strictly lower
/// latency and are preferred when both sources report the same occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Poll,
    Webhook,
}

/// One doorbell occurrence, immutable once constructed.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub device_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Cloud-assigned activity id, when the source provides one.
    pub sequence: Option<String>,
    pub origin: Origin,
    /// New device status carried by the event (poll-path status deltas);
    /// `None` leaves the device state unchanged.
    pub state: Option<String>,
}

/// Initial view of a device at discovery time.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceSnapshot {
    pub external_id: String,
    pub display_name: String,
    pub state: String,
}

/// Outward event bus payload.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BridgeEvent {
    DeviceDiscovered {
        device: DeviceSnapshot,
    },
    DeviceUpdate {
        event: Event,
        /// Device state after applying the event.
        state: String,
    },
    DeviceReachability {
        device_id: String,
        reachable: bool,
    },
}

/// Outcome of [`Bridge::ingest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ingest {
    Accepted,
    /// Same occurrence already emitted (sequence match, or same kind within
    /// the dedup tolerance window).
    Duplicate,
    /// Older than the last emitted event for this device.
    Stale,
    /// The device has not been discovered yet.
    UnknownDevice,
}

// ── Bridge ──────────────────────────────────────────────────────────────────

struct DeviceEntry {
    display_name: String,
    state: String,
    reachable: bool,
    last_sequence: Option<String>,
    last_emitted: Option<(EventKind, DateTime<Utc>)>,
}

/// Per-device state registry plus the outward event bus.
///
/// Concurrent ingestion from the poll loop and webhook handlers for the
/// same device is expected: the registry takes a read lock, each device
/// entry its own mutex. Cross-device operations never contend.
pub struct Bridge {
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceEntry>>>>,
    events: broadcast::Sender<BridgeEvent>,
    dedup_tolerance: Duration,
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    pub fn new() -> Self {
        Self::with_dedup_tolerance(Duration::seconds(DEFAULT_DEDUP_TOLERANCE_SECS))
    }

    pub fn with_dedup_tolerance(tolerance: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            events,
            dedup_tolerance: tolerance,
        }
    }

    /// Subscribe to the outward event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub async fn is_known(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    /// Register a discovered device. Idempotent per external id: the first
    /// registration publishes `DeviceDiscovered`; later calls only mark the
    /// device reachable again.
    pub async fn register(&self, snapshot: DeviceSnapshot) {
        {
            let devices = self.devices.read().await;
            if let Some(entry) = devices.get(&snapshot.external_id) {
                let entry = entry.clone();
                drop(devices);
                self.set_reachable_entry(&snapshot.external_id, &entry, true)
                    .await;
                return;
            }
        }

        let mut devices = self.devices.write().await;
        // Re-check under the write lock: a concurrent register may have won.
        if devices.contains_key(&snapshot.external_id) {
            return;
        }
        devices.insert(
            snapshot.external_id.clone(),
            Arc::new(Mutex::new(DeviceEntry {
                display_name: snapshot.display_name.clone(),
                state: snapshot.state.clone(),
                reachable: true,
                last_sequence: None,
                last_emitted: None,
            })),
        );
        drop(devices);

        info!(
            device_id = %snapshot.external_id,
            name = %snapshot.display_name,
            "device discovered"
        );
        let _ = self.events.send(BridgeEvent::DeviceDiscovered { device: snapshot });
    }

    /// Merge one event into the device's stream.
    ///
    /// Duplicates and out-of-order stragglers are dropped so that the
    /// outward stream is monotonic in timestamp per device and each
    /// physical occurrence is emitted exactly once; whichever origin
    /// reported it first wins.
    pub async fn ingest(&self, event: Event) -> Ingest {
        let entry = {
            let devices = self.devices.read().await;
            match devices.get(&event.device_id) {
                Some(entry) => entry.clone(),
                None => return Ingest::UnknownDevice,
            }
        };
        let mut entry = entry.lock().await;

        if let (Some(seq), Some(last)) = (&event.sequence, &entry.last_sequence) {
            if seq == last {
                debug!(
                    device_id = %event.device_id,
                    sequence = %seq,
                    origin = ?event.origin,
                    "event suppressed: sequence already emitted"
                );
                return Ingest::Duplicate;
            }
        }

        if let Some((last_kind, last_ts)) = entry.last_emitted {
            if event.timestamp < last_ts {
                debug!(
                    device_id = %event.device_id,
                    origin = ?event.origin,
                    "event suppressed: older than last emitted"
                );
                return Ingest::Stale;
            }
            if event.kind == last_kind && event.timestamp - last_ts <= self.dedup_tolerance {
                debug!(
                    device_id = %event.device_id,
                    kind = ?event.kind,
                    origin = ?event.origin,
                    "event suppressed: duplicate within tolerance window"
                );
                return Ingest::Duplicate;
            }
        }

        if let Some(state) = &event.state {
            entry.state = state.clone();
        }
        if event.sequence.is_some() {
            entry.last_sequence = event.sequence.clone();
        }
        entry.last_emitted = Some((event.kind, event.timestamp));
        let state = entry.state.clone();
        drop(entry);

        debug!(
            device_id = %event.device_id,
            kind = ?event.kind,
            origin = ?event.origin,
            "device update"
        );
        let _ = self.events.send(BridgeEvent::DeviceUpdate { event, state });
        Ingest::Accepted
    }

    /// Flip a device's reachability. Devices that disappear from an
    /// enumeration are marked unreachable, never deleted, so downstream
    /// consumers see a stable device set for the process lifetime.
    pub async fn set_reachable(&self, device_id: &str, reachable: bool) {
        let entry = {
            let devices = self.devices.read().await;
            match devices.get(device_id) {
                Some(entry) => entry.clone(),
                None => return,
            }
        };
        self.set_reachable_entry(device_id, &entry, reachable).await;
    }

    async fn set_reachable_entry(
        &self,
        device_id: &str,
        entry: &Arc<Mutex<DeviceEntry>>,
        reachable: bool,
    ) {
        let mut entry = entry.lock().await;
        if entry.reachable == reachable {
            return;
        }
        entry.reachable = reachable;
        let name = entry.display_name.clone();
        drop(entry);

        info!(device_id = %device_id, name = %name, reachable, "device reachability changed");
        let _ = self.events.send(BridgeEvent::DeviceReachability {
            device_id: device_id.to_string(),
            reachable,
        });
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
