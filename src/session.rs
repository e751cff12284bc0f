//! Cloud session manager.
//!
//! Owns the one authenticated session to the SkyBell cloud: login, device
//! discovery, and the background poll loop that turns fresh activity records
//! and status changes into bridge events. Authentication failures back off
//! exponentially (with jitter) and retry forever; transient poll failures
//! retry on a short delay and only tear the session down for a full re-login
//! after several consecutive misses. A session-expiry response always forces
//! immediate re-authentication.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, DeviceSnapshot, Event, EventKind, Origin};
use crate::config::Credentials;
use crate::error::CloudError;
use crate::skybell::{ActivityRecord, SessionToken, SkyBell};

/// How long `stop()` waits for the run loop to wind down before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

const STATUS_UNKNOWN: &str = "unknown";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    /// First retry delay after a failed login; doubles per attempt.
    pub auth_backoff_base: Duration,
    /// Ceiling for the login retry delay.
    pub auth_backoff_cap: Duration,
    /// Retry delay after a transient poll failure.
    pub poll_retry_delay: Duration,
    /// Consecutive poll failures after which the session is rebuilt.
    pub max_poll_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            auth_backoff_base: Duration::from_secs(1),
            auth_backoff_cap: Duration::from_secs(60),
            poll_retry_delay: Duration::from_secs(5),
            max_poll_failures: 3,
        }
    }
}

pub struct SessionManager {
    client: SkyBell,
    credentials: Credentials,
    bridge: Arc<Bridge>,
    config: SessionConfig,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        client: SkyBell,
        credentials: Credentials,
        bridge: Arc<Bridge>,
        config: SessionConfig,
    ) -> Self {
        Self {
            client,
            credentials,
            bridge,
            config,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the authentication/poll loop. Non-blocking; discovery and
    /// updates arrive on the bridge's event bus. Calling `start` on an
    /// already-running manager is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let client = self.client.clone();
        let credentials = self.credentials.clone();
        let bridge = self.bridge.clone();
        let config = self.config.clone();
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(run(client, credentials, bridge, config, cancel)));
    }

    /// Cancel the run loop and wait for it to finish, aborting if it does
    /// not wind down within a bounded timeout. Idempotent; after `stop`
    /// returns, no further bridge events originate from this manager.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("session task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

// ── Run loop ────────────────────────────────────────────────────────────────

async fn run(
    client: SkyBell,
    credentials: Credentials,
    bridge: Arc<Bridge>,
    config: SessionConfig,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(config.auth_backoff_base, config.auth_backoff_cap);
    // Poll cursors survive re-authentication so devices are neither
    // re-primed nor their activity replayed after a session rebuild.
    let mut cursors: HashMap<String, Cursor> = HashMap::new();

    loop {
        let token = tokio::select! {
            _ = cancel.cancelled() => return,
            result = client.login(&credentials) => match result {
                Ok(token) => token,
                Err(e) => {
                    let delay = jitter(backoff.next_delay());
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "cloud login failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                    continue;
                }
            },
        };

        info!("cloud session established");
        backoff.reset();

        run_session(&client, &token, &bridge, &config, &cancel, &mut cursors).await;
        if cancel.is_cancelled() {
            return;
        }
        info!("cloud session ended, re-authenticating");
    }
}

/// Drive poll cycles until the session must be rebuilt (expiry, repeated
/// transient failures) or the manager is stopped.
async fn run_session(
    client: &SkyBell,
    token: &SessionToken,
    bridge: &Bridge,
    config: &SessionConfig,
    cancel: &CancellationToken,
    cursors: &mut HashMap<String, Cursor>,
) {
    let mut failures = 0u32;

    loop {
        let cycle = tokio::select! {
            _ = cancel.cancelled() => return,
            result = poll_cycle(client, token, bridge, cursors) => result,
        };

        let delay = match cycle {
            Ok(()) => {
                failures = 0;
                config.poll_interval
            }
            Err(CloudError::SessionExpired) => {
                warn!("cloud session expired");
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(error = %e, consecutive = failures, "poll cycle failed");
                if failures >= config.max_poll_failures {
                    warn!("too many consecutive poll failures, rebuilding session");
                    return;
                }
                config.poll_retry_delay
            }
        };

        // Proactive expiry check, so we re-login before the cloud starts
        // rejecting requests.
        if let Some(expires_at) = token.expires_at {
            if Utc::now() >= expires_at {
                info!("access token expired");
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Per-device poll position, owned by the session manager.
#[derive(Default)]
struct Cursor {
    last_activity: Option<DateTime<Utc>>,
    last_status: Option<String>,
}

async fn poll_cycle(
    client: &SkyBell,
    token: &SessionToken,
    bridge: &Bridge,
    cursors: &mut HashMap<String, Cursor>,
) -> Result<(), CloudError> {
    let devices = client.list_devices(token).await?;

    // Devices that vanished from the enumeration are marked unreachable,
    // never removed.
    for known_id in cursors.keys() {
        if !devices.iter().any(|d| &d.id == known_id) {
            bridge.set_reachable(known_id, false).await;
        }
    }

    for device in devices {
        let first_seen = !cursors.contains_key(&device.id);
        if first_seen {
            bridge
                .register(DeviceSnapshot {
                    external_id: device.id.clone(),
                    display_name: device.name.clone(),
                    state: device
                        .status
                        .clone()
                        .unwrap_or_else(|| STATUS_UNKNOWN.to_string()),
                })
                .await;
        } else {
            bridge.set_reachable(&device.id, true).await;
        }

        let info = client.device_info(token, &device.id).await?;
        let activities = client.device_activities(token, &device.id).await?;

        let cursor = cursors.entry(device.id.clone()).or_default();
        if first_seen {
            // Prime the cursor: history that predates this run is not
            // replayed as fresh events.
            cursor.last_activity = activities.iter().map(|a| a.created_at).max();
            cursor.last_status = Some(info.status);
            continue;
        }

        // Activities first (their timestamps predate "now"), then the
        // status delta, keeping the per-device stream monotonic.
        let mut fresh: Vec<&ActivityRecord> = activities
            .iter()
            .filter(|a| cursor.last_activity.map_or(true, |seen| a.created_at > seen))
            .collect();
        fresh.sort_by_key(|a| a.created_at);

        for activity in fresh {
            debug!(
                device_id = %device.id,
                activity_id = %activity.id,
                event = %activity.event,
                "poll observed activity"
            );
            bridge
                .ingest(Event {
                    device_id: device.id.clone(),
                    kind: EventKind::from_activity(&activity.event),
                    timestamp: activity.created_at,
                    sequence: Some(activity.id.clone()),
                    origin: Origin::Poll,
                    state: None,
                })
                .await;
            cursor.last_activity = Some(activity.created_at);
        }

        if cursor.last_status.as_deref() != Some(info.status.as_str()) {
            bridge
                .ingest(Event {
                    device_id: device.id.clone(),
                    kind: EventKind::Other,
                    timestamp: Utc::now(),
                    sequence: None,
                    origin: Origin::Poll,
                    state: Some(info.status.clone()),
                })
                .await;
            cursor.last_status = Some(info.status);
        }
    }

    Ok(())
}

// ── Backoff ─────────────────────────────────────────────────────────────────

/// Exponential backoff: base, doubling per step, capped. Jitter is applied
/// by the caller at sleep time so the progression itself stays observable.
struct Backoff {
    base: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: None,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(current) => self.cap.min(current * 2),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Randomize a delay by ±20% so a fleet of restarting clients does not
/// hammer the cloud in lockstep.
fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
}
