//! Webhook receiver for pushed doorbell event notifications.
//!
//! The cloud service POSTs a JSON envelope of activity records to
//! `/webhook`, signed with HMAC-SHA256 over the raw body (see the
//! `signature` module). Requests are answered as soon as the signature and
//! envelope are judged; dispatch into the bridge happens concurrently so a
//! slow device stream never provokes cloud-side retry storms.
//!
//! Events for a device the cloud session has not discovered yet are held in
//! a small bounded buffer for a grace period and flushed when the discovery
//! arrives; overdue entries are dropped with a warning.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::bridge::{Bridge, BridgeEvent, Event, EventKind, Ingest, Origin};
use crate::error::StartError;
use crate::signature;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for the awaiting-discovery buffer.
#[derive(Clone, Debug)]
pub struct WebhookSettings {
    /// How long an event for an undiscovered device is held before being
    /// dropped.
    pub discovery_grace: Duration,
    /// Bound on buffered events; the oldest entry is evicted when full.
    pub pending_capacity: usize,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            discovery_grace: Duration::from_secs(5),
            pending_capacity: 64,
        }
    }
}

// ── Wire format ─────────────────────────────────────────────────────────────

/// The notification envelope: one push may batch several activity records.
#[derive(Deserialize)]
struct PushEnvelope {
    records: Vec<PushRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushRecord {
    device_id: String,
    /// Activity event string, e.g. `device:sensor:button`.
    event: String,
    #[serde(default)]
    id: Option<String>,
    created_at: DateTime<Utc>,
}

impl PushRecord {
    fn into_event(self) -> Event {
        Event {
            kind: EventKind::from_activity(&self.event),
            device_id: self.device_id,
            timestamp: self.created_at,
            sequence: self.id,
            origin: Origin::Webhook,
            state: None,
        }
    }
}

// ── Service ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct WebhookState {
    bridge: Arc<Bridge>,
    secret: String,
    pending: Arc<PendingEvents>,
    cancel: CancellationToken,
}

/// Running webhook service. Dropping the handle leaves the listener
/// running; call [`WebhookHandle::stop`] for an orderly shutdown.
pub struct WebhookHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    serve_task: JoinHandle<()>,
    flush_task: JoinHandle<()>,
}

impl WebhookHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut the listener down and cancel the pending-buffer flusher. After
    /// `stop` returns no further events reach the bridge from this service.
    pub async fn stop(self) {
        self.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, self.serve_task)
            .await
            .is_err()
        {
            warn!("webhook listener did not stop in time");
        }
        self.flush_task.abort();
    }
}

/// Bind the webhook listener with default buffer settings.
pub async fn start(
    bridge: Arc<Bridge>,
    port: u16,
    secret: &str,
) -> Result<WebhookHandle, StartError> {
    start_with(bridge, port, secret, WebhookSettings::default()).await
}

/// Bind the webhook listener.
///
/// Fails closed with [`StartError::Config`] when the secret is empty, and
/// with [`StartError::Bind`] when the port cannot be acquired.
pub async fn start_with(
    bridge: Arc<Bridge>,
    port: u16,
    secret: &str,
    settings: WebhookSettings,
) -> Result<WebhookHandle, StartError> {
    if secret.is_empty() {
        return Err(StartError::Config);
    }

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(StartError::Bind)?;
    let local_addr = listener.local_addr().map_err(StartError::Bind)?;

    let cancel = CancellationToken::new();
    let pending = Arc::new(PendingEvents::new(settings.clone()));
    let state = WebhookState {
        bridge: bridge.clone(),
        secret: secret.to_string(),
        pending: pending.clone(),
        cancel: cancel.clone(),
    };

    let app = Router::new()
        .route("/webhook", post(handle_push))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let serve_cancel = cancel.clone();
    let serve_task = tokio::spawn(async move {
        let serve =
            axum::serve(listener, app).with_graceful_shutdown(serve_cancel.cancelled_owned());
        if let Err(e) = serve.await {
            error!("webhook listener error: {e}");
        }
    });
    let flush_task = tokio::spawn(flush_pending(bridge, pending, settings, cancel.clone()));

    info!(%local_addr, "webhook listener started");
    Ok(WebhookHandle {
        local_addr,
        cancel,
        serve_task,
        flush_task,
    })
}

// ── Request handling ────────────────────────────────────────────────────────

async fn handle_push(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // 1. Authenticate the payload before touching it.
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !signature::verify(&body, header, &state.secret) {
        warn!("webhook push rejected: signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    // 2. Parse the envelope.
    let envelope: PushEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("webhook push rejected: unparseable envelope: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    debug!(records = envelope.records.len(), "webhook push accepted");

    // 3. Answer promptly; dispatch continues after the response so the
    //    cloud's delivery timeout is never at the mercy of our consumers.
    tokio::spawn(dispatch(state, envelope));
    StatusCode::ACCEPTED
}

async fn dispatch(state: WebhookState, envelope: PushEnvelope) {
    for record in envelope.records {
        // A stopped service publishes nothing, even for pushes accepted
        // just before shutdown.
        if state.cancel.is_cancelled() {
            return;
        }
        let event = record.into_event();
        match state.bridge.ingest(event.clone()).await {
            Ingest::Accepted => {}
            Ingest::Duplicate | Ingest::Stale => {
                debug!(device_id = %event.device_id, "webhook event suppressed by bridge");
            }
            Ingest::UnknownDevice => {
                debug!(
                    device_id = %event.device_id,
                    "device not yet discovered, holding webhook event"
                );
                state.pending.push(event).await;
            }
        }
    }
}

// ── Awaiting-discovery buffer ───────────────────────────────────────────────

struct PendingEntry {
    event: Event,
    expires_at: Instant,
}

struct PendingEvents {
    inner: Mutex<VecDeque<PendingEntry>>,
    settings: WebhookSettings,
}

impl PendingEvents {
    fn new(settings: WebhookSettings) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            settings,
        }
    }

    async fn push(&self, event: Event) {
        let mut queue = self.inner.lock().await;
        if queue.len() >= self.settings.pending_capacity {
            if let Some(evicted) = queue.pop_front() {
                warn!(
                    device_id = %evicted.event.device_id,
                    "pending buffer full, dropping oldest event"
                );
            }
        }
        queue.push_back(PendingEntry {
            event,
            expires_at: Instant::now() + self.settings.discovery_grace,
        });
    }

    /// Remove and return all buffered events for one device.
    async fn take_for(&self, device_id: &str) -> Vec<Event> {
        let mut queue = self.inner.lock().await;
        let mut taken = Vec::new();
        queue.retain(|entry| {
            if entry.event.device_id == device_id {
                taken.push(entry.event.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    /// Drop entries whose grace period has elapsed.
    async fn expire(&self) {
        let now = Instant::now();
        let mut queue = self.inner.lock().await;
        queue.retain(|entry| {
            if entry.expires_at <= now {
                warn!(
                    device_id = %entry.event.device_id,
                    "dropping webhook event: device was never discovered"
                );
                false
            } else {
                true
            }
        });
    }
}

/// Watch the bridge for discoveries and flush matching buffered events;
/// periodically sweep out entries whose grace period has run out.
async fn flush_pending(
    bridge: Arc<Bridge>,
    pending: Arc<PendingEvents>,
    settings: WebhookSettings,
    cancel: CancellationToken,
) {
    let mut rx = bridge.subscribe();
    let sweep_period = settings.discovery_grace.min(Duration::from_secs(1));
    let mut sweep = tokio::time::interval(sweep_period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sweep.tick() => pending.expire().await,
            result = rx.recv() => match result {
                Ok(BridgeEvent::DeviceDiscovered { device }) => {
                    for event in pending.take_for(&device.external_id).await {
                        debug!(
                            device_id = %device.external_id,
                            "flushing buffered webhook event after discovery"
                        );
                        bridge.ingest(event).await;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("pending flusher lagged, skipped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}
