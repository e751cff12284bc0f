// Integration tests for the SkyBell client and session manager, using
// wiremock to stand in for the cloud service.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use belfry::bridge::{Bridge, BridgeEvent, Event, EventKind, Origin};
use belfry::config::Credentials;
use belfry::error::CloudError;
use belfry::session::{SessionConfig, SessionManager};
use belfry::skybell::{SessionToken, SkyBell};

// ── Helpers ─────────────────────────────────────────────────────────

fn credentials() -> Credentials {
    Credentials {
        username: "user@example.com".to_string(),
        password: "hunter2".to_string(),
        user_agent_suffix: Some("homebridge/1.8".to_string()),
    }
}

fn client_for(server: &MockServer) -> SkyBell {
    SkyBell::new(server.uri(), None).unwrap()
}

fn token() -> SessionToken {
    SessionToken {
        access_token: "tok".to_string(),
        expires_at: None,
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        poll_interval: Duration::from_millis(300),
        auth_backoff_base: Duration::from_millis(10),
        auth_backoff_cap: Duration::from_millis(40),
        poll_retry_delay: Duration::from_millis(50),
        max_poll_failures: 3,
    }
}

async fn mount_login_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "tok", "expires_in": 3600})),
        )
        .mount(server)
        .await;
}

async fn next_event(rx: &mut broadcast::Receiver<BridgeEvent>) -> BridgeEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for bridge event")
        .expect("bridge event bus closed")
}

async fn login_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/login")
        .count()
}

// ── Client tests ────────────────────────────────────────────────────

#[tokio::test]
async fn login_returns_session_token() {
    let server = MockServer::start().await;
    mount_login_ok(&server).await;

    let session = client_for(&server).login(&credentials()).await.unwrap();
    assert_eq!(session.access_token, "tok");
    assert!(session.expires_at.is_some());
}

#[tokio::test]
async fn rejected_login_is_an_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let result = client_for(&server).login(&credentials()).await;
    assert!(
        matches!(result, Err(CloudError::Auth(_))),
        "expected Auth error, got: {result:?}"
    );
}

#[tokio::test]
async fn unauthorized_fetch_is_session_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let result = client_for(&server).list_devices(&token()).await;
    assert!(
        matches!(result, Err(CloudError::SessionExpired)),
        "expected SessionExpired, got: {result:?}"
    );
}

#[tokio::test]
async fn device_listing_and_activities_roundtrip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "D1", "name": "Front Door", "status": "up"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/activities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "act-1", "event": "device:sensor:button",
             "createdAt": "2026-08-06T10:00:00Z"}
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let devices = client.list_devices(&token()).await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "D1");
    assert_eq!(devices[0].name, "Front Door");
    assert_eq!(devices[0].status.as_deref(), Some("up"));

    let activities = client.device_activities(&token(), "D1").await.unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].event, "device:sensor:button");
}

// ── Session manager tests ───────────────────────────────────────────

#[tokio::test]
async fn manager_discovers_devices_and_emits_poll_events() {
    let server = MockServer::start().await;
    mount_login_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "D1", "name": "Front Door", "status": "up"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/info"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "D1", "status": "up"})),
        )
        .mount(&server)
        .await;
    // First cycle primes the cursor on an empty history; afterwards a
    // button press appears.
    Mock::given(method("GET"))
        .and(path("/devices/D1/activities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/activities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "act-1", "event": "device:sensor:button",
             "createdAt": Utc::now().to_rfc3339()}
        ])))
        .mount(&server)
        .await;

    let bridge = Arc::new(Bridge::new());
    let mut rx = bridge.subscribe();
    let manager = SessionManager::new(
        client_for(&server),
        credentials(),
        bridge.clone(),
        fast_config(),
    );
    manager.start();

    match next_event(&mut rx).await {
        BridgeEvent::DeviceDiscovered { device } => {
            assert_eq!(device.external_id, "D1");
            assert_eq!(device.display_name, "Front Door");
        }
        other => panic!("expected discovery first, got: {other:?}"),
    }

    match next_event(&mut rx).await {
        BridgeEvent::DeviceUpdate { event, .. } => {
            assert_eq!(event.kind, EventKind::Button);
            assert_eq!(event.origin, Origin::Poll);
            assert_eq!(event.sequence.as_deref(), Some("act-1"));
        }
        other => panic!("expected a poll update, got: {other:?}"),
    }

    manager.stop().await;
}

#[tokio::test]
async fn webhook_event_wins_over_poll_echo() {
    // The scenario from the reconciliation contract: a webhook button press
    // lands first, the next poll cycle reports the same activity a second
    // later. Exactly one update must be emitted, webhook-sourced.
    let server = MockServer::start().await;
    mount_login_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "D1", "name": "Front Door", "status": "up"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/info"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "D1", "status": "up"})),
        )
        .mount(&server)
        .await;

    let pressed_at = Utc::now();
    Mock::given(method("GET"))
        .and(path("/devices/D1/activities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/activities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "act-9", "event": "device:sensor:button",
             "createdAt": (pressed_at + chrono::Duration::seconds(1)).to_rfc3339()}
        ])))
        .mount(&server)
        .await;

    let bridge = Arc::new(Bridge::new());
    let mut rx = bridge.subscribe();
    let manager = SessionManager::new(
        client_for(&server),
        credentials(),
        bridge.clone(),
        fast_config(),
    );
    manager.start();

    match next_event(&mut rx).await {
        BridgeEvent::DeviceDiscovered { .. } => {}
        other => panic!("expected discovery first, got: {other:?}"),
    }

    // The push arrives before the next poll cycle.
    bridge
        .ingest(Event {
            device_id: "D1".to_string(),
            kind: EventKind::Button,
            timestamp: pressed_at,
            sequence: Some("act-9".to_string()),
            origin: Origin::Webhook,
            state: None,
        })
        .await;

    match next_event(&mut rx).await {
        BridgeEvent::DeviceUpdate { event, .. } => {
            assert_eq!(event.origin, Origin::Webhook);
            assert_eq!(event.timestamp, pressed_at);
        }
        other => panic!("expected the webhook update, got: {other:?}"),
    }

    // The poll echo must be suppressed: no further update arrives.
    let extra = tokio::time::timeout(Duration::from_millis(700), async {
        loop {
            if let BridgeEvent::DeviceUpdate { event, .. } = next_event(&mut rx).await {
                break event;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "poll echo was emitted: {extra:?}");

    manager.stop().await;
}

#[tokio::test]
async fn login_failures_retry_with_backoff_and_stop_halts_them() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
        .mount(&server)
        .await;

    let bridge = Arc::new(Bridge::new());
    let manager = SessionManager::new(
        client_for(&server),
        credentials(),
        bridge.clone(),
        fast_config(),
    );
    manager.start();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let attempts = login_count(&server).await;
    assert!(attempts >= 3, "expected repeated retries, saw {attempts}");

    manager.stop().await;
    let after_stop = login_count(&server).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        login_count(&server).await,
        after_stop,
        "manager kept retrying after stop"
    );
}

#[tokio::test]
async fn session_expiry_forces_relogin() {
    let server = MockServer::start().await;
    mount_login_ok(&server).await;
    // The first enumeration is rejected (session invalidated server-side);
    // the manager must come back with a fresh login.
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let bridge = Arc::new(Bridge::new());
    let manager = SessionManager::new(
        client_for(&server),
        credentials(),
        bridge.clone(),
        fast_config(),
    );
    manager.start();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let attempts = login_count(&server).await;
    assert!(attempts >= 2, "expected a re-login, saw {attempts} attempts");

    manager.stop().await;
}

#[tokio::test]
async fn vanished_devices_are_marked_unreachable() {
    let server = MockServer::start().await;
    mount_login_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "D1", "name": "Front Door", "status": "up"}
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/info"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "D1", "status": "up"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/devices/D1/activities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let bridge = Arc::new(Bridge::new());
    let mut rx = bridge.subscribe();
    let manager = SessionManager::new(
        client_for(&server),
        credentials(),
        bridge.clone(),
        fast_config(),
    );
    manager.start();

    match next_event(&mut rx).await {
        BridgeEvent::DeviceDiscovered { device } => assert_eq!(device.external_id, "D1"),
        other => panic!("expected discovery first, got: {other:?}"),
    }

    loop {
        if let BridgeEvent::DeviceReachability {
            device_id,
            reachable,
        } = next_event(&mut rx).await
        {
            assert_eq!(device_id, "D1");
            assert!(!reachable);
            break;
        }
    }

    manager.stop().await;
}
