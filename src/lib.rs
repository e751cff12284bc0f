//! Bridges a cloud-hosted SkyBell doorbell account to a local accessory model:
//! cloud session management, webhook event ingestion, and reconciliation of
//! both event sources into one per-device state stream.

pub mod bridge;
pub mod config;
pub mod error;
pub mod session;
pub mod signature;
pub mod skybell;
pub mod webhook;

pub use bridge::{Bridge, BridgeEvent, DeviceSnapshot, Event, EventKind, Origin};
pub use config::{Config, Credentials};
pub use error::{CloudError, StartError};
pub use session::{SessionConfig, SessionManager};
pub use skybell::SkyBell;
