//! Startup configuration.
//!
//! Everything comes from `BELFRY_*` environment variables, read once at
//! startup (a `.env` file is honored in development). Missing or invalid
//! values degrade the affected component and are reported once; they never
//! abort the process.

use std::env;
use std::time::Duration;

use tracing::{info, warn};

use crate::skybell::DEFAULT_API_URL;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
/// Floor on the poll interval, to respect cloud rate limits.
const MIN_POLL_INTERVAL_SECS: u64 = 10;

/// Cloud account credentials. Immutable for the process lifetime.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Appended to the cloud client's user agent, identifying the host
    /// integration on whose behalf we connect.
    pub user_agent_suffix: Option<String>,
}

/// Webhook listener configuration. Present only when the feature is enabled.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub port: u16,
    pub secret: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// `None` when username/password are missing: the cloud session stays
    /// idle and the degradation is logged, matching the permissive contract
    /// of the host integration above us.
    pub credentials: Option<Credentials>,
    /// `None` when the webhook port is unset or its configuration is
    /// invalid: the webhook service is disabled.
    pub webhook: Option<WebhookConfig>,
    pub poll_interval: Duration,
    pub api_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        let credentials = credentials_from_env();
        let webhook = match webhook_from_env() {
            Ok(webhook) => webhook,
            Err(e) => {
                warn!("invalid webhook configuration: {e} — webhook service disabled");
                None
            }
        };

        Self {
            credentials,
            webhook,
            poll_interval: poll_interval(env::var("BELFRY_POLL_INTERVAL").ok().as_deref()),
            api_url: env::var("BELFRY_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
        }
    }
}

fn credentials_from_env() -> Option<Credentials> {
    let username = env::var("BELFRY_USERNAME").unwrap_or_default();
    let password = env::var("BELFRY_PASSWORD").unwrap_or_default();
    if username.is_empty() || password.is_empty() {
        warn!("BELFRY_USERNAME/BELFRY_PASSWORD not set — cloud session disabled");
        return None;
    }
    Some(Credentials {
        username,
        password,
        user_agent_suffix: env::var("BELFRY_USER_AGENT_SUFFIX").ok(),
    })
}

fn webhook_from_env() -> Result<Option<WebhookConfig>, String> {
    let port = match env::var("BELFRY_WEBHOOK_PORT") {
        Ok(v) => v,
        Err(_) => {
            info!("BELFRY_WEBHOOK_PORT not set, webhook service disabled");
            return Ok(None);
        }
    };
    let port: u16 = port
        .parse()
        .map_err(|_| format!("BELFRY_WEBHOOK_PORT is not a port number: {port:?}"))?;

    // Fail closed: a listener without a secret would accept anything.
    let secret = env::var("BELFRY_WEBHOOK_SECRET").unwrap_or_default();
    if secret.is_empty() {
        return Err("BELFRY_WEBHOOK_SECRET must be set when BELFRY_WEBHOOK_PORT is set".into());
    }

    Ok(Some(WebhookConfig { port, secret }))
}

fn poll_interval(raw: Option<&str>) -> Duration {
    let secs = match raw {
        None => DEFAULT_POLL_INTERVAL_SECS,
        Some(v) => match v.parse::<u64>() {
            Ok(secs) => secs,
            Err(_) => {
                warn!("BELFRY_POLL_INTERVAL is not a number: {v:?} — using default");
                DEFAULT_POLL_INTERVAL_SECS
            }
        },
    };
    if secs < MIN_POLL_INTERVAL_SECS {
        warn!(
            "BELFRY_POLL_INTERVAL {secs}s is below the {MIN_POLL_INTERVAL_SECS}s floor — clamping"
        );
        return Duration::from_secs(MIN_POLL_INTERVAL_SECS);
    }
    Duration::from_secs(secs)
}
