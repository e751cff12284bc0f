//! SkyBell cloud API client.
//!
//! All requests go to a single REST base URL (`https://cloud.myskybell.com/api/v3`
//! in production; overridable for testing). Authentication is a session token
//! obtained from `POST /login` and sent as a Bearer header on every other call.
//!
//! The client is deliberately thin: typed request/response payloads, status
//! mapping into [`CloudError`], no retry policy of its own. Backoff and
//! re-authentication live in the session manager.

use chrono::{DateTime, Utc};
use reqwest::{header, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::Credentials;
use crate::error::CloudError;

pub const DEFAULT_API_URL: &str = "https://cloud.myskybell.com/api/v3";

/// Deadline for any single cloud request. Exceeding it surfaces as
/// [`CloudError::Timeout`], which the session manager treats as transient.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

// ── Response payloads ───────────────────────────────────────────────────────

/// Token returned by a successful login.
#[derive(Clone, Debug)]
pub struct SessionToken {
    pub access_token: String,
    /// When the token expires, if the cloud told us.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Debug)]
struct LoginResponse {
    access_token: String,
    expires_in: Option<i64>,
}

/// One doorbell as returned by device enumeration.
#[derive(Deserialize, Debug, Clone)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Status snapshot for a single doorbell.
#[derive(Deserialize, Debug, Clone)]
pub struct DeviceInfo {
    pub id: String,
    pub status: String,
}

/// One doorbell activity record (button press, motion, ...).
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,
    /// Activity event string, e.g. `device:sensor:button`.
    pub event: String,
    pub created_at: DateTime<Utc>,
}

// ── Client ──────────────────────────────────────────────────────────────────

/// Client for the SkyBell doorbell cloud API.
#[derive(Clone)]
pub struct SkyBell {
    base_url: String,
    user_agent: String,
    http: reqwest::Client,
}

impl SkyBell {
    /// Create a client for `base_url`, appending `user_agent_suffix` (the
    /// host integration's version string) to this crate's user agent.
    pub fn new(base_url: String, user_agent_suffix: Option<&str>) -> anyhow::Result<Self> {
        let mut user_agent = format!("belfry/{}", env!("CARGO_PKG_VERSION"));
        if let Some(suffix) = user_agent_suffix {
            user_agent.push(' ');
            user_agent.push_str(suffix);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent,
            http,
        })
    }

    /// Authenticate with username/password and obtain a session token.
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionToken, CloudError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            username: &'a str,
            password: &'a str,
        }

        let url = format!("{}/login", self.base_url);
        debug!(%url, "cloud login request");

        let response = self
            .http
            .post(&url)
            .header(header::USER_AGENT, &self.user_agent)
            .json(&LoginRequest {
                username: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let message = response.text().await.unwrap_or_default();
            return Err(CloudError::Auth(message));
        }
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }

        let payload: LoginResponse = response.json().await.map_err(transport)?;
        let expires_at = payload
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        debug!("cloud login OK");
        Ok(SessionToken {
            access_token: payload.access_token,
            expires_at,
        })
    }

    /// List all doorbells on the account.
    pub async fn list_devices(&self, token: &SessionToken) -> Result<Vec<DeviceRecord>, CloudError> {
        self.get_json(token, "/devices").await
    }

    /// Fetch the current status snapshot for one doorbell.
    pub async fn device_info(
        &self,
        token: &SessionToken,
        device_id: &str,
    ) -> Result<DeviceInfo, CloudError> {
        self.get_json(token, &format!("/devices/{device_id}/info")).await
    }

    /// Fetch recent activity records for one doorbell, newest last.
    pub async fn device_activities(
        &self,
        token: &SessionToken,
        device_id: &str,
    ) -> Result<Vec<ActivityRecord>, CloudError> {
        self.get_json(token, &format!("/devices/{device_id}/activities"))
            .await
    }

    /// Authenticated GET, shared by every non-login call.
    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &SessionToken,
        path: &str,
    ) -> Result<T, CloudError> {
        let url = format!("{}{path}", self.base_url);
        let request_id = Uuid::new_v4().to_string();
        debug!(%url, request_id, "cloud API request");

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token.access_token))
            .header(header::USER_AGENT, &self.user_agent)
            .header("x-request-id", &request_id)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CloudError::SessionExpired);
        }
        if !status.is_success() {
            return Err(api_error(status, response).await);
        }

        response.json().await.map_err(transport)
    }
}

fn transport(error: reqwest::Error) -> CloudError {
    if error.is_timeout() {
        CloudError::Timeout
    } else {
        CloudError::Transport(error)
    }
}

async fn api_error(status: StatusCode, response: reqwest::Response) -> CloudError {
    let message = response.text().await.unwrap_or_default();
    CloudError::Api {
        status: status.as_u16(),
        message,
    }
}
