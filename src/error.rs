use thiserror::Error;

/// Errors from the SkyBell cloud boundary.
///
/// None of these are fatal: the session manager maps them to backoff,
/// retry, or re-authentication.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The cloud rejected the credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The access token is no longer valid; a full re-login is required.
    #[error("session expired")]
    SessionExpired,

    /// Connection-level failure (reset, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(reqwest::Error),

    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The cloud answered with an unexpected status or payload.
    #[error("cloud API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
}

/// Errors raised when the webhook listener cannot start.
#[derive(Debug, Error)]
pub enum StartError {
    /// No shared secret configured; the listener refuses to start rather
    /// than accept unauthenticated input.
    #[error("webhook secret is not configured")]
    Config,

    /// The listener could not acquire its port.
    #[error("failed to bind webhook listener: {0}")]
    Bind(#[source] std::io::Error),
}
