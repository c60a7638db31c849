use thiserror::Error;

/// Typed error kinds the screener's adapters and stores raise.
///
/// Orchestration code above the adapter boundary propagates these as
/// `anyhow::Error` with `.context(...)` breadcrumbs; the watchdog and
/// reconnect loops match on `Network`/`WebSocket` to decide that a
/// failure is retryable rather than fatal.
#[derive(Debug, Error)]
pub enum ScreenerError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("network middleware error: {0}")]
    NetworkMiddleware(#[from] reqwest_middleware::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ScreenerError {
    /// Transient network/websocket failures are retried by the
    /// reconnect-with-backoff combinator and never surfaced to callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScreenerError::Network(_) | ScreenerError::NetworkMiddleware(_) | ScreenerError::WebSocket(_)
        )
    }
}
