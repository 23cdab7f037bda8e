use crate::error::{ProtocolError, Result};
use std::time::Duration;
use tokio::time;

/// Interval between server pings on an idle connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Time without any inbound data before a session is considered idle and
/// disconnected.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between periodic saves for v4 sessions.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Time a client gets to answer the encryption handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy session deletion delays, by the reason the session closed.
pub const PROXY_LONG_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const PROXY_MEDIUM_TIMEOUT: Duration = Duration::from_secs(30);
pub const PROXY_SHORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrap an async operation with a timeout
pub async fn with_timeout<T>(
    operation: impl std::future::Future<Output = T>,
    duration: Duration,
) -> std::result::Result<T, time::error::Elapsed> {
    time::timeout(duration, operation).await
}

/// Wrap an async operation with a timeout, converting Elapsed errors to
/// ProtocolError::Timeout
pub async fn with_timeout_error<T>(
    operation: impl std::future::Future<Output = Result<T>>,
    duration: Duration,
) -> Result<T> {
    match time::timeout(duration, operation).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
