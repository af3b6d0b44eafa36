use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be passed to handler callbacks for error-type-based decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket or network failure
    Transport,
    /// Malformed envelope or unexpected opcode
    Protocol,
    /// Invalid credentials
    Auth,
    /// Rate limited by the remote API
    RateLimited,
    /// 4xx response other than 429
    Client,
    /// 5xx response
    Server,
    /// Manager or dispatcher is shutting down
    Shutdown,
    /// Gateway closed the session with a fatal close code
    GatewayClosed,
    /// Invalid configuration or lifecycle misuse
    Config,
}

/// Errors that can occur in shardgate
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or network failure (retried with backoff)
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed payload or unexpected opcode
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credentials were rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Rate limit would hold the request longer than the configured maximum
    #[error("rate limited for {retry_after:?} (global: {global})")]
    RateLimited { retry_after: Duration, global: bool },

    /// 4xx response other than 401/429, never retried
    #[error("request rejected with status {status}: {body}")]
    Client { status: u16, body: String },

    /// 5xx response after all retry attempts
    #[error("server error {status} after {attempts} attempts")]
    Server { status: u16, attempts: u32 },

    /// Operation rejected because the manager or dispatcher is stopping
    #[error("shutting down")]
    Shutdown,

    /// `start()` called on a manager that is already running
    #[error("shard manager is already started")]
    AlreadyStarted,

    /// Gateway closed the connection with a non-recoverable close code
    #[error("gateway closed shard {shard_id} with code {code}: {reason}")]
    GatewayClosed {
        shard_id: u32,
        code: u16,
        reason: String,
    },

    /// Configuration could not be resolved
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// JSON encoding or decoding failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Protocol(_) | Error::Json(_) => ErrorKind::Protocol,
            Error::Auth(_) => ErrorKind::Auth,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Client { .. } => ErrorKind::Client,
            Error::Server { .. } => ErrorKind::Server,
            Error::Shutdown => ErrorKind::Shutdown,
            Error::GatewayClosed { .. } => ErrorKind::GatewayClosed,
            Error::Config(_) | Error::AlreadyStarted => ErrorKind::Config,
        }
    }

    /// Whether the failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::RateLimited { .. } | Error::Server { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(format!("websocket: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(format!("http: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(Error::Server { status: 502, attempts: 1 }.is_retryable());
        assert!(Error::RateLimited {
            retry_after: Duration::from_secs(1),
            global: false
        }
        .is_retryable());

        assert!(!Error::Auth("bad token".into()).is_retryable());
        assert!(!Error::Client {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!Error::Shutdown.is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::AlreadyStarted.kind(), ErrorKind::Config);
        assert_eq!(
            Error::GatewayClosed {
                shard_id: 2,
                code: 4004,
                reason: "Authentication failed".into()
            }
            .kind(),
            ErrorKind::GatewayClosed
        );
        let json = serde_json::from_str::<u8>("nope").unwrap_err();
        assert_eq!(Error::from(json).kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_messages_carry_context() {
        let err = Error::GatewayClosed {
            shard_id: 3,
            code: 4014,
            reason: "Disallowed intent(s)".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("shard 3"));
        assert!(msg.contains("4014"));
    }
}
