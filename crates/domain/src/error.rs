use serde::{Deserialize, Serialize};

/// The layer whose deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutLayer {
    Tool,
    Daemon,
    Shim,
    Client,
}

impl std::fmt::Display for TimeoutLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tool => write!(f, "tool"),
            Self::Daemon => write!(f, "daemon"),
            Self::Shim => write!(f, "shim"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Shared error type used across all EXAI crates.
///
/// Infrastructure errors (`Overloaded`, `CircuitBreakerOpen`, `Timeout`) are
/// handled at the daemon layer and surfaced as typed `call_tool_error`
/// messages; tool errors are surfaced verbatim; `Internal` is surfaced with
/// an opaque message only.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("session limit exceeded: {0}")]
    SessionLimitExceeded(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("timeout at {layer} layer after {seconds}s")]
    Timeout { layer: TimeoutLayer, seconds: u64 },

    #[error("circuit breaker open for {op}")]
    CircuitBreakerOpen {
        op: String,
        /// Seconds until the recovery window elapses, when known.
        retry_after_s: Option<u64>,
    },

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("tool: {0}")]
    Tool(String),

    #[error("dedup wait timed out: {0}")]
    DedupTimeout(String),

    #[error("daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// The wire `kind` tag for this error (stable, snake_case).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Auth(_) => "auth_failed",
            Self::SessionLimitExceeded(_) => "session_limit_exceeded",
            Self::Overloaded(_) => "overloaded",
            Self::Timeout { .. } => "timeout",
            Self::CircuitBreakerOpen { .. } => "circuit_open",
            Self::Provider { .. } => "provider_error",
            Self::Tool(_) => "tool_error",
            Self::DedupTimeout(_) => "dedup_timeout",
            Self::DaemonUnreachable(_) => "daemon_unreachable",
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => "internal",
        }
    }

    /// Retry-after hint in seconds, for overload and circuit-open errors.
    pub fn retry_after_s(&self) -> Option<u64> {
        match self {
            Self::CircuitBreakerOpen { retry_after_s, .. } => *retry_after_s,
            _ => None,
        }
    }

    /// The message exposed to clients.  `Internal`, `Io` and `Json` errors
    /// carry details that belong in the log, not on the wire.
    pub fn public_message(&self) -> String {
        match self {
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => {
                "internal error".to_owned()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::Config("x".into()).kind(), "config_error");
        assert_eq!(Error::Overloaded("x".into()).kind(), "overloaded");
        assert_eq!(
            Error::Timeout { layer: TimeoutLayer::Daemon, seconds: 180 }.kind(),
            "timeout"
        );
        assert_eq!(
            Error::CircuitBreakerOpen { op: "chat".into(), retry_after_s: Some(10) }.kind(),
            "circuit_open"
        );
    }

    #[test]
    fn timeout_names_the_layer() {
        let err = Error::Timeout { layer: TimeoutLayer::Shim, seconds: 240 };
        assert_eq!(err.to_string(), "timeout at shim layer after 240s");
    }

    #[test]
    fn internal_errors_are_opaque_on_the_wire() {
        let err = Error::Internal("lock poisoned at table.rs:42".into());
        assert_eq!(err.public_message(), "internal error");

        let err = Error::Tool("bad findings shape".into());
        assert_eq!(err.public_message(), "tool: bad findings shape");
    }

    #[test]
    fn circuit_open_carries_retry_hint() {
        let err = Error::CircuitBreakerOpen { op: "kimi_chat".into(), retry_after_s: Some(42) };
        assert_eq!(err.retry_after_s(), Some(42));
        assert_eq!(Error::Tool("x".into()).retry_after_s(), None);
    }
}
