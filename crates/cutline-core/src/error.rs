//! Typed failures crossing component boundaries.
//!
//! Locally recoverable conditions (reconnects, chunk abort + cleanup) stay
//! inside their component; everything else surfaces as a [`ClientError`]
//! with a category, a human-readable message and an optional retry delay
//! lifted from the server's `{detail, retry_after}` error bodies.

use std::fmt;

use serde_json::Value;

/// Error categories for structured handling by front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// HTTP status error (4xx, 5xx) from the request/response API.
    HttpStatus,
    /// Connection-level failure (request never completed).
    Transport,
    /// Response parsing failed.
    Parse,
    /// A pending-attachment limit rejected the operation before any I/O.
    Capacity,
    /// The server no longer knows the session; re-acquisition required.
    SessionNotFound,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientErrorKind::HttpStatus => write!(f, "http_status"),
            ClientErrorKind::Transport => write!(f, "transport"),
            ClientErrorKind::Parse => write!(f, "parse"),
            ClientErrorKind::Capacity => write!(f, "capacity"),
            ClientErrorKind::SessionNotFound => write!(f, "session_not_found"),
        }
    }
}

/// A failure with enough structure for the UI layer to act on.
#[derive(Debug, Clone)]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
    /// Seconds the server asked us to wait before retrying, when present.
    pub retry_after: Option<u64>,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after: None }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Transport, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Parse, message)
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Capacity, message)
    }

    /// Builds an error from an HTTP status and response body.
    ///
    /// Bodies come in several shapes: `{"detail": "..."}`,
    /// `{"detail": {"message"|"detail"|"error": ...}}`, optionally with a
    /// top-level or nested `retry_after` in seconds. A 404 on a session
    /// route maps to [`ClientErrorKind::SessionNotFound`].
    pub fn http_status(status: u16, body: &str) -> Self {
        let kind = if status == 404 {
            ClientErrorKind::SessionNotFound
        } else {
            ClientErrorKind::HttpStatus
        };

        let Ok(value) = serde_json::from_str::<Value>(body) else {
            let message = if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                body.trim().to_string()
            };
            return Self::new(kind, message);
        };

        let retry_after = read_retry_after(&value);
        let message = read_detail(&value).unwrap_or_else(|| format!("HTTP {status}"));
        Self { kind, message, retry_after }
    }
}

fn read_retry_after(value: &Value) -> Option<u64> {
    value
        .get("retry_after")
        .or_else(|| value.get("detail").and_then(|d| d.get("retry_after")))
        .and_then(as_seconds)
}

fn as_seconds(v: &Value) -> Option<u64> {
    if let Some(n) = v.as_u64() {
        return Some(n);
    }
    // Servers occasionally send fractional seconds; round up.
    v.as_f64().filter(|f| *f >= 0.0).map(|f| f.ceil() as u64)
}

fn read_detail(value: &Value) -> Option<String> {
    match value.get("detail") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(obj)) => obj
            .get("message")
            .or_else(|| obj.get("detail"))
            .or_else(|| obj.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| serde_json::to_string(obj).ok()),
        _ => value.get("message").and_then(Value::as_str).map(str::to_string),
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(secs) = self.retry_after {
            write!(f, " (retry after {secs}s)")?;
        }
        Ok(())
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::parse(err.to_string())
        } else {
            ClientError::transport(err.to_string())
        }
    }
}

/// Convenience alias used throughout the engine.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
