//! Error types for the broker session controller.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerErrorKind {
    /// Network / TLS / timeout — always retryable per policy
    Transport,
    /// Operation invoked in a state that does not accept it
    ProtocolSequence,
    /// Locally-detectable bad input (PIN mismatch, unsupported protocol, …)
    Validation,
    /// A lifecycle-action precondition failed
    ActionNotPermitted,
    /// Broker explicitly rejected the supplied credentials
    AuthenticationRejected,
    /// Round trip was cancelled before completion
    Cancelled,
    /// Desktop or session not known to the registry / broker
    NotFound,
    /// Response could not be decoded
    Parse,
    /// Remoting-client launch failure
    Launcher,
    /// Broker returned an HTTP error with status code
    Api(u16),
    /// Generic
    Other,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct BrokerError {
    pub kind: BrokerErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(kind: BrokerErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Transport, msg)
    }

    pub fn sequence(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::ProtocolSequence, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Validation, msg)
    }

    pub fn not_permitted(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::ActionNotPermitted, msg)
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::AuthenticationRejected, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Cancelled, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::NotFound, msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Parse, msg)
    }

    pub fn launcher(msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Launcher, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(BrokerErrorKind::Api(status), msg)
    }

    /// Whether the retry policy may act on this error automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, BrokerErrorKind::Transport)
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for BrokerError {}

impl From<BrokerError> for String {
    fn from(e: BrokerError) -> String {
        e.to_string()
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::transport(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::transport(format!("Connection failed: {e}"))
        } else {
            Self::new(BrokerErrorKind::Other, format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

/// Convenience alias.
pub type BrokerResult<T> = Result<T, BrokerError>;
