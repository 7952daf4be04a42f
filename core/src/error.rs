/// Error types for the inbox gateway
///
/// Every error is `Clone` so that all callers joined to one coalesced fetch
/// observe the identical classified failure.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream messaging session is not connected
    #[error("wa-not-connected")]
    NotConnected,

    #[error("Upstream rate limited: {0}")]
    RateLimited(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("send-transient:{0}")]
    Transient(String),

    #[error("invalid-jid: {0}")]
    InvalidRecipient(String),

    #[error("wa-number-not-registered: {0}")]
    NotRegistered(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not allowed for this chat")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    /// Unexpected upstream response shape
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure class used for status mapping and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; never surfaced as a hard failure
    Transient,
    /// Caller must correct the request
    Client,
    /// Logged and reported as a server fault
    Internal,
}

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GatewayError::NotConnected
            | GatewayError::RateLimited(_)
            | GatewayError::Timeout(_)
            | GatewayError::Transient(_)
            | GatewayError::Io(_) => ErrorClass::Transient,
            GatewayError::InvalidRecipient(_)
            | GatewayError::NotRegistered(_)
            | GatewayError::InvalidPayload(_)
            | GatewayError::Forbidden
            | GatewayError::NotFound(_) => ErrorClass::Client,
            GatewayError::Serialization(_)
            | GatewayError::Config(_)
            | GatewayError::Upstream(_)
            | GatewayError::Internal(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// HTTP-style status code for the dashboard boundary
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Forbidden => 403,
            GatewayError::NotFound(_) => 404,
            _ => match self.class() {
                ErrorClass::Transient => 503,
                ErrorClass::Client => 400,
                ErrorClass::Internal => 500,
            },
        }
    }

    /// Wording shown to the end user
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::NotConnected => {
                "The messaging session is not connected right now. Please try again shortly."
                    .to_string()
            }
            GatewayError::InvalidRecipient(_) => "The recipient identifier is not valid.".to_string(),
            GatewayError::NotRegistered(_) => {
                "The recipient is not on the messaging network.".to_string()
            }
            GatewayError::InvalidPayload(reason) => format!("The message could not be sent: {}", reason),
            GatewayError::Forbidden => {
                "Not allowed to send to this chat. Make sure the chat is assigned to you.".to_string()
            }
            GatewayError::NotFound(_) => "The requested item was not found.".to_string(),
            _ if self.is_retryable() => {
                "Message could not be sent due to a temporary connection hiccup. Please try again."
                    .to_string()
            }
            other => format!("Something went wrong: {}", other),
        }
    }

    /// Classify a raw upstream failure reason.
    ///
    /// Reason codes follow the upstream session's conventions
    /// (`wa-not-connected`, `send-transient:…`, `invalid-jid`, …).
    pub fn from_upstream_reason(reason: &str) -> Self {
        if reason.contains("wa-not-connected") {
            GatewayError::NotConnected
        } else if let Some(rest) = reason.strip_prefix("send-transient:") {
            GatewayError::Transient(rest.trim().to_string())
        } else if reason.contains("rate-overlimit") || reason.contains("429") {
            GatewayError::RateLimited(reason.to_string())
        } else if reason.contains("invalid-jid") {
            GatewayError::InvalidRecipient(reason.to_string())
        } else if reason.contains("wa-number-not-registered") {
            GatewayError::NotRegistered(reason.to_string())
        } else if let Some(rest) = reason.strip_prefix("send-failed:") {
            GatewayError::InvalidPayload(rest.trim().to_string())
        } else {
            GatewayError::Upstream(reason.to_string())
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
