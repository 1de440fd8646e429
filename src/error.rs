//! Error types for a3s-link

use thiserror::Error;

/// Errors that can occur in the link lifecycle
#[derive(Debug, Error)]
pub enum LinkError {
    /// Network or transport failure (always retried via backoff)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote side revoked the linked device
    #[error("Session logged out: {0}")]
    LoggedOut(String),

    /// Phone number failed validation
    #[error("Invalid phone number '{0}'")]
    InvalidPhone(String),

    /// Pairing requested while a session is already connected
    #[error("A session is already connected")]
    AlreadyConnected,

    /// The protocol library rejected a request (invalid or duplicate pairing)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Storage read/write failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Reconnect attempts exhausted
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    RetryExhausted { attempts: u32 },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Controller is not running or has shut down
    #[error("Controller unavailable: {0}")]
    Unavailable(String),
}

impl LinkError {
    /// Whether the failure should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }

    /// Whether this is a pairing validation error returned to callers
    pub fn is_pairing_error(&self) -> bool {
        matches!(
            self,
            LinkError::InvalidPhone(_) | LinkError::AlreadyConnected | LinkError::Protocol(_)
        )
    }

    /// Short machine-readable code recorded in the error log
    pub fn code(&self) -> &'static str {
        match self {
            LinkError::Transport(_) => "transport",
            LinkError::LoggedOut(_) => "logged_out",
            LinkError::InvalidPhone(_) => "invalid_phone",
            LinkError::AlreadyConnected => "already_connected",
            LinkError::Protocol(_) => "protocol",
            LinkError::Persistence(_) => "persistence",
            LinkError::RetryExhausted { .. } => "retry_exhausted",
            LinkError::Serialization(_) => "serialization",
            LinkError::Toml(_) => "config_parse",
            LinkError::Config(_) => "config",
            LinkError::Unavailable(_) => "unavailable",
        }
    }

    /// Message safe to show to an end user (no paths, no internals)
    pub fn user_message(&self) -> String {
        match self {
            LinkError::InvalidPhone(_) => {
                "Invalid phone number. Use the full international number, digits only (e.g. 15551234567).".to_string()
            }
            LinkError::AlreadyConnected => {
                "A device is already linked. Log out before pairing a new one.".to_string()
            }
            LinkError::Protocol(_) => {
                "The pairing code could not be generated. Please try again shortly.".to_string()
            }
            LinkError::RetryExhausted { .. } => {
                "Connection lost and automatic reconnect gave up. An operator must reset the session."
                    .to_string()
            }
            LinkError::Unavailable(_) | LinkError::Transport(_) => {
                "The service is not connected right now. Please try again shortly.".to_string()
            }
            _ => "An internal error occurred.".to_string(),
        }
    }
}

/// Result type alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LinkError::Transport("reset by peer".into()).is_retryable());
        assert!(!LinkError::LoggedOut("401".into()).is_retryable());
        assert!(!LinkError::Persistence("disk full".into()).is_retryable());
    }

    #[test]
    fn test_pairing_errors_have_safe_messages() {
        let err = LinkError::InvalidPhone("abc".into());
        assert!(err.is_pairing_error());
        assert!(!err.user_message().contains("abc"));

        let err = LinkError::Persistence("/var/lib/link/sessions.json: EACCES".into());
        assert!(!err.is_pairing_error());
        assert!(!err.user_message().contains("/var/lib"));
    }
}
