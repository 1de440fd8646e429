//! Transport trait, the seam to the external protocol library
//!
//! The wire protocol and its encryption live outside this crate. A
//! `Transport` opens connections from stored credentials; each
//! `Connection` hands back a `Link` for requests plus a serial stream of
//! lifecycle events. Inbound chat messages are passed to a
//! `CommandRouter` without interpretation.

use crate::credentials::Credentials;
use crate::error::Result;
use crate::types::SessionMetadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory;

/// Why the transport closed a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum DisconnectReason {
    /// The linked device was removed; credentials are no longer valid
    LoggedOut,
    /// Network dropped
    ConnectionLost,
    /// Server closed the stream
    ConnectionClosed,
    TimedOut,
    /// Another client took over the session
    ConnectionReplaced,
    BadSession,
    /// Server asked for a fresh connection (e.g. right after pairing)
    RestartRequired,
    Other(String),
}

impl DisconnectReason {
    /// Map a transport status code
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            408 => DisconnectReason::TimedOut,
            428 => DisconnectReason::ConnectionClosed,
            440 => DisconnectReason::ConnectionReplaced,
            500 => DisconnectReason::BadSession,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Other(format!("status {}", other)),
        }
    }

    /// Terminal reasons end the session; everything else is retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LoggedOut => f.write_str("logged_out"),
            DisconnectReason::ConnectionLost => f.write_str("connection_lost"),
            DisconnectReason::ConnectionClosed => f.write_str("connection_closed"),
            DisconnectReason::TimedOut => f.write_str("timed_out"),
            DisconnectReason::ConnectionReplaced => f.write_str("connection_replaced"),
            DisconnectReason::BadSession => f.write_str("bad_session"),
            DisconnectReason::RestartRequired => f.write_str("restart_required"),
            DisconnectReason::Other(detail) => write!(f, "other: {}", detail),
        }
    }
}

/// A decoded inbound chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Sender identity (e.g. `15551234567@s.whatsapp.net`)
    pub sender: String,
    /// Message content, opaque to this crate
    pub payload: serde_json::Value,
}

/// Events delivered by a connection, in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection authenticated as `identity`
    Open {
        identity: String,
        metadata: SessionMetadata,
    },
    /// Connection ended
    Close { reason: DisconnectReason },
    /// Key material rotated; must be persisted
    CredentialsUpdated(Credentials),
    /// Inbound chat message
    Message(InboundMessage),
}

/// Request side of a live connection
#[async_trait]
pub trait Link: Send + Sync {
    /// Ask the network for a pairing code for `phone`
    ///
    /// Fails with `LinkError::Protocol` when the number is rejected or a
    /// request is already outstanding.
    async fn request_pairing_code(&self, phone: &str) -> Result<String>;

    /// Close the connection; no further events are delivered
    async fn close(&self);
}

/// An opened connection
pub struct Connection {
    pub link: Arc<dyn Link>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Core trait for protocol backends
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection using the given credentials
    ///
    /// Unregistered credentials open a connection that is waiting for
    /// pairing.
    async fn open(&self, credentials: &Credentials) -> Result<Connection>;

    /// Transport name (e.g. "memory")
    fn name(&self) -> &str;
}

/// Receives inbound messages and owns all replies
#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn route(&self, message: InboundMessage);
}

/// Router that drops every message
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRouter;

#[async_trait]
impl CommandRouter for NoopRouter {
    async fn route(&self, _message: InboundMessage) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_logged_out_is_terminal() {
        assert!(DisconnectReason::LoggedOut.is_terminal());
        for reason in [
            DisconnectReason::ConnectionLost,
            DisconnectReason::ConnectionClosed,
            DisconnectReason::TimedOut,
            DisconnectReason::ConnectionReplaced,
            DisconnectReason::BadSession,
            DisconnectReason::RestartRequired,
            DisconnectReason::Other("x".into()),
        ] {
            assert!(!reason.is_terminal(), "{} should be retryable", reason);
        }
    }

    #[test]
    fn test_from_status_code() {
        assert_eq!(DisconnectReason::from_status_code(401), DisconnectReason::LoggedOut);
        assert_eq!(DisconnectReason::from_status_code(515), DisconnectReason::RestartRequired);
        assert_eq!(
            DisconnectReason::from_status_code(503),
            DisconnectReason::Other("status 503".into())
        );
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(DisconnectReason::LoggedOut.to_string(), "logged_out");
        assert_eq!(DisconnectReason::Other("eof".into()).to_string(), "other: eof");
    }
}
