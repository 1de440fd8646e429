//! Core lifecycle types for the a3s-link system
//!
//! All types use camelCase JSON serialization for on-disk compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Connection status recorded on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Device details reported by the transport when a connection opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default = "default_browser")]
    pub browser: String,

    /// Display name of the linked account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,

    #[serde(default)]
    pub extra: HashMap<String, String>,
}

fn default_platform() -> String {
    "unknown".to_string()
}

fn default_browser() -> String {
    "Chrome".to_string()
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            browser: default_browser(),
            push_name: None,
            extra: HashMap::new(),
        }
    }
}

impl SessionMetadata {
    pub fn with_push_name(mut self, name: impl Into<String>) -> Self {
        self.push_name = Some(name.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// A linked-device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session identifier (ses-<uuid>)
    pub id: String,

    /// Phone number of the linked account (bare digits)
    pub phone: String,

    pub connected_at: DateTime<Utc>,

    pub last_active: DateTime<Utc>,

    pub status: SessionStatus,

    pub reconnect_attempts: u32,

    #[serde(default)]
    pub metadata: SessionMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect_reason: Option<String>,
}

impl Session {
    /// Create a freshly connected session
    pub fn new(phone: impl Into<String>, metadata: SessionMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: format!("ses-{}", uuid::Uuid::new_v4()),
            phone: phone.into(),
            connected_at: now,
            last_active: now,
            status: SessionStatus::Connected,
            reconnect_attempts: 0,
            metadata,
            disconnected_at: None,
            disconnect_reason: None,
        }
    }

    /// Mark disconnected with a reason
    pub fn mark_disconnected(&mut self, reason: impl Into<String>) {
        self.status = SessionStatus::Disconnected;
        self.disconnected_at = Some(Utc::now());
        self.disconnect_reason = Some(reason.into());
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }
}

/// State of a pending pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Waiting,
    Completed,
    Failed,
    Expired,
}

/// An issued pairing code awaiting entry on the phone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPairing {
    pub phone: String,
    pub code: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PairingStatus,
}

impl PendingPairing {
    /// Create a waiting pairing that expires `ttl` after now
    pub fn new(phone: impl Into<String>, code: impl Into<String>, ttl: chrono::Duration) -> Self {
        let requested_at = Utc::now();
        Self {
            phone: phone.into(),
            code: code.into(),
            requested_at,
            expires_at: requested_at + ttl,
            status: PairingStatus::Waiting,
        }
    }

    /// Whether the code is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
