//! Credential persistence
//!
//! Credentials are an opaque blob owned by the transport: the store only
//! needs to keep the latest copy durable and to know whether the device has
//! completed pairing (`registered`).

use crate::error::Result;
use crate::state::{Document, StateBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// Durable material for a linked device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Pairing completed and the device is known to the network
    #[serde(default)]
    pub registered: bool,

    /// Network identity of the linked account, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    /// Key material, stored base64-encoded
    #[serde(default, with = "base64_bytes")]
    pub keys: Vec<u8>,

    /// Transport-specific fields the store does not interpret
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,

    pub updated_at: DateTime<Utc>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            registered: false,
            me: None,
            platform: None,
            keys: Vec::new(),
            attributes: serde_json::Map::new(),
            updated_at: Utc::now(),
        }
    }
}

impl Credentials {
    /// Credentials for a device that finished pairing as `me`
    pub fn registered(me: impl Into<String>, keys: Vec<u8>) -> Self {
        Self {
            registered: true,
            me: Some(me.into()),
            keys,
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Persists the credentials of the single linked device
pub struct CredentialStore {
    doc: Document<Credentials>,
    current: Mutex<Credentials>,
}

impl CredentialStore {
    pub const DOCUMENT: &'static str = "credentials";

    /// Open the store, loading (or initialising) the persisted credentials
    pub fn open(backend: &dyn StateBackend) -> Self {
        let doc: Document<Credentials> = Document::open(backend, Self::DOCUMENT);
        let current = doc.load_or_default();
        Self {
            doc,
            current: Mutex::new(current),
        }
    }

    /// Re-read the persisted credentials
    ///
    /// Never fails: an absent or corrupt document yields fresh defaults and
    /// is rewritten as a valid one.
    pub fn load(&self) -> Credentials {
        let creds = self.doc.load_or_default();
        *self.lock() = creds.clone();
        creds
    }

    /// Latest credentials without touching storage
    pub fn current(&self) -> Credentials {
        self.lock().clone()
    }

    /// Atomically replace the persisted credentials
    pub fn save(&self, creds: &Credentials) -> Result<()> {
        self.doc.save(creds)?;
        *self.lock() = creds.clone();
        tracing::debug!(registered = creds.registered, "Credentials saved");
        Ok(())
    }

    /// Delete the persisted credentials
    pub fn clear(&self) -> Result<()> {
        *self.lock() = Credentials::default();
        self.doc.clear()?;
        tracing::info!("Credentials cleared");
        Ok(())
    }

    /// Whether a paired device is on record
    pub fn has_credentials(&self) -> bool {
        self.lock().registered
    }

    fn lock(&self) -> MutexGuard<'_, Credentials> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
