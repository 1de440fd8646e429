//! Session registry
//!
//! Holds the single active session and a bounded history of past ones.
//! Every mutation rewrites the registry document; a failed write is recorded
//! in the error log and the in-memory state stays authoritative.

use crate::error::LinkError;
use crate::log::{EventLogger, SessionRecord};
use crate::phone;
use crate::state::{Document, StateBackend};
use crate::types::{Session, SessionMetadata, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum archived sessions kept
pub const MAX_HISTORY: usize = 50;

/// Persisted registry document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryState {
    #[serde(default)]
    pub active: Option<Session>,
    #[serde(default)]
    pub history: Vec<Session>,
}

impl RegistryState {
    fn archive(&mut self, session: Session) {
        self.history.push(session);
        if self.history.len() > MAX_HISTORY {
            let drain_count = self.history.len() - MAX_HISTORY;
            self.history.drain(..drain_count);
        }
    }
}

/// Snapshot for status pages
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub has_active: bool,
    /// Masked phone of the active session
    pub active_phone: Option<String>,
    pub status: Option<SessionStatus>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub history_count: usize,
}

/// Full registry dump for backup
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExport {
    pub exported_at: DateTime<Utc>,
    pub sessions: RegistryState,
}

/// In-memory + persisted record of the current session
pub struct SessionRegistry {
    doc: Document<RegistryState>,
    state: Mutex<RegistryState>,
    logger: Arc<EventLogger>,
}

impl SessionRegistry {
    pub const DOCUMENT: &'static str = "sessions";

    /// Open the registry, loading (or initialising) its document
    pub fn open(backend: &dyn StateBackend, logger: Arc<EventLogger>) -> Self {
        let doc: Document<RegistryState> = Document::open(backend, Self::DOCUMENT);
        let state = doc.load_or_default();
        Self {
            doc,
            state: Mutex::new(state),
            logger,
        }
    }

    /// Register the session that just connected
    ///
    /// A different active session is archived first with reason "replaced".
    /// Re-registering the active phone refreshes it in place.
    pub fn register_session(&self, phone: &str, metadata: SessionMetadata) -> Session {
        let mut state = self.lock();

        let session = match state.active.take() {
            Some(mut current) if current.phone == phone => {
                let now = Utc::now();
                current.status = SessionStatus::Connected;
                current.connected_at = now;
                current.last_active = now;
                current.reconnect_attempts = 0;
                current.disconnected_at = None;
                current.disconnect_reason = None;
                current.metadata = metadata;
                current
            }
            Some(mut previous) => {
                previous.mark_disconnected("replaced");
                self.logger.record_session(
                    SessionRecord::event("replaced")
                        .with_phone(&previous.phone)
                        .with_details(serde_json::json!({ "sessionId": previous.id })),
                );
                state.archive(previous);
                Session::new(phone, metadata)
            }
            None => Session::new(phone, metadata),
        };

        state.active = Some(session.clone());
        self.persist(&state);

        self.logger.record_session(
            SessionRecord::event("connected")
                .with_phone(phone)
                .with_details(serde_json::json!({ "sessionId": session.id })),
        );
        tracing::info!(phone = %phone::mask(phone), session_id = %session.id, "Session registered");
        session
    }

    /// Bump `last_active` on the active session
    pub fn update_activity(&self) -> bool {
        let mut state = self.lock();
        let Some(active) = state.active.as_mut() else {
            return false;
        };
        active.last_active = Utc::now();
        self.persist(&state);
        true
    }

    /// Mark the active session as reconnecting
    pub fn mark_connecting(&self) {
        let mut state = self.lock();
        if let Some(active) = state.active.as_mut() {
            active.status = SessionStatus::Connecting;
            self.persist(&state);
        }
    }

    /// Mark the active session disconnected
    ///
    /// With `should_reconnect` the session stays in the active slot so its
    /// attempt counter survives retries; otherwise it is archived and the
    /// slot cleared.
    pub fn disconnect_session(&self, reason: &str, should_reconnect: bool) -> Option<Session> {
        let mut state = self.lock();
        let active = state.active.as_mut()?;
        active.mark_disconnected(reason);
        let session = active.clone();

        if !should_reconnect {
            state.active = None;
            state.archive(session.clone());
        }
        self.persist(&state);

        self.logger.record_session(
            SessionRecord::event("disconnected")
                .with_phone(&session.phone)
                .with_reason(reason)
                .with_details(serde_json::json!({ "shouldReconnect": should_reconnect })),
        );
        Some(session)
    }

    /// Count a failed reconnect, returning the new total (0 without a session)
    pub fn increment_reconnect_attempts(&self) -> u32 {
        let mut state = self.lock();
        let Some(active) = state.active.as_mut() else {
            return 0;
        };
        active.reconnect_attempts += 1;
        let attempts = active.reconnect_attempts;
        self.persist(&state);
        attempts
    }

    pub fn reset_reconnect_attempts(&self) {
        let mut state = self.lock();
        if let Some(active) = state.active.as_mut() {
            active.reconnect_attempts = 0;
            self.persist(&state);
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock()
            .active
            .as_ref()
            .map_or(0, |s| s.reconnect_attempts)
    }

    pub fn active(&self) -> Option<Session> {
        self.lock().active.clone()
    }

    /// Archived sessions, newest first
    pub fn history(&self, limit: usize) -> Vec<Session> {
        self.lock().history.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.lock();
        let active = state.active.as_ref();
        SessionStats {
            has_active: active.is_some(),
            active_phone: active.map(|s| phone::mask(&s.phone)),
            status: active.map(|s| s.status),
            connected_at: active.map(|s| s.connected_at),
            last_active: active.map(|s| s.last_active),
            reconnect_attempts: active.map_or(0, |s| s.reconnect_attempts),
            history_count: state.history.len(),
        }
    }

    pub fn export(&self) -> SessionExport {
        SessionExport {
            exported_at: Utc::now(),
            sessions: self.lock().clone(),
        }
    }

    fn persist(&self, state: &RegistryState) {
        if let Err(e) = self.doc.save(state) {
            let e = match e {
                LinkError::Persistence(_) => e,
                other => LinkError::Persistence(other.to_string()),
            };
            self.logger.error("session_registry", &e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
