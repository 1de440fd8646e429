//! Audit logs: error, activity, session and pairing
//!
//! Four independent append-only logs. Each append gets a generated id and
//! timestamp, trims the log to its retention cap (oldest dropped) and
//! rewrites the backing document before returning. Reads are newest-first.

use crate::config::LogConfig;
use crate::error::LinkError;
use crate::phone;
use crate::state::{Document, MemoryBackend, StateBackend};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// A record kind stored in an `EventLog`
pub trait LogRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Key matched by the `filter` argument of `EventLog::recent`
    fn filter_key(&self) -> &str;
}

/// A written log entry (immutable)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry<T> {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: T,
}

/// Capped, persisted, append-only log
pub struct EventLog<T> {
    name: String,
    doc: Document<Vec<LogEntry<T>>>,
    entries: Mutex<Vec<LogEntry<T>>>,
    max_entries: usize,
}

impl<T: LogRecord> EventLog<T> {
    /// Open the log `name`, loading existing entries
    pub fn open(backend: &dyn StateBackend, name: &str, max_entries: usize) -> Self {
        let doc = Document::open(backend, name);
        let mut entries: Vec<LogEntry<T>> = doc.load_or_default();
        trim(&mut entries, max_entries);

        Self {
            name: name.to_string(),
            doc,
            entries: Mutex::new(entries),
            max_entries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a record, returning the written entry
    pub fn add(&self, record: T) -> LogEntry<T> {
        let entry = LogEntry {
            id: format!("log-{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            record,
        };

        let mut entries = self.lock();
        entries.push(entry.clone());
        trim(&mut entries, self.max_entries);

        if let Err(e) = self.doc.save(&entries) {
            tracing::warn!(log = %self.name, error = %e, "Failed to persist log");
        }

        entry
    }

    /// Most recent entries first, optionally restricted to one filter key
    pub fn recent(&self, limit: usize, filter: Option<&str>) -> Vec<LogEntry<T>> {
        let entries = self.lock();
        entries
            .iter()
            .rev()
            .filter(|e| filter.map_or(true, |f| e.record.filter_key() == f))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Look up an entry by id
    pub fn get(&self, id: &str) -> Option<LogEntry<T>> {
        let entries = self.lock();
        entries.iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop all entries
    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        if let Err(e) = self.doc.save(&entries) {
            tracing::warn!(log = %self.name, error = %e, "Failed to persist cleared log");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn trim<T>(entries: &mut Vec<T>, max_entries: usize) {
    if max_entries > 0 && entries.len() > max_entries {
        let drain_count = entries.len() - max_entries;
        entries.drain(..drain_count);
    }
}

// ─── Error log ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Where the error originated (e.g. "transport", "session_registry")
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorRecord {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            code: None,
            context: HashMap::new(),
        }
    }

    /// Build from a crate error, recording its code
    pub fn from_error(source: impl Into<String>, error: &LinkError) -> Self {
        Self::new(source, error.to_string()).with_code(error.code())
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context; a `sender` value is reduced to its user part
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let mut value = value.into();
        if key == "sender" {
            if let Some((user, _)) = value.split_once('@') {
                value = user.to_string();
            }
        }
        self.context.insert(key, value);
        self
    }
}

impl LogRecord for ErrorRecord {
    fn filter_key(&self) -> &str {
        &self.source
    }
}

/// Summary of the error log
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStats {
    pub total: usize,
    pub last_24h: usize,
    pub by_source: HashMap<String, usize>,
    pub last_error: Option<LogEntry<ErrorRecord>>,
}

impl EventLog<ErrorRecord> {
    pub fn stats(&self) -> ErrorStats {
        let entries = self.lock();
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let mut by_source = HashMap::new();
        for entry in entries.iter() {
            *by_source.entry(entry.record.source.clone()).or_insert(0) += 1;
        }

        ErrorStats {
            total: entries.len(),
            last_24h: entries.iter().filter(|e| e.timestamp > cutoff).count(),
            by_source,
            last_error: entries.last().cloned(),
        }
    }
}

// ─── Activity log ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    /// Activity type (e.g. "command", "connected", "cleanup")
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl ActivityRecord {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            sender: None,
            data,
        }
    }

    /// Attach the sender, reduced to its user part
    pub fn with_sender(mut self, sender: &str) -> Self {
        let user = sender.split('@').next().unwrap_or(sender);
        self.sender = Some(user.to_string());
        self
    }
}

impl LogRecord for ActivityRecord {
    fn filter_key(&self) -> &str {
        &self.kind
    }
}

/// Most frequent activity types
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub total: usize,
    pub by_type: Vec<(String, usize)>,
}

impl EventLog<ActivityRecord> {
    /// Counts per activity type, top 20, most frequent first
    pub fn stats(&self) -> ActivityStats {
        let entries = self.lock();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for entry in entries.iter() {
            *counts.entry(entry.record.kind.clone()).or_insert(0) += 1;
        }

        let mut by_type: Vec<(String, usize)> = counts.into_iter().collect();
        by_type.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_type.truncate(20);

        ActivityStats {
            total: entries.len(),
            by_type,
        }
    }
}

// ─── Session log ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Event name ("transition", "connected", "disconnected", ...)
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Masked phone of the session involved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl SessionRecord {
    pub fn event(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            from: None,
            to: None,
            reason: None,
            phone: None,
            details: serde_json::Value::Null,
        }
    }

    /// A state-machine transition
    pub fn transition(
        from: impl Into<String>,
        to: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            reason: Some(reason.into()),
            ..Self::event("transition")
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_phone(mut self, phone: &str) -> Self {
        self.phone = Some(phone::mask(phone));
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl LogRecord for SessionRecord {
    fn filter_key(&self) -> &str {
        &self.event
    }
}

// ─── Pairing log ─────────────────────────────────────────────────

/// Pairing outcomes recorded in the pairing log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingEvent {
    Requested,
    CodeGenerated,
    Success,
    Failed,
    Expired,
}

impl PairingEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingEvent::Requested => "requested",
            PairingEvent::CodeGenerated => "code_generated",
            PairingEvent::Success => "success",
            PairingEvent::Failed => "failed",
            PairingEvent::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRecord {
    /// Masked phone (`***4567`)
    pub phone: String,
    pub status: PairingEvent,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl PairingRecord {
    /// Build a record, masking the phone number
    pub fn new(phone: &str, status: PairingEvent, details: serde_json::Value) -> Self {
        Self {
            phone: phone::mask(phone),
            status,
            details,
        }
    }
}

impl LogRecord for PairingRecord {
    fn filter_key(&self) -> &str {
        self.status.as_str()
    }
}

/// Pairing outcome counts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStats {
    pub total: usize,
    pub requested: usize,
    pub code_generated: usize,
    pub success: usize,
    pub failed: usize,
    pub expired: usize,
    /// Successful pairings per request, in percent
    pub success_rate: f64,
}

impl EventLog<PairingRecord> {
    pub fn stats(&self) -> PairingStats {
        let entries = self.lock();
        let count = |status: PairingEvent| {
            entries
                .iter()
                .filter(|e| e.record.status == status)
                .count()
        };

        let requested = count(PairingEvent::Requested);
        let success = count(PairingEvent::Success);
        let success_rate = if requested == 0 {
            0.0
        } else {
            success as f64 / requested as f64 * 100.0
        };

        PairingStats {
            total: entries.len(),
            requested,
            code_generated: count(PairingEvent::CodeGenerated),
            success,
            failed: count(PairingEvent::Failed),
            expired: count(PairingEvent::Expired),
            success_rate,
        }
    }
}

// ─── Logger ──────────────────────────────────────────────────────

/// The four audit logs
pub struct EventLogger {
    errors: EventLog<ErrorRecord>,
    activity: EventLog<ActivityRecord>,
    sessions: EventLog<SessionRecord>,
    pairing: EventLog<PairingRecord>,
}

impl EventLogger {
    pub const ERROR_LOG: &'static str = "logs/errors";
    pub const ACTIVITY_LOG: &'static str = "logs/activity";
    pub const SESSION_LOG: &'static str = "logs/sessions";
    pub const PAIRING_LOG: &'static str = "logs/pairing";

    /// Open all four logs on a backend
    pub fn open(backend: &dyn StateBackend, config: &LogConfig) -> Self {
        Self {
            errors: EventLog::open(backend, Self::ERROR_LOG, config.max_errors),
            activity: EventLog::open(backend, Self::ACTIVITY_LOG, config.max_activity),
            sessions: EventLog::open(backend, Self::SESSION_LOG, config.max_session),
            pairing: EventLog::open(backend, Self::PAIRING_LOG, config.max_pairing),
        }
    }

    /// Logger backed by a throwaway in-memory backend
    pub fn in_memory() -> Self {
        Self::open(&MemoryBackend::new(), &LogConfig::default())
    }

    pub fn errors(&self) -> &EventLog<ErrorRecord> {
        &self.errors
    }

    pub fn activity(&self) -> &EventLog<ActivityRecord> {
        &self.activity
    }

    pub fn sessions(&self) -> &EventLog<SessionRecord> {
        &self.sessions
    }

    pub fn pairing(&self) -> &EventLog<PairingRecord> {
        &self.pairing
    }

    /// Record a crate error from `source`
    pub fn error(&self, source: &str, error: &LinkError) -> String {
        tracing::error!(source, error = %error, "Recorded error");
        self.errors.add(ErrorRecord::from_error(source, error)).id
    }

    /// Record a prepared error entry
    pub fn record_error(&self, record: ErrorRecord) -> String {
        tracing::error!(source = %record.source, error = %record.message, "Recorded error");
        self.errors.add(record).id
    }

    pub fn record_activity(&self, kind: &str, data: serde_json::Value) {
        self.activity.add(ActivityRecord::new(kind, data));
    }

    pub fn record_session(&self, record: SessionRecord) {
        tracing::info!(
            event = %record.event,
            from = record.from.as_deref().unwrap_or("-"),
            to = record.to.as_deref().unwrap_or("-"),
            reason = record.reason.as_deref().unwrap_or("-"),
            "Session event"
        );
        self.sessions.add(record);
    }

    pub fn record_pairing(&self, phone: &str, status: PairingEvent, details: serde_json::Value) {
        self.pairing.add(PairingRecord::new(phone, status, details));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity_log(cap: usize) -> (MemoryBackend, EventLog<ActivityRecord>) {
        let backend = MemoryBackend::new();
        let log = EventLog::open(&backend, "logs/activity", cap);
        (backend, log)
    }

    #[test]
    fn test_add_generates_id_and_timestamp() {
        let (_, log) = activity_log(10);
        let entry = log.add(ActivityRecord::new(
            "command",
            serde_json::json!({"command": "alive"}),
        ));
        assert!(entry.id.starts_with("log-"));
        assert!(entry.timestamp <= Utc::now());
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(&entry.id).unwrap().record.kind, "command");
    }

    #[test]
    fn test_recent_newest_first_with_filter() {
        let (_, log) = activity_log(10);
        for i in 0..5 {
            let kind = if i % 2 == 0 { "command" } else { "message" };
            log.add(ActivityRecord::new(kind, serde_json::json!({ "i": i })));
        }

        let recent = log.recent(3, None);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].record.data["i"], 4);
        assert_eq!(recent[2].record.data["i"], 2);

        let commands = log.recent(10, Some("command"));
        assert_eq!(commands.len(), 3);
        assert!(commands.iter().all(|e| e.record.kind == "command"));
        assert_eq!(commands[0].record.data["i"], 4);
    }

    #[test]
    fn test_retention_cap_drops_oldest() {
        let (_, log) = activity_log(3);
        for i in 0..5 {
            log.add(ActivityRecord::new("tick", serde_json::json!({ "i": i })));
        }

        assert_eq!(log.len(), 3);
        let all = log.recent(10, None);
        assert_eq!(all[0].record.data["i"], 4);
        assert_eq!(all[2].record.data["i"], 2);
    }

    #[test]
    fn test_persisted_on_every_write() {
        let (backend, log) = activity_log(10);
        log.add(ActivityRecord::new("connected", serde_json::Value::Null));

        let raw = backend.get("logs/activity").unwrap();
        let stored: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["type"], "connected");
        assert!(stored[0].get("data").is_none());

        // Reopen sees the same entries
        let reopened: EventLog<ActivityRecord> = EventLog::open(&backend, "logs/activity", 10);
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_corrupt_log_starts_empty() {
        let backend = MemoryBackend::new();
        backend.put("logs/errors", "not json at all");
        let log: EventLog<ErrorRecord> = EventLog::open(&backend, "logs/errors", 10);
        assert!(log.is_empty());
        assert_eq!(backend.get("logs/errors").unwrap().trim(), "[]");
    }

    #[test]
    fn test_pairing_record_masks_phone() {
        let logger = EventLogger::in_memory();
        logger.record_pairing("15551234567", PairingEvent::Requested, serde_json::Value::Null);

        let entries = logger.pairing().recent(1, None);
        assert_eq!(entries[0].record.phone, "***4567");
        assert!(!serde_json::to_string(&entries[0]).unwrap().contains("1555123"));
    }

    #[test]
    fn test_error_record_sender_context() {
        let record = ErrorRecord::new("router", "boom")
            .with_context("sender", "15551234567@s.whatsapp.net");
        assert_eq!(record.context["sender"], "15551234567");
    }

    #[test]
    fn test_error_stats() {
        let logger = EventLogger::in_memory();
        logger.error("transport", &LinkError::Transport("reset".into()));
        logger.error("transport", &LinkError::Transport("timeout".into()));
        let id = logger.error("session_registry", &LinkError::Persistence("disk".into()));

        let stats = logger.errors().stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.last_24h, 3);
        assert_eq!(stats.by_source["transport"], 2);
        assert_eq!(stats.last_error.unwrap().id, id);
        assert_eq!(logger.errors().get(&id).unwrap().record.code.as_deref(), Some("persistence"));
    }

    #[test]
    fn test_pairing_stats() {
        let logger = EventLogger::in_memory();
        logger.record_pairing("15551234567", PairingEvent::Requested, serde_json::Value::Null);
        logger.record_pairing("15551234567", PairingEvent::Success, serde_json::Value::Null);
        logger.record_pairing("15557654321", PairingEvent::Requested, serde_json::Value::Null);
        logger.record_pairing("15557654321", PairingEvent::Expired, serde_json::Value::Null);

        let stats = logger.pairing().stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.requested, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.expired, 1);
        assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_activity_stats_sorted() {
        let logger = EventLogger::in_memory();
        for _ in 0..3 {
            logger.record_activity("command", serde_json::Value::Null);
        }
        logger.record_activity("cleanup", serde_json::Value::Null);

        let stats = logger.activity().stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_type[0], ("command".to_string(), 3));
        assert_eq!(stats.by_type[1], ("cleanup".to_string(), 1));
    }

    #[test]
    fn test_session_transition_record() {
        let logger = EventLogger::in_memory();
        logger.record_session(SessionRecord::transition("connecting", "connected", "open"));
        logger.record_session(SessionRecord::event("connected").with_phone("15551234567"));

        let transitions = logger.sessions().recent(10, Some("transition"));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].record.from.as_deref(), Some("connecting"));
        assert_eq!(transitions[0].record.to.as_deref(), Some("connected"));

        let connected = logger.sessions().recent(10, Some("connected"));
        assert_eq!(connected[0].record.phone.as_deref(), Some("***4567"));
    }

    #[test]
    fn test_clear() {
        let logger = EventLogger::in_memory();
        logger.record_activity("command", serde_json::Value::Null);
        logger.activity().clear();
        assert!(logger.activity().is_empty());
    }
}
