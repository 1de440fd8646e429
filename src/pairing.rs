//! Pairing coordinator
//!
//! Issues device-linking codes, one pending request per phone. A pending
//! request lives until the connection opens for that phone, the request
//! fails, or the cleanup sweep finds it past `expires_at`.

use crate::error::{LinkError, Result};
use crate::log::{ErrorRecord, EventLogger, PairingEvent};
use crate::phone;
use crate::types::{PairingStatus, PendingPairing};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Source of pairing codes (the connection controller)
#[async_trait]
pub trait CodeIssuer: Send + Sync {
    /// Whether a session is currently connected
    fn is_connected(&self) -> bool;

    /// Ask the live connection for a code for `phone`
    async fn issue_code(&self, phone: &str) -> Result<String>;
}

/// Keyed registry of pending pairing requests
pub struct PairingCoordinator {
    pending: Mutex<HashMap<String, PendingPairing>>,
    /// Per-phone gates serializing issuer calls for the same number
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ttl: chrono::Duration,
    logger: Arc<EventLogger>,
}

impl PairingCoordinator {
    pub fn new(ttl: chrono::Duration, logger: Arc<EventLogger>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            ttl,
            logger,
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Issue (or re-issue) a pairing code for `phone`
    ///
    /// Idempotent while a request for the same phone is pending and
    /// unexpired: the existing record is returned and nothing is logged.
    /// Concurrent requests for one phone share a single issuer call. The
    /// pending map is never locked while the issuer is awaited.
    pub async fn request_code(
        &self,
        phone: &str,
        issuer: &dyn CodeIssuer,
    ) -> Result<PendingPairing> {
        let phone = phone::normalize(phone)?;
        if issuer.is_connected() {
            return Err(LinkError::AlreadyConnected);
        }

        if let Some(existing) = self.live_record(&phone).await {
            return Ok(existing);
        }

        let gate = self
            .in_flight
            .lock()
            .await
            .entry(phone.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _turn = gate.lock().await;
            self.issue(&phone, issuer).await
        };
        self.release_gate(&phone, gate).await;
        result
    }

    /// Unexpired record for `phone`; an expired one is logged and dropped
    async fn live_record(&self, phone: &str) -> Option<PendingPairing> {
        let mut pending = self.pending.lock().await;
        let existing = pending.get(phone)?;
        if !existing.is_expired_at(Utc::now()) {
            return Some(existing.clone());
        }
        pending.remove(phone);
        self.logger
            .record_pairing(phone, PairingEvent::Expired, serde_json::Value::Null);
        None
    }

    /// Call the issuer for `phone` while holding its gate
    async fn issue(&self, phone: &str, issuer: &dyn CodeIssuer) -> Result<PendingPairing> {
        // A request queued on the gate may find the winner's record
        if let Some(existing) = self.live_record(phone).await {
            return Ok(existing);
        }

        self.logger
            .record_pairing(phone, PairingEvent::Requested, serde_json::Value::Null);

        let code = match issuer.issue_code(phone).await {
            Ok(code) => code,
            Err(e) => {
                let message = phone::redact(&e.to_string(), phone);
                tracing::warn!(
                    phone = %phone::mask(phone),
                    error = %message,
                    "Pairing code request failed"
                );
                self.logger.record_pairing(
                    phone,
                    PairingEvent::Failed,
                    serde_json::json!({ "reason": e.code(), "message": &message }),
                );
                self.logger
                    .record_error(ErrorRecord::new("pairing", message).with_code(e.code()));
                return Err(e);
            }
        };

        let record = PendingPairing::new(phone.to_string(), code, self.ttl);
        self.logger.record_pairing(
            phone,
            PairingEvent::CodeGenerated,
            serde_json::json!({ "code": mask_code(&record.code), "expiresAt": record.expires_at }),
        );
        tracing::info!(
            phone = %phone::mask(phone),
            expires_at = %record.expires_at,
            "Pairing code issued"
        );

        self.pending
            .lock()
            .await
            .insert(phone.to_string(), record.clone());
        Ok(record)
    }

    /// Forget the gate for `phone` once nobody else holds it
    async fn release_gate(&self, phone: &str, gate: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // One reference in the map, one here
        if Arc::strong_count(&gate) <= 2 {
            in_flight.remove(phone);
        }
    }

    /// Resolve the pending request for `phone` after its connection opened
    pub async fn complete_pairing(&self, phone: &str) -> Option<PendingPairing> {
        let mut record = self.pending.lock().await.remove(phone)?;
        record.status = PairingStatus::Completed;

        self.logger.record_pairing(
            phone,
            PairingEvent::Success,
            serde_json::json!({ "completedAt": Utc::now() }),
        );
        tracing::info!(phone = %phone::mask(phone), "Pairing completed");
        Some(record)
    }

    /// Drop the pending request for `phone` as failed
    pub async fn fail_pairing(&self, phone: &str, reason: &str) -> Option<PendingPairing> {
        let mut record = self.pending.lock().await.remove(phone)?;
        record.status = PairingStatus::Failed;

        self.logger.record_pairing(
            phone,
            PairingEvent::Failed,
            serde_json::json!({ "reason": reason }),
        );
        tracing::info!(phone = %phone::mask(phone), reason, "Pairing failed");
        Some(record)
    }

    /// Fail every pending request (their codes died with the connection)
    pub async fn fail_all(&self, reason: &str) -> usize {
        let phones: Vec<String> = self.pending.lock().await.keys().cloned().collect();
        let mut failed = 0;
        for phone in phones {
            if self.fail_pairing(&phone, reason).await.is_some() {
                failed += 1;
            }
        }
        failed
    }

    /// Remove requests past their expiry
    pub async fn expire_stale(&self) -> Vec<PendingPairing> {
        self.expire_stale_at(Utc::now()).await
    }

    /// Remove requests expired at `now`
    pub async fn expire_stale_at(&self, now: DateTime<Utc>) -> Vec<PendingPairing> {
        let mut pending = self.pending.lock().await;
        let stale: Vec<String> = pending
            .values()
            .filter(|p| p.is_expired_at(now))
            .map(|p| p.phone.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for phone in stale {
            if let Some(mut record) = pending.remove(&phone) {
                record.status = PairingStatus::Expired;
                self.logger
                    .record_pairing(&phone, PairingEvent::Expired, serde_json::Value::Null);
                expired.push(record);
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired pending pairing requests");
        }
        expired
    }

    pub async fn get(&self, phone: &str) -> Option<PendingPairing> {
        self.pending.lock().await.get(phone).cloned()
    }

    /// All pending requests, oldest first
    pub async fn pending(&self) -> Vec<PendingPairing> {
        let mut list: Vec<PendingPairing> = self.pending.lock().await.values().cloned().collect();
        list.sort_by_key(|p| p.requested_at);
        list
    }

    /// Most recently issued code still waiting
    pub async fn latest_code(&self) -> Option<String> {
        self.pending
            .lock()
            .await
            .values()
            .filter(|p| p.status == PairingStatus::Waiting)
            .max_by_key(|p| p.requested_at)
            .map(|p| p.code.clone())
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

fn mask_code(code: &str) -> String {
    let head: String = code.chars().take(4).collect();
    format!("{}****", head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeIssuer {
        connected: AtomicBool,
        fail: AtomicBool,
        issued: AtomicU32,
    }

    #[async_trait]
    impl CodeIssuer for FakeIssuer {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn issue_code(&self, _phone: &str) -> Result<String> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LinkError::Protocol("rate limited".to_string()));
            }
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("CODE{:04}", n))
        }
    }

    /// Answers only once released
    #[derive(Default)]
    struct GatedIssuer {
        release: tokio::sync::Notify,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CodeIssuer for GatedIssuer {
        fn is_connected(&self) -> bool {
            false
        }

        async fn issue_code(&self, _phone: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok("GATE0001".to_string())
        }
    }

    struct RejectingIssuer;

    #[async_trait]
    impl CodeIssuer for RejectingIssuer {
        fn is_connected(&self) -> bool {
            false
        }

        async fn issue_code(&self, phone: &str) -> Result<String> {
            Err(LinkError::Protocol(format!("pairing rejected for {}", phone)))
        }
    }

    async fn wait_for_call(issuer: &GatedIssuer) {
        while issuer.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    }

    fn coordinator() -> (Arc<EventLogger>, PairingCoordinator) {
        let logger = Arc::new(EventLogger::in_memory());
        let coordinator = PairingCoordinator::new(chrono::Duration::seconds(60), logger.clone());
        (logger, coordinator)
    }

    #[tokio::test]
    async fn test_request_code_stores_pending() {
        let (logger, coordinator) = coordinator();
        let issuer = FakeIssuer::default();

        let pending = coordinator.request_code("+1 555 123 4567", &issuer).await.unwrap();
        assert_eq!(pending.phone, "15551234567");
        assert_eq!(pending.code, "CODE0001");
        assert_eq!(pending.expires_at - pending.requested_at, chrono::Duration::seconds(60));
        assert_eq!(coordinator.len().await, 1);

        assert_eq!(logger.pairing().recent(10, Some("requested")).len(), 1);
        let generated = logger.pairing().recent(10, Some("code_generated"));
        assert_eq!(generated.len(), 1);
        assert_eq!(generated[0].record.details["code"], "CODE****");
    }

    #[tokio::test]
    async fn test_request_code_idempotent() {
        let (logger, coordinator) = coordinator();
        let issuer = FakeIssuer::default();

        let first = coordinator.request_code("15551234567", &issuer).await.unwrap();
        let second = coordinator.request_code("15551234567", &issuer).await.unwrap();

        assert_eq!(first.code, second.code);
        assert_eq!(issuer.issued.load(Ordering::SeqCst), 1);
        assert_eq!(logger.pairing().recent(10, Some("requested")).len(), 1);
        assert_eq!(coordinator.len().await, 1);
    }

    #[tokio::test]
    async fn test_request_code_rejects_invalid_phone() {
        let (logger, coordinator) = coordinator();
        let issuer = FakeIssuer::default();

        let err = coordinator.request_code("not-a-phone", &issuer).await.unwrap_err();
        assert!(matches!(err, LinkError::InvalidPhone(_)));
        assert!(logger.pairing().is_empty());
    }

    #[tokio::test]
    async fn test_request_code_rejects_when_connected() {
        let (_, coordinator) = coordinator();
        let issuer = FakeIssuer::default();
        issuer.connected.store(true, Ordering::SeqCst);

        let err = coordinator.request_code("15551234567", &issuer).await.unwrap_err();
        assert!(matches!(err, LinkError::AlreadyConnected));
        assert!(coordinator.is_empty().await);
    }

    #[tokio::test]
    async fn test_issuer_failure_logged_and_not_stored() {
        let (logger, coordinator) = coordinator();
        let issuer = FakeIssuer::default();
        issuer.fail.store(true, Ordering::SeqCst);

        let err = coordinator.request_code("15551234567", &issuer).await.unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));
        assert!(coordinator.is_empty().await);
        assert_eq!(logger.pairing().recent(10, Some("failed")).len(), 1);
        assert_eq!(logger.errors().recent(10, Some("pairing")).len(), 1);
    }

    #[tokio::test]
    async fn test_complete_pairing() {
        let (logger, coordinator) = coordinator();
        let issuer = FakeIssuer::default();
        coordinator.request_code("15551234567", &issuer).await.unwrap();

        let completed = coordinator.complete_pairing("15551234567").await.unwrap();
        assert_eq!(completed.status, PairingStatus::Completed);
        assert!(coordinator.is_empty().await);
        assert_eq!(logger.pairing().recent(10, Some("success")).len(), 1);

        // Nothing pending: no spurious success entry
        assert!(coordinator.complete_pairing("15551234567").await.is_none());
        assert_eq!(logger.pairing().recent(10, Some("success")).len(), 1);
    }

    #[tokio::test]
    async fn test_fail_pairing() {
        let (logger, coordinator) = coordinator();
        let issuer = FakeIssuer::default();
        coordinator.request_code("15551234567", &issuer).await.unwrap();

        let failed = coordinator.fail_pairing("15551234567", "logged_out").await.unwrap();
        assert_eq!(failed.status, PairingStatus::Failed);
        assert!(coordinator.is_empty().await);

        let entries = logger.pairing().recent(1, Some("failed"));
        assert_eq!(entries[0].record.details["reason"], "logged_out");
    }

    #[tokio::test]
    async fn test_expire_stale_unblocks_new_request() {
        let (logger, coordinator) = coordinator();
        let issuer = FakeIssuer::default();
        let first = coordinator.request_code("15551234567", &issuer).await.unwrap();

        // Not yet expired
        assert!(coordinator.expire_stale().await.is_empty());

        let later = first.expires_at + chrono::Duration::seconds(1);
        let expired = coordinator.expire_stale_at(later).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, PairingStatus::Expired);
        assert!(coordinator.is_empty().await);
        assert_eq!(logger.pairing().recent(10, Some("expired")).len(), 1);

        let second = coordinator.request_code("15551234567", &issuer).await.unwrap();
        assert_ne!(second.code, first.code);
    }

    #[tokio::test]
    async fn test_one_pending_per_phone() {
        let (_, coordinator) = coordinator();
        let issuer = FakeIssuer::default();

        for _ in 0..3 {
            coordinator.request_code("15551234567", &issuer).await.unwrap();
            coordinator.request_code("15557654321", &issuer).await.unwrap();
        }

        let pending = coordinator.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].phone, "15551234567");
    }

    #[tokio::test]
    async fn test_latest_code_and_fail_all() {
        let (_, coordinator) = coordinator();
        let issuer = FakeIssuer::default();
        assert!(coordinator.latest_code().await.is_none());

        coordinator.request_code("15551234567", &issuer).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        coordinator.request_code("15557654321", &issuer).await.unwrap();
        assert_eq!(coordinator.latest_code().await.as_deref(), Some("CODE0002"));

        assert_eq!(coordinator.fail_all("shutdown").await, 2);
        assert!(coordinator.is_empty().await);
    }

    #[tokio::test]
    async fn test_slow_issuer_does_not_block_other_operations() {
        let (_, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);
        coordinator
            .request_code("15557654321", &FakeIssuer::default())
            .await
            .unwrap();

        let issuer = Arc::new(GatedIssuer::default());
        let task = {
            let coordinator = coordinator.clone();
            let issuer = issuer.clone();
            tokio::spawn(async move {
                coordinator
                    .request_code("15551234567", &*issuer)
                    .await
            })
        };
        wait_for_call(&issuer).await;

        let quick = std::time::Duration::from_secs(1);
        let latest = tokio::time::timeout(quick, coordinator.latest_code()).await.unwrap();
        assert_eq!(latest.as_deref(), Some("CODE0001"));
        let completed = tokio::time::timeout(quick, coordinator.complete_pairing("15557654321"))
            .await
            .unwrap();
        assert!(completed.is_some());
        let failed = tokio::time::timeout(quick, coordinator.fail_all("logged_out"))
            .await
            .unwrap();
        assert_eq!(failed, 0);

        issuer.release.notify_one();
        let record = task.await.unwrap().unwrap();
        assert_eq!(record.code, "GATE0001");
        assert_eq!(coordinator.get("15551234567").await.unwrap().code, "GATE0001");
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_issuer_call() {
        let (logger, coordinator) = coordinator();
        let coordinator = Arc::new(coordinator);
        let issuer = Arc::new(GatedIssuer::default());

        let spawn_request = || {
            let coordinator = coordinator.clone();
            let issuer = issuer.clone();
            tokio::spawn(async move {
                coordinator
                    .request_code("15551234567", &*issuer)
                    .await
            })
        };
        let first = spawn_request();
        let second = spawn_request();
        wait_for_call(&issuer).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        issuer.release.notify_one();
        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();

        assert_eq!(a.code, b.code);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(logger.pairing().recent(10, Some("requested")).len(), 1);
        assert!(coordinator.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_logs_mask_phone_in_error_text() {
        let (logger, coordinator) = coordinator();

        let err = coordinator
            .request_code("15551234567", &RejectingIssuer)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));

        let failed = logger.pairing().recent(1, Some("failed"));
        assert_eq!(failed[0].record.details["reason"], "protocol");
        assert_eq!(
            failed[0].record.details["message"],
            "Protocol error: pairing rejected for ***4567"
        );

        let pairing_log = serde_json::to_string(&logger.pairing().recent(10, None)).unwrap();
        assert!(!pairing_log.contains("15551234567"));
        let error_log = serde_json::to_string(&logger.errors().recent(10, None)).unwrap();
        assert!(!error_log.contains("15551234567"));
        assert!(error_log.contains("***4567"));
    }
}
