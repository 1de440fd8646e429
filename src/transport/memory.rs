//! In-process transport for testing and single-process use
//!
//! Every `open` yields a `MemoryConnection` on the test side through
//! `next_connection`, which drives the connection by emitting the events a
//! real protocol library would.

use super::{Connection, DisconnectReason, InboundMessage, Link, Transport, TransportEvent};
use crate::credentials::Credentials;
use crate::error::{LinkError, Result};
use crate::types::SessionMetadata;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Scriptable in-memory transport
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    opened_tx: mpsc::UnboundedSender<MemoryConnection>,
    opened_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    fail_opens: AtomicU32,
    open_count: AtomicU64,
    code_seq: Arc<AtomicU32>,
    reject_pairing: Arc<AtomicBool>,
    hold_pairing: Arc<AtomicBool>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                opened_tx,
                opened_rx: tokio::sync::Mutex::new(opened_rx),
                fail_opens: AtomicU32::new(0),
                open_count: AtomicU64::new(0),
                code_seq: Arc::new(AtomicU32::new(0)),
                reject_pairing: Arc::new(AtomicBool::new(false)),
                hold_pairing: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Make the next `n` calls to `open` fail
    pub fn fail_next_opens(&self, n: u32) {
        self.inner.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Reject every pairing-code request
    pub fn reject_pairing(&self, reject: bool) {
        self.inner.reject_pairing.store(reject, Ordering::SeqCst);
    }

    /// Leave every pairing-code request unanswered
    pub fn hold_pairing(&self, hold: bool) {
        self.inner.hold_pairing.store(hold, Ordering::SeqCst);
    }

    /// Number of successful opens so far
    pub fn open_count(&self) -> u64 {
        self.inner.open_count.load(Ordering::SeqCst)
    }

    /// Wait for the next opened connection
    pub async fn next_connection(&self) -> Option<MemoryConnection> {
        self.inner.opened_rx.lock().await.recv().await
    }

    /// Next opened connection if one is already queued
    pub async fn try_next_connection(&self) -> Option<MemoryConnection> {
        self.inner.opened_rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, credentials: &Credentials) -> Result<Connection> {
        let failing = self
            .inner
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LinkError::Transport("simulated open failure".to_string()));
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let link = Arc::new(MemoryLink {
            closed: AtomicBool::new(false),
            events: Mutex::new(Some(events_tx.clone())),
            requests: Mutex::new(Vec::new()),
            code_seq: self.inner.code_seq.clone(),
            reject: self.inner.reject_pairing.clone(),
            hold: self.inner.hold_pairing.clone(),
        });

        let id = self.inner.open_count.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = MemoryConnection {
            id,
            events: events_tx,
            link: link.clone(),
            credentials: credentials.clone(),
        };
        // The test side may not be listening; that's fine
        let _ = self.inner.opened_tx.send(handle);

        Ok(Connection {
            link,
            events: events_rx,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryLink {
    closed: AtomicBool,
    /// Keeps the event stream open until the link is closed
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    requests: Mutex<Vec<String>>,
    code_seq: Arc<AtomicU32>,
    reject: Arc<AtomicBool>,
    hold: Arc<AtomicBool>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn request_pairing_code(&self, phone: &str) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Protocol("connection closed".to_string()));
        }
        if self.reject.load(Ordering::SeqCst) {
            return Err(LinkError::Protocol(format!("pairing rejected for {}", phone)));
        }
        if self.hold.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(phone.to_string());
        let n = self.code_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("LINK{:04}", n))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Test-side handle to an opened memory connection
pub struct MemoryConnection {
    id: u64,
    events: mpsc::Sender<TransportEvent>,
    link: Arc<MemoryLink>,
    credentials: Credentials,
}

impl MemoryConnection {
    /// 1-based open sequence number
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Credentials the connection was opened with
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Whether the controller closed this connection
    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }

    /// Phones a pairing code was requested for
    pub fn pairing_requests(&self) -> Vec<String> {
        self.link
            .requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Emit "open" for `identity`
    pub async fn open(&self, identity: &str) {
        self.open_with(identity, SessionMetadata::default()).await;
    }

    pub async fn open_with(&self, identity: &str, metadata: SessionMetadata) {
        self.emit(TransportEvent::Open {
            identity: identity.to_string(),
            metadata,
        })
        .await;
    }

    /// Emit "close"
    pub async fn close(&self, reason: DisconnectReason) {
        self.emit(TransportEvent::Close { reason }).await;
    }

    pub async fn update_credentials(&self, credentials: Credentials) {
        self.emit(TransportEvent::CredentialsUpdated(credentials)).await;
    }

    pub async fn message(&self, sender: &str, payload: serde_json::Value) {
        self.emit(TransportEvent::Message(InboundMessage {
            sender: sender.to_string(),
            payload,
        }))
        .await;
    }

    /// Deliver a raw event; ignored once the controller stopped listening
    pub async fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_yields_connection() {
        let transport = MemoryTransport::new();
        let mut conn = transport.open(&Credentials::default()).await.unwrap();
        let handle = transport.next_connection().await.unwrap();
        assert_eq!(handle.id(), 1);
        assert_eq!(transport.open_count(), 1);

        handle.open("15551234567@s.whatsapp.net").await;
        match conn.events.recv().await.unwrap() {
            TransportEvent::Open { identity, .. } => {
                assert_eq!(identity, "15551234567@s.whatsapp.net")
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_next_opens() {
        let transport = MemoryTransport::new();
        transport.fail_next_opens(2);
        assert!(transport.open(&Credentials::default()).await.is_err());
        assert!(transport.open(&Credentials::default()).await.is_err());
        assert!(transport.open(&Credentials::default()).await.is_ok());
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_pairing_codes() {
        let transport = MemoryTransport::new();
        let conn = transport.open(&Credentials::default()).await.unwrap();
        let handle = transport.next_connection().await.unwrap();

        assert_eq!(conn.link.request_pairing_code("15551234567").await.unwrap(), "LINK0001");
        assert_eq!(handle.pairing_requests(), vec!["15551234567".to_string()]);

        transport.reject_pairing(true);
        assert!(matches!(
            conn.link.request_pairing_code("15551234567").await,
            Err(LinkError::Protocol(_))
        ));

        transport.reject_pairing(false);
        conn.link.close().await;
        assert!(handle.is_closed());
        assert!(conn.link.request_pairing_code("15551234567").await.is_err());
    }
}
