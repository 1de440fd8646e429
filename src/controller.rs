//! Connection controller
//!
//! Owns the single live connection. One run-loop task reads every input
//! (tagged transport events, open failures, timer expiries, operator
//! commands) from an mpsc inbox, feeds it to the `ConnectionMachine`, and
//! executes the resulting effects against the registry, credential store,
//! pairing coordinator and event logger.

use crate::credentials::CredentialStore;
use crate::error::{LinkError, Result};
use crate::log::{ActivityRecord, EventLogger, SessionRecord};
use crate::machine::{ConnectionMachine, ConnectionState, Effect, Input, MachineSnapshot};
use crate::pairing::{CodeIssuer, PairingCoordinator};
use crate::phone;
use crate::registry::SessionRegistry;
use crate::transport::{
    CommandRouter, Connection, DisconnectReason, Link, Transport, TransportEvent,
};
use crate::types::PendingPairing;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Observable controller activity
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Transition {
        from: ConnectionState,
        to: ConnectionState,
        reason: String,
    },
    ReconnectScheduled { attempt: u32, delay: Duration },
    Connected { phone: String },
    RetryExhausted { attempts: u32 },
    StaleEventDropped { generation: u64 },
}

/// Coarse status shown to operators and the pairing page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// No paired device; a pairing code can be requested
    Waiting,
    Connecting,
    Connected,
    Reconnecting,
    LoggedOut,
    RetryExhausted,
}

/// Read-only status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    pub status: StatusKind,
    pub state: ConnectionState,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Latest pairing code while waiting
    pub code: Option<String>,
    /// Masked phone of the connected account
    pub connected_number: Option<String>,
    pub description: String,
}

impl LinkStatus {
    fn from_snapshot(snapshot: MachineSnapshot, code: Option<String>) -> Self {
        let status = match snapshot.state {
            ConnectionState::Idle | ConnectionState::Connecting if !snapshot.registered => {
                StatusKind::Waiting
            }
            ConnectionState::Idle | ConnectionState::Connecting => StatusKind::Connecting,
            ConnectionState::Connected => StatusKind::Connected,
            ConnectionState::DisconnectedRetrying => StatusKind::Reconnecting,
            ConnectionState::DisconnectedTerminal => StatusKind::LoggedOut,
            ConnectionState::RetryExhausted => StatusKind::RetryExhausted,
        };

        let connected_number = match status {
            StatusKind::Connected => snapshot.phone.as_deref().map(phone::mask),
            _ => None,
        };
        let code = match status {
            StatusKind::Waiting => code,
            _ => None,
        };

        let description = match status {
            StatusKind::Waiting => match &code {
                Some(code) => format!("waiting for pairing (code {})", code),
                None => "waiting for pairing".to_string(),
            },
            StatusKind::Connecting => "connecting".to_string(),
            StatusKind::Connected => match &connected_number {
                Some(number) => format!("connected as {}", number),
                None => "connected".to_string(),
            },
            StatusKind::Reconnecting => format!(
                "reconnecting (attempt {}/{})",
                snapshot.attempts, snapshot.max_attempts
            ),
            StatusKind::LoggedOut => "logged out, preparing a new pairing".to_string(),
            StatusKind::RetryExhausted => format!(
                "gave up after {} attempts, reset required",
                snapshot.attempts
            ),
        };

        Self {
            status,
            state: snapshot.state,
            attempt: snapshot.attempts,
            max_attempts: snapshot.max_attempts,
            code,
            connected_number,
            description,
        }
    }
}

/// Collaborators the controller drives
pub struct ControllerParts {
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<CredentialStore>,
    pub registry: Arc<SessionRegistry>,
    pub pairing: Arc<PairingCoordinator>,
    pub logger: Arc<EventLogger>,
    pub router: Arc<dyn CommandRouter>,
}

/// Handle to the connection lifecycle
#[derive(Clone)]
pub struct ConnectionController {
    shared: Arc<Shared>,
}

struct Shared {
    machine: Mutex<ConnectionMachine>,
    link: Mutex<Option<(u64, Arc<dyn Link>)>>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    run_loop: Mutex<Option<JoinHandle<()>>>,
    inbox: mpsc::UnboundedSender<Input>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Input>>>,
    events: broadcast::Sender<ControllerEvent>,
    parts: ControllerParts,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionController {
    pub fn new(machine: ConnectionMachine, parts: ControllerParts) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                machine: Mutex::new(machine),
                link: Mutex::new(None),
                retry_timer: Mutex::new(None),
                forwarder: Mutex::new(None),
                run_loop: Mutex::new(None),
                inbox,
                inbox_rx: Mutex::new(Some(inbox_rx)),
                events,
                parts,
            }),
        }
    }

    /// Spawn the run loop and begin connecting
    ///
    /// Reuses stored credentials when the device is registered, otherwise
    /// opens an unregistered connection that waits for pairing.
    pub fn start(&self) -> Result<()> {
        let rx = lock(&self.shared.inbox_rx)
            .take()
            .ok_or_else(|| LinkError::Unavailable("controller already started".to_string()))?;

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { shared.run(rx).await });
        *lock(&self.shared.run_loop) = Some(handle);

        let has_credentials = self.shared.parts.credentials.has_credentials();
        tracing::info!(
            transport = self.shared.parts.transport.name(),
            has_credentials,
            "Connection controller started"
        );
        self.shared.send(Input::Start { has_credentials });
        Ok(())
    }

    /// Drop credentials and session, then connect fresh
    pub fn reset(&self) {
        tracing::warn!("Connection reset requested");
        self.shared.send(Input::Reset);
    }

    /// Stop the run loop, cancel timers and close the live connection
    pub async fn shutdown(&self) {
        self.shared.send(Input::Shutdown);
        let run_loop = lock(&self.shared.run_loop).take();
        if let Some(handle) = run_loop {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Controller run loop ended abnormally");
            }
        }

        // Never started, or the loop died: release whatever is left
        self.shared.cancel_retry();
        self.shared.close_link().await;
        tracing::info!("Connection controller stopped");
    }

    /// Request a pairing code for `phone`
    pub async fn request_code(&self, phone: &str) -> Result<PendingPairing> {
        self.shared
            .parts
            .pairing
            .request_code(phone, self.shared.as_ref())
            .await
    }

    pub async fn status(&self) -> LinkStatus {
        let snapshot = self.snapshot();
        let code = self.shared.parts.pairing.latest_code().await;
        LinkStatus::from_snapshot(snapshot, code)
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        lock(&self.shared.machine).snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.machine).state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Whether the run loop is alive
    pub fn is_running(&self) -> bool {
        lock(&self.shared.run_loop)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Abort the run loop, retry timer and event forwarder
    ///
    /// The link is left to drop with the controller. `shutdown` is the
    /// orderly path; this only releases tasks a dropped owner would leak.
    pub fn abort(&self) {
        if let Some(run_loop) = lock(&self.shared.run_loop).take() {
            run_loop.abort();
        }
        self.shared.cancel_retry();
        if let Some(forwarder) = lock(&self.shared.forwarder).take() {
            forwarder.abort();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }
}

#[async_trait]
impl CodeIssuer for Shared {
    fn is_connected(&self) -> bool {
        lock(&self.machine).state() == ConnectionState::Connected
    }

    async fn issue_code(&self, phone: &str) -> Result<String> {
        let link = lock(&self.link).as_ref().map(|(_, link)| link.clone());
        match link {
            Some(link) => link.request_pairing_code(phone).await,
            None => Err(LinkError::Unavailable(
                "no connection available for pairing".to_string(),
            )),
        }
    }
}

impl Shared {
    fn send(&self, input: Input) {
        if self.inbox.send(input).is_err() {
            tracing::debug!("Controller inbox closed, input dropped");
        }
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = rx.recv().await {
            let stop = matches!(input, Input::Shutdown);
            let effects = lock(&self.machine).handle(input);
            for effect in effects {
                self.apply(effect).await;
            }
            if stop {
                break;
            }
        }
    }

    async fn apply(self: &Arc<Self>, effect: Effect) {
        let parts = &self.parts;
        match effect {
            Effect::Transition { from, to, reason } => {
                parts
                    .logger
                    .record_session(SessionRecord::transition(from.as_str(), to.as_str(), &reason));
                self.emit(ControllerEvent::Transition { from, to, reason });
            }
            Effect::Connect { generation } => self.connect(generation),
            Effect::ScheduleConnect {
                generation,
                delay,
                attempt,
            } => self.schedule_connect(generation, delay, attempt),
            Effect::CancelRetry => self.cancel_retry(),
            Effect::CloseLink => self.close_link().await,
            Effect::MarkConnecting => parts.registry.mark_connecting(),
            Effect::RegisterSession { phone, metadata } => {
                parts.registry.register_session(&phone, metadata);
            }
            // Last effect of an open; observers see a fully handled connection
            Effect::ResolvePairing { phone } => {
                parts.pairing.complete_pairing(&phone).await;
                self.emit(ControllerEvent::Connected { phone });
            }
            Effect::RecordReconnectAttempt => {
                parts.registry.increment_reconnect_attempts();
            }
            Effect::ResetReconnectAttempts => parts.registry.reset_reconnect_attempts(),
            Effect::DisconnectSession {
                reason,
                should_reconnect,
            } => {
                parts.registry.disconnect_session(&reason, should_reconnect);
            }
            Effect::PersistCredentials(creds) => {
                if let Err(e) = parts.credentials.save(&creds) {
                    parts.logger.error("credentials", &e);
                }
            }
            Effect::ClearCredentials => {
                if let Err(e) = parts.credentials.clear() {
                    parts.logger.error("credentials", &e);
                }
            }
            Effect::FailPendingPairings { reason } => {
                parts.pairing.fail_all(&reason).await;
            }
            Effect::TouchActivity => {
                parts.registry.update_activity();
            }
            Effect::Deliver(message) => {
                parts.logger.activity().add(
                    ActivityRecord::new("message", serde_json::Value::Null)
                        .with_sender(&message.sender),
                );
                parts.router.route(message).await;
            }
            Effect::RetryExhausted { attempts } => {
                let error = LinkError::RetryExhausted { attempts };
                parts.logger.error("connection", &error);
                self.emit(ControllerEvent::RetryExhausted { attempts });
            }
            Effect::DropStale { generation } => {
                tracing::debug!(generation, "Dropped input from superseded connection");
                self.emit(ControllerEvent::StaleEventDropped { generation });
            }
        }
    }

    fn connect(self: &Arc<Self>, generation: u64) {
        let shared = self.clone();
        let credentials = self.parts.credentials.current();
        tokio::spawn(async move {
            match shared.parts.transport.open(&credentials).await {
                Ok(connection) => shared.attach(generation, connection).await,
                Err(e) => {
                    tracing::warn!(generation, error = %e, "Failed to open connection");
                    shared.parts.logger.error("transport", &e);
                    shared.send(Input::OpenFailed {
                        generation,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    async fn attach(self: &Arc<Self>, generation: u64, connection: Connection) {
        let Connection { link, events } = connection;
        let stale = {
            // Generation check and link install happen under the machine lock
            let machine = lock(&self.machine);
            if machine.generation() == generation {
                *lock(&self.link) = Some((generation, link.clone()));
                let forwarder = tokio::spawn(forward(self.inbox.clone(), generation, events));
                if let Some(previous) = lock(&self.forwarder).replace(forwarder) {
                    previous.abort();
                }
                false
            } else {
                true
            }
        };

        if stale {
            tracing::debug!(generation, "Closing connection opened for superseded attempt");
            link.close().await;
        } else {
            tracing::debug!(generation, "Connection attached");
        }
    }

    fn schedule_connect(&self, generation: u64, delay: Duration, attempt: u32) {
        let inbox = self.inbox.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(Input::RetryElapsed { generation });
        });
        if let Some(previous) = lock(&self.retry_timer).replace(timer) {
            previous.abort();
        }

        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.parts.logger.record_session(
            SessionRecord::event("reconnect_scheduled").with_details(serde_json::json!({
                "attempt": attempt,
                "delayMs": delay.as_millis() as u64,
            })),
        );
        self.emit(ControllerEvent::ReconnectScheduled { attempt, delay });
    }

    fn cancel_retry(&self) {
        if let Some(timer) = lock(&self.retry_timer).take() {
            timer.abort();
        }
    }

    async fn close_link(&self) {
        if let Some(forwarder) = lock(&self.forwarder).take() {
            forwarder.abort();
        }
        let link = lock(&self.link).take();
        if let Some((generation, link)) = link {
            tracing::debug!(generation, "Closing connection");
            link.close().await;
        }
    }
}

/// Pump one connection's events into the inbox, tagged with its generation
///
/// A stream that ends without a close is reported as a lost connection.
async fn forward(
    inbox: mpsc::UnboundedSender<Input>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let is_close = matches!(event, TransportEvent::Close { .. });
        if inbox.send(Input::Transport { generation, event }).is_err() || is_close {
            return;
        }
    }

    let _ = inbox.send(Input::Transport {
        generation,
        event: TransportEvent::Close {
            reason: DisconnectReason::ConnectionLost,
        },
    });
}
