//! Connection state machine
//!
//! Pure transition logic: `handle` takes one input and returns the effects
//! the controller must run, in order. No I/O happens here, so every
//! lifecycle rule is testable without a runtime.
//!
//! Each connection attempt carries a generation number. Inputs tagged with
//! an older generation come from a superseded connection or a cancelled
//! timer and are dropped.

use crate::backoff::BackoffPolicy;
use crate::credentials::Credentials;
use crate::phone;
use crate::transport::{DisconnectReason, InboundMessage, TransportEvent};
use crate::types::SessionMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt
    DisconnectedRetrying,
    /// Logged out; credentials dropped, a fresh unregistered connection follows
    DisconnectedTerminal,
    /// Too many consecutive failures; only `Reset` leaves this state
    RetryExhausted,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::DisconnectedRetrying => "disconnected_retrying",
            ConnectionState::DisconnectedTerminal => "disconnected_terminal",
            ConnectionState::RetryExhausted => "retry_exhausted",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the machine
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Begin connecting
    Start { has_credentials: bool },
    /// Event from the connection opened for `generation`
    Transport { generation: u64, event: TransportEvent },
    /// Opening the connection for `generation` failed
    OpenFailed { generation: u64, error: String },
    /// Backoff timer for `generation` fired
    RetryElapsed { generation: u64 },
    /// Forget credentials and session, start over unregistered
    Reset,
    Shutdown,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Transition {
        from: ConnectionState,
        to: ConnectionState,
        reason: String,
    },
    /// Open a new connection tagged with `generation`
    Connect { generation: u64 },
    /// Send `RetryElapsed { generation }` after `delay`
    ScheduleConnect {
        generation: u64,
        delay: Duration,
        attempt: u32,
    },
    CancelRetry,
    /// Close the current connection, if any
    CloseLink,
    MarkConnecting,
    RegisterSession {
        phone: String,
        metadata: SessionMetadata,
    },
    ResolvePairing { phone: String },
    RecordReconnectAttempt,
    ResetReconnectAttempts,
    DisconnectSession {
        reason: String,
        should_reconnect: bool,
    },
    PersistCredentials(Credentials),
    ClearCredentials,
    FailPendingPairings { reason: String },
    TouchActivity,
    Deliver(InboundMessage),
    RetryExhausted { attempts: u32 },
    /// Input from a superseded generation was ignored
    DropStale { generation: u64 },
}

/// Read-only view of the machine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineSnapshot {
    pub state: ConnectionState,
    pub generation: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub registered: bool,
    pub phone: Option<String>,
}

/// The connection lifecycle
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    generation: u64,
    attempts: u32,
    registered: bool,
    phone: Option<String>,
    backoff: BackoffPolicy,
    logout_delay: Duration,
}

impl ConnectionMachine {
    pub fn new(backoff: BackoffPolicy, logout_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Idle,
            generation: 0,
            attempts: 0,
            registered: false,
            phone: None,
            backoff,
            logout_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            state: self.state,
            generation: self.generation,
            attempts: self.attempts,
            max_attempts: self.backoff.max_attempts(),
            registered: self.registered,
            phone: self.phone.clone(),
        }
    }

    /// Apply one input
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Start { has_credentials } => self.on_start(has_credentials),
            Input::Transport { generation, event } => {
                if generation != self.generation {
                    return vec![Effect::DropStale { generation }];
                }
                self.on_transport(event)
            }
            Input::OpenFailed { generation, error } => {
                if generation != self.generation || self.state != ConnectionState::Connecting {
                    return vec![Effect::DropStale { generation }];
                }
                self.on_failure("open_failed", error)
            }
            Input::RetryElapsed { generation } => {
                if generation != self.generation {
                    return vec![Effect::DropStale { generation }];
                }
                self.on_retry_elapsed()
            }
            Input::Reset => self.on_reset(),
            Input::Shutdown => self.on_shutdown(),
        }
    }

    fn on_start(&mut self, has_credentials: bool) -> Vec<Effect> {
        if self.state != ConnectionState::Idle {
            return Vec::new();
        }
        self.registered = has_credentials;
        self.generation += 1;

        let mut effects = vec![self.transition(ConnectionState::Connecting, "start")];
        effects.push(Effect::MarkConnecting);
        effects.push(Effect::Connect {
            generation: self.generation,
        });
        effects
    }

    fn on_transport(&mut self, event: TransportEvent) -> Vec<Effect> {
        match event {
            TransportEvent::Open { identity, metadata } => self.on_open(identity, metadata),
            TransportEvent::Close { reason } if reason.is_terminal() => self.on_logged_out(reason),
            TransportEvent::Close { reason } => {
                let detail = reason.to_string();
                self.on_failure(&detail, detail.clone())
            }
            TransportEvent::CredentialsUpdated(creds) => {
                self.registered = creds.registered;
                vec![Effect::PersistCredentials(creds)]
            }
            TransportEvent::Message(message) => {
                vec![Effect::TouchActivity, Effect::Deliver(message)]
            }
        }
    }

    fn on_open(&mut self, identity: String, metadata: SessionMetadata) -> Vec<Effect> {
        let phone = phone::from_identity(&identity);
        let mut effects = Vec::new();

        match self.state {
            ConnectionState::Connecting => {
                effects.push(self.transition(ConnectionState::Connected, "open"));
            }
            // Duplicate open on a live connection refreshes the session
            ConnectionState::Connected => {}
            _ => return vec![Effect::DropStale {
                generation: self.generation,
            }],
        }

        self.attempts = 0;
        self.registered = true;
        self.phone = Some(phone.clone());

        effects.push(Effect::RegisterSession {
            phone: phone.clone(),
            metadata,
        });
        effects.push(Effect::ResetReconnectAttempts);
        effects.push(Effect::ResolvePairing { phone });
        effects
    }

    fn on_logged_out(&mut self, reason: DisconnectReason) -> Vec<Effect> {
        let reason = reason.to_string();
        self.attempts = 0;
        self.registered = false;
        self.phone = None;
        self.generation += 1;

        vec![
            self.transition(ConnectionState::DisconnectedTerminal, &reason),
            Effect::CloseLink,
            Effect::DisconnectSession {
                reason: reason.clone(),
                should_reconnect: false,
            },
            Effect::ResetReconnectAttempts,
            Effect::ClearCredentials,
            Effect::FailPendingPairings { reason },
            Effect::ScheduleConnect {
                generation: self.generation,
                delay: self.logout_delay,
                attempt: 0,
            },
        ]
    }

    fn on_failure(&mut self, reason: &str, detail: String) -> Vec<Effect> {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return vec![Effect::DropStale {
                generation: self.generation,
            }];
        }

        self.attempts += 1;
        self.generation += 1;

        let mut effects = Vec::new();
        if self.backoff.is_exhausted(self.attempts) {
            effects.push(self.transition(ConnectionState::RetryExhausted, reason));
            effects.push(Effect::CloseLink);
            effects.push(Effect::DisconnectSession {
                reason: detail,
                should_reconnect: true,
            });
            effects.push(Effect::RecordReconnectAttempt);
            effects.push(Effect::RetryExhausted {
                attempts: self.attempts,
            });
            effects.push(Effect::FailPendingPairings {
                reason: "retry_exhausted".to_string(),
            });
            return effects;
        }

        effects.push(self.transition(ConnectionState::DisconnectedRetrying, reason));
        effects.push(Effect::CloseLink);
        effects.push(Effect::DisconnectSession {
            reason: detail,
            should_reconnect: true,
        });
        effects.push(Effect::RecordReconnectAttempt);
        effects.push(Effect::ScheduleConnect {
            generation: self.generation,
            delay: self.backoff.delay(self.attempts),
            attempt: self.attempts,
        });
        effects
    }

    fn on_retry_elapsed(&mut self) -> Vec<Effect> {
        if !matches!(
            self.state,
            ConnectionState::DisconnectedRetrying | ConnectionState::DisconnectedTerminal
        ) {
            return Vec::new();
        }

        vec![
            self.transition(ConnectionState::Connecting, "retry"),
            Effect::MarkConnecting,
            Effect::Connect {
                generation: self.generation,
            },
        ]
    }

    fn on_reset(&mut self) -> Vec<Effect> {
        self.attempts = 0;
        self.registered = false;
        self.phone = None;
        self.generation += 1;

        vec![
            self.transition(ConnectionState::Connecting, "reset"),
            Effect::CancelRetry,
            Effect::CloseLink,
            Effect::DisconnectSession {
                reason: "reset".to_string(),
                should_reconnect: false,
            },
            Effect::ResetReconnectAttempts,
            Effect::ClearCredentials,
            Effect::FailPendingPairings {
                reason: "reset".to_string(),
            },
            Effect::Connect {
                generation: self.generation,
            },
        ]
    }

    fn on_shutdown(&mut self) -> Vec<Effect> {
        if self.state == ConnectionState::Idle {
            return Vec::new();
        }
        self.generation += 1;
        let was_connected = self.state == ConnectionState::Connected;

        let mut effects = vec![
            self.transition(ConnectionState::Idle, "shutdown"),
            Effect::CancelRetry,
            Effect::CloseLink,
            Effect::FailPendingPairings {
                reason: "shutdown".to_string(),
            },
        ];
        if was_connected {
            // Credentials stay valid; the session resumes on next start
            effects.push(Effect::DisconnectSession {
                reason: "shutdown".to_string(),
                should_reconnect: true,
            });
        }
        effects
    }

    fn transition(&mut self, to: ConnectionState, reason: &str) -> Effect {
        let from = self.state;
        self.state = to;
        Effect::Transition {
            from,
            to,
            reason: reason.to_string(),
        }
    }
}
