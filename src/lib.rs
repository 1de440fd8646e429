//! # a3s-link
//!
//! Session and connection lifecycle management for a long-lived client
//! linked to a remote messaging network.
//!
//! ## Overview
//!
//! `a3s-link` owns everything stateful about staying linked: durable
//! credentials, the connect/disconnect/retry state machine, device-pairing
//! codes, the session registry, background cleanup, and four structured
//! audit logs. The wire protocol is supplied by a `Transport`; message
//! handling is delegated to a `CommandRouter`.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_link::{LinkConfig, LinkService, MemoryBackend, MemoryTransport, NoopRouter};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_link::Result<()> {
//! let transport = MemoryTransport::new();
//! let service = LinkService::with_backend(
//!     LinkConfig::default(),
//!     &MemoryBackend::new(),
//!     Arc::new(transport.clone()),
//!     Arc::new(NoopRouter),
//! )?;
//! service.start()?;
//!
//! // No stored credentials: the service waits for pairing
//! let status = service.status().await;
//! println!("{}", status.description);
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ConnectionMachine**: pure transition logic, one input in, effects out
//! - **ConnectionController**: serial run loop executing machine effects
//! - **PairingCoordinator**: one pending pairing code per phone
//! - **SessionRegistry**: active session plus bounded history
//! - **CredentialStore**: atomic persistence of the linked device's keys
//! - **EventLogger**: error, activity, session and pairing logs
//! - **CleanupScheduler**: periodic expiry and temp/cache sweeps

pub mod backoff;
pub mod cleanup;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod log;
pub mod machine;
pub mod pairing;
pub mod phone;
pub mod registry;
pub mod service;
pub mod state;
pub mod transport;
pub mod types;

// Re-export core types
pub use backoff::BackoffPolicy;
pub use cleanup::{CleanupScheduler, SweepKind, SweepReport};
pub use config::{BackoffConfig, CleanupConfig, LinkConfig, LogConfig, PairingConfig};
pub use controller::{
    ConnectionController, ControllerEvent, ControllerParts, LinkStatus, StatusKind,
};
pub use credentials::{CredentialStore, Credentials};
pub use error::{LinkError, Result};
pub use log::{
    ActivityRecord, ErrorRecord, EventLog, EventLogger, LogEntry, PairingEvent, PairingRecord,
    SessionRecord,
};
pub use machine::{ConnectionMachine, ConnectionState, Effect, Input, MachineSnapshot};
pub use pairing::{CodeIssuer, PairingCoordinator};
pub use registry::{SessionRegistry, SessionStats};
pub use service::LinkService;
pub use state::{Document, FileBackend, MemoryBackend, StateBackend, StateStore};
pub use transport::{
    CommandRouter, Connection, DisconnectReason, InboundMessage, Link, NoopRouter, Transport,
    TransportEvent,
};
pub use types::{PairingStatus, PendingPairing, Session, SessionMetadata, SessionStatus};

// Re-export the in-process transport for convenience
pub use transport::memory::{MemoryConnection, MemoryTransport};
