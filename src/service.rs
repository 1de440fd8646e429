//! Link service
//!
//! Wires the lifecycle components together from a `LinkConfig` and owns
//! their startup and shutdown. This is the surface an HTTP pairing page or
//! a bot process holds on to.

use crate::cleanup::CleanupScheduler;
use crate::config::LinkConfig;
use crate::controller::{ConnectionController, ControllerParts, LinkStatus};
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::log::EventLogger;
use crate::machine::ConnectionMachine;
use crate::pairing::PairingCoordinator;
use crate::registry::SessionRegistry;
use crate::state::{FileBackend, StateBackend};
use crate::transport::{CommandRouter, Transport};
use crate::types::PendingPairing;
use std::sync::Arc;

/// The assembled session and connection lifecycle manager
pub struct LinkService {
    config: LinkConfig,
    logger: Arc<EventLogger>,
    credentials: Arc<CredentialStore>,
    registry: Arc<SessionRegistry>,
    pairing: Arc<PairingCoordinator>,
    controller: ConnectionController,
    cleanup: CleanupScheduler,
}

impl LinkService {
    /// Build a service persisting to files under `config.data_dir`
    pub fn open(
        config: LinkConfig,
        transport: Arc<dyn Transport>,
        router: Arc<dyn CommandRouter>,
    ) -> Result<Self> {
        let backend = FileBackend::new(&config.data_dir);
        Self::with_backend(config, &backend, transport, router)
    }

    /// Build a service on an explicit state backend
    pub fn with_backend(
        config: LinkConfig,
        backend: &dyn StateBackend,
        transport: Arc<dyn Transport>,
        router: Arc<dyn CommandRouter>,
    ) -> Result<Self> {
        config.validate()?;

        let logger = Arc::new(EventLogger::open(backend, &config.logs));
        let credentials = Arc::new(CredentialStore::open(backend));
        let registry = Arc::new(SessionRegistry::open(backend, logger.clone()));
        let pairing = Arc::new(PairingCoordinator::new(config.pairing.ttl(), logger.clone()));

        let cleanup = CleanupScheduler::new(
            config.cleanup.clone(),
            &config.data_dir,
            config.temp_dir(),
            pairing.clone(),
            logger.clone(),
        );

        let machine =
            ConnectionMachine::new(config.backoff_policy(), config.backoff.logout_delay());
        let controller = ConnectionController::new(
            machine,
            ControllerParts {
                transport,
                credentials: credentials.clone(),
                registry: registry.clone(),
                pairing: pairing.clone(),
                logger: logger.clone(),
                router,
            },
        );

        tracing::debug!(data_dir = %config.data_dir.display(), "Link service assembled");
        Ok(Self {
            config,
            logger,
            credentials,
            registry,
            pairing,
            controller,
            cleanup,
        })
    }

    /// Start connecting and begin background sweeps
    pub fn start(&self) -> Result<()> {
        self.controller.start()?;
        self.cleanup.start();
        self.logger.record_activity(
            "startup",
            serde_json::json!({ "registered": self.credentials.has_credentials() }),
        );
        Ok(())
    }

    /// Stop sweeps, then the connection
    pub async fn shutdown(&self) {
        self.cleanup.stop().await;
        self.controller.shutdown().await;
        self.logger.record_activity("shutdown", serde_json::Value::Null);
    }

    /// Request a pairing code (HTTP pairing surface)
    pub async fn request_code(&self, phone: &str) -> Result<PendingPairing> {
        self.controller.request_code(phone).await
    }

    /// Current status (HTTP pairing surface)
    pub async fn status(&self) -> LinkStatus {
        self.controller.status().await
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn controller(&self) -> &ConnectionController {
        &self.controller
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    pub fn logger(&self) -> &EventLogger {
        &self.logger
    }

    pub fn cleanup(&self) -> &CleanupScheduler {
        &self.cleanup
    }
}

impl Drop for LinkService {
    fn drop(&mut self) {
        // The cleanup scheduler aborts its own task
        self.controller.abort();
    }
}
