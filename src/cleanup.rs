//! Cleanup scheduler
//!
//! Background housekeeping on a single task: a frequent sweep (expired
//! pairing requests, stale temp artifacts) and an infrequent compaction of
//! oversized cache files. Both ticks share one `select!` loop, so they never
//! overlap.

use crate::config::CleanupConfig;
use crate::log::EventLogger;
use crate::pairing::PairingCoordinator;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// `tokio::time::interval` rejects a zero period
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Which tick produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Sweep,
    Compact,
}

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub kind: SweepKind,
    pub expired_pairings: usize,
    pub temp_files_removed: usize,
    pub files_truncated: usize,
    pub ran_at: DateTime<Utc>,
}

impl SweepReport {
    fn new(kind: SweepKind) -> Self {
        Self {
            kind,
            expired_pairings: 0,
            temp_files_removed: 0,
            files_truncated: 0,
            ran_at: Utc::now(),
        }
    }

    /// Whether the sweep found nothing to do
    pub fn is_empty(&self) -> bool {
        self.expired_pairings == 0 && self.temp_files_removed == 0 && self.files_truncated == 0
    }
}

/// Delete files in `dir` whose modification time is at least `max_age` ago
///
/// A missing directory counts as empty. Returns the number removed.
pub fn sweep_temp_dir(dir: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to read temp directory");
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        // Timestamps in the future count as fresh
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        if age < max_age {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file")
            }
        }
    }
    removed
}

/// Rewrite every file larger than `max_bytes` as an empty JSON object
///
/// Returns the number truncated.
pub fn truncate_oversized(files: &[PathBuf], max_bytes: u64) -> usize {
    let mut truncated = 0;
    for path in files {
        let Ok(metadata) = std::fs::metadata(path) else {
            continue;
        };
        if metadata.len() <= max_bytes {
            continue;
        }

        match std::fs::write(path, "{}") {
            Ok(()) => {
                tracing::warn!(
                    path = %path.display(),
                    bytes = metadata.len(),
                    "Truncated oversized cache file"
                );
                truncated += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to truncate cache file")
            }
        }
    }
    truncated
}

/// The work done on each tick
struct Sweeper {
    pairing: Arc<PairingCoordinator>,
    logger: Arc<EventLogger>,
    temp_dir: PathBuf,
    temp_max_age: Duration,
    cache_files: Vec<PathBuf>,
    max_file_bytes: u64,
    event_tx: broadcast::Sender<SweepReport>,
}

impl Sweeper {
    async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::new(SweepKind::Sweep);
        report.expired_pairings = self.pairing.expire_stale().await.len();
        report.temp_files_removed = sweep_temp_dir(&self.temp_dir, self.temp_max_age);
        self.finish(report)
    }

    fn compact(&self) -> SweepReport {
        let mut report = SweepReport::new(SweepKind::Compact);
        report.files_truncated = truncate_oversized(&self.cache_files, self.max_file_bytes);
        self.finish(report)
    }

    fn finish(&self, report: SweepReport) -> SweepReport {
        if report.is_empty() {
            tracing::debug!(kind = ?report.kind, "Cleanup sweep found nothing to do");
        } else {
            tracing::info!(
                kind = ?report.kind,
                expired_pairings = report.expired_pairings,
                temp_files_removed = report.temp_files_removed,
                files_truncated = report.files_truncated,
                "Cleanup sweep completed"
            );
            match serde_json::to_value(&report) {
                Ok(data) => self.logger.record_activity("cleanup", data),
                Err(e) => tracing::warn!(error = %e, "Failed to serialize sweep report"),
            }
        }
        let _ = self.event_tx.send(report.clone());
        report
    }
}

/// Periodic background sweeps
pub struct CleanupScheduler {
    sweeper: Arc<Sweeper>,
    config: CleanupConfig,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CleanupScheduler {
    /// Cache file paths in `config` are resolved against `data_dir`
    pub fn new(
        config: CleanupConfig,
        data_dir: &Path,
        temp_dir: PathBuf,
        pairing: Arc<PairingCoordinator>,
        logger: Arc<EventLogger>,
    ) -> Self {
        let cache_files = config
            .cache_files
            .iter()
            .map(|file| data_dir.join(file))
            .collect();
        let (event_tx, _) = broadcast::channel(16);

        Self {
            sweeper: Arc::new(Sweeper {
                pairing,
                logger,
                temp_dir,
                temp_max_age: config.temp_max_age(),
                cache_files,
                max_file_bytes: config.max_file_bytes,
                event_tx,
            }),
            config,
            task: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Spawn the sweep loop; a no-op if already running
    pub fn start(&self) {
        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *lock(&self.shutdown_tx) = Some(shutdown_tx);

        let sweeper = self.sweeper.clone();
        let first = Instant::now() + self.config.initial_delay();
        let mut sweep_tick = interval_at(first, self.config.sweep_interval().max(MIN_PERIOD));
        let mut compact_tick =
            interval_at(first, self.config.compact_interval().max(MIN_PERIOD));
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        compact_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            sweep_secs = self.config.sweep_interval_secs,
            compact_secs = self.config.compact_interval_secs,
            "Cleanup scheduler started"
        );

        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = sweep_tick.tick() => {
                        sweeper.sweep().await;
                    }
                    _ = compact_tick.tick() => {
                        sweeper.compact();
                    }
                }
            }
        }));
    }

    /// Stop the loop and wait for it to finish
    pub async fn stop(&self) {
        if let Some(tx) = lock(&self.shutdown_tx).take() {
            let _ = tx.send(());
        }
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Cleanup task ended abnormally");
                }
            }
            tracing::info!("Cleanup scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).is_some()
    }

    /// Run the pairing/temp sweep now
    pub async fn sweep_now(&self) -> SweepReport {
        self.sweeper.sweep().await
    }

    /// Run the oversized-file compaction now
    pub fn compact_now(&self) -> SweepReport {
        self.sweeper.compact()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SweepReport> {
        self.sweeper.event_tx.subscribe()
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}
