//! Migration scheduler: drains qualifying local entries to the remote tier
//! on a cron schedule, then prunes the directories it emptied.
//!
//! Cycle state machine: `Idle -> Scanning -> Transferring -> Pruning -> Idle`.
//! Overlapping triggers are queued, never interleaved. A local file is
//! deleted only strictly after its remote write is acknowledged.

pub mod cron;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Semaphore, watch};

use crate::error::{FsError, FsResult};
use crate::local::LocalTier;
use crate::models::{CyclePhase, CycleReport, Entry, TransferState, TransferTask};
use crate::remote::{RemoteBackend, RemoteClient};

pub use cron::{CronError, CronExpr};

#[derive(Clone, Debug)]
pub struct MigrateConfig {
    pub schedule: CronExpr,
    /// Concurrent uploads.
    pub transfers: usize,
    /// Concurrent remote existence checks.
    pub checkers: usize,
    /// Attempts per transfer before the entry is left for the next cycle.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Minimum age before an entry qualifies; stands in for open-for-write
    /// detection.
    pub quiescence: Duration,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            schedule: CronExpr::parse("0 2 * * *").expect("default schedule"),
            transfers: 16,
            checkers: 16,
            max_retries: 3,
            initial_backoff_ms: 100,
            quiescence: Duration::from_secs(60),
        }
    }
}

enum TaskOutcome {
    Transferred,
    Skipped,
    Failed,
}

pub struct MigrationScheduler<B: RemoteBackend> {
    local: Arc<LocalTier>,
    remote: Arc<RemoteClient<B>>,
    cfg: MigrateConfig,
    phase_tx: watch::Sender<CyclePhase>,
    cycle_gate: Mutex<()>,
    pending: AtomicBool,
    cancelled: Arc<AtomicBool>,
}

impl<B: RemoteBackend> MigrationScheduler<B> {
    pub fn new(local: Arc<LocalTier>, remote: Arc<RemoteClient<B>>, cfg: MigrateConfig) -> Self {
        let (phase_tx, _) = watch::channel(CyclePhase::Idle);
        Self {
            local,
            remote,
            cfg,
            phase_tx,
            cycle_gate: Mutex::new(()),
            pending: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<CyclePhase> {
        self.phase_tx.subscribe()
    }

    /// Cooperative cancellation, honored between transfer attempts.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Run a cycle now, or queue one if a cycle is already past `Scanning`.
    /// Returns `None` when the trigger was queued behind a running cycle.
    pub async fn trigger(&self) -> Option<FsResult<CycleReport>> {
        let Ok(_guard) = self.cycle_gate.try_lock() else {
            self.pending.store(true, Ordering::SeqCst);
            return None;
        };
        let mut result = self.run_cycle().await;
        // Drain triggers that queued up while the cycle ran.
        while self.pending.swap(false, Ordering::SeqCst)
            && !self.cancelled.load(Ordering::SeqCst)
        {
            result = self.run_cycle().await;
        }
        Some(result)
    }

    async fn run_cycle(&self) -> FsResult<CycleReport> {
        self.phase_tx.send_replace(CyclePhase::Scanning);
        let result = self.cycle_inner().await;
        self.phase_tx.send_replace(CyclePhase::Idle);
        result
    }

    async fn cycle_inner(&self) -> FsResult<CycleReport> {
        let files = self.local.scan_files().await?;
        let mut report = CycleReport {
            scanned: files.len(),
            ..CycleReport::default()
        };

        let now = SystemTime::now();
        let eligible: Vec<Entry> = files
            .into_iter()
            .filter(|e| {
                now.duration_since(e.mtime)
                    .map(|age| age >= self.cfg.quiescence)
                    .unwrap_or(false)
            })
            .collect();

        self.phase_tx.send_replace(CyclePhase::Transferring);
        let checkers = Arc::new(Semaphore::new(self.cfg.checkers.max(1)));
        let transfers = Arc::new(Semaphore::new(self.cfg.transfers.max(1)));
        let mut handles = Vec::new();
        for entry in eligible {
            let local = self.local.clone();
            let remote = self.remote.clone();
            let checkers = checkers.clone();
            let transfers = transfers.clone();
            let cancelled = self.cancelled.clone();
            let max_retries = self.cfg.max_retries;
            let backoff_ms = self.cfg.initial_backoff_ms;
            handles.push(tokio::spawn(async move {
                Self::run_task(
                    entry, local, remote, checkers, transfers, max_retries, backoff_ms, cancelled,
                )
                .await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(TaskOutcome::Transferred) => report.transferred += 1,
                Ok(TaskOutcome::Skipped) => report.skipped += 1,
                Ok(TaskOutcome::Failed) => report.failed += 1,
                Err(e) => {
                    warn!("transfer task aborted: {e}");
                    report.failed += 1;
                }
            }
        }

        self.phase_tx.send_replace(CyclePhase::Pruning);
        for dir in self.local.dirs_bottom_up().await? {
            match self.local.remove_dir(&dir).await {
                Ok(()) => report.pruned_dirs += 1,
                Err(FsError::DirectoryNotEmpty(_)) | Err(FsError::NotFound(_)) => {}
                Err(e) => warn!("prune {dir}: {e}"),
            }
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        entry: Entry,
        local: Arc<LocalTier>,
        remote: Arc<RemoteClient<B>>,
        checkers: Arc<Semaphore>,
        transfers: Arc<Semaphore>,
        max_retries: u32,
        backoff_ms: u64,
        cancelled: Arc<AtomicBool>,
    ) -> TaskOutcome {
        let mut task = TransferTask::new(&entry.path);

        // Checker pass: a matching remote copy means the content is already
        // confirmed present and the local copy can go without an upload.
        {
            let _permit = checkers.acquire().await.expect("checker pool closed");
            match remote.stat(&task.dest).await {
                Ok(Some(re)) if re.is_file() && re.size == entry.size => {
                    return match local.delete(&task.source).await {
                        Ok(()) => TaskOutcome::Skipped,
                        Err(e) => {
                            warn!("{}: local delete after remote match failed: {e}", task.source);
                            TaskOutcome::Failed
                        }
                    };
                }
                Ok(_) => {}
                Err(e) => debug!("{}: remote check failed: {e}", task.dest),
            }
        }

        loop {
            if cancelled.load(Ordering::SeqCst) {
                debug!("{}: cancelled before attempt {}", task.source, task.attempts + 1);
                task.state = TransferState::Failed;
                return TaskOutcome::Failed;
            }
            task.attempts += 1;
            task.state = TransferState::InFlight;

            let result: FsResult<()> = {
                let _permit = transfers.acquire().await.expect("transfer pool closed");
                match local.read(&task.source, 0, entry.size as usize).await {
                    Ok(data) => remote.write(&task.dest, &data).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {
                    // Upload acknowledged; only now remove the local copy.
                    return match local.delete(&task.source).await {
                        Ok(()) => {
                            task.state = TransferState::Done;
                            TaskOutcome::Transferred
                        }
                        Err(e) => {
                            warn!("{}: uploaded but local delete failed: {e}", task.source);
                            TaskOutcome::Failed
                        }
                    };
                }
                Err(e) if e.is_retryable() && task.attempts < max_retries => {
                    let delay_ms = backoff_ms * 2u64.pow(task.attempts - 1);
                    warn!(
                        "{}: attempt {} failed: {e}; retrying in {delay_ms}ms",
                        task.source, task.attempts
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => {
                    warn!(
                        "{}: transfer failed after {} attempt(s), leaving local copy: {e}",
                        task.source, task.attempts
                    );
                    task.state = TransferState::Failed;
                    return TaskOutcome::Failed;
                }
            }
        }
    }

    /// Cron loop: sleep until the next computed fire time, then trigger.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let now = Utc::now();
            let Some(next) = self.cfg.schedule.next_after(now) else {
                warn!(
                    "schedule {} never fires; migration loop exiting",
                    self.cfg.schedule
                );
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!("next migration cycle at {next}");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.trigger().await {
                        Some(Ok(report)) => info!("migration cycle settled: {report:?}"),
                        Some(Err(e)) => error!("migration cycle failed: {e}"),
                        None => {}
                    }
                }
                _ = shutdown.changed() => {
                    self.cancel();
                    break;
                }
            }
        }
    }
}
