//! Periodic background tasks.
//!
//! Four independent loops: expiration sweep, cache reload, backup and
//! cleanup. Each loop runs one iteration at a time and can be stopped on its
//! own; a stop request is only observed between iterations, so an in-flight
//! sweep always finishes. A failure is logged and retried next tick.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::backup::BackupService;
use crate::config::SchedulerConfig;
use crate::error::{ServiceError, ValidationFailure};
use crate::service::AuctionService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Expiration,
    CacheReload,
    Backup,
    Cleanup,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TaskKind::Expiration => "expiration",
            TaskKind::CacheReload => "cache-reload",
            TaskKind::Backup => "backup",
            TaskKind::Cleanup => "cleanup",
        })
    }
}

/// Result of one expiration sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub settled: usize,
    /// Settled by someone else between the scan and the lock
    pub skipped: usize,
    pub failed: usize,
}

pub struct Scheduler {
    service: Arc<AuctionService>,
    backups: Option<Arc<BackupService>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(service: Arc<AuctionService>, config: SchedulerConfig) -> Self {
        let backups = config.backup_enabled.then(|| {
            Arc::new(BackupService::new(
                service.store().clone(),
                config.backup_dir.clone(),
                config.backup_keep,
            ))
        });
        Self {
            service,
            backups,
            config,
        }
    }

    pub fn backups(&self) -> Option<&Arc<BackupService>> {
        self.backups.as_ref()
    }

    /// Settle every ACTIVE auction whose clock has run out. Each auction is
    /// handled on its own; one failure never stops the sweep.
    pub async fn run_expiration_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let due = match self.service.store().expired_active(Utc::now()).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("[SCHEDULER] Expiration scan failed: {}", e);
                report.failed += 1;
                return report;
            }
        };

        for id in due {
            match self.service.expire(id).await {
                Ok(_) => report.settled += 1,
                Err(ServiceError::Validation(ValidationFailure::NotActive))
                | Err(ServiceError::NotFound(_)) => report.skipped += 1,
                Err(e) => {
                    warn!("[SCHEDULER] Failed to expire auction {}, will retry: {}", id, e);
                    report.failed += 1;
                }
            }
        }

        if report.settled + report.failed > 0 {
            info!(
                "[SCHEDULER] Expiration sweep: {} settled, {} skipped, {} failed",
                report.settled, report.skipped, report.failed
            );
        }
        report
    }

    pub async fn run_cache_reload_once(&self) -> Option<usize> {
        match self.service.store().reload_cache().await {
            Ok(n) => Some(n),
            Err(e) => {
                error!("[SCHEDULER] Cache reload failed: {}", e);
                None
            }
        }
    }

    pub async fn run_backup_once(&self) -> Option<PathBuf> {
        let backups = self.backups.as_ref()?;
        match backups.run_once().await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("[SCHEDULER] Backup failed: {:#}", e);
                None
            }
        }
    }

    /// Delete EXPIRED/CLAIMED auctions older than the retention window.
    pub async fn run_cleanup_once(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = Utc::now() - retention;
        match self.service.purge_settled(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                error!("[SCHEDULER] Cleanup failed: {}", e);
                0
            }
        }
    }

    /// Spawn all enabled loops.
    pub fn start(self) -> SchedulerHandle {
        let this = Arc::new(self);
        let mut handle = SchedulerHandle { tasks: Vec::new() };

        let s = this.clone();
        handle.spawn(TaskKind::Expiration, this.config.expiration_interval, move || {
            let s = s.clone();
            async move {
                s.run_expiration_once().await;
            }
        });

        let s = this.clone();
        handle.spawn(TaskKind::CacheReload, this.config.cache_reload_interval, move || {
            let s = s.clone();
            async move {
                s.run_cache_reload_once().await;
            }
        });

        if this.backups.is_some() {
            let s = this.clone();
            handle.spawn(TaskKind::Backup, this.config.backup_interval, move || {
                let s = s.clone();
                async move {
                    s.run_backup_once().await;
                }
            });
        }

        let s = this.clone();
        handle.spawn(TaskKind::Cleanup, this.config.cleanup_interval, move || {
            let s = s.clone();
            async move {
                s.run_cleanup_once().await;
            }
        });

        info!(
            "[SCHEDULER] Started {} tasks (expiration every {}s, backups {})",
            handle.tasks.len(),
            this.config.expiration_interval.as_secs(),
            if this.backups.is_some() { "on" } else { "off" }
        );
        handle
    }
}

struct RunningTask {
    kind: TaskKind,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Control over the running loops.
pub struct SchedulerHandle {
    tasks: Vec<RunningTask>,
}

impl SchedulerHandle {
    fn spawn<F, Fut>(&mut self, kind: TaskKind, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = interval.tick() => {}
                }
                debug!("[SCHEDULER] Running {} task", kind);
                tick().await;
            }
            info!("[SCHEDULER] {} task stopped", kind);
        });
        self.tasks.push(RunningTask { kind, stop, join });
    }

    pub fn running(&self) -> Vec<TaskKind> {
        self.tasks.iter().map(|t| t.kind).collect()
    }

    /// Stop one loop and wait for its current iteration to finish.
    /// Returns false if no such loop was running.
    pub async fn stop(&mut self, kind: TaskKind) -> bool {
        let Some(pos) = self.tasks.iter().position(|t| t.kind == kind) else {
            return false;
        };
        let task = self.tasks.remove(pos);
        let _ = task.stop.send(true);
        if let Err(e) = task.join.await {
            error!("[SCHEDULER] {} task panicked: {}", kind, e);
        }
        true
    }

    /// Stop every loop and wait for all of them.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            let _ = task.stop.send(true);
        }
        let kinds: Vec<TaskKind> = self.tasks.iter().map(|t| t.kind).collect();
        let results = join_all(self.tasks.into_iter().map(|t| t.join)).await;
        for (kind, result) in kinds.into_iter().zip(results) {
            if let Err(e) = result {
                error!("[SCHEDULER] {} task panicked: {}", kind, e);
            }
        }
        info!("[SCHEDULER] All tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::ClaimsLedger;
    use crate::config::AuctionConfig;
    use crate::ports::{MemoryEconomy, MemoryInventory};
    use crate::storage::Database;
    use crate::store::AuctionStore;
    use crate::types::{AuctionStatus, ItemPayload, Listing, Participant};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn service() -> Arc<AuctionService> {
        let db = Database::open_in_memory().unwrap();
        Arc::new(AuctionService::new(
            Arc::new(AuctionStore::new(db.clone())),
            Arc::new(ClaimsLedger::new(db, 3)),
            Arc::new(MemoryEconomy::new()),
            Arc::new(MemoryInventory::default()),
            AuctionConfig::default(),
        ))
    }

    fn quiet_config() -> SchedulerConfig {
        SchedulerConfig {
            backup_enabled: false,
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_expiration_sweep_settles_only_due_auctions() {
        let service = service();
        let seller = Participant::new(Uuid::new_v4(), "s");
        let listing = Listing {
            seller: seller.clone(),
            item: ItemPayload::new("map"),
            category: "misc".to_string(),
            start_price: 5,
            buy_now_price: None,
            duration: Duration::from_secs(600),
        };
        let due = service.create_auction(listing.clone()).await.unwrap();
        let later = service.create_auction(listing).await.unwrap();

        let mut record = service.store().fetch(due.id()).await.unwrap().unwrap();
        record.expires_at = Utc::now() - chrono::Duration::seconds(5);
        service.store().update(&record).await.unwrap();

        let scheduler = Scheduler::new(service.clone(), quiet_config());
        let report = scheduler.run_expiration_once().await;
        assert_eq!(report, SweepReport { settled: 1, skipped: 0, failed: 0 });

        assert_eq!(service.get_auction(due.id()).await.unwrap().status(), AuctionStatus::Expired);
        assert_eq!(service.get_auction(later.id()).await.unwrap().status(), AuctionStatus::Active);
        assert_eq!(scheduler.run_expiration_once().await.settled, 0, "Nothing left to settle");
    }

    #[tokio::test]
    async fn test_stop_single_task_and_shutdown() {
        let mut handle = Scheduler::new(service(), quiet_config()).start();
        assert_eq!(
            handle.running(),
            vec![TaskKind::Expiration, TaskKind::CacheReload, TaskKind::Cleanup]
        );

        assert!(handle.stop(TaskKind::CacheReload).await);
        assert!(!handle.stop(TaskKind::CacheReload).await, "Already stopped");
        assert!(!handle.stop(TaskKind::Backup).await, "Backups are disabled");

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown must not hang");
    }

    #[tokio::test]
    async fn test_loop_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut handle = SchedulerHandle { tasks: Vec::new() };
        let counter = ticks.clone();
        handle.spawn(TaskKind::Expiration, Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "Expected several ticks, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen, "No ticks after shutdown");
    }
}
