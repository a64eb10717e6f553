//! Background synchronization scheduler.
//!
//! Each tick, in order:
//!
//! 1. abandons local operations that reached the retry ceiling,
//! 2. pushes operations still waiting for their first attempt,
//! 3. retries failed operations whose backoff has elapsed,
//! 4. refreshes stale mirrors of ERP-owned documents.
//!
//! Pending and failed operations are listed separately, so a backlog of
//! failures inside their backoff window cannot hold back new submissions.
//!
//! Ticks never overlap: `run_once` returns `None` while another tick runs, and
//! the spawned loop skips missed intervals instead of bursting.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use packline_core::OperationId;
use packline_operations::{Operation, SyncStatus};

use crate::config::SchedulerConfig;
use crate::operation_store::OperationStore;
use crate::orchestrator::{OperationOrchestrator, ProcessOutcome};

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub synced: usize,
    pub retry_scheduled: usize,
    pub abandoned: usize,
    /// Failed operations still inside their backoff window.
    pub deferred: usize,
    pub mirrors_refreshed: usize,
    pub errors: usize,
}

/// Totals since the scheduler was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub overlapping_ticks: u64,
    pub synced: u64,
    pub retry_scheduled: u64,
    pub abandoned: u64,
    pub mirrors_refreshed: u64,
    pub errors: u64,
}

impl SchedulerStats {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.synced += report.synced as u64;
        self.retry_scheduled += report.retry_scheduled as u64;
        self.abandoned += report.abandoned as u64;
        self.mirrors_refreshed += report.mirrors_refreshed as u64;
        self.errors += report.errors as u64;
    }
}

pub struct SyncScheduler {
    orchestrator: Arc<OperationOrchestrator>,
    config: SchedulerConfig,
    tick_lock: tokio::sync::Mutex<()>,
    stats: Mutex<SchedulerStats>,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<OperationOrchestrator>, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
            tick_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStats {
        match self.stats.lock() {
            Ok(stats) => *stats,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn update_stats(&self, apply: impl FnOnce(&mut SchedulerStats)) {
        match self.stats.lock() {
            Ok(mut stats) => apply(&mut stats),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }

    /// Run one tick now. Returns `None` if a tick is already running.
    pub async fn run_once(&self) -> Option<TickReport> {
        let Ok(_tick) = self.tick_lock.try_lock() else {
            debug!("sync tick already running; skipping");
            self.update_stats(|stats| stats.overlapping_ticks += 1);
            return None;
        };

        let report = self.tick(Utc::now()).await;
        self.update_stats(|stats| stats.record(&report));

        if report != TickReport::default() {
            info!(
                synced = report.synced,
                retry_scheduled = report.retry_scheduled,
                abandoned = report.abandoned,
                deferred = report.deferred,
                mirrors_refreshed = report.mirrors_refreshed,
                errors = report.errors,
                "sync tick finished"
            );
        }
        Some(report)
    }

    async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        self.abandon_exhausted(&mut report).await;
        let attempted = self.process_pending(&mut report).await;
        self.retry_failed(now, &attempted, &mut report).await;
        self.refresh_mirrors(now, &mut report).await;
        report
    }

    async fn abandon_exhausted(&self, report: &mut TickReport) {
        let store = self.orchestrator.store();
        let exhausted = match store
            .list_exhausted(self.config.max_retries, self.config.batch_size)
            .await
        {
            Ok(ops) => ops,
            Err(err) => {
                warn!(error = %err, "could not list exhausted operations");
                report.errors += 1;
                return;
            }
        };

        for op in exhausted {
            let reason = format!(
                "gave up after {} attempts: {}",
                op.retry_count,
                op.last_error.as_deref().unwrap_or("unknown error")
            );
            match self.orchestrator.abandon(op.id, &reason).await {
                Ok(_) => report.abandoned += 1,
                Err(err) => {
                    warn!(operation_id = %op.id, error = %err, "could not abandon operation");
                    report.errors += 1;
                }
            }
        }
    }

    fn backoff_elapsed(&self, op: &Operation, now: DateTime<Utc>) -> bool {
        if op.sync_status != Some(SyncStatus::Failed) {
            return true;
        }
        match op.last_attempt_at {
            Some(last) => self.config.retry_policy.next_attempt_at(last, op.retry_count) <= now,
            None => true,
        }
    }

    /// Returns the operations attempted, so a failure is not retried in the same tick.
    async fn process_pending(&self, report: &mut TickReport) -> HashSet<OperationId> {
        let pending = match self.orchestrator.store().list_pending(self.config.batch_size).await {
            Ok(ops) => ops,
            Err(err) => {
                warn!(error = %err, "could not list pending operations");
                report.errors += 1;
                return HashSet::new();
            }
        };

        let mut attempted = HashSet::with_capacity(pending.len());
        for op in pending {
            self.process_one(&op, report).await;
            attempted.insert(op.id);
        }
        attempted
    }

    async fn retry_failed(
        &self,
        now: DateTime<Utc>,
        attempted: &HashSet<OperationId>,
        report: &mut TickReport,
    ) {
        let retryable = match self
            .orchestrator
            .store()
            .list_retryable(self.config.max_retries, self.config.batch_size)
            .await
        {
            Ok(ops) => ops,
            Err(err) => {
                warn!(error = %err, "could not list retryable operations");
                report.errors += 1;
                return;
            }
        };

        for op in retryable.iter().filter(|op| !attempted.contains(&op.id)) {
            if !self.backoff_elapsed(op, now) {
                report.deferred += 1;
                continue;
            }
            self.process_one(op, report).await;
        }
    }

    async fn process_one(&self, op: &Operation, report: &mut TickReport) {
        match self.orchestrator.process(op.id).await {
            Ok(ProcessOutcome::Synced { .. }) => report.synced += 1,
            Ok(ProcessOutcome::AlreadySynced) => {}
            Ok(ProcessOutcome::RetryScheduled { .. }) => report.retry_scheduled += 1,
            Ok(ProcessOutcome::Abandoned { .. }) => report.abandoned += 1,
            Err(err) => {
                warn!(operation_id = %op.id, error = %err, "sync of operation failed");
                report.errors += 1;
            }
        }
    }

    async fn refresh_mirrors(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let cutoff = chrono::Duration::from_std(self.config.mirror_staleness)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = match self
            .orchestrator
            .store()
            .list_stale_mirrors(cutoff, self.config.batch_size)
            .await
        {
            Ok(ops) => ops,
            Err(err) => {
                warn!(error = %err, "could not list stale mirrors");
                report.errors += 1;
                return;
            }
        };

        for op in stale {
            match self.orchestrator.refresh_mirror(op.id).await {
                Ok(_) => report.mirrors_refreshed += 1,
                Err(err) => {
                    warn!(operation_id = %op.id, error = %err, "mirror refresh failed");
                    report.errors += 1;
                }
            }
        }
    }

    /// Run ticks on the configured interval until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let scheduler = self.clone();
        let period = self.config.interval.max(Duration::from_millis(1));

        let join = tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "sync scheduler started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.run_once().await;
                    }
                }
            }
            info!("sync scheduler stopped");
        });

        SchedulerHandle {
            token,
            join,
            scheduler: self,
        }
    }
}

pub struct SchedulerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    scheduler: Arc<SyncScheduler>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Stop after the current tick and wait for the loop to exit.
    pub async fn shutdown(self) -> SchedulerStats {
        self.token.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "sync scheduler task panicked");
        }
        self.scheduler.stats()
    }
}
