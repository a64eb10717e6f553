use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use packline_infra::config::SchedulerConfig;
use packline_infra::db;
use packline_infra::external::build_adapter;
use packline_infra::ledger::{CommitmentLedger, InMemoryLedger, PostgresLedger};
use packline_infra::operation_store::{InMemoryOperationStore, OperationStore, PostgresOperationStore};
use packline_infra::{AppConfig, OperationOrchestrator, SchedulerHandle, SyncScheduler};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StorageKind {
    InMemory,
    Postgres,
}

pub struct Services {
    pub orchestrator: Arc<OperationOrchestrator>,
    pub storage: StorageKind,
}

/// Wire stores and the ERP adapter from configuration.
///
/// Without `DATABASE_URL` everything runs in memory (dev/test only).
pub async fn build_services(config: &AppConfig) -> anyhow::Result<Services> {
    let (ledger, store, storage) = match &config.database {
        Some(database) => {
            let pool = db::connect(database)
                .await
                .context("failed to connect to Postgres")?;
            db::apply_schema(&pool)
                .await
                .context("failed to apply ledger schema")?;
            (
                Arc::new(PostgresLedger::new(pool.clone())) as Arc<dyn CommitmentLedger>,
                Arc::new(PostgresOperationStore::new(pool)) as Arc<dyn OperationStore>,
                StorageKind::Postgres,
            )
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores, state is lost on exit");
            (
                Arc::new(InMemoryLedger::new()) as Arc<dyn CommitmentLedger>,
                Arc::new(InMemoryOperationStore::new()) as Arc<dyn OperationStore>,
                StorageKind::InMemory,
            )
        }
    };

    let adapter = build_adapter(&config.erp).context("failed to build ERP adapter")?;
    info!(adapter = adapter.name(), storage = ?storage, "services ready");

    Ok(Services {
        orchestrator: Arc::new(OperationOrchestrator::new(ledger, store, adapter)),
        storage,
    })
}

impl Services {
    /// Spawn the sync scheduler unless it is disabled.
    pub fn start_scheduler(&self, config: &SchedulerConfig) -> Option<SchedulerHandle> {
        if !config.enabled {
            info!("sync scheduler disabled");
            return None;
        }
        let scheduler = Arc::new(SyncScheduler::new(self.orchestrator.clone(), config.clone()));
        Some(scheduler.spawn())
    }

    /// Stop the scheduler (after its current tick) and close the ERP session.
    pub async fn shutdown(&self, scheduler: Option<SchedulerHandle>) {
        if let Some(handle) = scheduler {
            let stats = handle.shutdown().await;
            info!(
                ticks = stats.ticks,
                synced = stats.synced,
                retry_scheduled = stats.retry_scheduled,
                abandoned = stats.abandoned,
                errors = stats.errors,
                "sync scheduler stopped"
            );
        }
        self.orchestrator.adapter().shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use packline_core::Entity;
    use packline_inventory::{PackageMetadata, PackageStatus};
    use packline_operations::{OperationKind, SyncStatus};

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned()).unwrap()
    }

    #[tokio::test]
    async fn defaults_run_in_memory_with_simulated_erp() {
        let services = build_services(&config(&[])).await.unwrap();
        assert_eq!(services.storage, StorageKind::InMemory);
        assert_eq!(services.orchestrator.adapter().name(), "simulated");
    }

    #[test]
    fn http_driver_without_credentials_is_rejected() {
        let err = AppConfig::from_lookup(|name| (name == "ERP_DRIVER").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("ERP_BASE_URL"));
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_spawned() {
        let cfg = config(&[("SYNC_ENABLED", "false")]);
        let services = build_services(&cfg).await.unwrap();
        assert!(services.start_scheduler(&cfg.scheduler).is_none());
        services.shutdown(None).await;
    }

    #[tokio::test]
    async fn scheduler_syncs_submitted_operation_and_stops() {
        let cfg = config(&[("SYNC_INTERVAL_SECS", "1")]);
        let services = build_services(&cfg).await.unwrap();
        let orchestrator = services.orchestrator.clone();

        let ledger = orchestrator.ledger();
        let package = ledger
            .create_package("PKG-1", "WH01", PackageMetadata::new())
            .await
            .unwrap();
        let content = ledger.add_content(package.id, "ITEM-1", 12).await.unwrap();
        ledger
            .set_package_status(package.id, PackageStatus::Active)
            .await
            .unwrap();

        let op = orchestrator
            .create_operation(OperationKind::Transfer, "WH01", None)
            .await
            .unwrap();
        orchestrator
            .add_line(op.id, *content.id(), "ITEM-1", 12)
            .await
            .unwrap();
        orchestrator.submit(op.id).await.unwrap();

        // The first interval tick fires immediately.
        let handle = services.start_scheduler(&cfg.scheduler).unwrap();
        for _ in 0..100 {
            if orchestrator.get_operation(op.id).await.unwrap().sync_status == Some(SyncStatus::Synced) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        services.shutdown(Some(handle)).await;

        let synced = orchestrator.get_operation(op.id).await.unwrap();
        assert_eq!(synced.sync_status, Some(SyncStatus::Synced));
        let content = ledger.get_content(*content.id()).await.unwrap().unwrap();
        assert_eq!(content.quantity(), 0);
        assert!(!orchestrator.adapter().is_connected());
    }
}
