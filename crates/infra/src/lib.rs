//! Infrastructure layer: ledger and operation storage, ERP integration,
//! orchestration and the background sync scheduler.

pub mod config;
pub mod db;
pub mod external;
pub mod ledger;
pub mod operation_store;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;


pub use config::{AppConfig, ConfigError};
pub use orchestrator::{OperationOrchestrator, OrchestratorError, ProcessOutcome};
pub use scheduler::{SchedulerHandle, SchedulerStats, SyncScheduler, TickReport};
