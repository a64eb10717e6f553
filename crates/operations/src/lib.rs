//! Warehouse operations (transfer, counting, receipt, pick) and their
//! lifecycle / sync-status state machine.
//!
//! Pure domain logic. The orchestrator in `packline-infra` drives these
//! transitions around ledger calls and ERP pushes.

pub mod operation;

pub use operation::{
    ExternalRef, LineState, Operation, OperationKind, OperationLine, OperationOrigin,
    OperationStatus, SyncStatus,
};
