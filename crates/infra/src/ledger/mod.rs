//! Commitment ledger: packages, contents and the commitments reserved against them.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use r#trait::{CommitRequest, CommitmentLedger, LedgerError};
