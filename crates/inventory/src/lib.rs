//! Inventory domain: packages, their contents and commitments against contents.
//!
//! Everything here is deterministic domain logic (no IO, no storage). The
//! ledger implementations in `packline-infra` load these records, call the
//! methods below inside a transaction, and write the results back.

pub mod commitment;
pub mod content;
pub mod package;

pub use commitment::{PackageCommitment, SourceOperation, SourceOperationType};
pub use content::PackageContent;
pub use package::{MetadataValue, Package, PackageMetadata, PackageStatus};
