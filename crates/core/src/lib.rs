//! `packline-core`: shared domain building blocks.
//!
//! Identifiers, the domain error model and the small traits the inventory and
//! operation crates implement. No IO lives here.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, Entity, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{CommitmentId, ContentId, OperationId, OperationLineId, PackageId};
