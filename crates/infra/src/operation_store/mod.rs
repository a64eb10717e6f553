//! Operation persistence.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryOperationStore;
pub use postgres::PostgresOperationStore;
pub use r#trait::{OperationStore, OperationStoreError};
