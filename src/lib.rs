// ============================================================================
// Fluent Transaction Library
// ============================================================================

pub mod core;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use core::{Result, TxError};
pub use storage::{Entry, MemoryStore};
pub use transaction::{RetryPolicy, TransactionRunner, TransactionalExecutor};
