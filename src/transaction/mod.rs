// ============================================================================
// Transaction Module
// ============================================================================
//
// - executor: the TransactionalExecutor contract (commit/rollback + retry)
// - runner:   fluent TransactionRunner that captures and resolves outcomes
// - policy:   conflict retry configuration for executors
//
// ============================================================================

pub mod executor;
pub mod policy;
pub mod runner;

pub use executor::TransactionalExecutor;
pub use policy::RetryPolicy;
pub use runner::TransactionRunner;
