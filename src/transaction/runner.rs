// ============================================================================
// Fluent Transaction Runner
// ============================================================================
//
// Runs a unit of work through a TransactionalExecutor and keeps the outcome
// instead of propagating it:
//
//   create ──> set_attempt_limit / disable_throw_on_resolve
//     └──> execute ──> on_failure_do ──> resolve
//
// ============================================================================

use super::TransactionalExecutor;
use log::debug;
use std::fmt;

/// Fluent builder around a single (or repeated) transactional execution.
///
/// Failures raised while executing are captured, never propagated by
/// [`execute`](Self::execute). They surface through
/// [`on_failure_do`](Self::on_failure_do) and, unless suppressed, through
/// [`resolve`](Self::resolve).
///
/// # Examples
///
/// ```
/// use fluent_transaction::{MemoryStore, TransactionRunner};
///
/// let store = MemoryStore::new();
/// let total = TransactionRunner::create(&store)
///     .set_attempt_limit(3)
///     .execute(|| {
///         store.put("orders:1", 40)?;
///         store.put("orders:2", 2)?;
///         Ok(42)
///     })
///     .resolve()
///     .unwrap();
///
/// assert_eq!(total, Some(42));
/// ```
pub struct TransactionRunner<'x, X, T>
where
    X: TransactionalExecutor,
{
    executor: &'x X,
    attempt_limit: u32,
    should_throw: bool,
    outcome: Option<Result<T, X::Error>>,
}

impl<'x, X, T> TransactionRunner<'x, X, T>
where
    X: TransactionalExecutor,
{
    /// Creates a runner with one attempt, throwing on resolve and no outcome.
    pub fn create(executor: &'x X) -> Self {
        Self {
            executor,
            attempt_limit: 1,
            should_throw: true,
            outcome: None,
        }
    }

    /// Sets the attempt limit handed to the executor.
    pub fn set_attempt_limit(&mut self, attempts: u32) -> &mut Self {
        self.attempt_limit = attempts;
        self
    }

    /// Runs `work` inside a transaction and captures its outcome.
    ///
    /// Replaces whatever a previous `execute` captured.
    pub fn execute<F>(&mut self, work: F) -> &mut Self
    where
        F: FnMut() -> Result<T, X::Error>,
    {
        let outcome = self.executor.execute_transaction(work, self.attempt_limit);
        if outcome.is_err() {
            debug!(
                "transaction failed after up to {} attempt(s); failure captured",
                self.attempt_limit
            );
        }
        self.outcome = Some(outcome);
        self
    }

    /// Calls `handler` right away if a failure is captured.
    ///
    /// The handler is not kept: failures captured by a later `execute` will
    /// not reach it.
    pub fn on_failure_do<H>(&mut self, handler: H) -> &mut Self
    where
        H: FnOnce(&X::Error),
    {
        if let Some(Err(failure)) = &self.outcome {
            handler(failure);
        }
        self
    }

    /// Makes [`resolve`](Self::resolve) return `Ok(None)` instead of the
    /// captured failure.
    pub fn disable_throw_on_resolve(&mut self) -> &mut Self {
        self.should_throw = false;
        self
    }

    /// Resolves the captured outcome without consuming it.
    ///
    /// Returns the captured failure when throwing is enabled, the value on
    /// success, and `Ok(None)` otherwise. Resolving leaves the runner as it
    /// was, so it can be resolved again or handed to `on_failure_do`. Use
    /// [`into_outcome`](Self::into_outcome) to take ownership instead.
    pub fn resolve(&self) -> Result<Option<T>, X::Error>
    where
        T: Clone,
        X::Error: Clone,
    {
        match &self.outcome {
            Some(Ok(value)) => Ok(Some(value.clone())),
            Some(Err(failure)) if self.should_throw => Err(failure.clone()),
            Some(Err(_)) => {
                debug!("transaction failure suppressed on resolve");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn attempt_limit(&self) -> u32 {
        self.attempt_limit
    }

    pub fn throws_on_resolve(&self) -> bool {
        self.should_throw
    }

    pub fn has_executed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.outcome, Some(Err(_)))
    }

    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&X::Error> {
        match &self.outcome {
            Some(Err(failure)) => Some(failure),
            _ => None,
        }
    }

    /// Consumes the runner, returning the raw outcome of the last execution.
    pub fn into_outcome(self) -> Option<Result<T, X::Error>> {
        self.outcome
    }
}

impl<X, T> fmt::Debug for TransactionRunner<'_, X, T>
where
    X: TransactionalExecutor,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match &self.outcome {
            None => "pending",
            Some(Ok(_)) => "succeeded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("TransactionRunner")
            .field("attempt_limit", &self.attempt_limit)
            .field("should_throw", &self.should_throw)
            .field("outcome", &outcome)
            .finish()
    }
}
