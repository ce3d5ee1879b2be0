use super::TransactionRunner;

/// A backend able to run a unit of work atomically.
///
/// Implementations must commit everything `work` did or roll all of it back,
/// may invoke `work` again (up to `attempt_limit` times) after a recoverable
/// write conflict, and must let `work` open nested transactions on the same
/// executor. A nested call participates in the enclosing transaction.
///
/// What an `attempt_limit` of zero means is up to the implementation.
pub trait TransactionalExecutor {
    type Error;

    fn execute_transaction<T, F>(&self, work: F, attempt_limit: u32) -> Result<T, Self::Error>
    where
        F: FnMut() -> Result<T, Self::Error>;

    /// Starts a fluent [`TransactionRunner`] bound to this executor.
    fn runner<T>(&self) -> TransactionRunner<'_, Self, T>
    where
        Self: Sized,
    {
        TransactionRunner::create(self)
    }
}

impl<X: TransactionalExecutor> TransactionalExecutor for &X {
    type Error = X::Error;

    fn execute_transaction<T, F>(&self, work: F, attempt_limit: u32) -> Result<T, Self::Error>
    where
        F: FnMut() -> Result<T, Self::Error>,
    {
        (**self).execute_transaction(work, attempt_limit)
    }
}

impl<X: TransactionalExecutor> TransactionalExecutor for std::sync::Arc<X> {
    type Error = X::Error;

    fn execute_transaction<T, F>(&self, work: F, attempt_limit: u32) -> Result<T, Self::Error>
    where
        F: FnMut() -> Result<T, Self::Error>,
    {
        (**self).execute_transaction(work, attempt_limit)
    }
}
