// ============================================================================
// In-Memory Transactional Store
// ============================================================================
//
// Key/value store implementing TransactionalExecutor.
//
// - Data lives in a persistent `im::HashMap`, so a savepoint is an O(1) clone
// - Every transaction scope pushes a frame holding the savepoint it rolls
//   back to; nested scopes stack on top of the enclosing one
// - Only the outermost scope retries, and only on write conflicts
// - The thread that opens the outermost scope owns the store until that
//   scope ends; other threads wait on a condvar, reads included
//
// ============================================================================

use crate::core::{Result, TxError};
use crate::transaction::{RetryPolicy, TransactionalExecutor};
use im::HashMap;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// A stored value together with its write version.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    /// Starts at 1 and grows by one with every write to the key.
    pub version: u64,
}

/// Per-store sequence number of a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScopeId(u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeEnd {
    Commit,
    Rollback,
}

impl fmt::Display for ScopeEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeEnd::Commit => write!(f, "commit"),
            ScopeEnd::Rollback => write!(f, "rollback"),
        }
    }
}

struct Frame {
    id: ScopeId,
    savepoint: HashMap<String, Entry>,
}

#[derive(Default)]
struct StoreState {
    data: HashMap<String, Entry>,
    frames: Vec<Frame>,
    /// Thread running the open transaction, if any.
    owner: Option<ThreadId>,
    last_scope: u64,
}

impl StoreState {
    fn held_by_other_thread(&self) -> bool {
        self.owner.is_some_and(|owner| owner != thread::current().id())
    }

    /// Closes scope `id` and every scope nested inside it.
    ///
    /// Returns `true` when this released the store to other threads.
    fn end_scope(&mut self, id: ScopeId, end: ScopeEnd) -> Result<bool> {
        let Some(position) = self.frames.iter().rposition(|frame| frame.id == id) else {
            return Err(TxError::ExecutionError(format!("{} is not an open scope", id)));
        };
        let level = self.frames.len();
        if end == ScopeEnd::Commit && position + 1 != level {
            return Err(TxError::ExecutionError(format!(
                "{} cannot commit while {} nested scope(s) are open",
                id,
                level - position - 1
            )));
        }

        if let Some(frame) = self.frames.drain(position..).next() {
            if end == ScopeEnd::Rollback {
                self.data = frame.savepoint;
            }
        }
        debug!("{} {} (level {})", id, end, level);

        if self.frames.is_empty() {
            self.owner = None;
            return Ok(true);
        }
        Ok(false)
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<StoreState>,
    released: Condvar,
}

/// Embedded transactional key/value store.
///
/// Clones share the same data. While a thread is inside a transaction, every
/// other thread touching the store blocks until that transaction ends, so a
/// thread must not wait on another thread that uses the store from inside its
/// own transaction.
///
/// Writes outside a transaction apply immediately.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    policy: RetryPolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::default(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        let state = self.shared.state.lock()?;
        Ok(self
            .shared
            .released
            .wait_while(state, |state| state.held_by_other_thread())?)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock()?.data.get(key).map(|entry| entry.value.clone()))
    }

    /// Reads `key` and deserializes it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn entry(&self, key: &str) -> Result<Option<Entry>> {
        Ok(self.lock()?.data.get(key).cloned())
    }

    pub fn version(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.lock()?.data.get(key).map(|entry| entry.version))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.data.contains_key(key))
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.lock()?.data.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.data.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Writes a new key, failing if it already exists.
    pub fn insert(&self, key: &str, value: impl Serialize) -> Result<u64> {
        let value = serde_json::to_value(value)?;
        let mut state = self.lock()?;
        if state.data.contains_key(key) {
            return Err(TxError::ConstraintViolation(format!(
                "key '{}' already exists",
                key
            )));
        }
        Ok(write_entry(&mut state, key, value))
    }

    /// Inserts or overwrites `key`, returning the new version.
    pub fn put(&self, key: &str, value: impl Serialize) -> Result<u64> {
        let value = serde_json::to_value(value)?;
        let mut state = self.lock()?;
        Ok(write_entry(&mut state, key, value))
    }

    /// Overwrites `key` only if it is still at `expected_version`.
    ///
    /// A missing key is at version 0. A mismatch is reported as a
    /// [`TxError::WriteConflict`], which the outermost transaction retries.
    pub fn put_if_version(
        &self,
        key: &str,
        expected_version: u64,
        value: impl Serialize,
    ) -> Result<u64> {
        let value = serde_json::to_value(value)?;
        let mut state = self.lock()?;
        let current = state.data.get(key).map_or(0, |entry| entry.version);
        if current != expected_version {
            return Err(TxError::WriteConflict(format!(
                "key '{}' is at version {}, expected {}",
                key, current, expected_version
            )));
        }
        Ok(write_entry(&mut state, key, value))
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.data.remove(key).is_some())
    }

    // ------------------------------------------------------------------
    // Transaction scopes
    // ------------------------------------------------------------------

    /// Number of open transaction scopes; 0 outside any transaction.
    pub fn transaction_level(&self) -> Result<usize> {
        Ok(self.lock()?.frames.len())
    }

    pub fn in_transaction(&self) -> Result<bool> {
        Ok(self.transaction_level()? > 0)
    }

    fn begin(&self) -> Result<ScopeGuard<'_>> {
        let mut state = self.lock()?;
        state.last_scope += 1;
        let id = ScopeId(state.last_scope);
        let savepoint = state.data.clone();
        state.frames.push(Frame { id, savepoint });
        state.owner = Some(thread::current().id());
        let level = state.frames.len();
        debug!("{} begin (level {})", id, level);

        Ok(ScopeGuard {
            store: self,
            id,
            level,
            finished: false,
        })
    }

    fn should_retry(&self, attempt: u32, max_attempts: u32, err: &TxError) -> bool {
        attempt < max_attempts && self.policy.retry_write_conflicts && err.is_write_conflict()
    }
}

fn write_entry(state: &mut StoreState, key: &str, value: Value) -> u64 {
    let version = state.data.get(key).map_or(0, |entry| entry.version) + 1;
    state.data.insert(key.to_string(), Entry { value, version });
    version
}

/// Open transaction scope; rolls back on drop unless closed.
struct ScopeGuard<'s> {
    store: &'s MemoryStore,
    id: ScopeId,
    level: usize,
    finished: bool,
}

impl ScopeGuard<'_> {
    /// On error the scope stays open and `Drop` rolls it back.
    fn close(mut self, end: ScopeEnd) -> Result<()> {
        let released = self.store.lock()?.end_scope(self.id, end)?;
        self.finished = true;
        if released {
            self.store.shared.released.notify_all();
        }
        Ok(())
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let released = self
            .store
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .end_scope(self.id, ScopeEnd::Rollback);
        match released {
            Ok(true) => self.store.shared.released.notify_all(),
            Ok(false) => {}
            Err(err) => warn!("Rollback of abandoned {} failed: {}", self.id, err),
        }
    }
}

impl TransactionalExecutor for MemoryStore {
    type Error = TxError;

    /// Runs `work` in a new scope, committing on `Ok` and rolling back on `Err`.
    ///
    /// An `attempt_limit` of 0 is treated as 1.
    fn execute_transaction<T, F>(&self, mut work: F, attempt_limit: u32) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = attempt_limit.max(1);
        let mut attempt = 1u32;
        loop {
            let scope = self.begin()?;
            let (id, level) = (scope.id, scope.level);

            match work() {
                Ok(value) => {
                    scope.close(ScopeEnd::Commit)?;
                    return Ok(value);
                }
                Err(err) => {
                    if let Err(close_err) = scope.close(ScopeEnd::Rollback) {
                        warn!("Rollback of {} failed: {}", id, close_err);
                    }
                    if level > 1 || !self.should_retry(attempt, max_attempts, &err) {
                        return Err(err);
                    }

                    let backoff_ms = self.policy.backoff_ms(attempt);
                    warn!(
                        "MemoryStore transaction retry on conflict \
                         (attempt {} of {}): {} (backoff={}ms)",
                        attempt, max_attempts, err, backoff_ms
                    );
                    if backoff_ms > 0 {
                        thread::sleep(Duration::from_millis(backoff_ms));
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::mpsc;

    #[test]
    fn test_writes_outside_transaction_apply_immediately() {
        let store = MemoryStore::new();
        assert_eq!(store.put("a", 1).unwrap(), 1);
        assert_eq!(store.put("a", 2).unwrap(), 2);

        assert_eq!(store.get_as::<i32>("a").unwrap(), Some(2));
        assert_eq!(store.version("a").unwrap(), Some(2));
        assert!(!store.in_transaction().unwrap());
    }

    #[test]
    fn test_commit_keeps_changes() {
        let store = MemoryStore::new();
        let value = store
            .execute_transaction(
                || {
                    assert_eq!(store.transaction_level()?, 1);
                    store.put("a", "x")?;
                    Ok("done")
                },
                1,
            )
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(store.get("a").unwrap(), Some(Value::from("x")));
        assert_eq!(store.transaction_level().unwrap(), 0);
    }

    #[test]
    fn test_rollback_restores_savepoint() {
        let store = MemoryStore::new();
        store.put("kept", 1).unwrap();

        let result: Result<()> = store.execute_transaction(
            || {
                store.put("kept", 2)?;
                store.put("lost", 3)?;
                Err(anyhow!("abort").into())
            },
            1,
        );

        assert!(result.is_err());
        assert_eq!(store.get_as::<i32>("kept").unwrap(), Some(1));
        assert_eq!(store.version("kept").unwrap(), Some(1));
        assert!(!store.contains_key("lost").unwrap());
    }

    #[test]
    fn test_insert_rejects_existing_key() {
        let store = MemoryStore::new();
        store.insert("user:1", "alice").unwrap();

        let err = store.insert("user:1", "bob").unwrap_err();
        assert!(matches!(err, TxError::ConstraintViolation(_)));
        assert_eq!(store.get_as::<String>("user:1").unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn test_put_if_version_detects_conflict() {
        let store = MemoryStore::new();
        assert_eq!(store.put_if_version("k", 0, "first").unwrap(), 1);

        let err = store.put_if_version("k", 0, "second").unwrap_err();
        assert!(err.is_write_conflict());
        assert_eq!(err.to_string(), "Write conflict: key 'k' is at version 1, expected 0");
    }

    #[test]
    fn test_panicking_work_rolls_back() {
        let store = MemoryStore::new();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = store.execute_transaction(
                || -> Result<()> {
                    store.put("ghost", true)?;
                    panic!("work blew up");
                },
                1,
            );
        }));

        assert!(outcome.is_err());
        assert_eq!(store.transaction_level().unwrap(), 0);
        assert!(!store.contains_key("ghost").unwrap());
    }

    #[test]
    fn test_delete_inside_rolled_back_transaction_is_undone() {
        let store = MemoryStore::new();
        store.put("session", "open").unwrap();

        let _ = store.execute_transaction(
            || -> Result<()> {
                assert!(store.delete("session")?);
                assert!(!store.delete("session")?);
                Err(TxError::ExecutionError("cancelled".into()))
            },
            1,
        );

        assert_eq!(store.entry("session").unwrap().map(|e| e.version), Some(1));
    }

    #[test]
    fn test_overlapping_scopes_from_two_threads_are_serialized() {
        let store = MemoryStore::new();
        let store = &store;
        let (began_tx, began_rx) = mpsc::channel();

        thread::scope(|s| {
            let first = s.spawn(move || {
                let scope = store.begin()?;
                store.put("first", 1)?;
                let _ = began_tx.send(());
                thread::sleep(Duration::from_millis(50));
                scope.close(ScopeEnd::Rollback)
            });
            began_rx.recv().unwrap();

            let second = s.spawn(move || {
                let scope = store.begin()?;
                let level = store.transaction_level()?;
                store.put("second", 2)?;
                scope.close(ScopeEnd::Commit)?;
                Ok::<_, TxError>(level)
            });

            assert!(first.join().unwrap().is_ok());
            assert_eq!(second.join().unwrap().unwrap(), 1);
        });

        assert_eq!(store.transaction_level().unwrap(), 0);
        assert!(!store.contains_key("first").unwrap());
        assert_eq!(store.get_as::<i32>("second").unwrap(), Some(2));
    }

    #[test]
    fn test_failed_commit_rolls_back_abandoned_nested_scopes() {
        let store = MemoryStore::new();
        let outer = store.begin().unwrap();
        store.put("outer", 1).unwrap();
        std::mem::forget(store.begin().unwrap());
        store.put("inner", 2).unwrap();

        let err = outer.close(ScopeEnd::Commit).unwrap_err();

        assert!(matches!(err, TxError::ExecutionError(_)));
        assert_eq!(store.transaction_level().unwrap(), 0);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_work_failure_survives_failed_rollback() {
        let store = MemoryStore::new();

        let result: Result<()> = store.execute_transaction(
            || {
                store.put("draft", 1)?;
                // Close the enclosing scope behind the executor's back.
                let mut state = store.lock()?;
                let id = ScopeId(state.last_scope);
                state.end_scope(id, ScopeEnd::Rollback)?;
                Err(TxError::ConstraintViolation("work failed".into()))
            },
            1,
        );

        match result {
            Err(TxError::ConstraintViolation(message)) => assert_eq!(message, "work failed"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.transaction_level().unwrap(), 0);
        assert!(!store.contains_key("draft").unwrap());
    }

    #[test]
    fn test_clones_share_data() {
        let store = MemoryStore::new();
        let other = store.clone();
        other.put("shared", 1).unwrap();

        assert_eq!(store.keys().unwrap(), vec!["shared".to_string()]);
        assert_eq!(store.len().unwrap(), 1);
        assert!(!store.is_empty().unwrap());
    }
}
