//! The driver module centralizes access to the shared atomic key-value
//! backend that serves as the fleet's sole coordination point.
//!
//! It defines the primitives every backend must implement to be a compliant
//! shared store. All primitives are atomic per key under arbitrary
//! concurrent callers; no client-side locking is assumed anywhere in the
//! coordination layer.

use std::sync::Arc;

use data_model::CoordinationError;

use crate::keys::Key;

pub mod memory;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("shared store unavailable: {source}")]
    Unavailable { source: anyhow::Error },

    #[error("shared store operation timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("failed to decode a stored record. error: {source}")]
    DecodeFailed { source: anyhow::Error },

    #[error("failed to encode a new record. error: {source}")]
    EncodeFailed { source: anyhow::Error },

    #[error("key {key} holds a {found} cell, expected {expected}")]
    WrongKind {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl Error {
    /// Identifies failed operations that the caller may retry with backoff.
    /// Schema violations and codec failures are permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(&self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

impl From<Error> for CoordinationError {
    fn from(err: Error) -> Self {
        CoordinationError::Store {
            source: anyhow::Error::new(err),
        }
    }
}

/// SharedStore defines the atomic primitives a backend must support.
///
/// Registries and the factory coordinator compose these primitives; every
/// decision step they take is atomic against the store, never against
/// in-process state.
pub trait SharedStore: Send + Sync {
    /// Adds `delta` to the counter at `key`, creating it at zero first.
    /// Returns the new value.
    fn atomic_increment(&self, key: &Key, delta: i64) -> Result<i64, Error>;

    /// Reads the record at `key`.
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, Error>;

    /// Conditionally replaces the record at `key`: the swap applies only if
    /// the current value equals `expected` (`None` meaning absent). `new` of
    /// `None` deletes the record. Returns whether the swap applied.
    fn compare_and_swap(
        &self,
        key: &Key,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, Error>;

    /// Deletes the record, set, or hash at `key`. Returns whether anything
    /// existed.
    fn delete(&self, key: &Key) -> Result<bool, Error>;

    /// Adds `member` to the set at `key`. Returns false if it was already
    /// present.
    fn set_add(&self, key: &Key, member: &[u8]) -> Result<bool, Error>;

    /// Atomically removes and returns one member of the set at `key`. No
    /// ordering guarantee beyond "each member is handed out exactly once".
    fn atomic_pop_from_set(&self, key: &Key) -> Result<Option<Vec<u8>>, Error>;

    /// Removes `member` from the set at `key`. Returns whether it was
    /// present.
    fn set_remove(&self, key: &Key, member: &[u8]) -> Result<bool, Error>;

    /// Reads one field of the hash at `key`. Absent hash and absent field
    /// are indistinguishable, both yield `None`.
    fn hash_get(&self, key: &Key, field: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Writes one field of the hash at `key`, creating the hash if needed.
    /// Returns true only on the first write of that field.
    fn hash_set(&self, key: &Key, field: &str, value: &[u8]) -> Result<bool, Error>;
}

/// Options to configure different shared-store backends.
///
/// The in-process memory backend is the only one wired up at the moment;
/// a networked backend plugs in here without touching any caller.
#[non_exhaustive]
pub enum ConnectionOptions {
    Memory,
}

/// Open a connection to a shared store.
///
/// This is the main entry point for wiring the coordination layer to its
/// backend.
pub fn open_store(options: ConnectionOptions) -> Result<Arc<dyn SharedStore>, Error> {
    match options {
        ConnectionOptions::Memory => Ok(Arc::new(memory::MemoryDriver::default())),
    }
}
