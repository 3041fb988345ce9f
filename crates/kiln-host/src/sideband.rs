//! Metadata sideband: the uuid-keyed table host callbacks consult.
//!
//! While a request is `Running`, exactly one entry for its uuid lives
//! here. Worker-invoked host functions look their caller's metadata up by
//! the uuid stamped into the request; the dispatcher removes the entry
//! after the user callback is prepared.
//!
//! The map is sharded by uuid hash so callback routing from many workers
//! never contends on one lock, and no lock is ever held across I/O.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use kiln_core::tags::Severity;

/// Tenant metadata attached to one request: an opaque string mapping the
/// core never interprets.
pub type Metadata = HashMap<String, String>;

/// The per-request record stored in the sideband: tenant metadata plus
/// the host-owned scalars callbacks need.
#[derive(Debug, Clone)]
pub struct SidebandEntry {
    /// Tenant metadata, stored by value.
    pub metadata: Metadata,
    /// Severity floor for the builtin log binding.
    pub min_log_level: Severity,
    /// Caller-supplied correlation id, if any.
    pub request_id: Option<String>,
}

/// Sharded concurrent map from request uuid to a value stored by value.
///
/// Generic so tests can instantiate it with small value types; the host
/// uses `Sideband<SidebandEntry>`.
#[derive(Debug)]
pub struct Sideband<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
}

/// Shard count; power of two so the hash masks cheaply.
const SHARDS: usize = 16;

impl<V> Sideband<V> {
    /// Creates an empty sideband.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, uuid: &str) -> &RwLock<HashMap<String, V>> {
        let mut hasher = DefaultHasher::new();
        uuid.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (SHARDS - 1)]
    }

    /// Inserts the entry for `uuid`, returning any displaced value.
    ///
    /// A displaced value indicates a uuid collision, which the dispatcher
    /// treats as an internal invariant violation.
    pub fn insert(&self, uuid: &str, value: V) -> Option<V> {
        self.shard(uuid)
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(uuid.to_owned(), value)
    }

    /// Removes and returns the entry for `uuid`.
    pub fn remove(&self, uuid: &str) -> Option<V> {
        self.shard(uuid)
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(uuid)
    }

    /// Runs `f` against the entry for `uuid` under the shard read lock.
    ///
    /// `f` must not block; the sideband is the innermost lock in the
    /// host's lock order.
    pub fn with_value<R>(&self, uuid: &str, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(uuid)
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(uuid)
            .map(f)
    }

    /// Number of live entries across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .len()
            })
            .sum()
    }

    /// True when no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for Sideband<V> {
    fn default() -> Self {
        Self::new()
    }
}
