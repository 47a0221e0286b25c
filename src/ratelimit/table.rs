//! Lock-sharded per-key state table.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Result, TurnstileError};

/// Per-key limiter state, partitioned into independently locked shards.
///
/// Every read-modify-write on a key's state runs while holding that key's
/// shard lock, so calls touching the same key are serialized while keys in
/// other shards proceed in parallel.
pub struct StateTable<S> {
    states: DashMap<String, S>,
}

impl<S> StateTable<S> {
    /// Create a table with DashMap's default shard count.
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Create a table with `shards` partitions. Must be a power of two, at least 2.
    pub fn with_shards(shards: usize) -> Result<Self> {
        if shards < 2 || !shards.is_power_of_two() {
            return Err(TurnstileError::Config(format!(
                "shards must be a power of two and at least 2, got {}",
                shards
            )));
        }
        Ok(Self {
            states: DashMap::with_shard_amount(shards),
        })
    }

    /// Run `f` on the state for `key` inside its critical section, creating
    /// the state with `init` if this is the first time `key` is seen.
    ///
    /// Returns `f`'s result and whether the state was created by this call.
    /// The shard lock is released before returning.
    pub fn with_state<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> (R, bool) {
        // Fast path avoids allocating an owned key for known users.
        if let Some(mut state) = self.states.get_mut(key) {
            return (f(state.value_mut()), false);
        }

        match self.states.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => (f(entry.get_mut()), false),
            Entry::Vacant(entry) => {
                let mut state = entry.insert(init());
                (f(state.value_mut()), true)
            }
        }
    }

    /// Read the state for `key` without creating it.
    pub fn inspect<R>(&self, key: &str, f: impl FnOnce(&S) -> R) -> Option<R> {
        self.states.get(key).map(|state| f(state.value()))
    }

    /// Keep only entries for which `keep` returns `true`. Returns how many were removed.
    pub fn retain(&self, mut keep: impl FnMut(&str, &mut S) -> bool) -> usize {
        let before = self.states.len();
        self.states.retain(|key, state| keep(key, state));
        before.saturating_sub(self.states.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop all state. Primarily useful for testing.
    pub fn clear(&self) {
        self.states.clear();
    }
}

impl<S> Default for StateTable<S> {
    fn default() -> Self {
        Self::new()
    }
}
