//! Immutable read view published through an atomic pointer.

use crate::entry::Entry;
use crate::overlay::Entries;
use crossbeam_epoch::Guard;
use std::borrow::Borrow;
use std::collections::hash_map;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

/// Read-only mapping consulted without the lock.
///
/// `incomplete` is set while the overlay holds keys missing here. The map is
/// behind an `Arc` so that flipping the flag republishes without copying.
pub(crate) struct Snapshot<K, V, S> {
    entries: Arc<Entries<K, V, S>>,
    incomplete: bool,
}

impl<K, V, S> Snapshot<K, V, S> {
    pub(crate) fn empty(hasher: S) -> Self {
        Self::complete(HashMap::with_hasher(hasher))
    }

    /// Snapshot holding every key, as published by a promotion.
    pub(crate) fn complete(entries: Entries<K, V, S>) -> Self {
        Self {
            entries: Arc::new(entries),
            incomplete: false,
        }
    }

    /// Same entries, flagged as missing keys that only the overlay has.
    pub(crate) fn amended(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            incomplete: true,
        }
    }

    #[inline]
    pub(crate) fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub(crate) fn iter(&self) -> hash_map::Iter<'_, K, Arc<Entry<V>>> {
        self.entries.iter()
    }
}

impl<K, V, S> Snapshot<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    #[inline]
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key)
    }

    /// Builds a new overlay from this snapshot.
    ///
    /// Absent entries are expunged and left out, so a lock-free writer still
    /// holding this snapshot cannot revive a key the overlay no longer has.
    /// Returns the overlay and the number of entries expunged.
    pub(crate) fn rebuild_overlay(&self, hasher: S, guard: &Guard) -> (Entries<K, V, S>, usize)
    where
        K: Clone,
    {
        let mut overlay = HashMap::with_capacity_and_hasher(self.entries.len(), hasher);
        let mut expunged = 0;
        for (key, entry) in self.entries.iter() {
            if entry.try_expunge_locked(guard) {
                expunged += 1;
            } else {
                overlay.insert(key.clone(), Arc::clone(entry));
            }
        }
        (overlay, expunged)
    }
}
