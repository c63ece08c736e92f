//! Lock-guarded overlay of keys not yet promoted into the snapshot, and the
//! miss counter that decides when to promote it.

use crate::entry::Entry;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

/// Key to entry mapping shared by the snapshot and the overlay.
pub(crate) type Entries<K, V, S> = HashMap<K, Arc<Entry<V>>, S>;

/// State owned by whoever holds the map's mutex.
pub(crate) struct Overlay<K, V, S> {
    entries: Option<Entries<K, V, S>>,
    misses: usize,
}

impl<K, V, S> Overlay<K, V, S> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: None,
            misses: 0,
        }
    }

    /// Whether an overlay currently exists.
    pub(crate) fn is_active(&self) -> bool {
        self.entries.is_some()
    }

    /// Returns the overlay's entries, installing the ones built by `rebuild`
    /// first if no overlay exists.
    pub(crate) fn activate<F>(&mut self, rebuild: F) -> &mut Entries<K, V, S>
    where
        F: FnOnce() -> Entries<K, V, S>,
    {
        self.entries.get_or_insert_with(rebuild)
    }

    /// Counts one lock-requiring lookup.
    ///
    /// Returns `true` once misses have caught up with the overlay size, at
    /// which point the caller promotes the overlay with [`take`](Self::take).
    pub(crate) fn record_miss(&mut self) -> bool {
        self.misses += 1;
        self.misses >= self.len()
    }

    pub(crate) fn misses(&self) -> usize {
        self.misses
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, HashMap::len)
    }

    /// Detaches the overlay for promotion and resets the miss counter.
    pub(crate) fn take(&mut self) -> Option<Entries<K, V, S>> {
        self.misses = 0;
        self.entries.take()
    }
}

impl<K, V, S> Overlay<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub(crate) fn get<Q>(&self, key: &Q) -> Option<&Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.as_ref()?.get(key)
    }

    pub(crate) fn remove<Q>(&mut self, key: &Q) -> Option<Arc<Entry<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.as_mut()?.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Staged;
    use std::collections::hash_map::RandomState;

    fn overlay_with(keys: &[u32]) -> Overlay<u32, u32, RandomState> {
        let mut overlay = Overlay::new();
        let entries = overlay.activate(HashMap::default);
        for &k in keys {
            entries.insert(k, Arc::new(Entry::new(Staged::new(k))));
        }
        overlay
    }

    #[test]
    fn test_inactive_overlay() {
        let mut overlay: Overlay<u32, u32, RandomState> = Overlay::new();
        assert!(!overlay.is_active());
        assert!(overlay.get(&1).is_none());
        assert!(overlay.remove(&1).is_none());
        assert!(overlay.take().is_none());
    }

    #[test]
    fn test_promotion_after_len_misses() {
        let mut overlay = overlay_with(&[1, 2, 3]);
        assert!(!overlay.record_miss());
        assert!(!overlay.record_miss());
        assert!(overlay.record_miss());
        assert_eq!(overlay.misses(), 3);

        let entries = overlay.take().map(|m| m.len());
        assert_eq!(entries, Some(3));
        assert_eq!(overlay.misses(), 0);
        assert!(!overlay.is_active());
    }

    #[test]
    fn test_activate_keeps_existing() {
        let mut overlay = overlay_with(&[1]);
        let entries = overlay.activate(|| panic!("active overlay must not be rebuilt"));
        assert_eq!(entries.len(), 1);
        assert_eq!(overlay.len(), 1);
        assert!(overlay.get(&1).is_some());
        assert!(overlay.remove(&1).is_some());
        assert_eq!(overlay.len(), 0);
    }
}
