//! The concurrent map.
//!
//! # Architecture
//! - **Snapshot**: immutable `key -> entry` table behind an epoch-protected
//!   pointer. Lookups and in-place updates of keys found here never lock.
//! - **Overlay**: superset of the snapshot's live keys plus new ones, behind a
//!   single mutex. Only new keys and snapshot misses go through it.
//! - **Promotion**: every locked lookup is a miss; once misses reach the
//!   overlay size the overlay becomes the snapshot. A stable key set ends up
//!   entirely on the lock-free path.

use crate::entry::{Entry, Staged};
use crate::overlay::{Entries, Overlay};
use crate::snapshot::Snapshot;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;
use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Hash builder used by [`SyncMap::new`].
pub type DefaultHashBuilder = foldhash::fast::RandomState;

/// Entry resolved by a lookup. Snapshot entries are borrowed for the guard's
/// lifetime; overlay entries are kept alive by a strong reference because the
/// overlay can drop them once the lock is released.
enum EntryRef<'g, V> {
    Snapshot(&'g Entry<V>),
    Overlay(Arc<Entry<V>>),
}

impl<V> Deref for EntryRef<'_, V> {
    type Target = Entry<V>;

    #[inline]
    fn deref(&self) -> &Entry<V> {
        match self {
            EntryRef::Snapshot(entry) => *entry,
            EntryRef::Overlay(entry) => &**entry,
        }
    }
}

/// Concurrent map tuned for read-mostly workloads over a stable key set.
///
/// All operations take `&self` and can be called from any number of threads,
/// typically through an `Arc<SyncMap<K, V>>`.
///
/// Reads and updates of keys already promoted into the snapshot are lock-free.
/// Inserting a key the snapshot does not know yet takes an internal mutex, and
/// so do lookups that miss the snapshot while unpromoted keys exist. Values are
/// returned by clone; wrap expensive values in `Arc`.
///
/// # Type Parameters
///
/// - `K`: Key type (must implement `Hash`, `Eq` and `Clone`)
/// - `V`: Value type (must implement `Clone`)
/// - `S`: Hash builder, [`DefaultHashBuilder`] by default
///
/// # Examples
///
/// ```
/// use kovan_syncmap::SyncMap;
///
/// let map = SyncMap::new();
/// map.store("a", 1);
/// map.store("b", 2);
/// assert_eq!(map.load("a"), Some(1));
///
/// assert!(map.compare_and_swap("a", &1, 9));
/// assert_eq!(map.load("a"), Some(9));
/// assert!(!map.compare_and_swap("a", &1, 5));
///
/// map.delete("b");
/// assert_eq!(map.load("b"), None);
/// ```
pub struct SyncMap<K, V, S = DefaultHashBuilder> {
    snapshot: CachePadded<Atomic<Snapshot<K, V, S>>>,
    overlay: Mutex<Overlay<K, V, S>>,
    hasher: S,
}

impl<K, V> SyncMap<K, V, DefaultHashBuilder> {
    /// Creates an empty map.
    ///
    /// # Examples
    ///
    /// ```
    /// use kovan_syncmap::SyncMap;
    ///
    /// let map: SyncMap<u64, String> = SyncMap::new();
    /// assert!(map.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, V, S: Clone> SyncMap<K, V, S> {
    /// Creates an empty map using `hasher` for both the snapshot and the
    /// overlay.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            snapshot: CachePadded::new(Atomic::new(Snapshot::empty(hasher.clone()))),
            overlay: Mutex::new(Overlay::new()),
            hasher,
        }
    }

    /// Returns a reference to the map's hash builder.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

impl<K, V, S> SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Returns a clone of the value stored for `key`.
    ///
    /// Lock-free when `key` is in the snapshot or when no unpromoted keys
    /// exist.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &epoch::pin();
        self.find(key, guard)?.load(guard).cloned()
    }

    /// Returns `true` if the map holds a value for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &epoch::pin();
        self.find(key, guard)
            .is_some_and(|entry| entry.load(guard).is_some())
    }

    /// Sets the value for `key`.
    pub fn store(&self, key: K, value: V) {
        self.swap(key, value);
    }

    /// Sets the value for `key`, returning the previous one.
    ///
    /// # Examples
    ///
    /// ```
    /// use kovan_syncmap::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// assert_eq!(map.swap(1, "a"), None);
    /// assert_eq!(map.swap(1, "b"), Some("a"));
    /// ```
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let mut staged = Staged::new(value);
        if let Some(entry) = self.snapshot(guard).get(&key) {
            match entry.try_swap(staged, guard) {
                Ok(previous) => return previous,
                Err(back) => staged = back,
            }
        }

        let mut overlay = self.lock();
        let snapshot = self.snapshot(guard);
        if let Some(entry) = snapshot.get(&key) {
            if entry.unexpunge_locked(guard) {
                self.overlay_entries_locked(&mut overlay, snapshot, guard)
                    .insert(key, Arc::clone(entry));
            }
            entry.swap_locked(staged, guard)
        } else if let Some(entry) = overlay.get(&key).cloned() {
            entry.swap_locked(staged, guard)
        } else {
            self.insert_locked(&mut overlay, snapshot, key, staged, guard);
            None
        }
    }

    /// Returns the existing value for `key` if present, otherwise stores
    /// `value`.
    ///
    /// The flag is `true` when the value was loaded, `false` when `value` was
    /// stored. Concurrent calls for the same missing key store exactly once;
    /// the others load the winner's value.
    ///
    /// # Examples
    ///
    /// ```
    /// use kovan_syncmap::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// assert_eq!(map.load_or_store("k", 1), (1, false));
    /// assert_eq!(map.load_or_store("k", 2), (1, true));
    /// ```
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        let guard = &epoch::pin();
        let snapshot = self.snapshot(guard);
        let staged = match snapshot.get(&key) {
            Some(entry) => {
                if let Some(existing) = entry.load(guard) {
                    return (existing.clone(), true);
                }
                match entry.try_load_or_store(Staged::new(value), guard) {
                    Ok(outcome) => return outcome,
                    Err(back) => back,
                }
            }
            None => Staged::new(value),
        };

        let mut overlay = self.lock();
        let snapshot = self.snapshot(guard);
        if let Some(entry) = snapshot.get(&key) {
            if entry.unexpunge_locked(guard) {
                self.overlay_entries_locked(&mut overlay, snapshot, guard)
                    .insert(key, Arc::clone(entry));
            }
            entry.load_or_store_locked(staged, guard)
        } else if let Some(entry) = overlay.get(&key).cloned() {
            let outcome = entry.load_or_store_locked(staged, guard);
            self.miss_locked(&mut overlay, guard);
            outcome
        } else {
            let actual = staged.value().clone();
            self.insert_locked(&mut overlay, snapshot, key, staged, guard);
            (actual, false)
        }
    }

    /// Removes `key`, returning the value it held.
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = &epoch::pin();
        let snapshot = self.snapshot(guard);
        if let Some(entry) = snapshot.get(key) {
            return entry.delete(guard);
        }
        if !snapshot.is_incomplete() {
            return None;
        }

        let entry = {
            let mut overlay = self.lock();
            let snapshot = self.snapshot(guard);
            match snapshot.get(key) {
                Some(entry) => EntryRef::Snapshot(entry),
                None if snapshot.is_incomplete() => {
                    let removed = overlay.remove(key);
                    self.miss_locked(&mut overlay, guard);
                    EntryRef::Overlay(removed?)
                }
                None => return None,
            }
        };
        entry.delete(guard)
    }

    /// Removes `key`. Missing keys are ignored.
    pub fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.load_and_delete(key);
    }

    /// Replaces the value for `key` with `new` if it currently equals `old`.
    ///
    /// Equality is `V`'s [`PartialEq`], i.e. a structural comparison, never
    /// identity. Never inserts a missing key.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = &epoch::pin();
        match self.find(key, guard) {
            Some(entry) => entry.try_compare_and_swap(old, new, guard),
            None => false,
        }
    }

    /// Removes `key` if its value currently equals `old`.
    ///
    /// Equality is `V`'s [`PartialEq`]. Returns whether the key was removed.
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let guard = &epoch::pin();
        match self.find(key, guard) {
            Some(entry) => entry.compare_and_delete(old, guard),
            None => false,
        }
    }

    /// Calls `f` for every present key and value until it returns `false`.
    ///
    /// Unpromoted keys are promoted first, so every key present when the call
    /// starts is visited exactly once unless it is deleted meanwhile. Keys
    /// added during the walk may or may not be seen. `f` runs without the
    /// internal lock held and may call back into the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use kovan_syncmap::SyncMap;
    ///
    /// let map = SyncMap::new();
    /// for i in 0..10 {
    ///     map.store(i, i * 10);
    /// }
    /// let mut sum = 0;
    /// map.range(|_, v| {
    ///     sum += v;
    ///     true
    /// });
    /// assert_eq!(sum, 450);
    /// ```
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = &epoch::pin();
        let mut snapshot = self.snapshot(guard);
        if snapshot.is_incomplete() {
            let mut overlay = self.lock();
            snapshot = self.snapshot(guard);
            if snapshot.is_incomplete() {
                self.promote_locked(&mut overlay, true, guard);
                snapshot = self.snapshot(guard);
            }
        }

        for (key, entry) in snapshot.iter() {
            if let Some(value) = entry.load(guard) {
                if !f(key, value) {
                    break;
                }
            }
        }
    }

    /// Returns the number of present keys.
    ///
    /// Walks the map with [`range`](Self::range); under concurrent writes the
    /// result is a point-in-time approximation.
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.range(|_, _| {
            count += 1;
            true
        });
        count
    }

    /// Returns `true` if no key holds a value.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.range(|_, _| {
            empty = false;
            false
        });
        empty
    }

    /// Removes every key.
    ///
    /// Writes racing with the clear through an already loaded snapshot may be
    /// lost.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let mut overlay = self.lock();
        let dropped = overlay.take().map_or(0, |entries| entries.len());
        self.publish(Snapshot::empty(self.hasher.clone()), guard);
        debug!(overlay = dropped, "cleared map");
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    #[inline]
    fn snapshot<'g>(&self, guard: &'g Guard) -> &'g Snapshot<K, V, S> {
        // SAFETY: the pointer is never null, and a replaced snapshot is only
        // destroyed after every guard pinned before the swap is released.
        unsafe { self.snapshot.load(Ordering::Acquire, guard).deref() }
    }

    fn lock(&self) -> MutexGuard<'_, Overlay<K, V, S>> {
        // Overlay updates are single map calls, a panicking `Hash` or `Eq`
        // cannot leave it half-written.
        self.overlay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves `key`, falling back to the overlay under the lock. Every
    /// overlay lookup counts as a miss, found or not.
    fn find<'g, Q>(&self, key: &Q, guard: &'g Guard) -> Option<EntryRef<'g, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let snapshot = self.snapshot(guard);
        if let Some(entry) = snapshot.get(key) {
            return Some(EntryRef::Snapshot(entry));
        }
        if !snapshot.is_incomplete() {
            return None;
        }

        let mut overlay = self.lock();
        let snapshot = self.snapshot(guard);
        if let Some(entry) = snapshot.get(key) {
            return Some(EntryRef::Snapshot(entry));
        }
        if !snapshot.is_incomplete() {
            return None;
        }
        let entry = overlay.get(key).cloned();
        self.miss_locked(&mut overlay, guard);
        entry.map(EntryRef::Overlay)
    }

    /// Replaces the published snapshot. Lock held.
    fn publish(&self, snapshot: Snapshot<K, V, S>, guard: &Guard) {
        let old = self
            .snapshot
            .swap(Owned::new(snapshot), Ordering::AcqRel, guard);
        // SAFETY: `old` is unlinked; readers that still hold it are pinned.
        unsafe { guard.defer_destroy(old) };
    }

    /// Returns the overlay's entries. Rebuilds the overlay from `snapshot` if
    /// none exists and flags a complete snapshot incomplete. Lock held.
    fn overlay_entries_locked<'o>(
        &self,
        overlay: &'o mut Overlay<K, V, S>,
        snapshot: &Snapshot<K, V, S>,
        guard: &Guard,
    ) -> &'o mut Entries<K, V, S> {
        if !snapshot.is_incomplete() {
            self.publish(snapshot.amended(), guard);
        }
        overlay.activate(|| {
            let (entries, expunged) = snapshot.rebuild_overlay(self.hasher.clone(), guard);
            trace!(carried = entries.len(), expunged, "rebuilt overlay from snapshot");
            entries
        })
    }

    /// Adds a brand-new key to the overlay. Lock held.
    fn insert_locked(
        &self,
        overlay: &mut Overlay<K, V, S>,
        snapshot: &Snapshot<K, V, S>,
        key: K,
        staged: Staged<V>,
        guard: &Guard,
    ) {
        self.overlay_entries_locked(overlay, snapshot, guard)
            .insert(key, Arc::new(Entry::new(staged)));
    }

    fn miss_locked(&self, overlay: &mut Overlay<K, V, S>, guard: &Guard) {
        if overlay.record_miss() {
            self.promote_locked(overlay, false, guard);
        }
    }

    /// Publishes the overlay as a complete snapshot. Lock held.
    fn promote_locked(&self, overlay: &mut Overlay<K, V, S>, forced: bool, guard: &Guard) {
        let misses = overlay.misses();
        if let Some(entries) = overlay.take() {
            trace!(entries = entries.len(), misses, forced, "promoted overlay to snapshot");
            self.publish(Snapshot::complete(entries), guard);
        }
    }
}

impl<K, V> Default for SyncMap<K, V, DefaultHashBuilder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> fmt::Debug for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + fmt::Debug + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        self.range(|key, value| {
            map.entry(key, value);
            true
        });
        map.finish()
    }
}

impl<K, V, S> FromIterator<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::with_hasher(S::default());
        for (key, value) in iter {
            map.store(key, value);
        }
        map
    }
}

impl<K, V, S> Extend<(K, V)> for SyncMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.store(key, value);
        }
    }
}

impl<K, V, S> Drop for SyncMap<K, V, S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent readers of the current
        // snapshot; retired ones are owned by the collector.
        unsafe {
            let snapshot = self.snapshot.load(Ordering::Relaxed, epoch::unprotected());
            if !snapshot.is_null() {
                drop(snapshot.into_owned());
            }
        }
    }
}
