//! Per-key atomic cell.
//!
//! An [`Entry`] owns one epoch-protected pointer to a boxed [`Slot`]. Every
//! state change installs a fresh box with a compare-and-swap and retires the
//! previous one through `defer_destroy`, so a reader that loaded the old slot
//! under its guard can keep borrowing from it.
//!
//! State machine:
//!
//! ```text
//!   Present(v) ──delete──▶ Absent ──rebuild overlay──▶ Expunged
//!        ▲                   │                            │
//!        └────store/swap─────┘◀──────unexpunge (locked)───┘
//! ```

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use std::sync::atomic::Ordering;

/// Contents of an entry.
pub(crate) enum Slot<V> {
    /// A live value.
    Present(V),
    /// Deleted, still reachable from the overlay.
    Absent,
    /// Deleted and left out of the overlay. Only the lock holder may revive it.
    Expunged,
}

impl<V> Slot<V> {
    #[inline]
    fn present(&self) -> Option<&V> {
        match self {
            Slot::Present(v) => Some(v),
            Slot::Absent | Slot::Expunged => None,
        }
    }

    #[inline]
    fn is_expunged(&self) -> bool {
        matches!(self, Slot::Expunged)
    }
}

/// A value boxed ahead of installation.
///
/// Failed CAS attempts hand the box back, so one allocation survives every
/// retry and the fall back onto the locked path.
pub(crate) struct Staged<V>(Owned<Slot<V>>);

impl<V> Staged<V> {
    pub(crate) fn new(value: V) -> Self {
        Self(Owned::new(Slot::Present(value)))
    }

    pub(crate) fn value(&self) -> &V {
        match &*self.0 {
            Slot::Present(v) => v,
            Slot::Absent | Slot::Expunged => unreachable!("staged slots always hold a value"),
        }
    }
}

/// Slot for one key, shared by the snapshot and the overlay.
pub(crate) struct Entry<V> {
    slot: Atomic<Slot<V>>,
}

impl<V> Entry<V> {
    pub(crate) fn new(staged: Staged<V>) -> Self {
        Self {
            slot: Atomic::from(staged.0),
        }
    }

    #[inline]
    fn current<'g>(&self, guard: &'g Guard) -> (Shared<'g, Slot<V>>, &'g Slot<V>) {
        let shared = self.slot.load(Ordering::Acquire, guard);
        // SAFETY: the pointer is never null, and a replaced slot is only
        // destroyed after every guard pinned before the replacement is gone.
        (shared, unsafe { shared.deref() })
    }

    /// Installs `new` if the cell still holds `current`, retiring `current`.
    #[inline]
    fn replace<'g>(
        &self,
        current: Shared<'g, Slot<V>>,
        new: Owned<Slot<V>>,
        guard: &'g Guard,
    ) -> Result<(), Owned<Slot<V>>> {
        match self
            .slot
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(_) => {
                // SAFETY: `current` is unlinked; later readers cannot reach it.
                unsafe { guard.defer_destroy(current) };
                Ok(())
            }
            Err(err) => Err(err.new),
        }
    }

    /// Borrows the live value, if any.
    #[inline]
    pub(crate) fn load<'a>(&'a self, guard: &'a Guard) -> Option<&'a V> {
        self.current(guard).1.present()
    }

    /// Clears the cell, returning the value it held.
    pub(crate) fn delete(&self, guard: &Guard) -> Option<V>
    where
        V: Clone,
    {
        let backoff = Backoff::new();
        let mut absent = Owned::new(Slot::Absent);
        loop {
            let (current, slot) = self.current(guard);
            let value = slot.present()?;
            match self.replace(current, absent, guard) {
                Ok(()) => return Some(value.clone()),
                Err(back) => absent = back,
            }
            backoff.spin();
        }
    }

    /// Clears the cell only while it holds a value equal to `old`.
    pub(crate) fn compare_and_delete(&self, old: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let backoff = Backoff::new();
        let mut absent = Owned::new(Slot::Absent);
        loop {
            let (current, slot) = self.current(guard);
            match slot.present() {
                Some(value) if value == old => {}
                _ => return false,
            }
            match self.replace(current, absent, guard) {
                Ok(()) => return true,
                Err(back) => absent = back,
            }
            backoff.spin();
        }
    }

    /// Replaces a value equal to `old` with `new`.
    ///
    /// A lost race re-reads the cell and compares again, so `false` always
    /// means the value observed last was not `old`.
    pub(crate) fn try_compare_and_swap(&self, old: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let backoff = Backoff::new();
        let mut staged = Staged::new(new);
        loop {
            let (current, slot) = self.current(guard);
            match slot.present() {
                Some(value) if value == old => {}
                _ => return false,
            }
            match self.replace(current, staged.0, guard) {
                Ok(()) => return true,
                Err(back) => staged = Staged(back),
            }
            backoff.spin();
        }
    }

    /// Swaps in the staged value unless the entry is expunged.
    ///
    /// `Ok` carries the previous value (`None` if the entry was absent). `Err`
    /// hands the staged value back for the locked path.
    pub(crate) fn try_swap(&self, staged: Staged<V>, guard: &Guard) -> Result<Option<V>, Staged<V>>
    where
        V: Clone,
    {
        let backoff = Backoff::new();
        let mut staged = staged;
        loop {
            let (current, slot) = self.current(guard);
            if slot.is_expunged() {
                return Err(staged);
            }
            match self.replace(current, staged.0, guard) {
                // The retired slot stays readable until `guard` is dropped.
                Ok(()) => return Ok(slot.present().cloned()),
                Err(back) => staged = Staged(back),
            }
            backoff.spin();
        }
    }

    /// Returns the live value, or revives an absent entry with the staged one.
    ///
    /// Among racing revivals the first CAS wins; the rest load its value.
    pub(crate) fn try_load_or_store(
        &self,
        staged: Staged<V>,
        guard: &Guard,
    ) -> Result<(V, bool), Staged<V>>
    where
        V: Clone,
    {
        let backoff = Backoff::new();
        let mut staged = staged;
        loop {
            let (current, slot) = self.current(guard);
            match slot {
                Slot::Present(value) => return Ok((value.clone(), true)),
                Slot::Expunged => return Err(staged),
                Slot::Absent => {}
            }
            let actual = staged.value().clone();
            match self.replace(current, staged.0, guard) {
                Ok(()) => return Ok((actual, false)),
                Err(back) => staged = Staged(back),
            }
            backoff.spin();
        }
    }

    /// [`try_load_or_store`](Self::try_load_or_store) for the lock holder,
    /// after [`unexpunge_locked`](Self::unexpunge_locked).
    pub(crate) fn load_or_store_locked(&self, staged: Staged<V>, guard: &Guard) -> (V, bool)
    where
        V: Clone,
    {
        let mut staged = staged;
        loop {
            match self.try_load_or_store(staged, guard) {
                Ok(outcome) => return outcome,
                Err(back) => {
                    self.unexpunge_locked(guard);
                    staged = back;
                }
            }
        }
    }

    /// Unconditionally installs the staged value. Lock holder only, after
    /// [`unexpunge_locked`](Self::unexpunge_locked).
    pub(crate) fn swap_locked(&self, staged: Staged<V>, guard: &Guard) -> Option<V>
    where
        V: Clone,
    {
        let previous = self.slot.swap(staged.0, Ordering::AcqRel, guard);
        // SAFETY: see `current`; `previous` was just unlinked.
        let value = unsafe { previous.deref() }.present().cloned();
        unsafe { guard.defer_destroy(previous) };
        value
    }

    /// Turns an expunged entry back into an absent one.
    ///
    /// Returns `true` if it was expunged; the caller must then put the entry
    /// back into the overlay before releasing the lock.
    pub(crate) fn unexpunge_locked(&self, guard: &Guard) -> bool {
        let (current, slot) = self.current(guard);
        if !slot.is_expunged() {
            return false;
        }
        // Only the lock holder moves an entry out of `Expunged`, so this
        // cannot race with another transition.
        self.replace(current, Owned::new(Slot::Absent), guard).is_ok()
    }

    /// Marks an absent entry expunged while rebuilding the overlay.
    ///
    /// Returns whether the entry ended up expunged, i.e. must be left out.
    pub(crate) fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let backoff = Backoff::new();
        let mut expunged = Owned::new(Slot::Expunged);
        loop {
            let (current, slot) = self.current(guard);
            match slot {
                Slot::Present(_) => return false,
                Slot::Expunged => return true,
                Slot::Absent => {}
            }
            match self.replace(current, expunged, guard) {
                Ok(()) => return true,
                Err(back) => expunged = back,
            }
            backoff.spin();
        }
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        // SAFETY: the last `Arc<Entry>` is gone. Readers reach entries only
        // through a snapshot they pinned or through an `Arc` they hold, so the
        // current slot is unreachable.
        unsafe {
            let slot = self.slot.load(Ordering::Relaxed, epoch::unprotected());
            if !slot.is_null() {
                drop(slot.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: u64) -> Entry<u64> {
        Entry::new(Staged::new(value))
    }

    #[test]
    fn test_load_and_delete() {
        let guard = &epoch::pin();
        let e = entry(7);
        assert_eq!(e.load(guard), Some(&7));
        assert_eq!(e.delete(guard), Some(7));
        assert_eq!(e.load(guard), None);
        assert_eq!(e.delete(guard), None);
    }

    #[test]
    fn test_swap_revives_absent() {
        let guard = &epoch::pin();
        let e = entry(1);
        e.delete(guard);
        assert_eq!(e.try_swap(Staged::new(2), guard).ok(), Some(None));
        assert_eq!(e.load(guard), Some(&2));
        assert_eq!(e.try_swap(Staged::new(3), guard).ok(), Some(Some(2)));
    }

    #[test]
    fn test_expunged_rejects_lock_free_writes() {
        let guard = &epoch::pin();
        let e = entry(1);

        // Present entries are never expunged.
        assert!(!e.try_expunge_locked(guard));

        e.delete(guard);
        assert!(e.try_expunge_locked(guard));
        // Expunging twice is stable.
        assert!(e.try_expunge_locked(guard));

        let staged = match e.try_swap(Staged::new(5), guard) {
            Err(staged) => staged,
            Ok(_) => panic!("swap must not revive an expunged entry"),
        };
        assert_eq!(*staged.value(), 5);
        assert!(e.try_load_or_store(Staged::new(6), guard).is_err());
        assert!(!e.try_compare_and_swap(&1, 9, guard));
        assert!(!e.compare_and_delete(&1, guard));
        assert_eq!(e.delete(guard), None);
        assert_eq!(e.load(guard), None);
    }

    #[test]
    fn test_unexpunge_then_store() {
        let guard = &epoch::pin();
        let e = entry(1);
        e.delete(guard);
        e.try_expunge_locked(guard);

        assert!(e.unexpunge_locked(guard));
        assert!(!e.unexpunge_locked(guard));
        assert_eq!(e.swap_locked(Staged::new(4), guard), None);
        assert_eq!(e.load(guard), Some(&4));
    }

    #[test]
    fn test_load_or_store_first_writer_wins() {
        let guard = &epoch::pin();
        let e = entry(1);
        assert_eq!(e.try_load_or_store(Staged::new(2), guard).ok(), Some((1, true)));

        e.delete(guard);
        assert_eq!(e.try_load_or_store(Staged::new(3), guard).ok(), Some((3, false)));
        assert_eq!(e.try_load_or_store(Staged::new(4), guard).ok(), Some((3, true)));
    }

    #[test]
    fn test_load_or_store_locked_recovers_expunged() {
        let guard = &epoch::pin();
        let e = entry(1);
        e.delete(guard);
        e.try_expunge_locked(guard);
        assert_eq!(e.load_or_store_locked(Staged::new(8), guard), (8, false));
        assert_eq!(e.load(guard), Some(&8));
    }

    #[test]
    fn test_compare_and_swap_uses_equality() {
        let guard = &epoch::pin();
        let e = Entry::new(Staged::new(vec![1, 2, 3]));
        assert!(!e.try_compare_and_swap(&vec![1, 2], vec![0], guard));
        assert!(e.try_compare_and_swap(&vec![1, 2, 3], vec![4], guard));
        assert_eq!(e.load(guard), Some(&vec![4]));
        assert!(!e.compare_and_delete(&vec![1, 2, 3], guard));
        assert!(e.compare_and_delete(&vec![4], guard));
        assert_eq!(e.load(guard), None);
    }
}
