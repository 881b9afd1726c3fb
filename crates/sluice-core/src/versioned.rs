//! Objects with one authoritative copy and two published generations.

use std::cell::UnsafeCell;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::lock::{DualGenLock, ReadGuard, Slot};
use crate::transaction::{Commit, Transaction};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(0);

/// A process-wide unique identifier for a versioned object.
///
/// Transactions use it to order and deduplicate the objects they hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn new() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

/// Data that can be published from an authoritative copy into a
/// read-only snapshot.
///
/// A [`Versioned`] object can be shared between threads and committed when
/// `Self` is `Send` and the snapshot is `Send + Sync`.
pub trait Publish: 'static {
    type Snapshot: Default + 'static;

    /// Bring `snapshot` up to date with `self`.
    ///
    /// This is called once for each slot during a commit, on the thread
    /// that commits.
    fn publish(&self, slot: Slot, snapshot: &mut Self::Snapshot);

    /// Reset `self` to the last published state.
    fn restore(&mut self, snapshot: &Self::Snapshot);
}

impl<K: Ord + Clone + 'static> Publish for BTreeSet<K> {
    type Snapshot = SmallVec<[K; 4]>;

    fn publish(&self, _slot: Slot, snapshot: &mut Self::Snapshot) {
        snapshot.clear();
        snapshot.extend(self.iter().cloned());
    }

    fn restore(&mut self, snapshot: &Self::Snapshot) {
        *self = snapshot.iter().cloned().collect();
    }
}

/// An object guarded by a [`DualGenLock`].
///
/// Writers edit the authoritative copy inside a [`Transaction`] and
/// readers only ever see one of the two published snapshots. Changes
/// become visible to readers when the transaction commits.
pub struct Versioned<A: Publish> {
    id: ObjectId,
    lock: DualGenLock,
    auth: UnsafeCell<A>,
    slots: [UnsafeCell<A::Snapshot>; 2],
}

// SAFETY: The authoritative copy is only touched by the transaction
// that holds the write lock, and each snapshot slot is only written while
// that slot is locked exclusively.
unsafe impl<A> Sync for Versioned<A>
where
    A: Publish + Send,
    A::Snapshot: Send + Sync,
{
}

impl<A: Publish> Versioned<A> {
    pub fn new(auth: A) -> Arc<Self> {
        let mut slots: [UnsafeCell<A::Snapshot>; 2] = Default::default();
        auth.publish(Slot::ZERO, slots[0].get_mut());
        auth.publish(Slot::ONE, slots[1].get_mut());

        Arc::new(Self {
            id: ObjectId::new(),
            lock: DualGenLock::new(),
            auth: UnsafeCell::new(auth),
            slots,
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Lock one of the two generations for reading.
    ///
    /// This never waits on a writer.
    pub fn read(&self) -> Snapshot<'_, A::Snapshot> {
        let guard = self.lock.read();
        // SAFETY: The guard holds `guard.slot()` shared, so no writer can
        // touch it until the guard is dropped.
        let data = unsafe { &*self.slots[guard.slot().index()].get() };
        Snapshot { guard, data }
    }

    /// Access a snapshot without locking this object.
    ///
    /// # Safety
    ///
    /// The caller must hold a read guard on `slot` of some other lock
    /// that every transaction modifying this object also holds for
    /// writing. The returned reference must not outlive that guard.
    #[inline]
    pub unsafe fn get_unchecked(&self, slot: Slot) -> &A::Snapshot {
        &*self.slots[slot.index()].get()
    }
}

impl<A> Versioned<A>
where
    A: Publish + Send,
    A::Snapshot: Send + Sync,
{
    /// Add this object to `txn`, locking it for writing if this is the
    /// first time the transaction sees it.
    ///
    /// Returns `true` if the object was newly added.
    pub fn enlist(self: &Arc<Self>, txn: &mut Transaction) -> bool {
        txn.add(Arc::clone(self) as Arc<dyn Commit>)
    }

    /// Modify the authoritative copy as part of `txn`.
    ///
    /// The changes are published when `txn` commits and rolled back when
    /// it is discarded.
    pub fn with_mut<R>(self: &Arc<Self>, txn: &mut Transaction, f: impl FnOnce(&mut A) -> R) -> R {
        self.enlist(txn);
        // SAFETY: `txn` holds the write lock of this object, and it is
        // borrowed mutably for the duration of `f`.
        f(unsafe { &mut *self.auth.get() })
    }
}

impl<A> Commit for Versioned<A>
where
    A: Publish + Send,
    A::Snapshot: Send + Sync,
{
    fn id(&self) -> ObjectId {
        self.id
    }

    fn lock(&self) -> &DualGenLock {
        &self.lock
    }

    unsafe fn publish(&self, slot: Slot) {
        let auth = &*self.auth.get();
        auth.publish(slot, &mut *self.slots[slot.index()].get());
    }

    unsafe fn restore(&self) {
        // Slot 1 is never written before the swap, so it still holds the
        // last committed state.
        (*self.auth.get()).restore(&*self.slots[1].get());
    }
}

impl<A: Publish> fmt::Debug for Versioned<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioned")
            .field("id", &self.id)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

/// A read-locked generation of a [`Versioned`] object.
pub struct Snapshot<'a, S> {
    guard: ReadGuard<'a>,
    data: &'a S,
}

impl<'a, S> Snapshot<'a, S> {
    pub fn slot(&self) -> Slot {
        self.guard.slot()
    }
}

impl<'a, S> Deref for Snapshot<'a, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.data
    }
}

impl<'a, S: fmt::Debug> fmt::Debug for Snapshot<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("slot", &self.slot())
            .field("data", self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const WIDTH: usize = 32;

    struct Wide(u64);

    impl Publish for Wide {
        type Snapshot = Vec<u64>;

        fn publish(&self, _slot: Slot, snapshot: &mut Vec<u64>) {
            snapshot.clear();
            snapshot.extend(std::iter::repeat(self.0).take(WIDTH));
        }

        fn restore(&mut self, snapshot: &Vec<u64>) {
            self.0 = snapshot[0];
        }
    }

    #[test]
    fn new_objects_publish_both_generations() {
        let set = Versioned::new(BTreeSet::from([3u32, 1, 2]));

        assert_eq!(set.read().as_slice(), &[1, 2, 3]);
        unsafe {
            assert_eq!(set.get_unchecked(Slot::ZERO).as_slice(), &[1, 2, 3]);
            assert_eq!(set.get_unchecked(Slot::ONE).as_slice(), &[1, 2, 3]);
        }
    }

    #[test]
    fn changes_are_invisible_until_commit() {
        let set = Versioned::new(BTreeSet::<u32>::new());

        let mut txn = Transaction::begin();
        set.with_mut(&mut txn, |s| {
            s.insert(7);
        });
        assert!(set.read().is_empty());

        txn.commit();
        assert_eq!(set.read().as_slice(), &[7]);
    }

    #[test]
    fn discard_rolls_back_the_authoritative_copy() {
        let set = Versioned::new(BTreeSet::from([1u32]));

        let mut txn = Transaction::begin();
        set.with_mut(&mut txn, |s| {
            s.insert(2);
            s.remove(&1);
        });
        txn.discard();

        assert_eq!(set.read().as_slice(), &[1]);

        let mut txn = Transaction::begin();
        let seen: Vec<u32> = set.with_mut(&mut txn, |s| s.iter().copied().collect());
        txn.commit();
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn readers_never_observe_a_torn_snapshot() {
        let obj = Versioned::new(Wide(0));
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    let mut last = 0;
                    while !done.load(Ordering::Relaxed) {
                        let snap = obj.read();
                        let first = snap[0];
                        assert!(snap.iter().all(|&v| v == first));
                        assert!(first >= last);
                        last = first;
                    }
                });
            }

            for _ in 0..500 {
                let mut txn = Transaction::begin();
                obj.with_mut(&mut txn, |w| w.0 += 1);
                txn.commit();
            }
            done.store(true, Ordering::Relaxed);
        });

        assert_eq!(obj.read()[0], 500);
    }
}
