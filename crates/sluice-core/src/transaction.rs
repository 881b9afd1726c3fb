use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::{const_reentrant_mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::lock::{DualGenLock, Slot};
use crate::versioned::ObjectId;

/// Serializes transactions across threads, so that two batches can never
/// take the write locks of the same objects in opposite orders.
static CONTROL: ReentrantMutex<()> = const_reentrant_mutex(());

/// An object that can take part in a [`Transaction`].
pub trait Commit: Send + Sync {
    fn id(&self) -> ObjectId;

    fn lock(&self) -> &DualGenLock;

    /// Publish the authoritative copy into the given slot.
    ///
    /// # Safety
    ///
    /// The caller must hold `slot` of [`Commit::lock`] exclusively.
    unsafe fn publish(&self, slot: Slot);

    /// Reset the authoritative copy to the last committed state.
    ///
    /// # Safety
    ///
    /// The caller must hold the write lock of this object and must not
    /// have swapped it.
    unsafe fn restore(&self);
}

/// A batch of changes that become visible to readers all at once.
///
/// The first time an object is added to the transaction its write lock is
/// taken. Committing publishes every object in lockstep: all of them
/// publish into slot 0, then all of them swap, then all of them publish
/// into slot 1. Readers that are covered by one object's lock therefore
/// never see a half-applied batch of the others.
///
/// Only one transaction is open at a time. [`Transaction::begin`] blocks
/// while another thread has one open. A thread that begins a second
/// transaction while its first is still open must not touch the same
/// objects from both, or it deadlocks.
///
/// Dropping an uncommitted transaction discards it.
pub struct Transaction {
    entries: BTreeMap<ObjectId, Arc<dyn Commit>>,
    moved: AHashSet<ObjectId>,
    _control: ReentrantMutexGuard<'static, ()>,
}

impl Transaction {
    pub fn begin() -> Self {
        Self {
            entries: BTreeMap::new(),
            moved: AHashSet::new(),
            _control: CONTROL.lock(),
        }
    }

    /// Add an object to this transaction, taking its write lock.
    ///
    /// Returns `false` (and does nothing) if the object is already part
    /// of this transaction.
    pub fn add(&mut self, object: Arc<dyn Commit>) -> bool {
        let id = object.id();
        if self.entries.contains_key(&id) {
            return false;
        }

        object.lock().write_lock();
        self.entries.insert(id, object);
        true
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that the object with the given id has been moved in or out
    /// of a container in this batch.
    ///
    /// Returns `false` if it had already been moved.
    pub fn mark_moved(&mut self, id: ObjectId) -> bool {
        self.moved.insert(id)
    }

    /// Publish every change in this batch and release all locks.
    pub fn commit(mut self) {
        let entries = std::mem::take(&mut self.entries);

        // SAFETY: Every entry was write locked in `add` and is released
        // exactly once below.
        unsafe {
            for object in entries.values() {
                object.publish(Slot::ZERO);
            }
            for object in entries.values() {
                object.lock().write_swap();
            }
            for object in entries.values() {
                object.publish(Slot::ONE);
            }
            for object in entries.values() {
                object.lock().write_unlock();
            }
        }

        log::debug!("committed transaction with {} objects", entries.len());
    }

    /// Roll back every change in this batch and release all locks.
    pub fn discard(mut self) {
        self.discard_entries();
    }

    fn discard_entries(&mut self) -> usize {
        let entries = std::mem::take(&mut self.entries);

        // SAFETY: Every entry was write locked in `add` and was not
        // swapped, since swapping only happens in `commit`.
        unsafe {
            for object in entries.values() {
                object.restore();
                object.lock().write_abort();
            }
        }

        entries.len()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            let n = self.discard_entries();
            log::warn!("transaction with {} objects dropped without commit, changes discarded", n);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("objects", &self.entries.keys().collect::<Vec<_>>())
            .field("moved", &self.moved.len())
            .finish()
    }
}

/// Run `f` inside `txn`, or inside a fresh transaction if `txn` is `None`.
///
/// A fresh transaction is committed if `f` succeeds and discarded if it
/// fails. A caller-supplied transaction is left open either way.
pub fn batch<R, E>(
    txn: Option<&mut Transaction>,
    f: impl FnOnce(&mut Transaction) -> Result<R, E>,
) -> Result<R, E> {
    match txn {
        Some(txn) => f(txn),
        None => {
            let mut txn = Transaction::begin();
            match f(&mut txn) {
                Ok(r) => {
                    txn.commit();
                    Ok(r)
                }
                Err(e) => {
                    txn.discard();
                    Err(e)
                }
            }
        }
    }
}
