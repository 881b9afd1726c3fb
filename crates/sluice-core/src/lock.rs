//! A reader/writer lock with two generation slots.
//!
//! Any number of readers may hold one of the two slots at the same time
//! as a single writer updates the other one. Readers never wait on the
//! writer: at any instant the writer holds exclusive access to at most
//! one slot, so a reader that finds one slot taken will find the other
//! one free.
//!
//! Writers must follow this sequence:
//!
//! 1. [`DualGenLock::write_lock`] serializes writers and takes slot 0
//!    exclusively. Readers of slot 0 drain, readers of slot 1 are not
//!    affected. The writer may now rebuild the data behind slot 0.
//! 2. [`DualGenLock::write_swap`] releases slot 0 (new readers now see
//!    the rebuilt data) and takes slot 1 exclusively, waiting for its
//!    readers to drain. The writer now brings slot 1 up to date.
//! 3. [`DualGenLock::write_unlock`] releases slot 1 and the writer lock.
//!
//! [`DualGenLock::write_abort`] may be used instead of steps 2 and 3 if
//! nothing behind slot 0 was modified.

use std::fmt;
use std::marker::PhantomData;

use parking_lot::lock_api::{RawMutex as _, RawRwLock as _};
use parking_lot::{RawMutex, RawRwLock};

/// One of the two generation slots of a [`DualGenLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(u8);

impl Slot {
    /// The slot a writer rebuilds first.
    pub const ZERO: Self = Self(0);
    /// The slot readers try first.
    pub const ONE: Self = Self(1);

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn other(self) -> Self {
        Self(self.0 ^ 1)
    }
}

pub struct DualGenLock {
    writer: RawMutex,
    slots: [RawRwLock; 2],
}

impl DualGenLock {
    pub const fn new() -> Self {
        Self {
            writer: RawMutex::INIT,
            slots: [RawRwLock::INIT, RawRwLock::INIT],
        }
    }

    /// Lock one of the two slots for reading.
    ///
    /// This alternates non-blocking attempts between slot 1 and slot 0
    /// (starting with slot 1) until one succeeds. It never parks the
    /// calling thread.
    pub fn read(&self) -> ReadGuard<'_> {
        let mut slot = Slot::ONE;
        loop {
            if let Some(guard) = self.try_read(slot) {
                return guard;
            }
            slot = slot.other();
        }
    }

    /// Make a single non-blocking attempt to lock the given slot for
    /// reading.
    pub fn try_read(&self, slot: Slot) -> Option<ReadGuard<'_>> {
        if self.slots[slot.index()].try_lock_shared() {
            Some(ReadGuard {
                lock: self,
                slot,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Start a write: take the writer lock, then slot 0 exclusively.
    ///
    /// This blocks while another writer is active and while readers of
    /// slot 0 drain.
    pub fn write_lock(&self) {
        self.writer.lock();
        self.slots[0].lock_exclusive();
    }

    /// Hand slot 0 back to readers and take slot 1 exclusively.
    ///
    /// # Safety
    ///
    /// The caller must have called [`DualGenLock::write_lock`] and not yet
    /// swapped, unlocked or aborted.
    pub unsafe fn write_swap(&self) {
        self.slots[0].unlock_exclusive();
        self.slots[1].lock_exclusive();
    }

    /// Finish a write by releasing slot 1 and the writer lock.
    ///
    /// # Safety
    ///
    /// The caller must have called [`DualGenLock::write_swap`] for the
    /// current write.
    pub unsafe fn write_unlock(&self) {
        self.slots[1].unlock_exclusive();
        self.writer.unlock();
    }

    /// Finish a write without publishing anything by releasing slot 0
    /// and the writer lock.
    ///
    /// # Safety
    ///
    /// The caller must have called [`DualGenLock::write_lock`] and not yet
    /// swapped, unlocked or aborted.
    pub unsafe fn write_abort(&self) {
        self.slots[0].unlock_exclusive();
        self.writer.unlock();
    }

    /// Returns `true` if a writer currently holds this lock.
    pub fn is_write_locked(&self) -> bool {
        self.writer.is_locked()
    }
}

impl Default for DualGenLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DualGenLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualGenLock")
            .field("write_locked", &self.writer.is_locked())
            .field("slot_0_locked", &self.slots[0].is_locked())
            .field("slot_1_locked", &self.slots[1].is_locked())
            .finish()
    }
}

/// Shared access to one slot of a [`DualGenLock`]. The slot is released
/// on drop.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a DualGenLock,
    slot: Slot,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReadGuard<'a> {
    /// The slot this guard holds. Readers use it to pick the matching
    /// generation of the guarded data.
    #[inline]
    pub fn slot(&self) -> Slot {
        self.slot
    }
}

impl<'a> Drop for ReadGuard<'a> {
    fn drop(&mut self) {
        // SAFETY: A `ReadGuard` is only constructed after a successful
        // `try_lock_shared` on this slot.
        unsafe { self.lock.slots[self.slot.index()].unlock_shared() }
    }
}

impl<'a> fmt::Debug for ReadGuard<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard").field("slot", &self.slot).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn idle_readers_start_on_slot_one() {
        let lock = DualGenLock::new();

        let a = lock.read();
        let b = lock.read();
        assert_eq!(a.slot(), Slot::ONE);
        assert_eq!(b.slot(), Slot::ONE);
    }

    #[test]
    fn one_slot_is_always_readable_during_a_write() {
        let lock = DualGenLock::new();

        lock.write_lock();
        assert!(lock.try_read(Slot::ONE).is_some());
        assert!(lock.try_read(Slot::ZERO).is_none());
        assert_eq!(lock.read().slot(), Slot::ONE);

        unsafe { lock.write_swap() };
        assert!(lock.try_read(Slot::ONE).is_none());
        assert!(lock.try_read(Slot::ZERO).is_some());
        assert_eq!(lock.read().slot(), Slot::ZERO);

        unsafe { lock.write_unlock() };
        assert!(lock.try_read(Slot::ONE).is_some());
        assert!(lock.try_read(Slot::ZERO).is_some());
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn abort_releases_everything() {
        let lock = DualGenLock::new();

        lock.write_lock();
        unsafe { lock.write_abort() };

        assert!(!lock.is_write_locked());
        assert!(lock.try_read(Slot::ZERO).is_some());

        // A second write can start right away.
        lock.write_lock();
        unsafe { lock.write_swap() };
        unsafe { lock.write_unlock() };
    }

    #[test]
    fn swap_waits_for_readers_of_slot_one() {
        let lock = DualGenLock::new();
        let swapped = AtomicBool::new(false);

        let reader = lock.read();
        assert_eq!(reader.slot(), Slot::ONE);

        std::thread::scope(|s| {
            s.spawn(|| {
                lock.write_lock();
                unsafe { lock.write_swap() };
                swapped.store(true, Ordering::SeqCst);
                unsafe { lock.write_unlock() };
            });

            std::thread::sleep(Duration::from_millis(30));
            assert!(!swapped.load(Ordering::SeqCst));

            // Meanwhile, new readers still get in without blocking.
            let other = lock.read();
            assert_eq!(other.slot(), Slot::ZERO);
            drop(other);

            drop(reader);
        });

        assert!(swapped.load(Ordering::SeqCst));
    }

    #[test]
    fn readers_never_stall_under_a_busy_writer() {
        let lock = DualGenLock::new();
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..2_000 {
                    lock.write_lock();
                    unsafe { lock.write_swap() };
                    unsafe { lock.write_unlock() };
                }
                done.store(true, Ordering::SeqCst);
            });

            // Between two consecutive writer state changes a reader that
            // fails on one slot must succeed on the other. Count attempts
            // per read and make sure the long tail stays short.
            let mut worst = 0;
            while !done.load(Ordering::SeqCst) {
                let mut slot = Slot::ONE;
                let mut attempts = 1;
                let guard = loop {
                    if let Some(g) = lock.try_read(slot) {
                        break g;
                    }
                    slot = slot.other();
                    attempts += 1;
                };
                drop(guard);
                worst = worst.max(attempts);
            }

            // A new write may start between two attempts, so allow for
            // the writer overtaking the reader a few times.
            assert!(worst < 4_096, "reader needed {} attempts", worst);
        });
    }
}
