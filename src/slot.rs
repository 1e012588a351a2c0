// MIT License
//
// Copyright (c) 2019 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! A reference-counted owning slot for a single heap object.
//!
//! [`OwnershipSlot`] is the sole owner of the object it holds. Readers borrow
//! the object through [`SlotRef`] guards, each of which holds one count on
//! the slot. The object is dropped once the owner reference installed by
//! [`reset`] and every outstanding guard have been released, after which the
//! slot may be reset with a new object.
//!
//! [`reset`]: OwnershipSlot::reset

use std::{
    fmt,
    marker::PhantomData,
    ops::Deref,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering},
};

use crossbeam_utils::Backoff;

// Set while an object is being installed or torn down.
const BUSY: u64 = 1 << 63;

/// An atomically reference-counted owning handle around one heap object.
///
/// The first caller of [`reset`] on an empty slot installs its object; any
/// racing callers get their box back. [`try_acquire`] fails on a slot that is
/// empty or that is in the middle of being installed or torn down, so a
/// successful acquisition always refers to a live object.
///
/// [`reset`]: #method.reset
/// [`try_acquire`]: #method.try_acquire
pub struct OwnershipSlot<T> {
    object: AtomicPtr<T>,
    refcount: AtomicU64,
    owned: AtomicBool,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send + Sync> Send for OwnershipSlot<T> {}
unsafe impl<T: Send + Sync> Sync for OwnershipSlot<T> {}

impl<T> OwnershipSlot<T> {
    /// Creates an empty slot.
    pub const fn new() -> OwnershipSlot<T> {
        OwnershipSlot {
            object: AtomicPtr::new(ptr::null_mut()),
            refcount: AtomicU64::new(0),
            owned: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    /// Installs `object` if the slot is empty.
    ///
    /// On success the slot holds one reference, the owner reference, which is
    /// given up by [`release`]. If the slot is occupied or another thread is
    /// installing or tearing down an object, `object` is handed back.
    ///
    /// [`release`]: #method.release
    pub fn reset(&self, object: Box<T>) -> Result<(), Box<T>> {
        if self
            .refcount
            .compare_exchange(0, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(object);
        }

        self.object.store(Box::into_raw(object), Ordering::Relaxed);
        self.refcount.store(1, Ordering::Release);
        // the count must be live before a release can claim the owner reference
        self.owned.store(true, Ordering::Release);

        Ok(())
    }

    /// Borrows the object in this slot, incrementing its reference count.
    ///
    /// Returns [`None`] if the slot is empty or its object is being installed
    /// or torn down. The reference is released when the returned guard is
    /// dropped.
    ///
    /// [`None`]: https://doc.rust-lang.org/std/option/enum.Option.html#variant.None
    pub fn try_acquire(&self) -> Option<SlotRef<'_, T>> {
        let mut count = self.refcount.load(Ordering::Acquire);

        loop {
            if count == 0 || count & BUSY != 0 {
                return None;
            }

            match self.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => count = current,
            }
        }

        match NonNull::new(self.object.load(Ordering::Acquire)) {
            Some(object) => Some(SlotRef { slot: self, object }),
            None => {
                self.decrement();

                None
            }
        }
    }

    /// Releases the owner reference installed by the last successful
    /// [`reset`].
    ///
    /// Returns false if that reference was already released. The object is
    /// dropped immediately if no guards are outstanding, or by whichever
    /// thread drops the last guard otherwise.
    ///
    /// [`reset`]: #method.reset
    pub fn release(&self) -> bool {
        if !self.owned.swap(false, Ordering::AcqRel) {
            return false;
        }

        self.decrement();

        true
    }

    /// Returns the number of outstanding references, including the owner
    /// reference.
    ///
    /// A slot that is being installed or torn down reports zero.
    pub fn ref_count(&self) -> u64 {
        let count = self.refcount.load(Ordering::Relaxed);

        if count & BUSY != 0 {
            0
        } else {
            count
        }
    }

    /// Returns true if this slot currently holds an object.
    pub fn is_occupied(&self) -> bool {
        self.ref_count() != 0
    }

    fn decrement(&self) {
        let backoff = Backoff::new();
        let mut count = self.refcount.load(Ordering::Acquire);

        loop {
            debug_assert!(count != 0 && count & BUSY == 0);

            let next = if count == 1 { BUSY } else { count - 1 };

            match self.refcount.compare_exchange_weak(
                count,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if count == 1 => break,
                Ok(_) => return,
                Err(current) => {
                    count = current;
                    backoff.spin();
                }
            }
        }

        // last reference; we hold BUSY, so nobody else can touch the pointer
        let object = self.object.swap(ptr::null_mut(), Ordering::Acquire);
        self.refcount.store(0, Ordering::Release);

        if !object.is_null() {
            drop(unsafe { Box::from_raw(object) });
        }
    }
}

impl<T> Default for OwnershipSlot<T> {
    fn default() -> OwnershipSlot<T> {
        OwnershipSlot::new()
    }
}

impl<T> From<Box<T>> for OwnershipSlot<T> {
    fn from(object: Box<T>) -> OwnershipSlot<T> {
        OwnershipSlot {
            object: AtomicPtr::new(Box::into_raw(object)),
            refcount: AtomicU64::new(1),
            owned: AtomicBool::new(true),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for OwnershipSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipSlot")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl<T> Drop for OwnershipSlot<T> {
    fn drop(&mut self) {
        // no guards can be outstanding, since they borrow the slot
        let object = *self.object.get_mut();

        if !object.is_null() {
            drop(unsafe { Box::from_raw(object) });
        }
    }
}

/// A counted borrow of the object in an [`OwnershipSlot`].
///
/// Dropping the guard releases its reference.
pub struct SlotRef<'a, T> {
    slot: &'a OwnershipSlot<T>,
    object: NonNull<T>,
}

impl<'a, T> Deref for SlotRef<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // the count held by this guard keeps the object alive
        unsafe { self.object.as_ref() }
    }
}

impl<'a, T: fmt::Debug> fmt::Debug for SlotRef<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T> Drop for SlotRef<'a, T> {
    fn drop(&mut self) {
        self.slot.decrement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::map::tests::util::{DropNotifier, NoisyDropper};

    use std::{
        sync::{atomic::AtomicUsize, Arc, Barrier},
        thread::{self, JoinHandle},
    };

    #[test]
    fn acquire_empty() {
        let slot: OwnershipSlot<i32> = OwnershipSlot::new();

        assert!(slot.try_acquire().is_none());
        assert!(!slot.is_occupied());
        assert!(!slot.release());
    }

    #[test]
    fn reset_acquire_release() {
        let slot = OwnershipSlot::new();

        assert!(slot.reset(Box::new(1)).is_ok());
        assert_eq!(slot.ref_count(), 1);

        {
            let object = slot.try_acquire().unwrap();
            assert_eq!(*object, 1);
            assert_eq!(slot.ref_count(), 2);
        }

        assert_eq!(slot.ref_count(), 1);
        assert!(slot.release());
        assert!(!slot.release());

        assert!(slot.try_acquire().is_none());
        assert_eq!(slot.ref_count(), 0);
    }

    #[test]
    fn reset_occupied() {
        let slot = OwnershipSlot::from(Box::new(5));

        assert_eq!(*slot.reset(Box::new(6)).unwrap_err(), 6);
        assert_eq!(*slot.try_acquire().unwrap(), 5);

        assert!(slot.release());
        assert!(slot.reset(Box::new(7)).is_ok());
        assert_eq!(*slot.try_acquire().unwrap(), 7);
    }

    #[test]
    fn guard_outlives_owner() {
        let notifier = Arc::new(DropNotifier::new());
        let slot = OwnershipSlot::new();

        assert!(slot
            .reset(Box::new(NoisyDropper::new(notifier.clone(), 0)))
            .is_ok());

        let guard = slot.try_acquire().unwrap();
        assert!(slot.release());
        assert!(!notifier.was_dropped());
        assert_eq!(guard.elem, 0);

        // the slot stays closed until the last guard is gone
        let rejected_notifier = Arc::new(DropNotifier::new());
        let rejected = slot.reset(Box::new(NoisyDropper::new(rejected_notifier.clone(), 1)));
        assert_eq!(rejected.unwrap_err().elem, 1);
        assert!(rejected_notifier.was_dropped());
        assert!(!notifier.was_dropped());

        drop(guard);
        assert!(notifier.was_dropped());
        assert!(!slot.is_occupied());
    }

    #[test]
    fn drop_occupied() {
        let notifier = Arc::new(DropNotifier::new());

        {
            let slot = OwnershipSlot::from(Box::new(NoisyDropper::new(notifier.clone(), ())));
            let _guard = slot.try_acquire().unwrap();
            assert!(!notifier.was_dropped());
        }

        assert!(notifier.was_dropped());
    }

    #[test]
    fn concurrent_reset() {
        const NUM_THREADS: usize = 64;

        let slot = Arc::new(OwnershipSlot::new());
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let slot = slot.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    slot.reset(Box::new(i)).is_ok()
                })
            })
            .collect();

        let winners = threads
            .into_iter()
            .map(JoinHandle::join)
            .filter(|result| *result.as_ref().unwrap())
            .count();

        assert_eq!(winners, 1);
        assert_eq!(slot.ref_count(), 1);
        assert!(*slot.try_acquire().unwrap() < NUM_THREADS);
    }

    #[test]
    fn concurrent_reset_and_release() {
        const NUM_THREADS: usize = 16;
        const NUM_ITERATIONS: usize = 4096;

        let slot = Arc::new(OwnershipSlot::new());
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|i| {
                let slot = slot.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for j in 0..NUM_ITERATIONS {
                        let _ = slot.reset(Box::new(i * NUM_ITERATIONS + j));
                        slot.release();
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(JoinHandle::join) {
            assert!(result.is_ok());
        }

        // a release that lands mid-reset must not strand the owner reference
        slot.release();
        assert!(!slot.is_occupied());
        assert!(slot.reset(Box::new(0)).is_ok());
        assert_eq!(slot.ref_count(), 1);
        assert!(slot.release());
        assert!(!slot.is_occupied());
    }

    #[test]
    fn concurrent_acquire_and_release() {
        const NUM_THREADS: usize = 64;
        const NUM_ITERATIONS: usize = 1024;

        let notifier = Arc::new(DropNotifier::new());
        let slot = Arc::new(OwnershipSlot::from(Box::new(NoisyDropper::new(
            notifier.clone(),
            AtomicUsize::new(0),
        ))));
        let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let slot = slot.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for _ in 0..NUM_ITERATIONS {
                        match slot.try_acquire() {
                            Some(object) => {
                                object.elem.fetch_add(1, Ordering::Relaxed);
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        assert!(slot.release());

        for result in threads.into_iter().map(JoinHandle::join) {
            assert!(result.is_ok());
        }

        assert!(notifier.was_dropped());
        assert!(!slot.is_occupied());
    }
}
