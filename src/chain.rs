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

//! A lockfree singly-linked set of unique values.
//!
//! [`ChainSet`] is the collision chain used by each bucket of
//! [`ConcurrentMap`](crate::ConcurrentMap), but it is also usable on its own
//! as a small concurrent set. Values are only ever added at the head of the
//! chain and are removed logically by setting a tombstone flag; nodes stay
//! linked until the whole chain is dropped, so traversals never need to
//! worry about a node disappearing from under them.

use std::{
    borrow::Borrow,
    fmt,
    iter::FusedIterator,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;

// No further inserts may commit to a frozen chain.
const FROZEN_TAG: usize = 0b01;
// Every live record of a frozen chain has been copied forward.
const MIGRATED_TAG: usize = 0b10;

/// A lockfree set of unique values stored in a singly-linked list.
///
/// Insertion is lockfree but not wait-free: a thread whose head CAS fails
/// retries, but only because another thread's insertion succeeded. If two
/// threads race to insert equal values, whichever CAS commits first wins and
/// the other thread observes the winner's node.
///
/// Iteration order is most-recently-inserted first.
pub struct ChainSet<T> {
    head: Atomic<Node<T>>,
    sentinel: Atomic<Node<T>>,
    len: AtomicUsize,
}

pub(crate) struct Record<T> {
    pub(crate) value: T,
    deleted: AtomicBool,
}

impl<T> Record<T> {
    pub(crate) fn new(value: T) -> Record<T> {
        Record {
            value,
            deleted: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    // only the thread that flips the flag succeeds
    fn mark_deleted(&self) -> bool {
        self.deleted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Node<T> {
    record: Option<Arc<Record<T>>>, // None only for the sentinel
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn is_sentinel(&self) -> bool {
        self.record.is_none()
    }

    fn live_record(&self) -> Option<&Arc<Record<T>>> {
        self.record.as_ref().filter(|r| !r.is_deleted())
    }
}

fn guard() -> &'static Guard {
    // nodes are only freed by `ChainSet::drop`, which has exclusive access
    unsafe { crossbeam_epoch::unprotected() }
}

impl<T> ChainSet<T> {
    /// Creates an empty chain.
    pub fn new() -> ChainSet<T> {
        let sentinel = Owned::new(Node {
            record: None,
            next: Atomic::null(),
        })
        .into_shared(guard());

        ChainSet {
            head: Atomic::from(sentinel),
            sentinel: Atomic::from(sentinel),
            len: AtomicUsize::new(0),
        }
    }

    /// Returns the number of live values in this chain.
    ///
    /// Values that a resize copied into another chain can be erased through
    /// that chain, which this count does not see.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns true if this chain contains no live values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a cursor to the first live value, or [`end`] if there is none.
    ///
    /// [`end`]: #method.end
    pub fn begin(&self) -> Cursor<'_, T> {
        let mut cursor = Cursor {
            node: self.head_node(),
        };

        if cursor.node.live_record().is_none() {
            cursor.move_next();
        }

        cursor
    }

    /// Returns the cursor past the last value.
    ///
    /// Every chain ends in the same sentinel node, so this cursor compares
    /// equal to any cursor that has run off the end of this chain.
    pub fn end(&self) -> Cursor<'_, T> {
        Cursor {
            node: self.node(self.sentinel.load(Ordering::Relaxed, guard())),
        }
    }

    /// Returns an iterator over the live values in this chain.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cursor: self.begin(),
        }
    }

    fn node(&self, ptr: Shared<'_, Node<T>>) -> &Node<T> {
        debug_assert!(!ptr.is_null());

        // nodes are never unlinked, so they live as long as the chain
        unsafe { &*ptr.as_raw() }
    }

    fn head_node(&self) -> &Node<T> {
        self.node(self.head.load(Ordering::Acquire, guard()))
    }

    // scans from `from` up to (but not including) `until` or the sentinel
    fn find_live_between<F: FnMut(&T) -> bool>(
        &self,
        from: Shared<'_, Node<T>>,
        until: *const Node<T>,
        mut condition: F,
    ) -> Option<&Node<T>> {
        let mut current = self.node(from);

        while !current.is_sentinel() && !ptr::eq(current, until) {
            if let Some(record) = current.live_record() {
                if condition(&record.value) {
                    return Some(current);
                }
            }

            current = self.node(current.next.load(Ordering::Acquire, guard()));
        }

        None
    }
}

impl<T: Eq> ChainSet<T> {
    /// Inserts `value` if no equal live value is in the chain.
    ///
    /// Returns a cursor to the node holding the value and true if the value
    /// was newly inserted, or a cursor to the existing equal value and false
    /// otherwise. In the latter case `value` is dropped.
    pub fn insert(&self, value: T) -> (Cursor<'_, T>, bool) {
        match self.insert_record_by(Arc::new(Record::new(value)), T::eq) {
            Ok(result) => result,
            Err(_) => unreachable!("standalone chains are never frozen"),
        }
    }

    /// Returns a cursor to the live value equal to `value`, or [`end`] if
    /// there is none.
    ///
    /// [`end`]: #method.end
    pub fn find<Q: ?Sized + Eq>(&self, value: &Q) -> Cursor<'_, T>
    where
        T: Borrow<Q>,
    {
        match self.find_node_by(|v| <T as Borrow<Q>>::borrow(v) == value) {
            Some(node) => Cursor { node },
            None => self.end(),
        }
    }

    /// Returns true if a live value equal to `value` is in the chain.
    pub fn contains<Q: ?Sized + Eq>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
    {
        self.find_node_by(|v| <T as Borrow<Q>>::borrow(v) == value).is_some()
    }

    /// Marks the live value equal to `value` as deleted.
    ///
    /// Returns a cursor to the next live value after the erased one. If no
    /// live value equal to `value` was found, or another thread erased it
    /// first, returns [`end`].
    ///
    /// [`end`]: #method.end
    pub fn erase<Q: ?Sized + Eq>(&self, value: &Q) -> Cursor<'_, T>
    where
        T: Borrow<Q>,
    {
        match self.erase_node_by(|v| <T as Borrow<Q>>::borrow(v) == value) {
            Some(node) => {
                let mut cursor = Cursor { node };
                cursor.move_next();

                cursor
            }
            None => self.end(),
        }
    }
}

impl<T> ChainSet<T> {
    /// Inserts `record` unless the chain holds a live value that `same`
    /// considers equal.
    ///
    /// Fails with the record if the chain has been frozen.
    pub(crate) fn insert_record_by<F: FnMut(&T, &T) -> bool>(
        &self,
        record: Arc<Record<T>>,
        mut same: F,
    ) -> Result<(Cursor<'_, T>, bool), Arc<Record<T>>> {
        let guard = guard();
        let mut snapshot = self.head.load(Ordering::Acquire, guard);

        if snapshot.tag() & FROZEN_TAG != 0 {
            return Err(record);
        }

        if let Some(existing) =
            self.find_live_between(snapshot, ptr::null(), |v| same(v, &record.value))
        {
            return Ok((Cursor { node: existing }, false));
        }

        let probe = record.clone();
        let mut new_node = Owned::new(Node {
            record: Some(record),
            next: Atomic::from(snapshot),
        });
        let backoff = Backoff::new();

        loop {
            match self.head.compare_exchange(
                snapshot,
                new_node,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(inserted) => {
                    self.len.fetch_add(1, Ordering::Relaxed);

                    return Ok((
                        Cursor {
                            node: self.node(inserted),
                        },
                        true,
                    ));
                }
                Err(e) => {
                    new_node = e.new;
                    let current = e.current;

                    if current.tag() & FROZEN_TAG != 0 {
                        drop(new_node);

                        return Err(probe);
                    }

                    // only the nodes pushed since our snapshot can be new
                    if let Some(existing) = self.find_live_between(
                        current,
                        snapshot.as_raw(),
                        |v| same(v, &probe.value),
                    ) {
                        return Ok((Cursor { node: existing }, false));
                    }

                    snapshot = current;
                    new_node.next.store(snapshot, Ordering::Relaxed);
                    backoff.spin();
                }
            }
        }
    }

    pub(crate) fn find_by<F: FnMut(&T) -> bool>(&self, condition: F) -> Option<&T> {
        self.find_node_by(condition)
            .and_then(|node| node.record.as_ref())
            .map(|record| &record.value)
    }

    /// Marks the first live value matching `condition` as deleted and returns
    /// it, or returns `None` if there was none or another thread got there
    /// first.
    pub(crate) fn erase_by<F: FnMut(&T) -> bool>(&self, condition: F) -> Option<&T> {
        self.erase_node_by(condition)
            .and_then(|node| node.record.as_ref())
            .map(|record| &record.value)
    }

    fn find_node_by<F: FnMut(&T) -> bool>(&self, condition: F) -> Option<&Node<T>> {
        self.find_live_between(
            self.head.load(Ordering::Acquire, guard()),
            ptr::null(),
            condition,
        )
    }

    fn erase_node_by<F: FnMut(&T) -> bool>(&self, condition: F) -> Option<&Node<T>> {
        let node = self.find_node_by(condition)?;

        if node.record.as_ref()?.mark_deleted() {
            self.len.fetch_sub(1, Ordering::Relaxed);

            Some(node)
        } else {
            None
        }
    }

    pub(crate) fn freeze(&self) {
        self.head.fetch_or(FROZEN_TAG, Ordering::AcqRel, guard());
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.head.load(Ordering::Acquire, guard()).tag() & FROZEN_TAG != 0
    }

    pub(crate) fn mark_migrated(&self) {
        debug_assert!(self.is_frozen());

        self.head.fetch_or(MIGRATED_TAG, Ordering::AcqRel, guard());
    }

    pub(crate) fn is_migrated(&self) -> bool {
        self.head.load(Ordering::Acquire, guard()).tag() & MIGRATED_TAG != 0
    }

    /// Iterates over the records that are live at the moment each is
    /// visited.
    pub(crate) fn live_records(&self) -> impl Iterator<Item = &Arc<Record<T>>> {
        let mut current = self.head_node();

        std::iter::from_fn(move || {
            while !current.is_sentinel() {
                let this = current;
                current = self.node(this.next.load(Ordering::Acquire, guard()));

                if let Some(record) = this.live_record() {
                    return Some(record);
                }
            }

            None
        })
    }
}

impl<T> Default for ChainSet<T> {
    fn default() -> ChainSet<T> {
        ChainSet::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for ChainSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<T> Drop for ChainSet<T> {
    fn drop(&mut self) {
        let guard = guard();
        let mut current = self.head.load(Ordering::Relaxed, guard).with_tag(0);

        // the sentinel is the last node, and its next pointer is null
        while !current.is_null() {
            let next = unsafe { current.deref() }
                .next
                .load(Ordering::Relaxed, guard);
            drop(unsafe { current.into_owned() });
            current = next;
        }
    }
}

impl<'a, T> IntoIterator for &'a ChainSet<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

/// A position in a [`ChainSet`].
///
/// Cursors compare equal when they point at the same node. A cursor that has
/// been advanced past the last live value is equal to [`ChainSet::end`].
pub struct Cursor<'a, T> {
    node: &'a Node<T>,
}

impl<'a, T> Cursor<'a, T> {
    /// Returns the value at this position, or `None` at the end of the chain.
    ///
    /// The value is returned even if another thread has erased it since the
    /// cursor was positioned.
    pub fn get(&self) -> Option<&'a T> {
        self.node.record.as_ref().map(|record| &record.value)
    }

    /// Returns true if this cursor is past the last value.
    pub fn is_end(&self) -> bool {
        self.node.is_sentinel()
    }

    /// Advances to the next live value, skipping tombstones.
    ///
    /// Does nothing at the end of the chain.
    pub fn move_next(&mut self) {
        if self.node.is_sentinel() {
            return;
        }

        let guard = guard();
        self.node = unsafe { &*self.node.next.load(Ordering::Acquire, guard).as_raw() };

        while !self.node.is_sentinel() && self.node.live_record().is_none() {
            self.node = unsafe { &*self.node.next.load(Ordering::Acquire, guard).as_raw() };
        }
    }
}

impl<'a, T> Clone for Cursor<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for Cursor<'a, T> {}

impl<'a, T> PartialEq for Cursor<'a, T> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.node, other.node)
    }
}

impl<'a, T> Eq for Cursor<'a, T> {}

impl<'a, T: fmt::Debug> fmt::Debug for Cursor<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cursor").field(&self.get()).finish()
    }
}

/// An iterator over the live values of a [`ChainSet`].
pub struct Iter<'a, T> {
    cursor: Cursor<'a, T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let value = self.cursor.get()?;
        self.cursor.move_next();

        Some(value)
    }
}

impl<'a, T> FusedIterator for Iter<'a, T> {}
