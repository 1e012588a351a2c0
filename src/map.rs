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

//! A lockfree concurrent hash map whose buckets are lockfree chains.

mod bucket_array;
mod builder;


pub use builder::{default_max_load_factor, Builder, DEFAULT_CAPACITY};

use bucket_array::{new_record, BucketArray, Entry, State};

use crate::slot::{OwnershipSlot, SlotRef};

use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;

/// Default hasher for `ConcurrentMap`.
///
/// This is currently [aHash], a hashing algorithm designed around
/// acceleration by the [AES-NI] instruction set on x86 processors. aHash is
/// not cryptographically secure, but is fast and resistant to DoS attacks.
///
/// [aHash]: https://docs.rs/ahash
/// [AES-NI]: https://en.wikipedia.org/wiki/AES_instruction_set
pub type DefaultHashBuilder = ahash::RandomState;

/// A lockfree concurrent hash map implemented with separate chaining.
///
/// Each bucket is a [`ChainSet`], a lockfree singly-linked list that only
/// ever grows at its head and deletes by tombstoning. The map keeps two
/// bucket arrays in a pair of [`OwnershipSlot`]s and an atomic selector
/// naming the active one. When the load factor passes
/// [`max_load_factor`], one thread allocates an array of twice the size in
/// the inactive slot, flips the selector and migrates entries forward, while
/// every other thread keeps reading and writing.
///
/// Insertion has insert-if-absent semantics: inserting a key that is already
/// present leaves the existing value in place. Lookups return copies of
/// values (or the result of a closure), since another thread may erase an
/// entry at any moment.
///
/// Key types must implement [`Hash`] and [`Eq`].
///
/// [`ChainSet`]: crate::ChainSet
/// [`OwnershipSlot`]: crate::OwnershipSlot
/// [`max_load_factor`]: #method.max_load_factor
/// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
/// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
pub struct ConcurrentMap<K, V, S = DefaultHashBuilder> {
    slot_a: OwnershipSlot<BucketArray<K, V>>,
    slot_b: OwnershipSlot<BucketArray<K, V>>,
    active_is_a: AtomicBool,
    len: AtomicUsize,
    max_load_factor: f32,
    hash_builder: S,
}

impl<K, V> ConcurrentMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `ConcurrentMap` with [`DEFAULT_CAPACITY`] buckets.
    ///
    /// [`DEFAULT_CAPACITY`]: crate::map::DEFAULT_CAPACITY
    pub fn new() -> ConcurrentMap<K, V, DefaultHashBuilder> {
        ConcurrentMap::with_capacity_and_hasher(DEFAULT_CAPACITY, DefaultHashBuilder::default())
    }

    /// Creates an empty `ConcurrentMap` with at least `capacity` buckets.
    ///
    /// The bucket count is rounded up to a power of two.
    pub fn with_capacity(capacity: usize) -> ConcurrentMap<K, V, DefaultHashBuilder> {
        ConcurrentMap::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }

    /// Returns a [`Builder`] for configuring a new map.
    pub fn builder() -> Builder<K, V, DefaultHashBuilder> {
        Builder::new()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S> {
    /// Creates an empty `ConcurrentMap` that will use `hash_builder` to hash
    /// keys.
    pub fn with_hasher(hash_builder: S) -> ConcurrentMap<K, V, S> {
        ConcurrentMap::with_capacity_and_hasher(DEFAULT_CAPACITY, hash_builder)
    }

    /// Creates an empty `ConcurrentMap` with at least `capacity` buckets that
    /// uses `hash_builder` to hash keys.
    ///
    /// The bucket count is rounded up to a power of two. Use [`builder`] to
    /// have an oversized capacity reported as an error.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is greater than the largest power of two that
    /// fits in a `usize`.
    ///
    /// [`builder`]: #method.builder
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> ConcurrentMap<K, V, S> {
        ConcurrentMap::from_parts(
            capacity.max(1).next_power_of_two(),
            default_max_load_factor(),
            hash_builder,
        )
    }

    pub(crate) fn from_parts(
        capacity: usize,
        max_load_factor: f32,
        hash_builder: S,
    ) -> ConcurrentMap<K, V, S> {
        let buckets = BucketArray::with_capacity(0, capacity);
        buckets.update();
        buckets.ready();

        ConcurrentMap {
            slot_a: OwnershipSlot::from(Box::new(buckets)),
            slot_b: OwnershipSlot::new(),
            active_is_a: AtomicBool::new(true),
            len: AtomicUsize::new(0),
            max_load_factor,
            hash_builder,
        }
    }

    /// Returns the number of elements in this map.
    ///
    /// This counts insertions and erasures that have completed. While other
    /// threads are writing it is only an approximation.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns true if this map contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the active bucket array.
    pub fn capacity(&self) -> usize {
        self.acquire_active().1.capacity()
    }

    /// Returns the ratio of elements to buckets.
    ///
    /// The element count and the bucket array are read independently, so
    /// this is a heuristic while other threads are writing.
    pub fn load_factor(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }

    /// Returns the load factor above which this map grows.
    pub fn max_load_factor(&self) -> f32 {
        self.max_load_factor
    }

    /// Returns a reference to this map's hash builder.
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    fn slot(&self, is_a: bool) -> &OwnershipSlot<BucketArray<K, V>> {
        if is_a {
            &self.slot_a
        } else {
            &self.slot_b
        }
    }

    // The selector is re-read after acquiring so that the returned array was
    // active at some point while we held it.
    fn acquire_active(&self) -> (bool, SlotRef<'_, BucketArray<K, V>>) {
        let backoff = Backoff::new();

        loop {
            let active = self.active_is_a.load(Ordering::Acquire);

            if let Some(buckets) = self.slot(active).try_acquire() {
                if self.active_is_a.load(Ordering::Acquire) == active {
                    return (active, buckets);
                }
            }

            backoff.snooze();
        }
    }

    fn acquire_predecessor(
        &self,
        active: bool,
        buckets: &BucketArray<K, V>,
    ) -> Option<SlotRef<'_, BucketArray<K, V>>> {
        self.slot(!active)
            .try_acquire()
            .filter(|previous| previous.epoch() + 1 == buckets.epoch())
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> ConcurrentMap<K, V, S> {
    /// Returns a copy of the value corresponding to `key`.
    ///
    /// `Q` can be any borrowed form of `K`, but [`Hash`] and [`Eq`] on `Q`
    /// *must* match that of `K`. `V` must implement [`Clone`], as the value
    /// may be concurrently erased at any moment.
    ///
    /// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
    /// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
    /// [`Clone`]: https://doc.rust-lang.org/std/clone/trait.Clone.html
    pub fn find<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.find_and(key, V::clone)
    }

    /// Returns true if this map contains a value for `key`.
    pub fn contains_key<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
    {
        self.find_and(key, |_| ()).is_some()
    }

    /// Invokes `func` with a reference to the value corresponding to `key`.
    ///
    /// `func` will only be invoked if there is a value associated with `key`
    /// contained within this map.
    pub fn find_and<Q: ?Sized + Hash + Eq, F: FnOnce(&V) -> T, T>(
        &self,
        key: &Q,
        func: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let hash = self.get_hash(key);
        let matches =
            |e: &Entry<K, V>| e.hash == hash && <K as Borrow<Q>>::borrow(&e.key) == key;

        loop {
            let (active, buckets) = self.acquire_active();

            // must be read before searching; Ready means fully migrated
            let state = buckets.state();

            if let Some(entry) = buckets.bucket_for(hash).find_by(matches) {
                return Some(func(&entry.value));
            }

            if state != State::Updating {
                return None;
            }

            // entries not yet migrated are still in the predecessor
            if let Some(previous) = self.acquire_predecessor(active, &buckets) {
                return previous
                    .bucket_for(hash)
                    .find_by(matches)
                    .map(|entry| func(&entry.value));
            }

            // the predecessor is gone, so the migration finished meanwhile
        }
    }

    /// Inserts a key-value pair if `key` is not already present.
    ///
    /// Returns true if the pair was inserted. If `key` was already present,
    /// its value is left unchanged and `value` is dropped.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.insert_and(key, value, |_| ()).is_none()
    }

    /// Inserts a key-value pair if `key` is not already present, otherwise
    /// invokes `func` with the existing value.
    ///
    /// Returns [`None`] if the pair was inserted.
    ///
    /// [`None`]: https://doc.rust-lang.org/std/option/enum.Option.html#variant.None
    pub fn insert_and<F: FnOnce(&V) -> T, T>(&self, key: K, value: V, func: F) -> Option<T> {
        let hash = self.get_hash(&key);
        let mut record = new_record(hash, key, value);

        loop {
            let (active, buckets) = self.acquire_active();
            self.help_migrate(active, &buckets, hash);

            match buckets
                .bucket_for(hash)
                .insert_record_by(record, Entry::same_key)
            {
                Ok((_, true)) => (),
                Ok((existing, false)) => {
                    return existing.get().map(|entry| func(&entry.value));
                }
                Err(r) => {
                    // frozen; a resize superseded this array after we got it
                    record = r;

                    continue;
                }
            }

            self.len.fetch_add(1, Ordering::Relaxed);
            drop(buckets);
            self.maybe_grow();

            return None;
        }
    }

    /// Erases the entry for `key`, returning a copy of its value if there was
    /// one.
    ///
    /// If several threads erase the same key at once, only one of them gets
    /// the value.
    pub fn erase<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.erase_and(key, V::clone)
    }

    /// Erases the entry for `key`, then returns the result of invoking `func`
    /// with its value.
    pub fn erase_and<Q: ?Sized + Hash + Eq, F: FnOnce(&V) -> T, T>(
        &self,
        key: &Q,
        func: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let hash = self.get_hash(key);
        let matches =
            |e: &Entry<K, V>| e.hash == hash && <K as Borrow<Q>>::borrow(&e.key) == key;

        loop {
            let (active, buckets) = self.acquire_active();
            self.help_migrate(active, &buckets, hash);

            let bucket = buckets.bucket_for(hash);

            if let Some(entry) = bucket.erase_by(matches) {
                self.len.fetch_sub(1, Ordering::Relaxed);

                return Some(func(&entry.value));
            }

            if !bucket.is_frozen() {
                return None;
            }
        }
    }

    fn get_hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);

        hasher.finish()
    }

    // Writers to an array that is still being filled first make sure that the
    // predecessor bucket feeding their bucket has been copied over, so that
    // deduplication in the new bucket sees every live key.
    fn help_migrate(&self, active: bool, buckets: &BucketArray<K, V>, hash: u64) {
        if buckets.state() != State::Updating {
            return;
        }

        if let Some(previous) = self.acquire_predecessor(active, buckets) {
            previous.migrate_bucket(previous.index_of(hash), buckets);
        }
    }

    fn maybe_grow(&self) {
        let (active, buckets) = self.acquire_active();

        if self.len() as f32 / buckets.capacity() as f32 <= self.max_load_factor {
            return;
        }

        if !buckets.lock() {
            log::trace!(
                "resize of epoch {} already in progress elsewhere",
                buckets.epoch()
            );

            return;
        }

        self.grow(active, &buckets);
    }

    fn grow(&self, active: bool, buckets: &BucketArray<K, V>) {
        let capacity = match grown_capacity(buckets.capacity()) {
            Some(c) => c,
            None => {
                log::warn!(
                    "cannot grow past {} buckets; staying at the current size",
                    buckets.capacity()
                );
                buckets.unlock();

                return;
            }
        };

        let epoch = buckets.epoch() + 1;

        if self
            .slot(!active)
            .reset(Box::new(BucketArray::with_capacity(epoch, capacity)))
            .is_err()
        {
            log::trace!(
                "previous bucket array is still referenced; deferring resize to {} buckets",
                capacity
            );
            buckets.unlock();

            return;
        }

        let next = match self.slot(!active).try_acquire() {
            Some(next) => next,
            None => {
                self.slot(!active).release();
                buckets.unlock();

                return;
            }
        };

        log::debug!(
            "resizing from {} to {} buckets (epoch {})",
            buckets.capacity(),
            capacity,
            epoch
        );

        next.update();
        self.active_is_a.store(!active, Ordering::Release);

        for index in 0..buckets.capacity() {
            buckets.migrate_bucket(index, &next);
        }

        next.ready();
        self.slot(active).release();

        log::debug!("resize to {} buckets (epoch {}) complete", capacity, epoch);
    }
}

fn grown_capacity(capacity: usize) -> Option<usize> {
    capacity.checked_mul(2)
}

impl<K, V, S: Default> Default for ConcurrentMap<K, V, S> {
    fn default() -> ConcurrentMap<K, V, S> {
        ConcurrentMap::with_hasher(S::default())
    }
}
