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

use crate::chain::{ChainSet, Record};

use std::{
    ops::Index,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

pub(crate) struct Entry<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: V,
}

impl<K: Eq, V> Entry<K, V> {
    pub(crate) fn same_key(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key == other.key
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Locked = 0,
    Updating = 1,
    Ready = 2,
}

impl State {
    fn from_u8(state: u8) -> State {
        match state {
            0 => State::Locked,
            1 => State::Updating,
            _ => State::Ready,
        }
    }
}

/// A fixed-capacity array of chains plus the lifecycle flag that gates
/// resizing.
///
/// Arrays are created `Locked`, become `Updating` once they are published as
/// the target of a resize, and `Ready` when every entry of their predecessor
/// has been migrated into them. A `Ready` array that wins [`lock`] becomes
/// the source of the next resize and is retired afterwards.
///
/// [`lock`]: #method.lock
pub(crate) struct BucketArray<K, V> {
    buckets: Box<[ChainSet<Entry<K, V>>]>, // len() is a power of 2
    state: AtomicU8,
    epoch: usize,
    modulo_mask: usize,
}

impl<K, V> BucketArray<K, V> {
    pub(crate) fn with_capacity(epoch: usize, capacity: usize) -> BucketArray<K, V> {
        assert!(capacity.is_power_of_two());

        BucketArray {
            buckets: (0..capacity).map(|_| ChainSet::new()).collect(),
            state: AtomicU8::new(State::Locked as u8),
            epoch,
            modulo_mask: capacity - 1,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn epoch(&self) -> usize {
        self.epoch
    }

    pub(crate) fn index_of(&self, hash: u64) -> usize {
        (hash as usize) & self.modulo_mask
    }

    pub(crate) fn bucket_for(&self, hash: u64) -> &ChainSet<Entry<K, V>> {
        &self.buckets[self.index_of(hash)]
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Ready -> Locked. Only the thread that gets true drives the resize.
    pub(crate) fn lock(&self) -> bool {
        self.transition(State::Ready, State::Locked)
    }

    /// Locked -> Updating.
    pub(crate) fn update(&self) -> bool {
        self.transition(State::Locked, State::Updating)
    }

    /// Updating -> Ready.
    pub(crate) fn ready(&self) -> bool {
        self.transition(State::Updating, State::Ready)
    }

    /// Locked -> Ready, for a resize that was abandoned before it started.
    pub(crate) fn unlock(&self) -> bool {
        self.transition(State::Locked, State::Ready)
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<K: Eq, V> BucketArray<K, V> {
    /// Copies every live entry of bucket `index` into `next`.
    ///
    /// The bucket is frozen first, so no insert can commit to it once the
    /// copy has started. Any number of threads may migrate the same bucket
    /// at once; records are shared with `next` rather than cloned, so an
    /// erase through either array is seen by both.
    pub(crate) fn migrate_bucket(&self, index: usize, next: &BucketArray<K, V>) {
        let bucket = &self.buckets[index];

        if bucket.is_migrated() {
            return;
        }

        bucket.freeze();

        for record in bucket.live_records() {
            // `next` is only frozen by its own resize, which cannot start
            // before the driver of this one has migrated this bucket
            let _ = next
                .bucket_for(record.value.hash)
                .insert_record_by(Arc::clone(record), Entry::same_key);
        }

        bucket.mark_migrated();
    }
}

impl<K, V> Index<usize> for BucketArray<K, V> {
    type Output = ChainSet<Entry<K, V>>;

    fn index(&self, index: usize) -> &ChainSet<Entry<K, V>> {
        &self.buckets[index]
    }
}

pub(crate) fn new_record<K, V>(hash: u64, key: K, value: V) -> Arc<Record<Entry<K, V>>> {
    Arc::new(Record::new(Entry { hash, key, value }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(array: &BucketArray<i32, i32>, hash: u64, key: i32) -> bool {
        array
            .bucket_for(hash)
            .insert_record_by(new_record(hash, key, key), Entry::same_key)
            .map(|(_, inserted)| inserted)
            .unwrap_or(false)
    }

    #[test]
    fn state_machine() {
        let array: BucketArray<i32, i32> = BucketArray::with_capacity(0, 4);
        assert_eq!(array.state(), State::Locked);

        assert!(!array.lock());
        assert!(!array.ready());
        assert!(array.update());
        assert_eq!(array.state(), State::Updating);

        assert!(!array.lock());
        assert!(!array.update());
        assert!(array.ready());
        assert_eq!(array.state(), State::Ready);

        assert!(array.lock());
        assert!(!array.lock());
        assert_eq!(array.state(), State::Locked);

        assert!(array.unlock());
        assert_eq!(array.state(), State::Ready);
    }

    #[test]
    fn indexing() {
        let array: BucketArray<i32, i32> = BucketArray::with_capacity(3, 8);

        assert_eq!(array.capacity(), 8);
        assert_eq!(array.epoch(), 3);
        assert_eq!(array.index_of(13), 5);
        assert_eq!(array.index_of(8), 0);

        assert!(insert(&array, 13, 13));
        assert!(array[5].find_by(|e| e.key == 13).is_some());
        assert!(array[0].find_by(|e| e.key == 13).is_none());
    }

    #[test]
    fn migration() {
        let old: BucketArray<i32, i32> = BucketArray::with_capacity(0, 2);
        let new: BucketArray<i32, i32> = BucketArray::with_capacity(1, 4);

        // bucket 1 of the old array splits into buckets 1 and 3
        for hash in [1u64, 3, 5, 7] {
            assert!(insert(&old, hash, hash as i32));
        }

        assert!(old[1].erase_by(|e| e.key == 5).is_some());

        old.migrate_bucket(1, &new);

        assert!(old[1].is_frozen());
        assert!(old[1].is_migrated());
        assert!(!old[0].is_frozen());

        assert_eq!(new[1].len(), 1);
        assert_eq!(new[3].len(), 2);
        assert!(new[1].find_by(|e| e.key == 1).is_some());
        assert!(new[1].find_by(|e| e.key == 5).is_none());
        assert!(new[3].find_by(|e| e.key == 3).is_some());
        assert!(new[3].find_by(|e| e.key == 7).is_some());

        // a frozen bucket rejects inserts
        assert!(old[1]
            .insert_record_by(new_record(9, 9, 9), Entry::same_key)
            .is_err());

        // migrating again changes nothing
        old.migrate_bucket(1, &new);
        assert_eq!(new[3].len(), 2);
    }

    #[test]
    fn shared_deletion() {
        let old: BucketArray<i32, i32> = BucketArray::with_capacity(0, 1);
        let new: BucketArray<i32, i32> = BucketArray::with_capacity(1, 2);

        assert!(insert(&old, 2, 2));
        old.migrate_bucket(0, &new);

        assert!(old[0].find_by(|e| e.key == 2).is_some());
        assert!(new[0].find_by(|e| e.key == 2).is_some());

        // erasing through the old array is visible in the new one
        assert!(old[0].erase_by(|e| e.key == 2).is_some());
        assert!(new[0].find_by(|e| e.key == 2).is_none());
        assert!(new[0].erase_by(|e| e.key == 2).is_none());
    }
}
