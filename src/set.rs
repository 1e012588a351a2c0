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

//! A lockfree concurrent hash set.

use crate::map::{ConcurrentMap, DefaultHashBuilder, DEFAULT_CAPACITY};

use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash},
};

/// A lockfree concurrent hash set backed by a [`ConcurrentMap`] with unit
/// values.
///
/// [`ConcurrentMap`]: crate::ConcurrentMap
pub struct ConcurrentSet<T, S = DefaultHashBuilder> {
    map: ConcurrentMap<T, (), S>,
}

impl<T> ConcurrentSet<T, DefaultHashBuilder> {
    pub fn new() -> ConcurrentSet<T, DefaultHashBuilder> {
        ConcurrentSet::with_capacity_and_hasher(DEFAULT_CAPACITY, DefaultHashBuilder::default())
    }

    pub fn with_capacity(capacity: usize) -> ConcurrentSet<T, DefaultHashBuilder> {
        ConcurrentSet::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<T, S> ConcurrentSet<T, S> {
    pub fn with_hasher(hash_builder: S) -> ConcurrentSet<T, S> {
        ConcurrentSet::with_capacity_and_hasher(DEFAULT_CAPACITY, hash_builder)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> ConcurrentSet<T, S> {
        ConcurrentSet {
            map: ConcurrentMap::with_capacity_and_hasher(capacity, hash_builder),
        }
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn load_factor(&self) -> f32 {
        self.map.load_factor()
    }
}

impl<T: Hash + Eq, S: BuildHasher> ConcurrentSet<T, S> {
    pub fn contains<Q: ?Sized + Hash + Eq>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
    {
        self.map.contains_key(value)
    }

    /// Returns true if `value` was not already present.
    pub fn insert(&self, value: T) -> bool {
        self.map.insert(value, ())
    }

    /// Returns true if `value` was present and this call erased it.
    pub fn erase<Q: ?Sized + Hash + Eq>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
    {
        self.map.erase_and(value, |_| ()).is_some()
    }
}

impl<T, S: Default> Default for ConcurrentSet<T, S> {
    fn default() -> ConcurrentSet<T, S> {
        ConcurrentSet::with_hasher(S::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    #[test]
    fn basics() {
        let set = ConcurrentSet::new();

        assert!(set.is_empty());
        assert!(set.insert("foo".to_string()));
        assert!(set.insert("bar".to_string()));
        assert!(!set.insert("foo".to_string()));

        assert_eq!(set.len(), 2);
        assert!(set.contains("foo"));
        assert!(!set.contains("baz"));

        assert!(set.erase("foo"));
        assert!(!set.erase("foo"));
        assert!(!set.contains("foo"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn concurrent_overlapped_insertion() {
        const NUM_THREADS: usize = 16;
        const MAX_VALUE: i32 = 1024;

        let set = Arc::new(ConcurrentSet::with_capacity(1));
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let set = set.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    for i in 0..MAX_VALUE {
                        set.insert(i);
                    }
                })
            })
            .collect();

        for result in threads.into_iter().map(|t| t.join()) {
            assert!(result.is_ok());
        }

        assert_eq!(set.len(), MAX_VALUE as usize);
        assert!(set.capacity() > 1);

        for i in 0..MAX_VALUE {
            assert!(set.contains(&i));
        }
    }
}
