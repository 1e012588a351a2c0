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

use super::{ConcurrentMap, DefaultHashBuilder};

use crate::error::BuildError;

use std::{
    env,
    hash::BuildHasher,
    marker::PhantomData,
    sync::atomic::{AtomicU32, Ordering},
};

/// The number of buckets a map starts with unless told otherwise.
pub const DEFAULT_CAPACITY: usize = 32;

const DEFAULT_MAX_LOAD_FACTOR: f32 = 0.8;

/// Returns the default maximum load factor.
///
/// This is 0.8 unless the `MAX_LOAD_FACTOR` environment variable holds a
/// finite positive number. The variable is read once per process.
pub fn default_max_load_factor() -> f32 {
    static STORAGE: AtomicU32 = AtomicU32::new(u32::MAX);

    let mut storage = STORAGE.load(Ordering::Relaxed);

    if storage == u32::MAX {
        storage = parse_max_load_factor(env::var("MAX_LOAD_FACTOR").ok().as_deref()).to_bits();

        STORAGE
            .compare_exchange(u32::MAX, storage, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    f32::from_bits(storage)
}

fn parse_max_load_factor(value: Option<&str>) -> f32 {
    let value = match value {
        Some(v) => v,
        None => return DEFAULT_MAX_LOAD_FACTOR,
    };

    match value.trim().parse::<f32>() {
        Ok(parsed) if is_valid_max_load_factor(parsed) => parsed,
        _ => {
            log::warn!(
                "ignoring MAX_LOAD_FACTOR={:?}; using {}",
                value,
                DEFAULT_MAX_LOAD_FACTOR
            );

            DEFAULT_MAX_LOAD_FACTOR
        }
    }
}

fn is_valid_max_load_factor(max_load_factor: f32) -> bool {
    max_load_factor.is_finite() && max_load_factor > 0.0
}

/// Configures and creates a [`ConcurrentMap`].
///
/// ```
/// use chaintable::ConcurrentMap;
///
/// let map: ConcurrentMap<u32, &str> = ConcurrentMap::builder()
///     .capacity(100)
///     .max_load_factor(0.5)
///     .build()
///     .unwrap();
///
/// assert_eq!(map.capacity(), 128);
/// ```
#[derive(Debug, Clone)]
pub struct Builder<K, V, S = DefaultHashBuilder> {
    capacity: usize,
    max_load_factor: f32,
    hash_builder: S,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V> Builder<K, V, DefaultHashBuilder> {
    pub(crate) fn new() -> Builder<K, V, DefaultHashBuilder> {
        Builder {
            capacity: DEFAULT_CAPACITY,
            max_load_factor: default_max_load_factor(),
            hash_builder: DefaultHashBuilder::default(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, S> Builder<K, V, S> {
    /// Sets the initial number of buckets. It is rounded up to the next
    /// power of two, and zero is treated as one.
    pub fn capacity(mut self, capacity: usize) -> Builder<K, V, S> {
        self.capacity = capacity;

        self
    }

    /// Sets the load factor above which the map doubles its bucket count.
    pub fn max_load_factor(mut self, max_load_factor: f32) -> Builder<K, V, S> {
        self.max_load_factor = max_load_factor;

        self
    }

    /// Sets the hash builder used to hash keys.
    pub fn hasher<T: BuildHasher>(self, hash_builder: T) -> Builder<K, V, T> {
        Builder {
            capacity: self.capacity,
            max_load_factor: self.max_load_factor,
            hash_builder,
            _marker: PhantomData,
        }
    }

    /// Creates the map.
    pub fn build(self) -> Result<ConcurrentMap<K, V, S>, BuildError> {
        if !is_valid_max_load_factor(self.max_load_factor) {
            return Err(BuildError::InvalidMaxLoadFactor(self.max_load_factor));
        }

        let capacity = self
            .capacity
            .max(1)
            .checked_next_power_of_two()
            .ok_or(BuildError::CapacityOverflow(self.capacity))?;

        Ok(ConcurrentMap::from_parts(
            capacity,
            self.max_load_factor,
            self.hash_builder,
        ))
    }
}
