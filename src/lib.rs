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

//! Lockfree concurrent hash containers built on chained buckets.
//!
//! The building blocks are usable on their own:
//!
//! * [`ChainSet`] is a lockfree insert-if-absent set kept in a singly-linked
//!   list. Values are never unlinked; erasure marks them as deleted.
//! * [`OwnershipSlot`] owns a single heap object and hands out reference
//!   counted [`SlotRef`] guards to it.
//!
//! [`ConcurrentMap`] combines them into a resizeable hash map: an array of
//! chains lives in one of two slots, and growing the map migrates entries
//! into a larger array in the other slot while readers and writers keep
//! going. [`ConcurrentSet`] is the same map with unit values.
//!
//! ```
//! use chaintable::ConcurrentMap;
//!
//! let map = ConcurrentMap::new();
//!
//! assert!(map.insert("foo", 1));
//! assert!(!map.insert("foo", 2));
//! assert_eq!(map.find("foo"), Some(1));
//! assert_eq!(map.erase("foo"), Some(1));
//! assert!(map.is_empty());
//! ```

pub mod chain;
pub mod error;
pub mod map;
pub mod set;
pub mod slot;

pub use chain::{ChainSet, Cursor};
pub use error::BuildError;
pub use map::{Builder, ConcurrentMap};
pub use set::ConcurrentSet;
pub use slot::{OwnershipSlot, SlotRef};
