mod lru;

use std::ptr::NonNull;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    cache::lru::{LruCache, LruHandle},
    utils::hash::hash,
};

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

/// A pinned reference to a cache entry. Holding one keeps the entry's
/// value alive regardless of eviction or erasure; every handle must be
/// given back through [`ShardedLruCache::release`]. A handle that is
/// dropped instead of released pins its entry forever.
pub struct Handle<T> {
    ptr: NonNull<LruHandle<T>>,
}

// Safety: the entry behind `ptr` is only mutated under its shard's mutex;
// through the handle itself nothing but the immutable value is reachable.
unsafe impl<T: Send> Send for Handle<T> {}
unsafe impl<T: Sync> Sync for Handle<T> {}

impl<T> Handle<T> {
    pub fn value(&self) -> &T {
        unsafe { self.ptr.as_ref() }.value_ref()
    }
}

/// Concurrent LRU cache of opaque values, split into 16 independent
/// shards selected by the top bits of the key hash. Each shard has its
/// own mutex and a capacity of one sixteenth of the total (rounded up),
/// so operations on keys in different shards never contend.
///
/// The deleter passed to `insert` runs exactly once, under the owning
/// shard's mutex, when the entry is both uncached and unpinned. Deleters
/// must not call back into the cache.
pub struct ShardedLruCache<T> {
    shards: [LruCache<T>; NUM_SHARDS],
    last_id: Mutex<u64>,
}

impl<T> ShardedLruCache<T> {
    /// `capacity` is a total budget in the same unit callers use for
    /// `charge`. Zero disables caching entirely.
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        Self {
            shards: std::array::from_fn(|_| LruCache::new(per_shard)),
            last_id: Mutex::new(0),
        }
    }

    /// Caches `value` under `key` and returns a handle pinning it. A
    /// previous entry with the same key is displaced immediately, though
    /// its value survives until its own pins are gone.
    pub fn insert(
        &self,
        key: Bytes,
        value: T,
        charge: usize,
        deleter: impl FnOnce(&[u8], T) + Send + 'static,
    ) -> Handle<T> {
        let h = hash_key(&key);
        let ptr = self.shards[shard(h)].insert(key, h, value, charge, Box::new(deleter));
        Handle { ptr }
    }

    /// Returns a handle pinning the entry under `key`, if cached.
    pub fn lookup(&self, key: &[u8]) -> Option<Handle<T>> {
        let h = hash_key(key);
        self.shards[shard(h)]
            .lookup(key, h)
            .map(|ptr| Handle { ptr })
    }

    /// Gives back the pin held by `handle`.
    pub fn release(&self, handle: Handle<T>) {
        let h = unsafe { handle.ptr.as_ref() }.hash;
        self.shards[shard(h)].release(handle.ptr);
    }

    /// Uncaches the entry under `key`. Pinned entries survive until their
    /// last release; the deleter runs then.
    pub fn erase(&self, key: &[u8]) {
        let h = hash_key(key);
        self.shards[shard(h)].erase(key, h);
    }

    /// Strictly increasing id, for clients that prefix their keys to
    /// partition a shared cache.
    pub fn new_id(&self) -> u64 {
        let mut last_id = self.last_id.lock();
        *last_id += 1;
        *last_id
    }

    /// Drops every unpinned entry in every shard.
    pub fn prune(&self) {
        for shard in &self.shards {
            shard.prune();
        }
    }

    /// Sum of charges across shards, taken one shard at a time; an
    /// observational estimate, not a snapshot.
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(LruCache::total_charge).sum()
    }
}

fn hash_key(key: &[u8]) -> u32 {
    hash(key, 0)
}

fn shard(hash: u32) -> usize {
    (hash >> (32 - NUM_SHARD_BITS)) as usize
}
