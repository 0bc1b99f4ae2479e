use std::ptr::{null_mut, NonNull};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

/// Called exactly once per entry, with the entry's key and value, when the
/// entry is no longer cached and no client handle remains.
pub(crate) type Deleter<T> = Box<dyn FnOnce(&[u8], T) + Send>;

/// One cache entry. Chain and list links are intrusive; the key lives in
/// an owned buffer on the entry itself so a lookup never chases a second
/// allocation.
///
/// `refs` counts the cache's own reference (while `in_cache`) plus every
/// outstanding client handle. An entry is on the cold list iff
/// `refs == 1 && in_cache`, on the hot list iff `refs >= 2 && in_cache`,
/// and on neither list when it has been erased but is still client-held.
pub(crate) struct LruHandle<T> {
    value: Option<T>,
    deleter: Option<Deleter<T>>,
    next_hash: *mut LruHandle<T>,
    next: *mut LruHandle<T>,
    prev: *mut LruHandle<T>,
    charge: usize,
    key: Bytes,
    pub(crate) hash: u32,
    in_cache: bool,
    refs: u32,
}

impl<T> LruHandle<T> {
    /// List head; never carries a value and never enters the table.
    fn sentinel() -> *mut Self {
        let e = Box::into_raw(Box::new(Self {
            value: None,
            deleter: None,
            next_hash: null_mut(),
            next: null_mut(),
            prev: null_mut(),
            charge: 0,
            key: Bytes::new(),
            hash: 0,
            in_cache: false,
            refs: 0,
        }));
        unsafe {
            (*e).next = e;
            (*e).prev = e;
        }
        e
    }

    pub(crate) fn value_ref(&self) -> &T {
        self.value.as_ref().expect("live cache entry")
    }
}

/// Hash table over entry pointers: power-of-two bucket array, per-bucket
/// chain through `next_hash`, load factor held at or below one by
/// doubling. Resizing relinks the existing nodes; it allocates nothing
/// per node.
struct HandleTable<T> {
    length: u32,
    elems: u32,
    list: Vec<*mut LruHandle<T>>,
}

impl<T> HandleTable<T> {
    fn new() -> Self {
        let mut table = Self {
            length: 0,
            elems: 0,
            list: Vec::new(),
        };
        table.resize();
        table
    }

    fn lookup(&mut self, key: &[u8], hash: u32) -> *mut LruHandle<T> {
        unsafe { *self.find_pointer(key, hash) }
    }

    /// Links `h` into its bucket. If an entry with the same key was
    /// present it is unlinked and returned; the caller owns finishing its
    /// erasure.
    fn insert(&mut self, h: *mut LruHandle<T>) -> *mut LruHandle<T> {
        unsafe {
            let slot = self.find_pointer((*h).key.as_ref(), (*h).hash);
            let old = *slot;
            (*h).next_hash = if old.is_null() { null_mut() } else { (*old).next_hash };
            *slot = h;
            if old.is_null() {
                self.elems += 1;
                if self.elems > self.length {
                    self.resize();
                }
            }
            old
        }
    }

    fn remove(&mut self, key: &[u8], hash: u32) -> *mut LruHandle<T> {
        unsafe {
            let slot = self.find_pointer(key, hash);
            let result = *slot;
            if !result.is_null() {
                *slot = (*result).next_hash;
                self.elems -= 1;
            }
            result
        }
    }

    /// Slot holding the matching entry, or the trailing null slot of the
    /// bucket's chain.
    fn find_pointer(&mut self, key: &[u8], hash: u32) -> *mut *mut LruHandle<T> {
        let mut slot: *mut *mut LruHandle<T> =
            &mut self.list[(hash & (self.length - 1)) as usize];
        unsafe {
            while !(*slot).is_null() && ((**slot).hash != hash || (**slot).key.as_ref() != key) {
                slot = &mut (**slot).next_hash;
            }
        }
        slot
    }

    fn resize(&mut self) {
        let mut new_length: u32 = 4;
        while new_length < self.elems {
            new_length *= 2;
        }

        let mut new_list = vec![null_mut(); new_length as usize];
        let mut count = 0;
        for i in 0..self.list.len() {
            let mut h = self.list[i];
            while !h.is_null() {
                unsafe {
                    let next = (*h).next_hash;
                    let slot = &mut new_list[((*h).hash & (new_length - 1)) as usize];
                    (*h).next_hash = *slot;
                    *slot = h;
                    h = next;
                }
                count += 1;
            }
        }
        debug_assert_eq!(self.elems, count);

        self.list = new_list;
        self.length = new_length;
    }
}

/// One cache shard: a capacity-bounded LRU with pinning.
///
/// Two circular lists partition the cached entries. The cold list keeps
/// unpinned entries in recency order (head.next oldest); the hot list
/// keeps client-pinned entries in no particular order. Eviction only ever
/// walks the cold list, so pinned entries are never considered.
///
/// All operations take the shard mutex for their whole duration,
/// including deleter invocations; deleters must not call back into the
/// cache.
pub(crate) struct LruCache<T> {
    capacity: usize,
    inner: Mutex<LruCacheInner<T>>,
}

struct LruCacheInner<T> {
    usage: usize,
    lru: *mut LruHandle<T>,
    in_use: *mut LruHandle<T>,
    table: HandleTable<T>,
}

// Safety: the raw entry pointers are only dereferenced under the shard
// mutex (or exclusively in Drop); entries themselves move between threads
// only as whole values.
unsafe impl<T: Send> Send for LruCache<T> {}
unsafe impl<T: Send> Sync for LruCache<T> {}

impl<T> LruCache<T> {
    /// `capacity == 0` turns caching off: inserts still hand out working
    /// handles but nothing is retained.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LruCacheInner {
                usage: 0,
                lru: LruHandle::sentinel(),
                in_use: LruHandle::sentinel(),
                table: HandleTable::new(),
            }),
        }
    }

    pub(crate) fn insert(
        &self,
        key: Bytes,
        hash: u32,
        value: T,
        charge: usize,
        deleter: Deleter<T>,
    ) -> NonNull<LruHandle<T>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let e = Box::into_raw(Box::new(LruHandle {
            value: Some(value),
            deleter: Some(deleter),
            next_hash: null_mut(),
            next: null_mut(),
            prev: null_mut(),
            charge,
            key,
            hash,
            in_cache: false,
            refs: 1, // the returned handle
        }));

        unsafe {
            if self.capacity > 0 {
                (*e).refs += 1; // the cache's own reference
                (*e).in_cache = true;
                LruCacheInner::list_append(inner.in_use, e);
                inner.usage += charge;
                let displaced = inner.table.insert(e);
                inner.finish_erase(displaced);
            }

            self.evict_cold(inner);
        }

        NonNull::new(e).expect("fresh allocation")
    }

    pub(crate) fn lookup(&self, key: &[u8], hash: u32) -> Option<NonNull<LruHandle<T>>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let e = inner.table.lookup(key, hash);
        if e.is_null() {
            return None;
        }
        unsafe {
            inner.ref_entry(e);
        }
        NonNull::new(e)
    }

    pub(crate) fn release(&self, handle: NonNull<LruHandle<T>>) {
        let mut guard = self.inner.lock();
        unsafe {
            guard.unref_entry(handle.as_ptr());
        }
    }

    pub(crate) fn erase(&self, key: &[u8], hash: u32) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        unsafe {
            let removed = inner.table.remove(key, hash);
            inner.finish_erase(removed);
        }
    }

    /// Drops every unpinned entry. Pinned entries are untouched.
    pub(crate) fn prune(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        unsafe {
            while (*inner.lru).next != inner.lru {
                let e = (*inner.lru).next;
                assert_eq!((*e).refs, 1);
                let removed = inner.table.remove((*e).key.as_ref(), (*e).hash);
                let erased = inner.finish_erase(removed);
                debug_assert!(erased);
            }
        }
    }

    pub(crate) fn total_charge(&self) -> usize {
        self.inner.lock().usage
    }

    /// Evicts from the cold end until usage fits or nothing evictable
    /// remains. Overshoot is possible while every entry is pinned.
    unsafe fn evict_cold(&self, inner: &mut LruCacheInner<T>) {
        while inner.usage > self.capacity && (*inner.lru).next != inner.lru {
            let old = (*inner.lru).next;
            assert_eq!((*old).refs, 1);
            trace!(
                usage = inner.usage,
                capacity = self.capacity,
                "evicting cold cache entry"
            );
            let removed = inner.table.remove((*old).key.as_ref(), (*old).hash);
            let erased = inner.finish_erase(removed);
            debug_assert!(erased);
        }
    }
}

impl<T> LruCacheInner<T> {
    /// Takes one more reference; a cold entry gaining its first client
    /// moves to the hot list.
    unsafe fn ref_entry(&mut self, e: *mut LruHandle<T>) {
        if (*e).refs == 1 && (*e).in_cache {
            Self::list_remove(e);
            Self::list_append(self.in_use, e);
        }
        (*e).refs += 1;
    }

    /// Drops one reference. At zero the entry dies and its deleter runs;
    /// an entry cooling back to only the cache's reference rejoins the
    /// cold list at the newest end.
    unsafe fn unref_entry(&mut self, e: *mut LruHandle<T>) {
        assert!((*e).refs > 0, "release of a dead cache handle");
        (*e).refs -= 1;

        if (*e).refs == 0 {
            assert!(!(*e).in_cache, "deallocating an entry the cache still owns");
            let mut entry = Box::from_raw(e);
            match (entry.value.take(), entry.deleter.take()) {
                (Some(value), Some(deleter)) => deleter(entry.key.as_ref(), value),
                _ => debug_assert!(false, "entry missing value or deleter"),
            }
        } else if (*e).in_cache && (*e).refs == 1 {
            Self::list_remove(e);
            Self::list_append(self.lru, e);
        }
    }

    /// Finishes removing `e` from the cache after the table no longer
    /// references it. Returns whether `e` was non-null.
    unsafe fn finish_erase(&mut self, e: *mut LruHandle<T>) -> bool {
        if e.is_null() {
            return false;
        }
        assert!((*e).in_cache);
        Self::list_remove(e);
        (*e).in_cache = false;
        self.usage -= (*e).charge;
        self.unref_entry(e);
        true
    }

    unsafe fn list_remove(e: *mut LruHandle<T>) {
        (*(*e).next).prev = (*e).prev;
        (*(*e).prev).next = (*e).next;
    }

    /// Inserts `e` just before the sentinel, i.e. at the newest end.
    unsafe fn list_append(list: *mut LruHandle<T>, e: *mut LruHandle<T>) {
        (*e).next = list;
        (*e).prev = (*list).prev;
        (*(*e).prev).next = e;
        (*(*e).next).prev = e;
    }
}

impl<T> Drop for LruCache<T> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        unsafe {
            assert!(
                (*inner.in_use).next == inner.in_use,
                "cache dropped with an outstanding handle"
            );

            let mut e = (*inner.lru).next;
            while e != inner.lru {
                let next = (*e).next;
                assert!((*e).in_cache);
                (*e).in_cache = false;
                assert_eq!((*e).refs, 1); // cache's own reference
                inner.unref_entry(e);
                e = next;
            }

            drop(Box::from_raw(inner.lru));
            drop(Box::from_raw(inner.in_use));
        }
    }
}
