use std::{
    alloc::Layout,
    ops::{Deref, Index},
    ptr::NonNull,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering::*},
        Arc,
    },
};

use crate::{comparator::Comparator, utils::arena::Arena, utils::iterator::Iterator};

const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/// Reference to an immutable, self-describing byte record in the arena.
/// Plain old data; the bytes outlive every node because the list and the
/// records share the arena.
#[derive(Clone, Copy)]
pub(crate) struct RecordRef {
    ptr: NonNull<u8>,
    len: u32,
}

impl RecordRef {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len: len as u32,
        }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len as usize) }
    }
}

#[repr(C)]
struct Tower {
    ptrs: [AtomicPtr<Node>; 0],
}

impl Index<usize> for Tower {
    type Output = AtomicPtr<Node>;

    fn index(&self, index: usize) -> &Self::Output {
        unsafe { &*self.ptrs.as_ptr().add(index) }
    }
}

impl Tower {
    fn get_next(&self, level: usize) -> *mut Node {
        self[level].load(Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node) {
        self[level].store(node, Release);
    }
}

#[repr(C)]
struct Head {
    ptrs: [AtomicPtr<Node>; MAX_HEIGHT],
}

impl Deref for Head {
    type Target = Tower;

    fn deref(&self) -> &Self::Target {
        unsafe { &*(self as *const Self as *const _) }
    }
}

impl Default for Head {
    fn default() -> Self {
        Self {
            ptrs: Default::default(),
        }
    }
}

/// A node is a record reference followed by a variable-height tower of
/// forward links, all living in the arena. Nothing here needs dropping,
/// so the arena's free-all-at-once is the whole destructor story.
#[repr(C)]
struct Node {
    key: RecordRef,
    tower: Tower,
}

impl Node {
    unsafe fn alloc(key: RecordRef, height: usize, arena: &Arena) -> *mut Self {
        let ptr = arena.allocate_aligned(Self::layout(height).size()).as_ptr() as *mut Self;
        std::ptr::addr_of_mut!((*ptr).key).write(key);
        std::ptr::addr_of_mut!((*ptr).tower)
            .cast::<AtomicPtr<Node>>()
            .write_bytes(0, height);
        ptr
    }

    fn layout(height: usize) -> Layout {
        Layout::new::<Node>()
            .extend(Layout::array::<AtomicPtr<Node>>(height).expect("tower layout"))
            .expect("node layout")
            .0
            .pad_to_align()
    }
}

/// Ordered multiset of arena records. One writer at a time may `insert`;
/// readers may traverse concurrently with it and see a monotonically
/// growing prefix of the inserted entries. Links are published with
/// release stores and traversed with acquire loads, so a reader that sees
/// a node pointer sees the fully-written node behind it. No deletion.
pub(crate) struct SkipList<C: Comparator> {
    head: Head,
    max_height: AtomicUsize,
    cmp: C,
    arena: Arc<Arena>,
}

impl<C: Comparator> SkipList<C> {
    pub(crate) fn new(cmp: C, arena: Arc<Arena>) -> Self {
        Self {
            head: Head::default(),
            max_height: AtomicUsize::new(1),
            cmp,
            arena,
        }
    }

    pub(crate) fn comparator(&self) -> &C {
        &self.cmp
    }

    /// Inserts a record. Caller must serialize writers externally; the
    /// record must not compare equal to any already-inserted one.
    pub(crate) fn insert(&self, key: RecordRef) {
        let mut prev = [&*self.head as *const Tower; MAX_HEIGHT];

        unsafe {
            let node = self.search_ge_node(key.as_slice(), Some(&mut prev));
            if !node.is_null() {
                assert!(
                    !self.cmp.compare(key.as_slice(), (*node).key.as_slice()).is_eq(),
                    "duplicate key inserted"
                );
            }

            let height = random_height();
            let new_node = Node::alloc(key, height, &self.arena);
            for level in 0..height {
                // Fill the new node's link before publishing it at this
                // level; the publish store is the release point.
                (*new_node).tower.set_next(level, (*prev[level]).get_next(level));
                (*prev[level]).set_next(level, new_node);
            }

            if height > self.max_height() {
                self.max_height.store(height, Release);
            }
        }
    }

    pub(crate) fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        unsafe {
            let node = self.search_ge_node(key.as_ref(), None);
            !node.is_null()
                && self
                    .cmp
                    .compare(key.as_ref(), (*node).key.as_slice())
                    .is_eq()
        }
    }

    pub(crate) fn iter(&self) -> Iter<'_, C> {
        Iter::new(self)
    }

    fn max_height(&self) -> usize {
        self.max_height.load(Acquire)
    }

    /// First node whose key is >= `key`, or null. When `prev` is given it
    /// receives, per level, the tower the search descended from.
    unsafe fn search_ge_node(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*const Tower]>,
    ) -> *mut Node {
        let mut level = self.max_height() - 1;
        let mut cur = &*self.head;

        loop {
            let next = cur.get_next(level);
            if self.key_le_node(key, next) {
                if let Some(ref mut prev) = prev {
                    prev[level] = cur;
                }

                if level == 0 {
                    return next;
                }
                level -= 1;
            } else {
                cur = &(*next).tower;
            }
        }
    }

    /// Last node whose key is < `key`, or null.
    unsafe fn search_lt_node(&self, key: &[u8]) -> *mut Node {
        let mut level = self.max_height() - 1;
        let mut cur = &*self.head;
        let mut cur_node = std::ptr::null_mut();

        loop {
            let next = cur.get_next(level);
            if next.is_null() || !self.cmp.compare((*next).key.as_slice(), key).is_lt() {
                if level == 0 {
                    return cur_node;
                }
                level -= 1;
            } else {
                cur_node = next;
                cur = &(*next).tower;
            }
        }
    }

    unsafe fn search_last(&self) -> *mut Node {
        let mut level = self.max_height() - 1;
        let mut cur = &*self.head;
        let mut cur_node = std::ptr::null_mut();

        loop {
            let next = cur.get_next(level);
            if next.is_null() {
                if level == 0 {
                    return cur_node;
                }
                level -= 1;
            } else {
                cur_node = next;
                cur = &(*next).tower;
            }
        }
    }

    unsafe fn search_first(&self) -> *mut Node {
        self.head.get_next(0)
    }

    unsafe fn key_le_node(&self, key: &[u8], node: *const Node) -> bool {
        node.is_null() || self.cmp.compare(key, (*node).key.as_slice()).is_le()
    }
}

fn random_height() -> usize {
    let mut height = 1;
    while height < MAX_HEIGHT && rand::random::<u32>() % BRANCHING == 0 {
        height += 1;
    }
    height
}

pub(crate) struct Iter<'a, C: Comparator> {
    list: &'a SkipList<C>,
    node: Option<NonNull<Node>>,
}

impl<'a, C: Comparator> Iter<'a, C> {
    fn new(list: &'a SkipList<C>) -> Self {
        Self { list, node: None }
    }
}

impl<C: Comparator> Iterator for Iter<'_, C> {
    fn is_valid(&self) -> bool {
        self.node.is_some()
    }

    fn seek_to_first(&mut self) {
        unsafe {
            self.node = NonNull::new(self.list.search_first());
        }
    }

    fn seek_to_last(&mut self) {
        unsafe {
            self.node = NonNull::new(self.list.search_last());
        }
    }

    fn seek(&mut self, key: impl AsRef<[u8]>) {
        unsafe {
            self.node = NonNull::new(self.list.search_ge_node(key.as_ref(), None));
        }
    }

    fn next(&mut self) {
        unsafe {
            let node = self.node.expect("iterator not valid");
            self.node = NonNull::new(node.as_ref().tower.get_next(0));
        }
    }

    fn prev(&mut self) {
        // No back links; re-search from the head instead.
        unsafe {
            let node = self.node.expect("iterator not valid");
            self.node = NonNull::new(self.list.search_lt_node(node.as_ref().key.as_slice()));
        }
    }

    fn key(&self) -> &[u8] {
        let node = self.node.expect("iterator not valid");
        unsafe { node.as_ref() }.key.as_slice()
    }

    fn value(&self) -> &[u8] {
        unimplemented!("records carry their value inside the key bytes")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use itertools::Itertools;

    use super::{RecordRef, SkipList};
    use crate::{
        comparator::BytewiseComparator,
        utils::{arena::Arena, iterator::Iterator},
    };

    fn record(arena: &Arena, data: &[u8]) -> RecordRef {
        let ptr = arena.allocate(data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
        }
        RecordRef::new(ptr, data.len())
    }

    fn gen_keys(n: usize) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| format!("key{i:09}").into_bytes())
            .collect_vec()
    }

    fn build_list(keys: &[Vec<u8>]) -> (Arc<Arena>, SkipList<BytewiseComparator>) {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(BytewiseComparator, arena.clone());
        for key in keys {
            let rec = record(&arena, key);
            list.insert(rec);
        }
        (arena, list)
    }

    #[test]
    fn insert_and_contains() {
        let keys = gen_keys(2000);
        let (_arena, list) = build_list(&keys);

        for key in &keys {
            assert!(list.contains(key));
        }
        assert!(!list.contains(b"key-not-there"));
    }

    #[test]
    fn iterates_in_order() {
        let mut keys = gen_keys(2000);
        // Insert in a scrambled order; iteration must still be sorted.
        keys.rotate_left(700);
        let sorted = {
            let mut s = keys.clone();
            s.sort();
            s
        };
        let (_arena, list) = build_list(&keys);

        let mut iter = list.iter();
        iter.seek_to_first();
        for key in &sorted {
            assert!(iter.is_valid());
            assert_eq!(iter.key(), key.as_slice());
            iter.next();
        }
        assert!(!iter.is_valid());
    }

    #[test]
    fn seek_lands_on_first_ge() {
        let keys = gen_keys(100);
        let (_arena, list) = build_list(&keys);

        let mut iter = list.iter();
        for key in keys.iter().step_by(7) {
            iter.seek(key);
            assert!(iter.is_valid());
            assert_eq!(iter.key(), key.as_slice());
        }

        // Between two stored keys.
        iter.seek(b"key000000010z");
        assert!(iter.is_valid());
        assert_eq!(iter.key(), b"key000000011");

        // Past the end.
        iter.seek(b"zzz");
        assert!(!iter.is_valid());
    }

    #[test]
    fn walks_backward_from_last() {
        let keys = gen_keys(500);
        let (_arena, list) = build_list(&keys);

        let mut iter = list.iter();
        iter.seek_to_last();
        for key in keys.iter().rev() {
            assert!(iter.is_valid());
            assert_eq!(iter.key(), key.as_slice());
            iter.prev();
        }
        assert!(!iter.is_valid());
    }

    #[test]
    fn empty_list() {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(BytewiseComparator, arena);

        assert!(!list.contains(b"anything"));
        let mut iter = list.iter();
        iter.seek_to_first();
        assert!(!iter.is_valid());
        iter.seek_to_last();
        assert!(!iter.is_valid());
    }

    #[test]
    #[should_panic]
    fn duplicate_insert_panics() {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(BytewiseComparator, arena.clone());
        list.insert(record(&arena, b"key"));
        list.insert(record(&arena, b"key"));
    }

    #[test]
    fn readers_see_monotonic_sorted_prefix() {
        const KEY_COUNT: usize = 5000;
        const READER_COUNT: usize = 4;

        let keys = gen_keys(KEY_COUNT);
        let arena = Arc::new(Arena::new());
        let list = Arc::new(SkipList::new(BytewiseComparator, arena.clone()));
        let done = Arc::new(AtomicBool::new(false));

        let readers = (0..READER_COUNT)
            .map(|_| {
                let list = list.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut max_seen = 0;
                    while !done.load(Ordering::Acquire) {
                        let mut iter = list.iter();
                        iter.seek_to_first();
                        let mut count = 0;
                        let mut last: Option<Vec<u8>> = None;
                        while iter.is_valid() {
                            if let Some(prev) = &last {
                                assert!(prev.as_slice() < iter.key());
                            }
                            last = Some(iter.key().to_vec());
                            count += 1;
                            iter.next();
                        }
                        // Entries never disappear.
                        assert!(count >= max_seen);
                        max_seen = count;
                    }
                })
            })
            .collect_vec();

        for key in &keys {
            let rec = record(&arena, key);
            list.insert(rec);
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }

        for key in &keys {
            assert!(list.contains(key));
        }
    }
}
