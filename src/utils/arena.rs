use std::{
    alloc::Layout,
    cell::RefCell,
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::trace;

pub(crate) const BLOCK_SIZE: usize = 4096;

/// Bump allocator backing a memtable. Memory is handed out from 4 KiB
/// blocks and freed all at once when the arena drops; nothing allocated
/// from it is ever dropped in place, so only trivially-destructible data
/// may live here.
///
/// Only one thread may allocate at a time (the memtable writer).
/// `memory_usage` may be read from any thread.
pub struct Arena {
    core: RefCell<ArenaCore>,
    memory_usage: AtomicUsize,
}

// Safety: all mutation goes through `core`, which the single-writer
// contract restricts to one thread at a time; other threads only read
// `memory_usage` and bytes that were published before they got the pointer.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

struct ArenaCore {
    alloc_ptr: *mut u8,
    bytes_remaining: usize,
    blocks: Vec<(*mut u8, Layout)>,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            core: RefCell::new(ArenaCore {
                alloc_ptr: null_mut(),
                bytes_remaining: 0,
                blocks: Vec::new(),
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Returns a pointer to `bytes` fresh bytes with no alignment guarantee.
    pub fn allocate(&self, bytes: usize) -> NonNull<u8> {
        assert!(bytes > 0, "zero-byte arena allocation");
        let (ptr, added) = self.core.borrow_mut().allocate(bytes, 1);
        if added > 0 {
            self.memory_usage.fetch_add(added, Ordering::Relaxed);
        }
        ptr
    }

    /// Returns a pointer aligned for any pointer-sized data.
    pub fn allocate_aligned(&self, bytes: usize) -> NonNull<u8> {
        assert!(bytes > 0, "zero-byte arena allocation");
        let (ptr, added) = self
            .core
            .borrow_mut()
            .allocate(bytes, std::mem::align_of::<*mut u8>());
        if added > 0 {
            self.memory_usage.fetch_add(added, Ordering::Relaxed);
        }
        ptr
    }

    /// Total bytes held by the arena, including per-block bookkeeping.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl ArenaCore {
    fn allocate(&mut self, bytes: usize, align: usize) -> (NonNull<u8>, usize) {
        debug_assert!(align.is_power_of_two());

        let slop = {
            let rem = self.alloc_ptr as usize & (align - 1);
            if rem == 0 {
                0
            } else {
                align - rem
            }
        };
        let needed = bytes + slop;

        if needed <= self.bytes_remaining {
            let result = self.alloc_ptr.wrapping_add(slop);
            self.alloc_ptr = self.alloc_ptr.wrapping_add(needed);
            self.bytes_remaining -= needed;
            // Null is impossible here: a block is in play.
            return (NonNull::new(result).expect("allocation inside a live block"), 0);
        }

        self.allocate_fallback(bytes)
    }

    fn allocate_fallback(&mut self, bytes: usize) -> (NonNull<u8>, usize) {
        if bytes > BLOCK_SIZE / 4 {
            // Object is more than a quarter of a block. Give it its own
            // block so the current one keeps serving small allocations.
            return self.allocate_new_block(bytes);
        }

        // The remainder of the current block is wasted from here on.
        let (ptr, added) = self.allocate_new_block(BLOCK_SIZE);
        self.alloc_ptr = ptr.as_ptr().wrapping_add(bytes);
        self.bytes_remaining = BLOCK_SIZE - bytes;
        (ptr, added)
    }

    fn allocate_new_block(&mut self, block_bytes: usize) -> (NonNull<u8>, usize) {
        // Blocks are pointer-aligned, so aligned requests never need slop
        // at a block start.
        let layout = Layout::from_size_align(block_bytes, std::mem::align_of::<*mut u8>())
            .expect("block layout");
        let ptr = unsafe { std::alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };

        self.blocks.push((ptr.as_ptr(), layout));
        trace!(block_bytes, total_blocks = self.blocks.len(), "arena block allocated");
        (ptr, block_bytes + std::mem::size_of::<*mut u8>())
    }
}

impl Drop for ArenaCore {
    fn drop(&mut self) {
        for &(ptr, layout) in self.blocks.iter() {
            unsafe {
                std::alloc::dealloc(ptr, layout);
            }
        }
        self.blocks.clear();
    }
}
