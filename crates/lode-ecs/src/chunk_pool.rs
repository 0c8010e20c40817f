//! Pooled allocator for fixed-size chunks.
//!
//! Archetypes store their rows in 16 KiB chunks. Chunks are recycled through
//! a [`ChunkPool`] so that structural churn (archetypes filling up and
//! emptying) does not hit the global allocator every time. Chunks are
//! addressed by pool-relative [`ChunkHandle`]s rather than raw pointers.
//!
//! Each block starts with a [`ChunkHeader`] followed, at
//! [`CHUNK_ALIGNMENT`], by [`CHUNK_PAYLOAD_SIZE`] bytes of uninitialized
//! payload that the owning archetype lays out as columns.
//!
//! The pool is not synchronized. It belongs to one
//! [`EntityRegistry`](crate::registry::EntityRegistry) and is only touched
//! through it.

use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};

use tracing::debug;

/// Alignment of every chunk block and of its payload.
pub const CHUNK_ALIGNMENT: usize = 64;

/// Size of a whole block, header included.
pub const CHUNK_WITH_HEADER_SIZE: usize = 1 << 14;

/// Bytes available for columns in each chunk.
pub const CHUNK_PAYLOAD_SIZE: usize = CHUNK_WITH_HEADER_SIZE - CHUNK_ALIGNMENT;

const CHUNK_LAYOUT: Layout = match Layout::from_size_align(CHUNK_WITH_HEADER_SIZE, CHUNK_ALIGNMENT) {
    Ok(layout) => layout,
    Err(_) => panic!("invalid chunk layout"),
};

// ---------------------------------------------------------------------------
// Handles and header
// ---------------------------------------------------------------------------

/// Pool-relative identifier of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHandle(u32);

impl ChunkHandle {
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Per-chunk bookkeeping stored at the start of the block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkHeader {
    /// Number of occupied rows in this chunk.
    pub num_entities: u32,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Blocks currently backed by memory.
    pub allocated: usize,
    /// Blocks handed out and not yet released.
    pub in_use: usize,
    /// Blocks waiting on the free list.
    pub free: usize,
}

// ---------------------------------------------------------------------------
// ChunkPool
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Block {
    /// `None` once the memory was returned to the allocator.
    memory: Option<NonNull<u8>>,
    in_use: bool,
}

/// Hands out and reclaims fixed-size chunks.
#[derive(Debug, Default)]
pub struct ChunkPool {
    blocks: Vec<Block>,
    /// Released chunks whose memory is kept for reuse.
    free: Vec<ChunkHandle>,
    /// Slots whose memory was returned to the allocator.
    vacant: Vec<ChunkHandle>,
}

// The pool owns its blocks exclusively; the raw pointers are never shared
// outside of borrows of the pool itself.
unsafe impl Send for ChunkPool {}

impl ChunkPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a chunk with a zeroed header and uninitialized payload.
    ///
    /// Aborts through [`alloc::handle_alloc_error`] if the allocator fails.
    pub fn acquire(&mut self) -> ChunkHandle {
        if let Some(handle) = self.free.pop() {
            let block = &mut self.blocks[handle.0 as usize];
            block.in_use = true;
            if let Some(memory) = block.memory {
                // Safety: the block is backed by a CHUNK_LAYOUT allocation.
                unsafe { ptr::write(memory.as_ptr() as *mut ChunkHeader, ChunkHeader::default()) };
            }
            return handle;
        }

        let memory = Self::allocate_block();
        let handle = match self.vacant.pop() {
            Some(handle) => {
                self.blocks[handle.0 as usize] = Block {
                    memory: Some(memory),
                    in_use: true,
                };
                handle
            }
            None => {
                let handle = ChunkHandle(self.blocks.len() as u32);
                self.blocks.push(Block {
                    memory: Some(memory),
                    in_use: true,
                });
                handle
            }
        };
        debug!(
            chunk = handle.0,
            allocated = self.stats().allocated,
            "chunk pool allocated a new block"
        );
        handle
    }

    fn allocate_block() -> NonNull<u8> {
        // Safety: CHUNK_LAYOUT has a non-zero size.
        let raw = unsafe { alloc::alloc(CHUNK_LAYOUT) };
        let Some(memory) = NonNull::new(raw) else {
            alloc::handle_alloc_error(CHUNK_LAYOUT);
        };
        // Safety: fresh allocation, aligned for ChunkHeader.
        unsafe { ptr::write(memory.as_ptr() as *mut ChunkHeader, ChunkHeader::default()) };
        memory
    }

    /// Return a chunk to the free list. The payload is not dropped; the
    /// caller must have destroyed every value stored in it.
    ///
    /// # Panics
    ///
    /// Panics if the chunk is not currently acquired.
    pub fn release(&mut self, handle: ChunkHandle) {
        let block = &mut self.blocks[handle.0 as usize];
        assert!(block.in_use, "chunk {} released twice", handle.0);
        block.in_use = false;
        self.free.push(handle);
    }

    #[inline]
    fn memory(&self, handle: ChunkHandle) -> NonNull<u8> {
        let block = &self.blocks[handle.0 as usize];
        debug_assert!(block.in_use, "access to released chunk {}", handle.0);
        match block.memory {
            Some(memory) => memory,
            None => panic!("chunk {} has no backing memory", handle.0),
        }
    }

    #[inline]
    pub fn header(&self, handle: ChunkHandle) -> &ChunkHeader {
        // Safety: every backed block starts with an initialized header.
        unsafe { &*(self.memory(handle).as_ptr() as *const ChunkHeader) }
    }

    #[inline]
    pub fn header_mut(&mut self, handle: ChunkHandle) -> &mut ChunkHeader {
        // Safety: as above, and `&mut self` guarantees exclusivity.
        unsafe { &mut *(self.memory(handle).as_ptr() as *mut ChunkHeader) }
    }

    /// Pointer to the start of the chunk's payload.
    ///
    /// Writing through the pointer requires exclusive access to the owning
    /// archetype; the pool does not track column borrows.
    #[inline]
    pub fn payload_ptr(&self, handle: ChunkHandle) -> *mut u8 {
        // Safety: CHUNK_ALIGNMENT < CHUNK_WITH_HEADER_SIZE.
        unsafe { self.memory(handle).as_ptr().add(CHUNK_ALIGNMENT) }
    }

    pub fn stats(&self) -> PoolStats {
        let allocated = self.blocks.iter().filter(|b| b.memory.is_some()).count();
        let in_use = self.blocks.iter().filter(|b| b.in_use).count();
        PoolStats {
            allocated,
            in_use,
            free: self.free.len(),
        }
    }

    /// Give free-listed blocks back to the allocator until at most
    /// `max_free` remain. Returns the number of blocks freed.
    pub fn shrink_to(&mut self, max_free: usize) -> usize {
        let mut freed = 0;
        while self.free.len() > max_free {
            let Some(handle) = self.free.pop() else { break };
            let block = &mut self.blocks[handle.0 as usize];
            if let Some(memory) = block.memory.take() {
                // Safety: allocated with CHUNK_LAYOUT and not in use.
                unsafe { alloc::dealloc(memory.as_ptr(), CHUNK_LAYOUT) };
                freed += 1;
            }
            self.vacant.push(handle);
        }
        if freed > 0 {
            debug!(freed, remaining_free = self.free.len(), "chunk pool shrunk");
        }
        freed
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        for block in &mut self.blocks {
            if let Some(memory) = block.memory.take() {
                // Safety: allocated with CHUNK_LAYOUT. Values stored in chunks
                // still in use were destroyed by their archetypes beforehand.
                unsafe { alloc::dealloc(memory.as_ptr(), CHUNK_LAYOUT) };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
