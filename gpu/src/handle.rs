//! Generation-safe resource handles and their allocator.
//!
//! A handle identifies one slot of one resource kind. Slots are reused, but
//! the generation is bumped on free, so stale handles never validate again.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::Mutex;

/// Everything a handle can refer to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum ResourceKind {
    SwapChain,
    Buffer,
    Texture,
    SamplerState,
    Shader,
    GraphicsPipelineState,
    ComputePipelineState,
    PipelineBindingSet,
    DrawBindingSet,
    FrameBindingSet,
    CommandList,
    Fence,
}

pub const NUM_RESOURCE_KINDS: usize = ResourceKind::Fence as usize + 1;

impl ResourceKind {
    pub fn all() -> impl Iterator<Item = ResourceKind> {
        (0..NUM_RESOURCE_KINDS as u16).map(|v| unsafe { std::mem::transmute::<u16, ResourceKind>(v) })
    }
}

const INDEX_BITS: u32 = 20;
const GENERATION_BITS: u32 = 12;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;

pub const MAX_HANDLE_INDEX: u32 = (1 << INDEX_BITS) - 1;

/// Packed `{kind, index, generation}` identity of a resource slot.
///
/// Copyable value; the null handle has generation zero and validates false
/// everywhere.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub(crate) fn new(kind: ResourceKind, index: u32, generation: u16) -> Handle {
        debug_assert!(index as u64 <= INDEX_MASK);
        debug_assert!(generation as u64 <= GENERATION_MASK);
        debug_assert!(generation != 0);
        Handle(
            (index as u64)
                | ((generation as u64) << INDEX_BITS)
                | ((kind as u64) << (INDEX_BITS + GENERATION_BITS)),
        )
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    pub fn generation(self) -> u16 {
        ((self.0 >> INDEX_BITS) & GENERATION_MASK) as u16
    }

    pub fn kind(self) -> Option<ResourceKind> {
        if self.is_null() {
            return None;
        }
        let raw = (self.0 >> (INDEX_BITS + GENERATION_BITS)) as u16;
        if (raw as usize) < NUM_RESOURCE_KINDS {
            Some(unsafe { std::mem::transmute::<u16, ResourceKind>(raw) })
        } else {
            None
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(
                f,
                "Handle({:?}:{}#{})",
                self.kind(),
                self.index(),
                self.generation()
            )
        }
    }
}

//--------------------------------------------------------------------------------------------------

struct KindPool {
    /// Current generation per slot. Zero only transiently (wrap skip).
    generations: Vec<u16>,
    free: Vec<u32>,
}

/// Dense, typed handle allocator with per-kind pools.
///
/// Allocation is O(1) amortised; a per-kind free list holds released indices.
/// Concurrent `alloc`/`free` on the same kind are linearised by a short-held
/// mutex.
pub struct HandleAllocator {
    pools: Vec<Mutex<KindPool>>,
}

impl HandleAllocator {
    pub fn new() -> HandleAllocator {
        HandleAllocator {
            pools: (0..NUM_RESOURCE_KINDS)
                .map(|_| {
                    Mutex::new(KindPool {
                        generations: Vec::new(),
                        free: Vec::new(),
                    })
                })
                .collect(),
        }
    }

    pub fn alloc(&self, kind: ResourceKind) -> Result<Handle> {
        let mut pool = self.pools[kind as usize].lock().unwrap();
        if let Some(index) = pool.free.pop() {
            let generation = pool.generations[index as usize];
            return Ok(Handle::new(kind, index, generation));
        }
        let index = pool.generations.len() as u32;
        if index > MAX_HANDLE_INDEX {
            return Err(Error::OutOfMemory);
        }
        pool.generations.push(1);
        Ok(Handle::new(kind, index, 1))
    }

    /// Releases a handle. The slot's generation is bumped immediately, so
    /// every outstanding copy of `handle` stops validating.
    pub fn free(&self, handle: Handle) -> Result<()> {
        let kind = handle.kind().ok_or(Error::InvalidArgument)?;
        let mut pool = self.pools[kind as usize].lock().unwrap();
        let slot = pool
            .generations
            .get_mut(handle.index() as usize)
            .ok_or(Error::InvalidArgument)?;
        if *slot != handle.generation() {
            return Err(Error::InvalidArgument);
        }
        // Bump and skip zero on wrap; zero marks the null handle.
        let mut next = (*slot + 1) & GENERATION_MASK as u16;
        if next == 0 {
            next = 1;
        }
        *slot = next;
        let index = handle.index();
        pool.free.push(index);
        Ok(())
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        let kind = match handle.kind() {
            Some(kind) => kind,
            None => return false,
        };
        let pool = self.pools[kind as usize].lock().unwrap();
        match pool.generations.get(handle.index() as usize) {
            Some(&generation) => {
                generation == handle.generation() && !pool.free.contains(&handle.index())
            }
            None => false,
        }
    }

    /// True if `handle` is valid and of kind `kind`.
    pub fn is_valid_kind(&self, handle: Handle, kind: ResourceKind) -> bool {
        handle.kind() == Some(kind) && self.is_valid(handle)
    }

    /// Number of slots ever allocated for `kind` (live + free-listed).
    pub fn num_slots(&self, kind: ResourceKind) -> usize {
        self.pools[kind as usize].lock().unwrap().generations.len()
    }
}

impl Default for HandleAllocator {
    fn default() -> HandleAllocator {
        HandleAllocator::new()
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn alloc_free_reuse() {
        let allocator = HandleAllocator::new();
        let a = allocator.alloc(ResourceKind::Buffer).unwrap();
        assert!(allocator.is_valid(a));
        assert_eq!(a.kind(), Some(ResourceKind::Buffer));

        allocator.free(a).unwrap();
        assert!(!allocator.is_valid(a));

        // Index is reused, generation differs.
        let b = allocator.alloc(ResourceKind::Buffer).unwrap();
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
        assert!(allocator.is_valid(b));
        assert!(!allocator.is_valid(a));
    }

    #[test]
    fn kinds_are_independent() {
        let allocator = HandleAllocator::new();
        let buffer = allocator.alloc(ResourceKind::Buffer).unwrap();
        let texture = allocator.alloc(ResourceKind::Texture).unwrap();
        assert_eq!(buffer.index(), texture.index());
        assert!(allocator.is_valid_kind(buffer, ResourceKind::Buffer));
        assert!(!allocator.is_valid_kind(buffer, ResourceKind::Texture));
    }

    #[test]
    fn null_handle_is_invalid() {
        let allocator = HandleAllocator::new();
        assert!(!allocator.is_valid(Handle::default()));
        assert!(allocator.free(Handle::default()).is_err());
    }

    #[test]
    fn double_free_rejected() {
        let allocator = HandleAllocator::new();
        let a = allocator.alloc(ResourceKind::Fence).unwrap();
        allocator.free(a).unwrap();
        assert_eq!(allocator.free(a), Err(Error::InvalidArgument));
    }

    #[test]
    fn concurrent_alloc_free() {
        let allocator = Arc::new(HandleAllocator::new());
        let mut threads = Vec::new();
        for _ in 0..4 {
            let allocator = Arc::clone(&allocator);
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let h = allocator.alloc(ResourceKind::Texture).unwrap();
                    assert!(allocator.is_valid(h));
                    allocator.free(h).unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
    }
}
