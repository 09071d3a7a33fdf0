//! Sharded storage for backend resource records.
//!
//! Records live in fixed-size blocks of individually rw-locked slots, so
//! frequent readers (the compiler) do not contend with each other, and
//! writers (creation, destruction) only lock the slot they touch. The block
//! list only ever grows; blocks are boxed so slot addresses stay stable.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tachyon_gpu::error::{Error, Result};
use tachyon_gpu::handle::Handle;

const INDEX_BITS: u32 = 8;
/// Resources per block.
pub const BLOCK_SIZE: usize = 1 << INDEX_BITS;

struct Block<T> {
    slots: Vec<RwLock<T>>,
}

pub struct ResourcePool<T> {
    name: &'static str,
    blocks: Mutex<Vec<Box<Block<T>>>>,
}

/// Read guard over one resource record. Blocks writers, not other readers.
pub struct ResourceRead<'a, T>(RwLockReadGuard<'a, T>);

impl<'a, T> Deref for ResourceRead<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

/// Exclusive guard over one resource record.
pub struct ResourceWrite<'a, T>(RwLockWriteGuard<'a, T>);

impl<'a, T> Deref for ResourceWrite<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<'a, T> DerefMut for ResourceWrite<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: Default> ResourcePool<T> {
    pub fn new(name: &'static str) -> ResourcePool<T> {
        log::debug!("ResourcePool<{}>: record size {}", name, std::mem::size_of::<T>());
        ResourcePool {
            name,
            blocks: Mutex::new(Vec::new()),
        }
    }

    fn slot(&self, index: u32) -> Option<&RwLock<T>> {
        let blocks = self.blocks.lock().unwrap();
        let block_idx = (index >> INDEX_BITS) as usize;
        let slot_idx = index as usize & (BLOCK_SIZE - 1);
        let block = blocks.get(block_idx)?;
        let ptr: *const RwLock<T> = &block.slots[slot_idx];
        // The block list is append-only and blocks are boxed, so the slot
        // address outlives the short block-list lock and stays valid for the
        // pool's lifetime.
        Some(unsafe { &*ptr })
    }

    fn slot_grow(&self, index: u32) -> &RwLock<T> {
        {
            let mut blocks = self.blocks.lock().unwrap();
            let block_idx = (index >> INDEX_BITS) as usize;
            while block_idx >= blocks.len() {
                let slots = (0..BLOCK_SIZE).map(|_| RwLock::new(T::default())).collect();
                blocks.push(Box::new(Block { slots }));
            }
        }
        self.slot(index).unwrap()
    }

    /// Shared access to the record behind `handle`. Fails if the slot was
    /// never written.
    pub fn read(&self, handle: Handle) -> Result<ResourceRead<'_, T>> {
        let slot = self.slot(handle.index()).ok_or_else(|| {
            log::warn!("{}: read of unknown slot {:?}", self.name, handle);
            Error::InvalidArgument
        })?;
        Ok(ResourceRead(slot.read().unwrap()))
    }

    /// Exclusive access to the record behind `handle`, growing the pool to
    /// cover the slot if needed.
    pub fn write(&self, handle: Handle) -> ResourceWrite<'_, T> {
        let slot = self.slot_grow(handle.index());
        ResourceWrite(slot.write().unwrap())
    }

    /// Slots currently backed by storage.
    pub fn capacity(&self) -> usize {
        self.blocks.lock().unwrap().len() * BLOCK_SIZE
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tachyon_gpu::handle::{HandleAllocator, ResourceKind};

    #[test]
    fn write_then_read() {
        let handles = HandleAllocator::new();
        let pool: ResourcePool<u32> = ResourcePool::new("test");
        let h = handles.alloc(ResourceKind::Buffer).unwrap();

        *pool.write(h) = 42;
        assert_eq!(*pool.read(h).unwrap(), 42);
    }

    #[test]
    fn read_of_untouched_slot_fails() {
        let handles = HandleAllocator::new();
        let pool: ResourcePool<u32> = ResourcePool::new("test");
        let h = handles.alloc(ResourceKind::Buffer).unwrap();
        assert!(pool.read(h).is_err());
    }

    #[test]
    fn grows_in_blocks_with_stable_records() {
        let handles = HandleAllocator::new();
        let pool: ResourcePool<usize> = ResourcePool::new("test");

        let all: Vec<_> = (0..BLOCK_SIZE * 2 + 3)
            .map(|i| {
                let h = handles.alloc(ResourceKind::Texture).unwrap();
                *pool.write(h) = i;
                (h, i)
            })
            .collect();
        assert!(pool.capacity() >= BLOCK_SIZE * 2 + 3);
        for (h, i) in all {
            assert_eq!(*pool.read(h).unwrap(), i);
        }
    }

    #[test]
    fn concurrent_readers() {
        use std::sync::Arc;
        let handles = HandleAllocator::new();
        let pool: Arc<ResourcePool<u64>> = Arc::new(ResourcePool::new("test"));
        let h = handles.alloc(ResourceKind::Buffer).unwrap();
        *pool.write(h) = 7;

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(*pool.read(h).unwrap(), 7);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
    }
}
