//! Descriptor heaps and their allocators.
//!
//! Three layers, mirroring how the persistent and per-frame descriptor
//! traffic differs:
//!
//! * [`DescriptorHeapAllocator`] — block pool with free-range lists, used for
//!   persistent binding sets and RTV/DSV views. Grows by whole blocks, never
//!   shrinks.
//! * [`LinearDescriptorAllocator`] — one block, atomic bump offset, reset
//!   once per frame. Backs the per-frame descriptor stream.
//! * [`LinearDescriptorSubAllocator`] — wraps the linear allocator and pads
//!   every request so Tier-1 style hardware always sees a contiguous table
//!   of the expected size.
//!
//! Freshly allocated ranges are sentinel-filled so undisturbed slots are
//! rejected instead of aliasing stale views.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use tachyon_gpu::error::{Error, Result};
use tachyon_gpu::resources::{BindingCbv, BindingDsv, BindingRtv, BindingSrv, BindingUav};
use tachyon_gpu::types::SamplerState;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DescriptorHeapSubType {
    Invalid,
    Cbv,
    Srv,
    Uav,
    Sampler,
    Rtv,
    Dsv,
}

/// One descriptor slot. `Null` is the sentinel an allocator writes into a
/// fresh range; a typed `Null` marks which class the slot is reserved for.
#[derive(Clone, Debug, PartialEq)]
pub enum Descriptor {
    Null(DescriptorHeapSubType),
    Cbv(BindingCbv),
    Srv(BindingSrv),
    Uav(BindingUav),
    Sampler(SamplerState),
    Rtv(BindingRtv),
    Dsv(BindingDsv),
}

impl Descriptor {
    pub fn sub_type(&self) -> DescriptorHeapSubType {
        match self {
            Descriptor::Null(sub_type) => *sub_type,
            Descriptor::Cbv(_) => DescriptorHeapSubType::Cbv,
            Descriptor::Srv(_) => DescriptorHeapSubType::Srv,
            Descriptor::Uav(_) => DescriptorHeapSubType::Uav,
            Descriptor::Sampler(_) => DescriptorHeapSubType::Sampler,
            Descriptor::Rtv(_) => DescriptorHeapSubType::Rtv,
            Descriptor::Dsv(_) => DescriptorHeapSubType::Dsv,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Descriptor::Null(_))
    }
}

/// A descriptor heap: a flat array of descriptor slots.
pub struct DescriptorHeap {
    debug_name: String,
    shader_visible: bool,
    entries: Mutex<Vec<Descriptor>>,
}

impl DescriptorHeap {
    fn new(capacity: u32, shader_visible: bool, debug_name: &str) -> DescriptorHeap {
        DescriptorHeap {
            debug_name: debug_name.to_string(),
            shader_visible,
            entries: Mutex::new(vec![
                Descriptor::Null(DescriptorHeapSubType::Invalid);
                capacity as usize
            ]),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.entries.lock().unwrap().len() as u32
    }

    pub fn shader_visible(&self) -> bool {
        self.shader_visible
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn write(&self, offset: u32, descriptors: &[Descriptor]) {
        let mut entries = self.entries.lock().unwrap();
        let base = offset as usize;
        entries[base..base + descriptors.len()].clone_from_slice(descriptors);
    }

    pub fn read(&self, offset: u32, len: u32) -> Vec<Descriptor> {
        let entries = self.entries.lock().unwrap();
        entries[offset as usize..(offset + len) as usize].to_vec()
    }

    pub fn clear_range(&self, sub_type: DescriptorHeapSubType, offset: u32, len: u32) {
        let mut entries = self.entries.lock().unwrap();
        for entry in &mut entries[offset as usize..(offset + len) as usize] {
            *entry = Descriptor::Null(sub_type);
        }
    }

    /// The software equivalent of the driver's simple descriptor copy.
    pub fn copy_descriptors(
        dst: &DescriptorHeap,
        dst_offset: u32,
        src: &DescriptorHeap,
        src_offset: u32,
        len: u32,
    ) {
        if len == 0 {
            return;
        }
        if std::ptr::eq(dst, src) {
            let mut entries = dst.entries.lock().unwrap();
            let copied: Vec<Descriptor> =
                entries[src_offset as usize..(src_offset + len) as usize].to_vec();
            entries[dst_offset as usize..(dst_offset + len) as usize].clone_from_slice(&copied);
        } else {
            let copied = src.read(src_offset, len);
            dst.write(dst_offset, &copied);
        }
    }
}

/// A contiguous range of descriptors inside one heap.
///
/// Invariant: `offset + size <= heap.capacity()`. A default-constructed
/// allocation is the null allocation.
#[derive(Clone, Default)]
pub struct DescriptorAllocation {
    pub heap: Option<Arc<DescriptorHeap>>,
    pub offset: u32,
    pub size: u32,
    /// Block routing for `DescriptorHeapAllocator::free`; zero for linear
    /// allocations, which are reclaimed wholesale on reset.
    pub alloc_id: u32,
}

impl DescriptorAllocation {
    pub fn is_null(&self) -> bool {
        self.heap.is_none()
    }

    pub fn heap(&self) -> &Arc<DescriptorHeap> {
        self.heap.as_ref().expect("null descriptor allocation")
    }

    /// Sub-range view of this allocation.
    pub fn slice(&self, offset: u32, size: u32) -> DescriptorAllocation {
        debug_assert!(offset + size <= self.size);
        DescriptorAllocation {
            heap: self.heap.clone(),
            offset: self.offset + offset,
            size,
            alloc_id: 0,
        }
    }
}

impl std::fmt::Debug for DescriptorAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.heap {
            Some(heap) => write!(
                f,
                "DescriptorAllocation({} +{} x{})",
                heap.debug_name(),
                self.offset,
                self.size
            ),
            None => write!(f, "DescriptorAllocation(null)"),
        }
    }
}

//--------------------------------------------------------------------------------------------------

#[derive(Copy, Clone, Debug)]
struct FreeRange {
    offset: u32,
    size: u32,
}

struct DescriptorBlock {
    heap: Arc<DescriptorHeap>,
    /// Free segments, kept sorted by offset and merged on free.
    free: Vec<FreeRange>,
    num_allocs: u32,
}

impl DescriptorBlock {
    fn alloc(&mut self, size: u32) -> Option<u32> {
        let pos = self.free.iter().position(|r| r.size >= size)?;
        let range = &mut self.free[pos];
        let offset = range.offset;
        range.offset += size;
        range.size -= size;
        if range.size == 0 {
            self.free.remove(pos);
        }
        self.num_allocs += 1;
        Some(offset)
    }

    fn free(&mut self, offset: u32, size: u32) {
        debug_assert!(self.num_allocs > 0);
        self.num_allocs -= 1;
        let pos = self
            .free
            .iter()
            .position(|r| r.offset > offset)
            .unwrap_or(self.free.len());
        self.free.insert(pos, FreeRange { offset, size });
        // Merge with neighbours.
        if pos + 1 < self.free.len()
            && self.free[pos].offset + self.free[pos].size == self.free[pos + 1].offset
        {
            self.free[pos].size += self.free[pos + 1].size;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].offset + self.free[pos - 1].size == self.free[pos].offset {
            self.free[pos - 1].size += self.free[pos].size;
            self.free.remove(pos);
        }
    }
}

/// Block-level descriptor heap pool with free-list allocation.
pub struct DescriptorHeapAllocator {
    debug_name: &'static str,
    shader_visible: bool,
    block_size: u32,
    blocks: Mutex<Vec<DescriptorBlock>>,
    next_serial: AtomicU32,
}

impl DescriptorHeapAllocator {
    pub fn new(
        shader_visible: bool,
        block_size: u32,
        debug_name: &'static str,
    ) -> DescriptorHeapAllocator {
        let allocator = DescriptorHeapAllocator {
            debug_name,
            shader_visible,
            block_size,
            blocks: Mutex::new(Vec::new()),
            next_serial: AtomicU32::new(1),
        };
        allocator.add_block(block_size);
        allocator
    }

    fn add_block(&self, size: u32) {
        let mut blocks = self.blocks.lock().unwrap();
        log::debug!("{}: adding descriptor block of {}", self.debug_name, size);
        blocks.push(DescriptorBlock {
            heap: Arc::new(DescriptorHeap::new(size, self.shader_visible, self.debug_name)),
            free: vec![FreeRange { offset: 0, size }],
            num_allocs: 0,
        });
    }

    /// Allocates `size` descriptors, scanning blocks front to back and
    /// growing by a new block when nothing fits. The returned range is
    /// sentinel-filled.
    pub fn alloc(&self, size: u32) -> Result<DescriptorAllocation> {
        if size == 0 {
            return Ok(DescriptorAllocation::default());
        }
        loop {
            {
                let mut blocks = self.blocks.lock().unwrap();
                for (block_idx, block) in blocks.iter_mut().enumerate() {
                    if let Some(offset) = block.alloc(size) {
                        block
                            .heap
                            .clear_range(DescriptorHeapSubType::Invalid, offset, size);
                        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed) & 0xffff;
                        return Ok(DescriptorAllocation {
                            heap: Some(Arc::clone(&block.heap)),
                            offset,
                            size,
                            alloc_id: ((block_idx as u32) << 16) | serial,
                        });
                    }
                }
            }
            self.add_block(self.block_size.max(size));
        }
    }

    /// Returns a range to its block's free list.
    pub fn free(&self, alloc: DescriptorAllocation) {
        if alloc.is_null() || alloc.size == 0 {
            return;
        }
        let mut blocks = self.blocks.lock().unwrap();
        let block_idx = (alloc.alloc_id >> 16) as usize;
        let block = &mut blocks[block_idx];
        debug_assert!(Arc::ptr_eq(&block.heap, alloc.heap()));
        block.heap.clear_range(DescriptorHeapSubType::Invalid, alloc.offset, alloc.size);
        block.free(alloc.offset, alloc.size);
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}

//--------------------------------------------------------------------------------------------------

/// Per-frame bump allocator over one shader-visible block.
pub struct LinearDescriptorAllocator {
    alloc: DescriptorAllocation,
    offset: AtomicU32,
}

impl LinearDescriptorAllocator {
    pub fn new(allocator: &DescriptorHeapAllocator, block_size: u32) -> Result<LinearDescriptorAllocator> {
        Ok(LinearDescriptorAllocator {
            alloc: allocator.alloc(block_size)?,
            offset: AtomicU32::new(0),
        })
    }

    pub fn alloc(&self, num: u32, sub_type: DescriptorHeapSubType) -> Result<DescriptorAllocation> {
        if num == 0 {
            return Ok(DescriptorAllocation::default());
        }
        let offset = self.offset.fetch_add(num, Ordering::Relaxed);
        if offset + num > self.alloc.size {
            log::error!("per-frame descriptor stream exhausted");
            return Err(Error::OutOfMemory);
        }
        let alloc = self.alloc.slice(offset, num);
        alloc.heap().clear_range(sub_type, alloc.offset, alloc.size);
        Ok(alloc)
    }

    /// Allocates and copies `size` existing descriptors.
    pub fn copy(
        &self,
        src: &DescriptorAllocation,
        size: u32,
        sub_type: DescriptorHeapSubType,
    ) -> Result<DescriptorAllocation> {
        let dst = self.alloc(size, sub_type)?;
        let copy_size = size.min(src.size);
        if copy_size > 0 {
            DescriptorHeap::copy_descriptors(
                dst.heap(),
                dst.offset,
                src.heap(),
                src.offset,
                copy_size,
            );
        }
        Ok(dst)
    }

    /// Sentinel-fills the whole block and rewinds. Callable only once no
    /// in-flight frame still references this stream.
    pub fn reset(&self) {
        if !self.alloc.is_null() {
            self.alloc
                .heap()
                .clear_range(DescriptorHeapSubType::Invalid, self.alloc.offset, self.alloc.size);
        }
        self.offset.store(0, Ordering::Relaxed);
    }
}

//--------------------------------------------------------------------------------------------------

struct SubAllocatorState {
    alloc: DescriptorAllocation,
    offset: u32,
}

/// Sub-allocator handing out padded binding tables from the per-frame
/// descriptor stream.
pub struct LinearDescriptorSubAllocator {
    allocator: Arc<LinearDescriptorAllocator>,
    sub_type: DescriptorHeapSubType,
    block_size: u32,
    state: Mutex<SubAllocatorState>,
}

impl LinearDescriptorSubAllocator {
    pub fn new(
        allocator: Arc<LinearDescriptorAllocator>,
        sub_type: DescriptorHeapSubType,
        block_size: u32,
    ) -> LinearDescriptorSubAllocator {
        LinearDescriptorSubAllocator {
            allocator,
            sub_type,
            block_size,
            state: Mutex::new(SubAllocatorState {
                alloc: DescriptorAllocation::default(),
                offset: 0,
            }),
        }
    }

    /// Allocates `num` descriptors with `padding - num` valid descriptors
    /// immediately after, so the device always sees a full-size table.
    pub fn alloc(&self, num: u32, padding: u32) -> Result<DescriptorAllocation> {
        debug_assert!(num <= padding);
        let mut state = self.state.lock().unwrap();

        let remaining = state.alloc.size.saturating_sub(state.offset);
        if remaining < padding {
            state.alloc = self
                .allocator
                .alloc(self.block_size.max(padding), self.sub_type)?;
            state.offset = 0;
        }

        let alloc = state.alloc.slice(state.offset, padding);
        alloc.heap().clear_range(self.sub_type, alloc.offset, alloc.size);
        state.offset += num;
        Ok(alloc)
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.alloc = DescriptorAllocation::default();
        state.offset = 0;
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_pool_alloc_free() {
        let allocator = DescriptorHeapAllocator::new(false, 64, "test heap");
        let a = allocator.alloc(16).unwrap();
        let b = allocator.alloc(16).unwrap();
        assert_eq!(a.size, 16);
        assert_ne!(a.offset, b.offset);
        assert_eq!(allocator.num_blocks(), 1);

        // Freed ranges coalesce and are reused.
        let a_offset = a.offset;
        allocator.free(a);
        let c = allocator.alloc(16).unwrap();
        assert_eq!(c.offset, a_offset);
        allocator.free(b);
        allocator.free(c);
        let d = allocator.alloc(64).unwrap();
        assert_eq!(d.offset, 0);
    }

    #[test]
    fn block_pool_grows() {
        let allocator = DescriptorHeapAllocator::new(false, 32, "test heap");
        let _a = allocator.alloc(32).unwrap();
        let _b = allocator.alloc(32).unwrap();
        assert_eq!(allocator.num_blocks(), 2);
        // Oversized requests get an oversized block.
        let c = allocator.alloc(100).unwrap();
        assert_eq!(c.size, 100);
    }

    #[test]
    fn fresh_ranges_are_sentinel_filled() {
        let allocator = DescriptorHeapAllocator::new(false, 32, "test heap");
        let a = allocator.alloc(4).unwrap();
        for entry in a.heap().read(a.offset, a.size) {
            assert!(entry.is_null());
        }
    }

    #[test]
    fn linear_bump_and_reset() {
        let heap = DescriptorHeapAllocator::new(true, 128, "stream");
        let linear = LinearDescriptorAllocator::new(&heap, 64).unwrap();

        let a = linear.alloc(8, DescriptorHeapSubType::Srv).unwrap();
        let b = linear.alloc(8, DescriptorHeapSubType::Srv).unwrap();
        assert_eq!(b.offset, a.offset + 8);

        assert!(matches!(
            linear.alloc(64, DescriptorHeapSubType::Srv),
            Err(Error::OutOfMemory)
        ));

        linear.reset();
        let c = linear.alloc(8, DescriptorHeapSubType::Srv).unwrap();
        assert_eq!(c.offset, a.offset);
    }

    #[test]
    fn linear_copy_copies_entries() {
        let heap = DescriptorHeapAllocator::new(true, 128, "stream");
        let linear = LinearDescriptorAllocator::new(&heap, 64).unwrap();

        let src = linear.alloc(2, DescriptorHeapSubType::Sampler).unwrap();
        src.heap().write(
            src.offset,
            &[
                Descriptor::Sampler(SamplerState::default()),
                Descriptor::Sampler(SamplerState::default()),
            ],
        );
        let dst = linear.copy(&src, 2, DescriptorHeapSubType::Sampler).unwrap();
        assert_eq!(
            dst.heap().read(dst.offset, 2),
            src.heap().read(src.offset, 2)
        );
    }

    #[test]
    fn sub_allocator_pads_requests() {
        let heap = DescriptorHeapAllocator::new(true, 256, "stream");
        let linear = Arc::new(LinearDescriptorAllocator::new(&heap, 256).unwrap());
        let sub = LinearDescriptorSubAllocator::new(linear, DescriptorHeapSubType::Srv, 64);

        // Each request sees a full `padding`-sized window but only consumes
        // `num` slots.
        let a = sub.alloc(2, 32).unwrap();
        assert_eq!(a.size, 32);
        let b = sub.alloc(2, 32).unwrap();
        assert_eq!(b.offset, a.offset + 2);
    }

    #[test]
    fn sub_allocator_grabs_new_block_when_short() {
        let heap = DescriptorHeapAllocator::new(true, 1024, "stream");
        let linear = Arc::new(LinearDescriptorAllocator::new(&heap, 1024).unwrap());
        let sub = LinearDescriptorSubAllocator::new(linear, DescriptorHeapSubType::Srv, 40);

        let a = sub.alloc(32, 32).unwrap();
        // 8 slots remain in the sub-block; padding of 32 doesn't fit.
        let b = sub.alloc(4, 32).unwrap();
        assert!(b.offset >= a.offset + 32);
    }
}
