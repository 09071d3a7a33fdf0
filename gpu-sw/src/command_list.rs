//! Native command list for the software device.
//!
//! The compiler appends [`NativeOp`]s; submission hands the closed op buffer
//! to the executor thread, which plays it against CPU-side storage. Op
//! buffers rotate across `MAX_GPU_FRAMES` allocators so a buffer is only
//! recycled once the frame that used it has retired.

use crate::resources::{Storage, TrackKey};
use crate::upload::UploadBlock;
use std::sync::Arc;
use tachyon_gpu::error::{Error, Result};
use tachyon_gpu::handle::Handle;
use tachyon_gpu::types::{
    CommandQueueType, ResourceState, ScissorRect, Viewport, MAX_GPU_FRAMES,
};

/// Subresources covered by a barrier: a contiguous span, or all of them.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BarrierSubresources {
    All,
    Range { first: u32, num: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum BarrierOp {
    Transition {
        resource: TrackKey,
        subresources: BarrierSubresources,
        before: ResourceState,
        after: ResourceState,
    },
    /// Ordering barrier between two unordered-access uses of `resource`.
    Uav { resource: TrackKey },
}

/// One byte-range copy, resolved to concrete offsets at compile time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RowCopy {
    pub dst_offset: usize,
    pub src_offset: usize,
    pub len: usize,
}

#[derive(Clone)]
pub enum CopySource {
    Buffer(Storage),
    Upload(Arc<UploadBlock>),
}

/// Commands as the software device executes them.
#[derive(Clone)]
pub enum NativeOp {
    Barriers(Vec<BarrierOp>),
    BindPipeline {
        pipeline: Handle,
    },
    BindFrame {
        frame_binding: Handle,
        num_rtvs: u32,
        has_dsv: bool,
    },
    BindVertexBuffers {
        num: u32,
    },
    BindIndexBuffer,
    SetDrawState {
        viewport: Viewport,
        scissor_rect: ScissorRect,
        stencil_ref: u8,
    },
    Draw {
        indexed: bool,
        num_vertices: u32,
        num_instances: u32,
    },
    DrawIndirect {
        max_commands: u32,
    },
    Dispatch {
        x_groups: u32,
        y_groups: u32,
        z_groups: u32,
    },
    DispatchIndirect {
        max_commands: u32,
    },
    /// Fill byte ranges of `dst` with a repeating pattern (clears).
    Fill {
        dst: Storage,
        ranges: Vec<(usize, usize)>,
        pattern: Vec<u8>,
    },
    /// Copy resolved byte rows into `dst` (buffer copies, texture copies and
    /// staged updates).
    CopyRows {
        dst: Storage,
        src: CopySource,
        rows: Vec<RowCopy>,
    },
    BeginEvent {
        meta_data: u32,
        text: String,
    },
    EndEvent,
}

impl NativeOp {
    pub fn execute(&self) {
        match self {
            NativeOp::Barriers(_) => {}
            NativeOp::BindPipeline { .. }
            | NativeOp::BindFrame { .. }
            | NativeOp::BindVertexBuffers { .. }
            | NativeOp::BindIndexBuffer
            | NativeOp::SetDrawState { .. } => {}
            NativeOp::Draw {
                indexed,
                num_vertices,
                num_instances,
            } => {
                // Rasterisation is out of scope for the software device; the
                // draw is validated, ordered and logged.
                log::trace!(
                    "draw(indexed: {}, vertices: {}, instances: {})",
                    indexed,
                    num_vertices,
                    num_instances
                );
            }
            NativeOp::DrawIndirect { max_commands } => {
                log::trace!("draw_indirect(max_commands: {})", max_commands);
            }
            NativeOp::Dispatch {
                x_groups,
                y_groups,
                z_groups,
            } => {
                log::trace!("dispatch({}, {}, {})", x_groups, y_groups, z_groups);
            }
            NativeOp::DispatchIndirect { max_commands } => {
                log::trace!("dispatch_indirect(max_commands: {})", max_commands);
            }
            NativeOp::Fill {
                dst,
                ranges,
                pattern,
            } => {
                let mut dst = dst.lock().unwrap();
                for &(offset, len) in ranges {
                    for (i, byte) in dst[offset..offset + len].iter_mut().enumerate() {
                        *byte = pattern[i % pattern.len()];
                    }
                }
            }
            NativeOp::CopyRows { dst, src, rows } => match src {
                CopySource::Buffer(src) => {
                    // Recording rejects dst == src, so the locks are distinct.
                    let src = src.lock().unwrap();
                    let mut dst = dst.lock().unwrap();
                    for row in rows {
                        let (dst_row, src_row) = (
                            &mut dst[row.dst_offset..row.dst_offset + row.len],
                            &src[row.src_offset..row.src_offset + row.len],
                        );
                        dst_row.copy_from_slice(src_row);
                    }
                }
                CopySource::Upload(block) => {
                    let mut dst = dst.lock().unwrap();
                    for row in rows {
                        dst[row.dst_offset..row.dst_offset + row.len]
                            .copy_from_slice(block.read(row.src_offset as u64, row.len));
                    }
                }
            },
            NativeOp::BeginEvent { meta_data, text } => {
                log::trace!("begin event [{}] {}", meta_data, text);
            }
            NativeOp::EndEvent => {}
        }
    }
}

//--------------------------------------------------------------------------------------------------

/// Lifecycle of a compiled list. Submission may only advance
/// `Closed -> Submitted`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ListState {
    Idle,
    Open,
    Recorded,
    Closed,
    Submitted,
}

#[derive(Default)]
pub struct SwCommandList {
    pub debug_name: String,
    state: Option<ListState>,
    /// Queue class the recorded commands require.
    queue_type: CommandQueueType,
    /// Rotated op buffers; `Arc` strong count tells whether the executor is
    /// still holding a buffer when its turn comes round again.
    allocators: [Option<Arc<Vec<NativeOp>>>; MAX_GPU_FRAMES as usize],
    /// Allocator the list is currently recorded on.
    current: usize,
    building: Vec<NativeOp>,
}

impl SwCommandList {
    pub fn new(debug_name: &str) -> SwCommandList {
        SwCommandList {
            debug_name: debug_name.to_string(),
            state: Some(ListState::Idle),
            queue_type: CommandQueueType::empty(),
            allocators: Default::default(),
            current: 0,
            building: Vec::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> ListState {
        self.state.unwrap_or(ListState::Idle)
    }

    pub fn queue_type(&self) -> CommandQueueType {
        self.queue_type
    }

    /// Opens the list for re-recording on the allocator for `frame_idx`. The
    /// allocator's buffer is recycled if the GPU has let go of it.
    pub fn open(&mut self, frame_idx: u64) -> Result<()> {
        if !self.is_live() || self.state() == ListState::Open {
            return Err(Error::InvalidState);
        }
        self.current = (frame_idx % MAX_GPU_FRAMES) as usize;
        let slot = &mut self.allocators[self.current];
        self.building = match slot.take().map(Arc::try_unwrap) {
            Some(Ok(mut ops)) => {
                ops.clear();
                ops
            }
            // Still referenced by an in-flight submission; start fresh.
            _ => Vec::new(),
        };
        self.queue_type = CommandQueueType::empty();
        self.state = Some(ListState::Open);
        Ok(())
    }

    pub fn push(&mut self, op: NativeOp) {
        debug_assert_eq!(self.state(), ListState::Open);
        self.building.push(op);
    }

    pub fn mark_recorded(&mut self, queue_type: CommandQueueType) -> Result<()> {
        if self.state() != ListState::Open {
            return Err(Error::InvalidState);
        }
        self.queue_type = queue_type;
        self.state = Some(ListState::Recorded);
        Ok(())
    }

    /// Closes the list. An empty list is closeable with zero barriers.
    pub fn close(&mut self) -> Result<()> {
        match self.state() {
            ListState::Open | ListState::Recorded => {}
            _ => return Err(Error::InvalidState),
        }
        let ops = std::mem::replace(&mut self.building, Vec::new());
        self.allocators[self.current] = Some(Arc::new(ops));
        self.state = Some(ListState::Closed);
        Ok(())
    }

    /// Drops whatever was recorded and leaves the list closeable and empty.
    pub fn abort(&mut self) {
        self.building.clear();
        self.queue_type = CommandQueueType::empty();
        self.state = Some(ListState::Open);
        let _ = self.close();
    }

    /// `Closed -> Submitted`; hands the op buffer to the caller.
    pub fn submit(&mut self) -> Result<Arc<Vec<NativeOp>>> {
        if self.state() != ListState::Closed {
            return Err(Error::InvalidState);
        }
        self.state = Some(ListState::Submitted);
        Ok(Arc::clone(
            self.allocators[self.current]
                .as_ref()
                .expect("closed list without ops"),
        ))
    }

    /// Most recently closed op buffer, for tooling and tests.
    pub fn ops(&self) -> Option<Arc<Vec<NativeOp>>> {
        self.allocators[self.current].clone()
    }

    pub fn release(&mut self) {
        self.state = None;
        self.building.clear();
        self.allocators = Default::default();
        self.queue_type = CommandQueueType::empty();
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine() {
        let mut list = SwCommandList::new("test");
        assert_eq!(list.state(), ListState::Idle);
        // Submitting anything but a closed list fails.
        assert!(list.submit().is_err());

        list.open(0).unwrap();
        assert!(list.open(0).is_err());
        list.push(NativeOp::EndEvent);
        list.mark_recorded(CommandQueueType::GRAPHICS).unwrap();
        list.close().unwrap();
        assert_eq!(list.state(), ListState::Closed);

        let ops = list.submit().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(list.state(), ListState::Submitted);
        assert!(list.submit().is_err());

        // Reopening recycles the allocator once the ops are released.
        drop(ops);
        list.open(0).unwrap();
        list.close().unwrap();
        assert_eq!(list.submit().unwrap().len(), 0);
    }

    #[test]
    fn abort_leaves_list_closeable_and_empty() {
        let mut list = SwCommandList::new("test");
        list.open(0).unwrap();
        list.push(NativeOp::EndEvent);
        list.abort();
        assert_eq!(list.state(), ListState::Closed);
        assert_eq!(list.submit().unwrap().len(), 0);
    }
}
