//! Software-side command list.
//!
//! Commands are recorded into an append-only arena and compiled by a backend
//! prior to submission to a GPU queue. A single list must be built from a
//! single thread; different lists can be built concurrently.

use crate::error::{Error, Result};
use crate::handle::{Handle, HandleAllocator, ResourceKind};
use crate::resources::TextureSubResourceData;
use crate::types::*;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Range of payload bytes inside the command list's arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataRange {
    pub offset: usize,
    pub len: usize,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ClearUavValue {
    Float([f32; 4]),
    Uint([u32; 4]),
}

/// One recorded command. Payload data lives in the arena and is referenced
/// by `DataRange`; everything else is stored inline.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Indexed or non-indexed draw, decided by the draw binding set.
    Draw {
        pipeline_binding: Handle,
        draw_binding: Handle,
        frame_binding: Handle,
        draw_state: u32,
        topology: PrimitiveTopology,
        index_offset: u32,
        vertex_offset: u32,
        num_vertices: u32,
        first_instance: u32,
        num_instances: u32,
    },
    DrawIndirect {
        pipeline_binding: Handle,
        draw_binding: Handle,
        frame_binding: Handle,
        draw_state: u32,
        topology: PrimitiveTopology,
        indirect_buffer: Handle,
        arg_byte_offset: u64,
        count_buffer: Handle,
        count_byte_offset: u64,
        max_commands: u32,
    },
    Dispatch {
        pipeline_binding: Handle,
        x_groups: u32,
        y_groups: u32,
        z_groups: u32,
    },
    DispatchIndirect {
        pipeline_binding: Handle,
        indirect_buffer: Handle,
        arg_byte_offset: u64,
        count_buffer: Handle,
        count_byte_offset: u64,
        max_commands: u32,
    },
    ClearRtv {
        frame_binding: Handle,
        rtv_idx: u32,
        color: [f32; 4],
    },
    ClearDsv {
        frame_binding: Handle,
        depth: f32,
        stencil: u8,
    },
    ClearUav {
        pipeline_binding: Handle,
        uav_idx: u32,
        value: ClearUavValue,
    },
    UpdateBuffer {
        buffer: Handle,
        offset: u64,
        data: DataRange,
    },
    UpdateTextureSubResource {
        texture: Handle,
        sub_resource_idx: u32,
        row_pitch: u32,
        slice_pitch: u32,
        data: DataRange,
    },
    CopyBuffer {
        dst: Handle,
        dst_offset: u64,
        src: Handle,
        src_offset: u64,
        size: u64,
    },
    CopyTextureSubResource {
        dst: Handle,
        dst_sub_resource_idx: u32,
        dst_point: Point,
        src: Handle,
        src_sub_resource_idx: u32,
        src_box: Box3d,
    },
    BeginEvent {
        meta_data: u32,
        text: DataRange,
    },
    EndEvent,
}

//--------------------------------------------------------------------------------------------------

/// Recorder over an append-only byte arena plus a typed command index.
///
/// The recorder validates handles and argument shapes eagerly and tracks the
/// queue class required by the recorded commands; the class only ever
/// upgrades (copy < compute < graphics).
pub struct CommandList {
    handles: Arc<HandleAllocator>,
    queue_type: CommandQueueType,
    arena: Vec<u8>,
    arena_capacity: usize,
    commands: Vec<Command>,
    draw_states: Vec<DrawState>,
    event_depth: i32,
}

impl CommandList {
    pub fn new(handles: Arc<HandleAllocator>) -> CommandList {
        CommandList::with_capacity(handles, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(handles: Arc<HandleAllocator>, arena_capacity: usize) -> CommandList {
        CommandList {
            handles,
            queue_type: CommandQueueType::empty(),
            arena: Vec::with_capacity(arena_capacity),
            arena_capacity,
            commands: Vec::new(),
            draw_states: Vec::new(),
            event_depth: 0,
        }
    }

    /// Copies `data` into the arena. Valid until `reset` or destruction.
    pub fn push_data(&mut self, data: &[u8]) -> Result<DataRange> {
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if self.arena.len() + data.len() > self.arena_capacity {
            return Err(Error::OutOfMemory);
        }
        let offset = self.arena.len();
        self.arena.extend_from_slice(data);
        Ok(DataRange {
            offset,
            len: data.len(),
        })
    }

    /// Resolves a payload range previously returned by `push_data`.
    pub fn data(&self, range: DataRange) -> &[u8] {
        &self.arena[range.offset..range.offset + range.len]
    }

    pub fn draw_state(&self, idx: u32) -> &DrawState {
        &self.draw_states[idx as usize]
    }

    /// Rewinds the arena and drops the command index. Previously returned
    /// payload ranges become invalid.
    pub fn reset(&mut self) {
        self.queue_type = CommandQueueType::empty();
        self.arena.clear();
        self.commands.clear();
        self.draw_states.clear();
        self.event_depth = 0;
    }

    pub fn queue_type(&self) -> CommandQueueType {
        self.queue_type
    }

    pub fn num_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    pub fn handle_allocator(&self) -> &Arc<HandleAllocator> {
        &self.handles
    }

    /// Outstanding `event` scopes. Zero once recording is balanced.
    pub fn event_depth(&self) -> i32 {
        self.event_depth
    }

    //----------------------------------------------------------------------------------------------
    // Validation helpers.

    fn check(&self, handle: Handle, kind: ResourceKind) -> Result<()> {
        if self.handles.is_valid_kind(handle, kind) {
            Ok(())
        } else {
            Err(Error::InvalidArgument)
        }
    }

    fn check_optional(&self, handle: Handle, kind: ResourceKind) -> Result<()> {
        if handle.is_null() {
            Ok(())
        } else {
            self.check(handle, kind)
        }
    }

    /// Consecutive identical draw states share one entry.
    fn intern_draw_state(&mut self, draw_state: &DrawState) -> u32 {
        if let Some(last) = self.draw_states.last() {
            if last == draw_state {
                return (self.draw_states.len() - 1) as u32;
            }
        }
        self.draw_states.push(*draw_state);
        (self.draw_states.len() - 1) as u32
    }

    fn push_command(&mut self, queue: CommandQueueType, command: Command) {
        self.queue_type |= queue;
        self.commands.push(command);
    }

    //----------------------------------------------------------------------------------------------
    // Draws.

    pub fn draw(
        &mut self,
        pipeline_binding: Handle,
        draw_binding: Handle,
        frame_binding: Handle,
        draw_state: &DrawState,
        topology: PrimitiveTopology,
        index_offset: u32,
        vertex_offset: u32,
        num_vertices: u32,
        first_instance: u32,
        num_instances: u32,
    ) -> Result<()> {
        self.check(pipeline_binding, ResourceKind::PipelineBindingSet)?;
        self.check_optional(draw_binding, ResourceKind::DrawBindingSet)?;
        self.check(frame_binding, ResourceKind::FrameBindingSet)?;
        if num_vertices == 0 || num_instances == 0 {
            return Err(Error::InvalidArgument);
        }
        let draw_state = self.intern_draw_state(draw_state);
        self.push_command(
            CommandQueueType::GRAPHICS,
            Command::Draw {
                pipeline_binding,
                draw_binding,
                frame_binding,
                draw_state,
                topology,
                index_offset,
                vertex_offset,
                num_vertices,
                first_instance,
                num_instances,
            },
        );
        Ok(())
    }

    pub fn draw_indirect(
        &mut self,
        pipeline_binding: Handle,
        draw_binding: Handle,
        frame_binding: Handle,
        draw_state: &DrawState,
        topology: PrimitiveTopology,
        indirect_buffer: Handle,
        arg_byte_offset: u64,
        count_buffer: Handle,
        count_byte_offset: u64,
        max_commands: u32,
    ) -> Result<()> {
        self.check(pipeline_binding, ResourceKind::PipelineBindingSet)?;
        self.check_optional(draw_binding, ResourceKind::DrawBindingSet)?;
        self.check(frame_binding, ResourceKind::FrameBindingSet)?;
        self.check(indirect_buffer, ResourceKind::Buffer)?;
        self.check_optional(count_buffer, ResourceKind::Buffer)?;
        if max_commands == 0 {
            return Err(Error::InvalidArgument);
        }
        let draw_state = self.intern_draw_state(draw_state);
        self.push_command(
            CommandQueueType::GRAPHICS,
            Command::DrawIndirect {
                pipeline_binding,
                draw_binding,
                frame_binding,
                draw_state,
                topology,
                indirect_buffer,
                arg_byte_offset,
                count_buffer,
                count_byte_offset,
                max_commands,
            },
        );
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Dispatches.

    pub fn dispatch(
        &mut self,
        pipeline_binding: Handle,
        x_groups: u32,
        y_groups: u32,
        z_groups: u32,
    ) -> Result<()> {
        self.check(pipeline_binding, ResourceKind::PipelineBindingSet)?;
        if x_groups == 0 || y_groups == 0 || z_groups == 0 {
            return Err(Error::InvalidArgument);
        }
        self.push_command(
            CommandQueueType::COMPUTE,
            Command::Dispatch {
                pipeline_binding,
                x_groups,
                y_groups,
                z_groups,
            },
        );
        Ok(())
    }

    pub fn dispatch_indirect(
        &mut self,
        pipeline_binding: Handle,
        indirect_buffer: Handle,
        arg_byte_offset: u64,
        count_buffer: Handle,
        count_byte_offset: u64,
        max_commands: u32,
    ) -> Result<()> {
        self.check(pipeline_binding, ResourceKind::PipelineBindingSet)?;
        self.check(indirect_buffer, ResourceKind::Buffer)?;
        self.check_optional(count_buffer, ResourceKind::Buffer)?;
        if max_commands == 0 {
            return Err(Error::InvalidArgument);
        }
        self.push_command(
            CommandQueueType::COMPUTE,
            Command::DispatchIndirect {
                pipeline_binding,
                indirect_buffer,
                arg_byte_offset,
                count_buffer,
                count_byte_offset,
                max_commands,
            },
        );
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Clears.

    pub fn clear_rtv(&mut self, frame_binding: Handle, rtv_idx: u32, color: [f32; 4]) -> Result<()> {
        self.check(frame_binding, ResourceKind::FrameBindingSet)?;
        if rtv_idx as usize >= MAX_BOUND_RTVS {
            return Err(Error::InvalidArgument);
        }
        self.push_command(
            CommandQueueType::GRAPHICS,
            Command::ClearRtv {
                frame_binding,
                rtv_idx,
                color,
            },
        );
        Ok(())
    }

    pub fn clear_dsv(&mut self, frame_binding: Handle, depth: f32, stencil: u8) -> Result<()> {
        self.check(frame_binding, ResourceKind::FrameBindingSet)?;
        self.push_command(
            CommandQueueType::GRAPHICS,
            Command::ClearDsv {
                frame_binding,
                depth,
                stencil,
            },
        );
        Ok(())
    }

    pub fn clear_uav_f32(
        &mut self,
        pipeline_binding: Handle,
        uav_idx: u32,
        values: [f32; 4],
    ) -> Result<()> {
        self.clear_uav(pipeline_binding, uav_idx, ClearUavValue::Float(values))
    }

    pub fn clear_uav_u32(
        &mut self,
        pipeline_binding: Handle,
        uav_idx: u32,
        values: [u32; 4],
    ) -> Result<()> {
        self.clear_uav(pipeline_binding, uav_idx, ClearUavValue::Uint(values))
    }

    fn clear_uav(
        &mut self,
        pipeline_binding: Handle,
        uav_idx: u32,
        value: ClearUavValue,
    ) -> Result<()> {
        self.check(pipeline_binding, ResourceKind::PipelineBindingSet)?;
        if uav_idx as usize >= MAX_UAV_BINDINGS {
            return Err(Error::InvalidArgument);
        }
        self.push_command(
            CommandQueueType::GRAPHICS,
            Command::ClearUav {
                pipeline_binding,
                uav_idx,
                value,
            },
        );
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Updates. The payload is inlined into the arena.

    pub fn update_buffer(&mut self, buffer: Handle, offset: u64, data: &[u8]) -> Result<()> {
        self.check(buffer, ResourceKind::Buffer)?;
        let data = self.push_data(data)?;
        self.push_command(
            CommandQueueType::COPY,
            Command::UpdateBuffer {
                buffer,
                offset,
                data,
            },
        );
        Ok(())
    }

    pub fn update_texture_sub_resource(
        &mut self,
        texture: Handle,
        sub_resource_idx: u32,
        data: &TextureSubResourceData,
    ) -> Result<()> {
        self.check(texture, ResourceKind::Texture)?;
        if data.row_pitch == 0 {
            return Err(Error::InvalidArgument);
        }
        let payload = self.push_data(data.data)?;
        self.push_command(
            CommandQueueType::COPY,
            Command::UpdateTextureSubResource {
                texture,
                sub_resource_idx,
                row_pitch: data.row_pitch,
                slice_pitch: data.slice_pitch,
                data: payload,
            },
        );
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Transfers.

    pub fn copy_buffer(
        &mut self,
        dst: Handle,
        dst_offset: u64,
        src: Handle,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.check(dst, ResourceKind::Buffer)?;
        self.check(src, ResourceKind::Buffer)?;
        if size == 0 || dst == src {
            return Err(Error::InvalidArgument);
        }
        self.push_command(
            CommandQueueType::COPY,
            Command::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            },
        );
        Ok(())
    }

    pub fn copy_texture_sub_resource(
        &mut self,
        dst: Handle,
        dst_sub_resource_idx: u32,
        dst_point: Point,
        src: Handle,
        src_sub_resource_idx: u32,
        src_box: Box3d,
    ) -> Result<()> {
        self.check(dst, ResourceKind::Texture)?;
        self.check(src, ResourceKind::Texture)?;
        if dst == src && dst_sub_resource_idx == src_sub_resource_idx {
            return Err(Error::InvalidArgument);
        }
        if src_box.w <= 0 || src_box.h <= 0 || src_box.d <= 0 {
            return Err(Error::InvalidArgument);
        }
        self.push_command(
            CommandQueueType::COPY,
            Command::CopyTextureSubResource {
                dst,
                dst_sub_resource_idx,
                dst_point,
                src,
                src_sub_resource_idx,
                src_box,
            },
        );
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Debug events.

    /// Pushes a text event and returns a scope that records the matching end
    /// event when dropped. Record through the scope.
    pub fn event(&mut self, meta_data: u32, text: &str) -> Result<ScopedEvent<'_>> {
        if text.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let text = self.push_data(text.as_bytes())?;
        // Events don't constrain the queue class.
        self.commands.push(Command::BeginEvent { meta_data, text });
        self.event_depth += 1;
        Ok(ScopedEvent { list: self })
    }

    fn end_event(&mut self) {
        debug_assert!(self.event_depth > 0);
        self.commands.push(Command::EndEvent);
        self.event_depth -= 1;
    }
}

/// RAII guard for a debug event scope. Derefs to the command list so
/// recording continues through it.
pub struct ScopedEvent<'a> {
    list: &'a mut CommandList,
}

impl<'a> Deref for ScopedEvent<'a> {
    type Target = CommandList;
    fn deref(&self) -> &CommandList {
        self.list
    }
}

impl<'a> DerefMut for ScopedEvent<'a> {
    fn deref_mut(&mut self) -> &mut CommandList {
        self.list
    }
}

impl<'a> Drop for ScopedEvent<'a> {
    fn drop(&mut self) {
        self.list.end_event();
    }
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleAllocator;

    fn handles() -> Arc<HandleAllocator> {
        Arc::new(HandleAllocator::new())
    }

    #[test]
    fn arena_is_bounded() {
        let mut list = CommandList::with_capacity(handles(), 8 * 4);
        for _ in 0..4 {
            assert!(list.push_data(&[0u8; 8]).is_ok());
        }
        assert_eq!(list.push_data(&[0u8; 8]), Err(Error::OutOfMemory));

        list.reset();
        assert!(list.push_data(&[0u8; 8]).is_ok());
    }

    #[test]
    fn records_every_command_kind() {
        let handles = handles();
        let buffer0 = handles.alloc(ResourceKind::Buffer).unwrap();
        let buffer1 = handles.alloc(ResourceKind::Buffer).unwrap();
        let texture0 = handles.alloc(ResourceKind::Texture).unwrap();
        let texture1 = handles.alloc(ResourceKind::Texture).unwrap();
        let pbs = handles.alloc(ResourceKind::PipelineBindingSet).unwrap();
        let dbs = handles.alloc(ResourceKind::DrawBindingSet).unwrap();
        let fbs = handles.alloc(ResourceKind::FrameBindingSet).unwrap();

        let mut list = CommandList::new(Arc::clone(&handles));
        let ds = DrawState::default();
        let topo = PrimitiveTopology::TriangleList;

        list.draw(pbs, dbs, fbs, &ds, topo, 0, 0, 3, 0, 1).unwrap();
        list.draw_indirect(pbs, dbs, fbs, &ds, topo, buffer0, 0, Handle::default(), 0, 1)
            .unwrap();
        list.dispatch(pbs, 1, 1, 1).unwrap();
        list.dispatch_indirect(pbs, buffer0, 0, Handle::default(), 0, 1)
            .unwrap();
        list.clear_rtv(fbs, 0, [0.0; 4]).unwrap();
        list.clear_dsv(fbs, 0.0, 0).unwrap();
        list.clear_uav_f32(pbs, 0, [0.0; 4]).unwrap();
        list.clear_uav_u32(pbs, 0, [0; 4]).unwrap();
        list.update_buffer(buffer0, 0, &[0u8; 16]).unwrap();
        list.update_texture_sub_resource(
            texture0,
            0,
            &TextureSubResourceData {
                data: &[0u8; 16],
                row_pitch: 4,
                slice_pitch: 16,
            },
        )
        .unwrap();
        list.copy_buffer(buffer1, 0, buffer0, 0, 16).unwrap();
        list.copy_texture_sub_resource(
            texture1,
            0,
            Point::default(),
            texture0,
            0,
            Box3d {
                w: 1,
                h: 1,
                d: 1,
                ..Box3d::default()
            },
        )
        .unwrap();
        // Same texture is fine across different subresources.
        list.copy_texture_sub_resource(
            texture0,
            1,
            Point::default(),
            texture0,
            0,
            Box3d {
                w: 1,
                h: 1,
                d: 1,
                ..Box3d::default()
            },
        )
        .unwrap();

        assert_eq!(list.num_commands(), 13);
        assert_eq!(
            list.queue_type(),
            CommandQueueType::COPY | CommandQueueType::COMPUTE | CommandQueueType::GRAPHICS
        );
    }

    #[test]
    fn invalid_handles_do_not_append() {
        let handles = handles();
        let buffer = handles.alloc(ResourceKind::Buffer).unwrap();
        let stale = handles.alloc(ResourceKind::Buffer).unwrap();
        handles.free(stale).unwrap();

        let mut list = CommandList::new(Arc::clone(&handles));
        assert_eq!(
            list.update_buffer(stale, 0, &[0u8; 4]),
            Err(Error::InvalidArgument)
        );
        // Kind mismatch.
        assert_eq!(
            list.update_texture_sub_resource(
                buffer,
                0,
                &TextureSubResourceData {
                    data: &[0u8; 4],
                    row_pitch: 4,
                    slice_pitch: 4,
                },
            ),
            Err(Error::InvalidArgument)
        );
        assert_eq!(list.num_commands(), 0);
        assert_eq!(list.queue_type(), CommandQueueType::empty());
    }

    #[test]
    fn copy_onto_itself_rejected() {
        let handles = handles();
        let buffer = handles.alloc(ResourceKind::Buffer).unwrap();
        let texture = handles.alloc(ResourceKind::Texture).unwrap();

        let mut list = CommandList::new(Arc::clone(&handles));
        assert_eq!(
            list.copy_buffer(buffer, 0, buffer, 0, 16),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            list.copy_texture_sub_resource(
                texture,
                0,
                Point::default(),
                texture,
                0,
                Box3d {
                    w: 1,
                    h: 1,
                    d: 1,
                    ..Box3d::default()
                },
            ),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn queue_class_upgrades_monotonically() {
        let handles = handles();
        let buffer0 = handles.alloc(ResourceKind::Buffer).unwrap();
        let buffer1 = handles.alloc(ResourceKind::Buffer).unwrap();
        let pbs = handles.alloc(ResourceKind::PipelineBindingSet).unwrap();

        let mut list = CommandList::new(Arc::clone(&handles));
        list.copy_buffer(buffer1, 0, buffer0, 0, 4).unwrap();
        assert_eq!(list.queue_type(), CommandQueueType::COPY);
        assert!(CommandQueueType::COPY.can_execute(list.queue_type()));

        list.dispatch(pbs, 1, 1, 1).unwrap();
        assert!(!CommandQueueType::COPY.can_execute(list.queue_type()));
        assert!(CommandQueueType::COMPUTE.can_execute(list.queue_type()));
        assert!(CommandQueueType::GRAPHICS.can_execute(list.queue_type()));
    }

    #[test]
    fn scoped_events_balance() {
        let handles = handles();
        let buffer0 = handles.alloc(ResourceKind::Buffer).unwrap();
        let buffer1 = handles.alloc(ResourceKind::Buffer).unwrap();

        let mut list = CommandList::new(Arc::clone(&handles));
        {
            let mut ev = list.event(0, "transfer pass").unwrap();
            ev.copy_buffer(buffer1, 0, buffer0, 0, 4).unwrap();
            assert_eq!(ev.event_depth(), 1);
        }
        assert_eq!(list.event_depth(), 0);
        assert_eq!(list.num_commands(), 3);
        assert!(matches!(list.iter().last(), Some(Command::EndEvent)));
    }

    #[test]
    fn consecutive_draw_states_share_storage() {
        let handles = handles();
        let pbs = handles.alloc(ResourceKind::PipelineBindingSet).unwrap();
        let fbs = handles.alloc(ResourceKind::FrameBindingSet).unwrap();

        let mut list = CommandList::new(Arc::clone(&handles));
        let ds = DrawState::default();
        let topo = PrimitiveTopology::TriangleList;
        list.draw(pbs, Handle::default(), fbs, &ds, topo, 0, 0, 3, 0, 1)
            .unwrap();
        list.draw(pbs, Handle::default(), fbs, &ds, topo, 0, 0, 3, 0, 1)
            .unwrap();
        let mut other = ds;
        other.stencil_ref = 1;
        list.draw(pbs, Handle::default(), fbs, &other, topo, 0, 0, 3, 0, 1)
            .unwrap();

        assert_eq!(list.draw_states.len(), 2);
    }
}
