//! Command-list compiler.
//!
//! Walks a recorded command list in order and appends native ops to the
//! target list. For every resource a command touches, the required state is
//! derived and a pending transition recorded; pending transitions are
//! coalesced into one barrier batch and flushed before the command's op is
//! emitted. A restore pass at end-of-stream returns every touched resource to
//! its default state, so a submitted list always begins and ends with
//! every resource in its resting state.

use crate::backend::SwBackend;
use crate::command_list::{BarrierOp, BarrierSubresources, CopySource, NativeOp, RowCopy};
use crate::resources::*;
use fxhash::FxHashMap;
use smallvec::SmallVec;
use tachyon_gpu::command_list::{ClearUavValue, Command, CommandList};
use tachyon_gpu::error::{Error, Result};
use tachyon_gpu::format::{format_info, Format};
use tachyon_gpu::handle::{Handle, ResourceKind};
use tachyon_gpu::types::*;

/// A touched resource, resolved under a read guard.
#[derive(Clone)]
struct Resolved {
    key: TrackKey,
    storage: Storage,
    states: ResourceStates,
    sub_count: u32,
}

struct PendingTransition {
    subresources: BarrierSubresources,
    before: ResourceState,
    after: ResourceState,
}

pub struct CompileContext<'a> {
    backend: &'a SwBackend,
    commands: &'a CommandList,
    debug_runtime: bool,
    ops: Vec<NativeOp>,
    /// Current state per touched resource. Unknown resources enter at their
    /// default state on first access.
    state_tracker: FxHashMap<TrackKey, ResourceState>,
    /// Default/supported metadata remembered for the restore pass.
    touched: FxHashMap<TrackKey, ResourceStates>,
    pending: FxHashMap<TrackKey, PendingTransition>,
    pending_uav: SmallVec<[TrackKey; 4]>,
    /// Keys in first-touch order so barrier emission is deterministic.
    pending_order: SmallVec<[TrackKey; 8]>,
    /// Consecutive draws with the same dynamic state share one set op.
    current_draw_state: Option<u32>,
}

impl<'a> CompileContext<'a> {
    pub fn new(backend: &'a SwBackend, commands: &'a CommandList) -> CompileContext<'a> {
        CompileContext {
            backend,
            commands,
            debug_runtime: backend.debug_runtime(),
            ops: Vec::new(),
            state_tracker: FxHashMap::default(),
            touched: FxHashMap::default(),
            pending: FxHashMap::default(),
            pending_uav: SmallVec::new(),
            pending_order: SmallVec::new(),
            current_draw_state: None,
        }
    }

    fn apply_draw_state(&mut self, draw_state: u32) {
        if self.current_draw_state == Some(draw_state) {
            return;
        }
        let state = self.commands.draw_state(draw_state);
        self.ops.push(NativeOp::SetDrawState {
            viewport: state.viewport,
            scissor_rect: state.scissor_rect,
            stencil_ref: state.stencil_ref,
        });
        self.current_draw_state = Some(draw_state);
    }

    pub fn run(mut self) -> Result<Vec<NativeOp>> {
        for command in self.commands.iter() {
            self.compile_command(command)?;
        }
        self.restore_default();
        Ok(self.ops)
    }

    //----------------------------------------------------------------------------------------------
    // Resolution.

    fn resolve_buffer(&self, handle: Handle) -> Result<Resolved> {
        let buffer = self.backend.buffers.read(handle)?;
        let storage = buffer.storage.clone().ok_or(Error::InvalidArgument)?;
        Ok(Resolved {
            key: TrackKey::new(handle),
            storage,
            states: buffer.states,
            sub_count: 1,
        })
    }

    /// Textures and swap chains; a swap chain resolves to the back buffer
    /// selected by `backbuffer`.
    fn resolve_texture(&self, handle: Handle, backbuffer: u32) -> Result<Resolved> {
        match handle.kind() {
            Some(ResourceKind::Texture) => {
                let texture = self.backend.textures.read(handle)?;
                let storage = texture.storage.clone().ok_or(Error::InvalidArgument)?;
                Ok(Resolved {
                    key: TrackKey::new(handle),
                    storage,
                    states: texture.states,
                    sub_count: texture.sub_resource_count,
                })
            }
            Some(ResourceKind::SwapChain) => {
                let swap_chain = self.backend.swap_chains.read(handle)?;
                let texture = swap_chain
                    .textures
                    .get(backbuffer as usize)
                    .ok_or(Error::InvalidArgument)?;
                let storage = texture.storage.clone().ok_or(Error::InvalidArgument)?;
                Ok(Resolved {
                    key: TrackKey { handle, backbuffer },
                    storage,
                    states: texture.states,
                    sub_count: texture.sub_resource_count,
                })
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    fn resolve_range(&self, range: &SubresourceRange) -> Result<Resolved> {
        match range.resource.kind() {
            Some(ResourceKind::Buffer) => self.resolve_buffer(range.resource),
            _ => self.resolve_texture(range.resource, range.backbuffer),
        }
    }

    //----------------------------------------------------------------------------------------------
    // State tracking.

    /// Records a pending transition of `resolved` to `state`. Chained
    /// transitions of the same resource within one flush window fuse,
    /// keeping the earliest `before`.
    fn add_transition(
        &mut self,
        resolved: &Resolved,
        subresources: BarrierSubresources,
        state: ResourceState,
    ) -> Result<()> {
        if !resolved.states.supported.contains(state) {
            log::error!(
                "transition to {:?} not in supported states {:?} of {:?}",
                state,
                resolved.states.supported,
                resolved.key.handle,
            );
            return Err(Error::InvalidState);
        }

        self.touched.entry(resolved.key).or_insert(resolved.states);
        let current = *self
            .state_tracker
            .entry(resolved.key)
            .or_insert(resolved.states.default);

        if state != current {
            if let Some(pending) = self.pending.get_mut(&resolved.key) {
                pending.after = state;
                pending.subresources = merge_subresources(pending.subresources, subresources);
                if pending.after == pending.before {
                    self.pending.remove(&resolved.key);
                    self.pending_order.retain(|k| *k != resolved.key);
                }
            } else {
                self.pending.insert(
                    resolved.key,
                    PendingTransition {
                        subresources,
                        before: current,
                        after: state,
                    },
                );
                self.pending_order.push(resolved.key);
            }
            self.state_tracker.insert(resolved.key, state);
        } else if state == ResourceState::UNORDERED_ACCESS {
            // Back-to-back unordered access: order the accesses explicitly.
            if !self.pending_uav.contains(&resolved.key) {
                self.pending_uav.push(resolved.key);
            }
        }
        Ok(())
    }

    /// Coalesces pending transitions into a single barrier batch.
    fn flush_transitions(&mut self) {
        if self.pending.is_empty() && self.pending_uav.is_empty() {
            return;
        }
        let mut barriers = Vec::with_capacity(self.pending.len() + self.pending_uav.len());
        for key in self.pending_order.drain(..) {
            if let Some(pending) = self.pending.remove(&key) {
                barriers.push(BarrierOp::Transition {
                    resource: key,
                    subresources: pending.subresources,
                    before: pending.before,
                    after: pending.after,
                });
            }
        }
        for key in self.pending_uav.drain(..) {
            barriers.push(BarrierOp::Uav { resource: key });
        }
        self.ops.push(NativeOp::Barriers(barriers));
    }

    /// Emits transitions returning every touched resource to its default
    /// state. Always runs, even for a list with no GPU work.
    fn restore_default(&mut self) {
        let touched: Vec<(TrackKey, ResourceStates)> =
            self.touched.iter().map(|(k, s)| (*k, *s)).collect();
        for (key, states) in touched {
            let current = self.state_tracker[&key];
            if current != states.default {
                self.pending.insert(
                    key,
                    PendingTransition {
                        subresources: BarrierSubresources::All,
                        before: current,
                        after: states.default,
                    },
                );
                self.pending_order.push(key);
                self.state_tracker.insert(key, states.default);
            }
        }
        self.flush_transitions();
    }

    //----------------------------------------------------------------------------------------------
    // Binding-set application.

    /// Adds the transitions a pipeline binding set demands and emits the
    /// pipeline bind.
    fn apply_pipeline_binding(&mut self, pbs_handle: Handle, compute_only: bool) -> Result<()> {
        struct PbsInfo {
            pipeline: Handle,
            root_signature: RootSignatureKind,
            cbvs: SmallVec<[SubresourceRange; 8]>,
            srvs: SmallVec<[SubresourceRange; 8]>,
            uavs: SmallVec<[SubresourceRange; 8]>,
        }
        let info = {
            let pbs = self.backend.pipeline_binding_sets.read(pbs_handle)?;
            let root_signature = pbs.root_signature.ok_or(Error::InvalidArgument)?;
            PbsInfo {
                pipeline: pbs.pipeline,
                root_signature,
                cbvs: pbs.cbv_transitions.iter().cloned().collect(),
                srvs: pbs.srv_transitions.iter().cloned().collect(),
                uavs: pbs.uav_transitions.iter().cloned().collect(),
            }
        };

        if self.debug_runtime {
            let expected = if compute_only {
                RootSignatureKind::Compute
            } else {
                RootSignatureKind::Graphics
            };
            if info.root_signature != expected {
                log::error!(
                    "pipeline binding set {:?} targets {:?}, command needs {:?}",
                    pbs_handle,
                    info.root_signature,
                    expected
                );
                return Err(Error::InvalidState);
            }
        }

        let srv_state = if compute_only {
            ResourceState::NON_PIXEL_SHADER_RESOURCE
        } else {
            ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE
        };

        for range in info.cbvs.iter().filter(|r| !r.is_empty()) {
            let resolved = self.resolve_range(range)?;
            self.add_transition(
                &resolved,
                span(range, resolved.sub_count),
                ResourceState::VERTEX_AND_CONSTANT_BUFFER,
            )?;
        }
        for range in info.srvs.iter().filter(|r| !r.is_empty()) {
            let resolved = self.resolve_range(range)?;
            self.add_transition(&resolved, span(range, resolved.sub_count), srv_state)?;
        }
        for range in info.uavs.iter().filter(|r| !r.is_empty()) {
            let resolved = self.resolve_range(range)?;
            self.add_transition(
                &resolved,
                span(range, resolved.sub_count),
                ResourceState::UNORDERED_ACCESS,
            )?;
        }

        self.ops.push(NativeOp::BindPipeline {
            pipeline: info.pipeline,
        });
        Ok(())
    }

    /// Adds RTV/DSV transitions for the frame binding set's active buffer
    /// and emits the output-merger bind.
    fn apply_frame_binding(&mut self, fbs_handle: Handle) -> Result<()> {
        struct FbsInfo {
            rtvs: SmallVec<[SubresourceRange; 8]>,
            dsv: SubresourceRange,
            read_only_depth: bool,
            num_rtvs: u32,
        }
        let info = {
            let fbs = self.backend.frame_binding_sets.read(fbs_handle)?;
            if !fbs.is_live() {
                return Err(Error::InvalidArgument);
            }
            let buffer_idx = if fbs.swap_chain.is_null() {
                0
            } else {
                self.backend.swap_chains.read(fbs.swap_chain)?.bb_idx
            };
            FbsInfo {
                rtvs: (0..fbs.num_rtvs)
                    .map(|i| *fbs.rtv_resource(buffer_idx, i))
                    .collect(),
                dsv: fbs.dsv_resource,
                read_only_depth: fbs.desc.dsv.flags.contains(DsvFlags::READ_ONLY_DEPTH),
                num_rtvs: fbs.num_rtvs,
            }
        };

        for range in info.rtvs.iter() {
            let resolved = self.resolve_range(range)?;
            self.add_transition(
                &resolved,
                span(range, resolved.sub_count),
                ResourceState::RENDER_TARGET,
            )?;
        }
        let has_dsv = !info.dsv.is_empty();
        if has_dsv {
            let resolved = self.resolve_range(&info.dsv)?;
            let state = if info.read_only_depth {
                ResourceState::DEPTH_READ
            } else {
                ResourceState::DEPTH_WRITE
            };
            self.add_transition(&resolved, span(&info.dsv, resolved.sub_count), state)?;
        }

        self.ops.push(NativeOp::BindFrame {
            frame_binding: fbs_handle,
            num_rtvs: info.num_rtvs,
            has_dsv,
        });
        Ok(())
    }

    /// Adds IB/VB transitions. Returns whether an index buffer is bound.
    fn apply_draw_binding(&mut self, dbs_handle: Handle) -> Result<bool> {
        let desc = {
            let dbs = self.backend.draw_binding_sets.read(dbs_handle)?;
            if !dbs.live {
                return Err(Error::InvalidArgument);
            }
            dbs.desc
        };

        let indexed = !desc.ib.resource.is_null();
        if indexed {
            let resolved = self.resolve_buffer(desc.ib.resource)?;
            self.add_transition(
                &resolved,
                BarrierSubresources::All,
                ResourceState::INDEX_BUFFER,
            )?;
        }
        let mut num_vbs = 0;
        for vb in desc.vbs.iter().filter(|vb| !vb.resource.is_null()) {
            let resolved = self.resolve_buffer(vb.resource)?;
            self.add_transition(
                &resolved,
                BarrierSubresources::All,
                ResourceState::VERTEX_AND_CONSTANT_BUFFER,
            )?;
            num_vbs += 1;
        }

        if indexed {
            self.ops.push(NativeOp::BindIndexBuffer);
        }
        self.ops.push(NativeOp::BindVertexBuffers { num: num_vbs });
        Ok(indexed)
    }

    fn apply_indirect_args(&mut self, indirect_buffer: Handle, count_buffer: Handle) -> Result<()> {
        let resolved = self.resolve_buffer(indirect_buffer)?;
        self.add_transition(
            &resolved,
            BarrierSubresources::All,
            ResourceState::INDIRECT_ARGUMENT,
        )?;
        if !count_buffer.is_null() {
            let resolved = self.resolve_buffer(count_buffer)?;
            self.add_transition(
                &resolved,
                BarrierSubresources::All,
                ResourceState::INDIRECT_ARGUMENT,
            )?;
        }
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Commands.

    fn compile_command(&mut self, command: &Command) -> Result<()> {
        match *command {
            Command::Draw {
                pipeline_binding,
                draw_binding,
                frame_binding,
                draw_state,
                num_vertices,
                num_instances,
                ..
            } => {
                self.apply_pipeline_binding(pipeline_binding, false)?;
                self.apply_frame_binding(frame_binding)?;
                self.apply_draw_state(draw_state);
                let indexed = if draw_binding.is_null() {
                    false
                } else {
                    self.apply_draw_binding(draw_binding)?
                };
                self.flush_transitions();
                self.ops.push(NativeOp::Draw {
                    indexed,
                    num_vertices,
                    num_instances,
                });
                Ok(())
            }
            Command::DrawIndirect {
                pipeline_binding,
                draw_binding,
                frame_binding,
                draw_state,
                indirect_buffer,
                count_buffer,
                max_commands,
                ..
            } => {
                self.apply_pipeline_binding(pipeline_binding, false)?;
                self.apply_frame_binding(frame_binding)?;
                self.apply_draw_state(draw_state);
                if !draw_binding.is_null() {
                    self.apply_draw_binding(draw_binding)?;
                }
                self.apply_indirect_args(indirect_buffer, count_buffer)?;
                self.flush_transitions();
                self.ops.push(NativeOp::DrawIndirect { max_commands });
                Ok(())
            }
            Command::Dispatch {
                pipeline_binding,
                x_groups,
                y_groups,
                z_groups,
            } => {
                self.apply_pipeline_binding(pipeline_binding, true)?;
                self.flush_transitions();
                self.ops.push(NativeOp::Dispatch {
                    x_groups,
                    y_groups,
                    z_groups,
                });
                Ok(())
            }
            Command::DispatchIndirect {
                pipeline_binding,
                indirect_buffer,
                count_buffer,
                max_commands,
                ..
            } => {
                self.apply_pipeline_binding(pipeline_binding, true)?;
                self.apply_indirect_args(indirect_buffer, count_buffer)?;
                self.flush_transitions();
                self.ops.push(NativeOp::DispatchIndirect { max_commands });
                Ok(())
            }
            Command::ClearRtv {
                frame_binding,
                rtv_idx,
                color,
            } => self.compile_clear_rtv(frame_binding, rtv_idx, color),
            Command::ClearDsv {
                frame_binding,
                depth,
                stencil,
            } => self.compile_clear_dsv(frame_binding, depth, stencil),
            Command::ClearUav {
                pipeline_binding,
                uav_idx,
                value,
            } => self.compile_clear_uav(pipeline_binding, uav_idx, value),
            Command::UpdateBuffer {
                buffer,
                offset,
                data,
            } => self.compile_update_buffer(buffer, offset, data),
            Command::UpdateTextureSubResource {
                texture,
                sub_resource_idx,
                row_pitch,
                slice_pitch,
                data,
            } => self.compile_update_texture(texture, sub_resource_idx, row_pitch, slice_pitch, data),
            Command::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => self.compile_copy_buffer(dst, dst_offset, src, src_offset, size),
            Command::CopyTextureSubResource {
                dst,
                dst_sub_resource_idx,
                dst_point,
                src,
                src_sub_resource_idx,
                src_box,
            } => self.compile_copy_texture(
                dst,
                dst_sub_resource_idx,
                dst_point,
                src,
                src_sub_resource_idx,
                src_box,
            ),
            Command::BeginEvent { meta_data, text } => {
                let text = String::from_utf8_lossy(self.commands.data(text)).into_owned();
                self.ops.push(NativeOp::BeginEvent { meta_data, text });
                Ok(())
            }
            Command::EndEvent => {
                self.ops.push(NativeOp::EndEvent);
                Ok(())
            }
        }
    }

    fn compile_clear_rtv(
        &mut self,
        frame_binding: Handle,
        rtv_idx: u32,
        color: [f32; 4],
    ) -> Result<()> {
        let (range, format) = {
            let fbs = self.backend.frame_binding_sets.read(frame_binding)?;
            if !fbs.is_live() || rtv_idx >= fbs.num_rtvs {
                return Err(Error::InvalidArgument);
            }
            let buffer_idx = if fbs.swap_chain.is_null() {
                0
            } else {
                self.backend.swap_chains.read(fbs.swap_chain)?.bb_idx
            };
            (
                *fbs.rtv_resource(buffer_idx, rtv_idx),
                fbs.desc.rtvs[rtv_idx as usize].format,
            )
        };

        let resolved = self.resolve_range(&range)?;
        self.add_transition(
            &resolved,
            span(&range, resolved.sub_count),
            ResourceState::RENDER_TARGET,
        )?;
        self.flush_transitions();

        let len = resolved.storage.lock().unwrap().len();
        match encode_clear_color(format, color) {
            Some(pattern) => self.ops.push(NativeOp::Fill {
                dst: resolved.storage,
                ranges: vec![(0, len)],
                pattern,
            }),
            None => log::warn!("clear of {:?} not supported by the software device", format),
        }
        Ok(())
    }

    fn compile_clear_dsv(&mut self, frame_binding: Handle, depth: f32, stencil: u8) -> Result<()> {
        let (range, format) = {
            let fbs = self.backend.frame_binding_sets.read(frame_binding)?;
            if !fbs.is_live() || fbs.dsv_resource.is_empty() {
                return Err(Error::InvalidArgument);
            }
            (fbs.dsv_resource, fbs.desc.dsv.format)
        };

        let resolved = self.resolve_range(&range)?;
        self.add_transition(
            &resolved,
            span(&range, resolved.sub_count),
            ResourceState::DEPTH_WRITE,
        )?;
        self.flush_transitions();

        let len = resolved.storage.lock().unwrap().len();
        match encode_clear_depth(format, depth, stencil) {
            Some(pattern) => self.ops.push(NativeOp::Fill {
                dst: resolved.storage,
                ranges: vec![(0, len)],
                pattern,
            }),
            None => log::warn!("depth clear of {:?} not supported by the software device", format),
        }
        Ok(())
    }

    fn compile_clear_uav(
        &mut self,
        pipeline_binding: Handle,
        uav_idx: u32,
        value: ClearUavValue,
    ) -> Result<()> {
        let range = {
            let pbs = self.backend.pipeline_binding_sets.read(pipeline_binding)?;
            *pbs
                .uav_transitions
                .get(uav_idx as usize)
                .ok_or(Error::InvalidArgument)?
        };
        if range.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let resolved = self.resolve_range(&range)?;
        self.add_transition(
            &resolved,
            span(&range, resolved.sub_count),
            ResourceState::UNORDERED_ACCESS,
        )?;
        self.flush_transitions();

        let pattern = match value {
            ClearUavValue::Float(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ClearUavValue::Uint(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        };
        let len = resolved.storage.lock().unwrap().len();
        self.ops.push(NativeOp::Fill {
            dst: resolved.storage,
            ranges: vec![(0, len)],
            pattern,
        });
        Ok(())
    }

    fn compile_update_buffer(
        &mut self,
        buffer: Handle,
        offset: u64,
        data: tachyon_gpu::command_list::DataRange,
    ) -> Result<()> {
        let resolved = self.resolve_buffer(buffer)?;
        let payload = self.commands.data(data);
        {
            let size = self.backend.buffers.read(buffer)?.desc.size;
            if offset + payload.len() as u64 > size {
                return Err(Error::InvalidArgument);
            }
        }

        // Stage through the per-frame upload allocator, then copy on-GPU.
        let staged = self
            .backend
            .device()?
            .upload_allocator()
            .alloc_default(payload.len() as u64)?;
        staged.write(0, payload);

        self.add_transition(&resolved, BarrierSubresources::All, ResourceState::COPY_DEST)?;
        self.flush_transitions();

        self.ops.push(NativeOp::CopyRows {
            dst: resolved.storage,
            src: CopySource::Upload(staged.block.clone()),
            rows: vec![RowCopy {
                dst_offset: offset as usize,
                src_offset: staged.offset as usize,
                len: payload.len(),
            }],
        });
        Ok(())
    }

    fn compile_update_texture(
        &mut self,
        texture: Handle,
        sub_resource_idx: u32,
        row_pitch: u32,
        slice_pitch: u32,
        data: tachyon_gpu::command_list::DataRange,
    ) -> Result<()> {
        let resolved = self.resolve_texture(texture, 0)?;
        let sub = {
            let tex = self.backend.textures.read(texture)?;
            *tex.sub_layout(sub_resource_idx)?
        };
        let payload = self.commands.data(data);

        let row_bytes = sub.footprint.row_pitch as usize;
        if (row_pitch as usize) < row_bytes {
            return Err(Error::InvalidArgument);
        }
        let rows = sub.footprint.num_rows as usize;
        let slices = sub.depth as usize;
        let required = (slices - 1) * slice_pitch as usize + (rows - 1) * row_pitch as usize + row_bytes;
        if payload.len() < required {
            return Err(Error::InvalidArgument);
        }

        // Stage into the upload heap at the subresource's tight layout.
        let staged = self
            .backend
            .device()?
            .upload_allocator()
            .alloc_default(sub.footprint.total_bytes)?;
        let mut row_copies = Vec::with_capacity(rows * slices);
        for slice in 0..slices {
            for row in 0..rows {
                let src = slice * slice_pitch as usize + row * row_pitch as usize;
                let staged_offset =
                    slice * sub.footprint.slice_pitch as usize + row * row_bytes;
                staged.write(staged_offset as u64, &payload[src..src + row_bytes]);
                row_copies.push(RowCopy {
                    dst_offset: sub.offset as usize + staged_offset,
                    src_offset: staged.offset as usize + staged_offset,
                    len: row_bytes,
                });
            }
        }

        self.add_transition(&resolved, BarrierSubresources::All, ResourceState::COPY_DEST)?;
        self.flush_transitions();

        self.ops.push(NativeOp::CopyRows {
            dst: resolved.storage,
            src: CopySource::Upload(staged.block.clone()),
            rows: row_copies,
        });
        Ok(())
    }

    fn compile_copy_buffer(
        &mut self,
        dst: Handle,
        dst_offset: u64,
        src: Handle,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        let dst_resolved = self.resolve_buffer(dst)?;
        let src_resolved = self.resolve_buffer(src)?;
        {
            let dst_size = self.backend.buffers.read(dst)?.desc.size;
            let src_size = self.backend.buffers.read(src)?.desc.size;
            if dst_offset + size > dst_size || src_offset + size > src_size {
                return Err(Error::InvalidArgument);
            }
        }

        self.add_transition(&src_resolved, BarrierSubresources::All, ResourceState::COPY_SOURCE)?;
        self.add_transition(&dst_resolved, BarrierSubresources::All, ResourceState::COPY_DEST)?;
        self.flush_transitions();

        self.ops.push(NativeOp::CopyRows {
            dst: dst_resolved.storage,
            src: CopySource::Buffer(src_resolved.storage),
            rows: vec![RowCopy {
                dst_offset: dst_offset as usize,
                src_offset: src_offset as usize,
                len: size as usize,
            }],
        });
        Ok(())
    }

    fn compile_copy_texture(
        &mut self,
        dst: Handle,
        dst_sub_resource_idx: u32,
        dst_point: Point,
        src: Handle,
        src_sub_resource_idx: u32,
        src_box: Box3d,
    ) -> Result<()> {
        let dst_resolved = self.resolve_texture(dst, 0)?;
        let src_resolved = self.resolve_texture(src, 0)?;

        let (dst_sub, dst_format) = {
            let tex = self.backend.textures.read(dst)?;
            (*tex.sub_layout(dst_sub_resource_idx)?, tex.desc.format)
        };
        let (src_sub, src_format) = {
            let tex = self.backend.textures.read(src)?;
            (*tex.sub_layout(src_sub_resource_idx)?, tex.desc.format)
        };

        let info = format_info(src_format);
        let dst_info = format_info(dst_format);
        if info.block_bits != dst_info.block_bits {
            return Err(Error::Unsupported);
        }
        // Block-compressed regions must stay on block boundaries.
        if info.compressed
            && (src_box.x as u32 % info.block_w != 0
                || src_box.y as u32 % info.block_h != 0
                || src_box.w as u32 % info.block_w != 0
                || src_box.h as u32 % info.block_h != 0)
        {
            return Err(Error::Unsupported);
        }
        if dst_info.compressed
            && (dst_point.x as u32 % dst_info.block_w != 0
                || dst_point.y as u32 % dst_info.block_h != 0)
        {
            return Err(Error::Unsupported);
        }
        if src_box.x < 0 || src_box.y < 0 || src_box.z < 0 || dst_point.x < 0 || dst_point.y < 0
            || dst_point.z < 0
        {
            return Err(Error::InvalidArgument);
        }
        if (src_box.x + src_box.w) as u32 > src_sub.width
            || (src_box.y + src_box.h) as u32 > src_sub.height
            || (src_box.z + src_box.d) as u32 > src_sub.depth
        {
            return Err(Error::InvalidArgument);
        }
        if dst_point.x as u32 + src_box.w as u32 > dst_sub.width
            || dst_point.y as u32 + src_box.h as u32 > dst_sub.height
            || dst_point.z as u32 + src_box.d as u32 > dst_sub.depth
        {
            return Err(Error::InvalidArgument);
        }

        let block_bytes = info.block_bytes() as usize;
        let row_blocks = (src_box.w as u32 / info.block_w.max(1)).max(1) as usize;
        let row_len = row_blocks * block_bytes;
        let num_rows = ((src_box.h as u32 + info.block_h - 1) / info.block_h) as usize;

        let mut rows = Vec::with_capacity(num_rows * src_box.d as usize);
        for z in 0..src_box.d as usize {
            for row in 0..num_rows {
                let src_offset = src_sub.offset as usize
                    + (src_box.z as usize + z) * src_sub.footprint.slice_pitch as usize
                    + ((src_box.y as u32 / info.block_h) as usize + row)
                        * src_sub.footprint.row_pitch as usize
                    + (src_box.x as u32 / info.block_w) as usize * block_bytes;
                let dst_offset = dst_sub.offset as usize
                    + (dst_point.z as usize + z) * dst_sub.footprint.slice_pitch as usize
                    + ((dst_point.y as u32 / dst_info.block_h) as usize + row)
                        * dst_sub.footprint.row_pitch as usize
                    + (dst_point.x as u32 / dst_info.block_w) as usize * block_bytes;
                rows.push(RowCopy {
                    dst_offset,
                    src_offset,
                    len: row_len,
                });
            }
        }

        self.add_transition(&src_resolved, BarrierSubresources::All, ResourceState::COPY_SOURCE)?;
        self.add_transition(&dst_resolved, BarrierSubresources::All, ResourceState::COPY_DEST)?;
        self.flush_transitions();

        self.ops.push(NativeOp::CopyRows {
            dst: dst_resolved.storage,
            src: CopySource::Buffer(src_resolved.storage),
            rows,
        });
        Ok(())
    }
}

/// Barrier span for a cached subresource range: whole-resource ranges
/// collapse to the all-subresources form.
fn span(range: &SubresourceRange, sub_count: u32) -> BarrierSubresources {
    if range.first == 0 && range.num >= sub_count {
        BarrierSubresources::All
    } else {
        BarrierSubresources::Range {
            first: range.first,
            num: range.num,
        }
    }
}

fn merge_subresources(a: BarrierSubresources, b: BarrierSubresources) -> BarrierSubresources {
    match (a, b) {
        (BarrierSubresources::All, _) | (_, BarrierSubresources::All) => BarrierSubresources::All,
        (
            BarrierSubresources::Range { first, num },
            BarrierSubresources::Range {
                first: other_first,
                num: other_num,
            },
        ) => {
            let start = first.min(other_first);
            let end = (first + num).max(other_first + other_num);
            BarrierSubresources::Range {
                first: start,
                num: end - start,
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Clear encodings. Payload updates pass pixel data through untouched; clears
// are the one place the software device converts a value to the target
// format.

fn unorm8(v: f32) -> u8 {
    (v.max(0.0).min(1.0) * 255.0 + 0.5) as u8
}

fn encode_clear_color(format: Format, color: [f32; 4]) -> Option<Vec<u8>> {
    let [r, g, b, a] = color;
    match format {
        Format::R8_UNORM => Some(vec![unorm8(r)]),
        Format::R8G8_UNORM => Some(vec![unorm8(r), unorm8(g)]),
        Format::R8G8B8A8_UNORM | Format::R8G8B8A8_UNORM_SRGB => {
            Some(vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)])
        }
        Format::B8G8R8A8_UNORM => Some(vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)]),
        Format::R16G16B16A16_UNORM => Some(
            [r, g, b, a]
                .iter()
                .flat_map(|v| (((v.max(0.0).min(1.0)) * 65535.0 + 0.5) as u16).to_le_bytes())
                .collect(),
        ),
        Format::R32_FLOAT => Some(r.to_le_bytes().to_vec()),
        Format::R32G32_FLOAT => Some([r, g].iter().flat_map(|v| v.to_le_bytes()).collect()),
        Format::R32G32B32A32_FLOAT => {
            Some([r, g, b, a].iter().flat_map(|v| v.to_le_bytes()).collect())
        }
        Format::R32_UINT => Some((r as u32).to_le_bytes().to_vec()),
        Format::R10G10B10A2_UNORM => {
            let pack = |v: f32, bits: u32| -> u32 {
                (v.max(0.0).min(1.0) * ((1 << bits) - 1) as f32 + 0.5) as u32
            };
            let value = pack(r, 10) | (pack(g, 10) << 10) | (pack(b, 10) << 20) | (pack(a, 2) << 30);
            Some(value.to_le_bytes().to_vec())
        }
        _ => None,
    }
}

fn encode_clear_depth(format: Format, depth: f32, stencil: u8) -> Option<Vec<u8>> {
    match format {
        Format::D16_UNORM => {
            Some((((depth.max(0.0).min(1.0)) * 65535.0 + 0.5) as u16).to_le_bytes().to_vec())
        }
        Format::D24_UNORM_S8_UINT => {
            let d = (depth.max(0.0).min(1.0) * 16_777_215.0 + 0.5) as u32;
            Some((d | ((stencil as u32) << 24)).to_le_bytes().to_vec())
        }
        Format::D32_FLOAT => Some(depth.to_le_bytes().to_vec()),
        Format::D32_FLOAT_S8X24_UINT => {
            let mut bytes = depth.to_le_bytes().to_vec();
            bytes.extend_from_slice(&[stencil, 0, 0, 0]);
            Some(bytes)
        }
        _ => None,
    }
}
