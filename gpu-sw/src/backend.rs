//! The software backend.
//!
//! Implements the full backend contract against CPU-side storage so the
//! whole pipeline — recording, compilation with state tracking, submission,
//! fencing, presentation, readback — runs and is observable on any host.

use crate::command_list::{NativeOp, SwCommandList};
use crate::compile::CompileContext;
use crate::descriptor::{Descriptor, DescriptorHeap, DescriptorHeapSubType};
use crate::device::{QueueKind, SwDevice};
use crate::pool::ResourcePool;
use crate::resources::*;
use std::sync::{Arc, Mutex};
use tachyon_gpu::backend::{AdapterInfo, Backend, SetupParams};
use tachyon_gpu::command_list::CommandList;
use tachyon_gpu::error::{Error, Result};
use tachyon_gpu::format::texture_footprint;
use tachyon_gpu::handle::{Handle, ResourceKind};
use tachyon_gpu::resources::*;
use tachyon_gpu::types::*;

pub struct SwBackend {
    setup_params: SetupParams,
    device: Mutex<Option<Arc<SwDevice>>>,
    adapter_infos: Mutex<Vec<AdapterInfo>>,

    pub(crate) swap_chains: ResourcePool<SwSwapChain>,
    pub(crate) buffers: ResourcePool<SwBuffer>,
    pub(crate) textures: ResourcePool<SwTexture>,
    pub(crate) sampler_states: ResourcePool<SwSamplerState>,
    pub(crate) shaders: ResourcePool<SwShader>,
    pub(crate) graphics_pipelines: ResourcePool<SwGraphicsPipelineState>,
    pub(crate) compute_pipelines: ResourcePool<SwComputePipelineState>,
    pub(crate) pipeline_binding_sets: ResourcePool<SwPipelineBindingSet>,
    pub(crate) draw_binding_sets: ResourcePool<SwDrawBindingSet>,
    pub(crate) frame_binding_sets: ResourcePool<SwFrameBindingSet>,
    pub(crate) command_lists: ResourcePool<SwCommandList>,
    pub(crate) fences: ResourcePool<SwFence>,
}

impl SwBackend {
    pub fn new(setup_params: SetupParams) -> SwBackend {
        if setup_params
            .debug_flags
            .contains(DebugFlags::GPU_BASED_VALIDATION)
        {
            log::info!("gpu-based validation requested; software device validates on the CPU");
        }
        SwBackend {
            setup_params,
            device: Mutex::new(None),
            adapter_infos: Mutex::new(Vec::new()),
            swap_chains: ResourcePool::new("SwSwapChain"),
            buffers: ResourcePool::new("SwBuffer"),
            textures: ResourcePool::new("SwTexture"),
            sampler_states: ResourcePool::new("SwSamplerState"),
            shaders: ResourcePool::new("SwShader"),
            graphics_pipelines: ResourcePool::new("SwGraphicsPipelineState"),
            compute_pipelines: ResourcePool::new("SwComputePipelineState"),
            pipeline_binding_sets: ResourcePool::new("SwPipelineBindingSet"),
            draw_binding_sets: ResourcePool::new("SwDrawBindingSet"),
            frame_binding_sets: ResourcePool::new("SwFrameBindingSet"),
            command_lists: ResourcePool::new("SwCommandList"),
            fences: ResourcePool::new("SwFence"),
        }
    }

    pub(crate) fn debug_runtime(&self) -> bool {
        self.setup_params
            .debug_flags
            .contains(DebugFlags::DEBUG_RUNTIME)
    }

    pub(crate) fn device(&self) -> Result<Arc<SwDevice>> {
        self.device
            .lock()
            .unwrap()
            .as_ref()
            .cloned()
            .ok_or(Error::InvalidState)
    }

    //----------------------------------------------------------------------------------------------
    // Debugging hooks. Not part of the backend contract; tooling and tests
    // reach them on the concrete type.

    /// Runs `f` over the most recently closed op buffer of a compiled list.
    pub fn with_compiled_ops<R>(
        &self,
        handle: Handle,
        f: impl FnOnce(&[NativeOp]) -> R,
    ) -> Result<R> {
        let list = self.command_lists.read(handle)?;
        let ops = list.ops().ok_or(Error::InvalidState)?;
        Ok(f(&ops))
    }

    /// Holds the executor still, so submitted work does not complete and
    /// fences do not advance until released.
    pub fn set_stalled(&self, stalled: bool) -> Result<()> {
        self.device()?.set_stalled(stalled);
        Ok(())
    }

    /// Back buffer a swap chain currently presents from.
    pub fn swap_chain_backbuffer_idx(&self, handle: Handle) -> Result<u32> {
        let swap_chain = self.swap_chains.read(handle)?;
        if !swap_chain.is_live() {
            return Err(Error::InvalidArgument);
        }
        Ok(swap_chain.bb_idx)
    }

    //----------------------------------------------------------------------------------------------

    fn make_backbuffer(&self, desc: &SwapChainDesc, idx: u32, debug_name: &str) -> Result<SwTexture> {
        let tex_desc = TextureDesc {
            texture_type: TextureType::Tex2d,
            width: desc.width,
            height: desc.height,
            depth: 1,
            array_elements: 1,
            mip_levels: 1,
            format: desc.format,
            bind_flags: BindFlags::RENDER_TARGET | BindFlags::PRESENT,
        };
        let layout = texture_layout(&tex_desc)?;
        let mut states = ResourceStates {
            supported: resource_states(tex_desc.bind_flags),
            default: default_resource_state(tex_desc.bind_flags),
        };
        states.supported |= ResourceState::COPY_SOURCE | ResourceState::COPY_DEST;
        Ok(SwTexture {
            desc: tex_desc,
            storage: Some(new_storage(layout.total_bytes)),
            sub_resource_count: tex_desc.sub_resource_count(),
            layout,
            states,
            debug_name: format!("{} [bb {}]", debug_name, idx),
        })
    }

    /// Stages `data` through the upload allocator and copies it into
    /// `storage` on the copy queue, fencing the upload for the direct queue.
    fn upload_initial_data(
        &self,
        device: &SwDevice,
        storage: &Storage,
        dst_offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let staged = device.upload_allocator().alloc_default(data.len() as u64)?;
        staged.write(0, data);
        let ops = vec![NativeOp::CopyRows {
            dst: Arc::clone(storage),
            src: crate::command_list::CopySource::Upload(Arc::clone(&staged.block)),
            rows: vec![crate::command_list::RowCopy {
                dst_offset,
                src_offset: staged.offset as usize,
                len: data.len(),
            }],
        }];
        device.execute(QueueKind::Copy, Arc::new(ops));
        device.signal_upload();
        Ok(())
    }
}

impl Backend for SwBackend {
    fn enumerate_adapters(&self) -> Result<Vec<AdapterInfo>> {
        let mut infos = self.adapter_infos.lock().unwrap();
        if infos.is_empty() {
            log::info!("enumerating adapters: software device");
            infos.push(AdapterInfo {
                description: "Software device".to_string(),
                vendor_id: 0,
                device_id: 0,
                dedicated_video_memory: 0,
                dedicated_system_memory: 0,
                shared_system_memory: 0,
            });
        }
        Ok(infos.clone())
    }

    fn is_initialized(&self) -> bool {
        self.device.lock().unwrap().is_some()
    }

    fn initialize(&self, adapter_idx: usize) -> Result<()> {
        if adapter_idx != 0 {
            return Err(Error::InvalidArgument);
        }
        let mut device = self.device.lock().unwrap();
        if device.is_some() {
            return Err(Error::InvalidState);
        }
        *device = Some(Arc::new(SwDevice::new()));
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Resource creation.

    fn create_swap_chain(
        &self,
        handle: Handle,
        desc: &SwapChainDesc,
        debug_name: &str,
    ) -> Result<()> {
        self.device()?;
        let textures = (0..desc.buffer_count)
            .map(|idx| self.make_backbuffer(desc, idx, debug_name))
            .collect::<Result<Vec<_>>>()?;
        let mut swap_chain = self.swap_chains.write(handle);
        *swap_chain = SwSwapChain {
            desc: *desc,
            textures,
            bb_idx: 0,
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_buffer(
        &self,
        handle: Handle,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
        debug_name: &str,
    ) -> Result<()> {
        let device = self.device()?;
        let storage = new_storage(desc.size);
        let mut states = ResourceStates {
            supported: resource_states(desc.bind_flags),
            default: default_resource_state(desc.bind_flags),
        };
        // Copies are always reachable regardless of bind flags.
        states.supported |= ResourceState::COPY_SOURCE | ResourceState::COPY_DEST;

        if let Some(data) = initial_data {
            self.upload_initial_data(&device, &storage, 0, data)?;
        }

        let mut buffer = self.buffers.write(handle);
        *buffer = SwBuffer {
            desc: *desc,
            storage: Some(storage),
            states,
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_texture(
        &self,
        handle: Handle,
        desc: &TextureDesc,
        initial_data: Option<&[TextureSubResourceData]>,
        debug_name: &str,
    ) -> Result<()> {
        let device = self.device()?;
        let layout = texture_layout(desc).map_err(|_| Error::Unsupported)?;
        let storage = new_storage(layout.total_bytes);
        let mut states = ResourceStates {
            supported: resource_states(desc.bind_flags),
            default: default_resource_state(desc.bind_flags),
        };
        states.supported |= ResourceState::COPY_SOURCE | ResourceState::COPY_DEST;

        if let Some(subs) = initial_data {
            for (idx, sub_data) in subs.iter().enumerate() {
                let sub = &layout.subs[idx];
                let row_bytes = sub.footprint.row_pitch as usize;
                if (sub_data.row_pitch as usize) < row_bytes {
                    return Err(Error::InvalidArgument);
                }
                // Repack to the tight layout, then stage.
                let mut packed = vec![0u8; sub.footprint.total_bytes as usize];
                for slice in 0..sub.depth as usize {
                    for row in 0..sub.footprint.num_rows as usize {
                        let src = slice * sub_data.slice_pitch as usize
                            + row * sub_data.row_pitch as usize;
                        let dst = slice * sub.footprint.slice_pitch as usize + row * row_bytes;
                        let src_row = sub_data
                            .data
                            .get(src..src + row_bytes)
                            .ok_or(Error::InvalidArgument)?;
                        packed[dst..dst + row_bytes].copy_from_slice(src_row);
                    }
                }
                self.upload_initial_data(&device, &storage, sub.offset as usize, &packed)?;
            }
        }

        let mut texture = self.textures.write(handle);
        *texture = SwTexture {
            desc: *desc,
            storage: Some(storage),
            sub_resource_count: desc.sub_resource_count(),
            layout,
            states,
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_sampler_state(
        &self,
        handle: Handle,
        state: &SamplerState,
        debug_name: &str,
    ) -> Result<()> {
        let mut sampler = self.sampler_states.write(handle);
        *sampler = SwSamplerState {
            state: Some(*state),
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_shader(&self, handle: Handle, desc: &ShaderDesc, debug_name: &str) -> Result<()> {
        let mut shader = self.shaders.write(handle);
        *shader = SwShader {
            byte_code: desc.data.to_vec(),
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_graphics_pipeline_state(
        &self,
        handle: Handle,
        desc: &GraphicsPipelineStateDesc,
        debug_name: &str,
    ) -> Result<()> {
        for shader in desc.shaders.iter().filter(|s| !s.is_null()) {
            let record = self.shaders.read(*shader)?;
            if record.byte_code.is_empty() {
                return Err(Error::InvalidArgument);
            }
        }
        let mut pso = self.graphics_pipelines.write(handle);
        *pso = SwGraphicsPipelineState {
            root_signature: RootSignatureKind::Graphics,
            desc: desc.clone(),
            live: true,
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_compute_pipeline_state(
        &self,
        handle: Handle,
        desc: &ComputePipelineStateDesc,
        debug_name: &str,
    ) -> Result<()> {
        let record = self.shaders.read(desc.shader)?;
        if record.byte_code.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut pso = self.compute_pipelines.write(handle);
        *pso = SwComputePipelineState {
            root_signature: RootSignatureKind::Compute,
            shader: desc.shader,
            live: true,
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_pipeline_binding_set(
        &self,
        handle: Handle,
        desc: &PipelineBindingSetDesc,
        debug_name: &str,
    ) -> Result<()> {
        let device = self.device()?;
        let root_signature = match desc.pipeline.kind() {
            Some(ResourceKind::GraphicsPipelineState) => RootSignatureKind::Graphics,
            Some(ResourceKind::ComputePipelineState) => RootSignatureKind::Compute,
            _ => return Err(Error::InvalidArgument),
        };

        let cbvs = device.view_heap_allocator.alloc(desc.num_cbvs)?;
        let srvs = device.view_heap_allocator.alloc(desc.num_srvs)?;
        let uavs = device.view_heap_allocator.alloc(desc.num_uavs)?;
        let samplers = device.sampler_heap_allocator.alloc(desc.num_samplers)?;

        let mut pbs = self.pipeline_binding_sets.write(handle);
        *pbs = SwPipelineBindingSet {
            pipeline: desc.pipeline,
            root_signature: Some(root_signature),
            cbvs,
            srvs,
            uavs,
            samplers,
            cbv_transitions: vec![SubresourceRange::default(); desc.num_cbvs as usize],
            srv_transitions: vec![SubresourceRange::default(); desc.num_srvs as usize],
            uav_transitions: vec![SubresourceRange::default(); desc.num_uavs as usize],
            shader_visible: desc.shader_visible,
            temporary: false,
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_draw_binding_set(
        &self,
        handle: Handle,
        desc: &DrawBindingSetDesc,
        debug_name: &str,
    ) -> Result<()> {
        if !desc.ib.resource.is_null() {
            let buffer = self.buffers.read(desc.ib.resource)?;
            if !buffer.states.supported.contains(ResourceState::INDEX_BUFFER) {
                return Err(Error::InvalidArgument);
            }
        }
        for vb in desc.vbs.iter().filter(|vb| !vb.resource.is_null()) {
            let buffer = self.buffers.read(vb.resource)?;
            if !buffer
                .states
                .supported
                .contains(ResourceState::VERTEX_AND_CONSTANT_BUFFER)
            {
                return Err(Error::InvalidArgument);
            }
        }
        let mut dbs = self.draw_binding_sets.write(handle);
        *dbs = SwDrawBindingSet {
            desc: *desc,
            live: true,
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_frame_binding_set(
        &self,
        handle: Handle,
        desc: &FrameBindingSetDesc,
        debug_name: &str,
    ) -> Result<()> {
        let device = self.device()?;

        // A swap chain bound at RTV[0] replicates the RTV set per buffer.
        let mut swap_chain = Handle::default();
        let mut num_buffers = 1u32;
        if desc.rtvs[0].resource.kind() == Some(ResourceKind::SwapChain) {
            let sc = self.swap_chains.read(desc.rtvs[0].resource)?;
            if !sc.is_live() {
                return Err(Error::InvalidArgument);
            }
            swap_chain = desc.rtvs[0].resource;
            num_buffers = sc.textures.len() as u32;
        }

        let mut num_rtvs = 0u32;
        let mut rtv_resources =
            vec![SubresourceRange::default(); (num_buffers as usize) * MAX_BOUND_RTVS];
        let mut rtv_descriptors =
            vec![Descriptor::Null(DescriptorHeapSubType::Rtv); (num_buffers as usize) * MAX_BOUND_RTVS];

        for buffer_idx in 0..num_buffers {
            for (rtv_idx, rtv) in desc.rtvs.iter().enumerate() {
                if rtv.resource.is_null() {
                    continue;
                }
                // Only RTV[0] may be a swap chain, and no other RTV may be
                // one; RTVs are packed without holes.
                if rtv.resource.kind() == Some(ResourceKind::SwapChain) && rtv_idx != 0 {
                    return Err(Error::InvalidArgument);
                }
                if buffer_idx == 0 {
                    if rtv_idx as u32 != num_rtvs {
                        return Err(Error::InvalidArgument);
                    }
                    num_rtvs += 1;
                }

                let slot = (buffer_idx as usize) * MAX_BOUND_RTVS + rtv_idx;
                if rtv.resource.kind() == Some(ResourceKind::SwapChain) {
                    let sc = self.swap_chains.read(rtv.resource)?;
                    let texture = &sc.textures[buffer_idx as usize];
                    if !texture.states.supported.contains(ResourceState::RENDER_TARGET) {
                        return Err(Error::InvalidArgument);
                    }
                    rtv_resources[slot] = SubresourceRange {
                        resource: rtv.resource,
                        backbuffer: buffer_idx,
                        first: 0,
                        num: texture.sub_resource_count,
                    };
                } else {
                    let texture = self.textures.read(rtv.resource)?;
                    if !texture.is_live()
                        || !texture.states.supported.contains(ResourceState::RENDER_TARGET)
                    {
                        return Err(Error::InvalidArgument);
                    }
                    rtv_resources[slot] = SubresourceRange {
                        resource: rtv.resource,
                        backbuffer: 0,
                        first: 0,
                        num: texture.sub_resource_count,
                    };
                }
                rtv_descriptors[slot] = Descriptor::Rtv(*rtv);
            }
        }

        let mut dsv_resource = SubresourceRange::default();
        if !desc.dsv.resource.is_null() {
            let texture = self.textures.read(desc.dsv.resource)?;
            if !texture.is_live()
                || !texture
                    .states
                    .supported
                    .intersects(ResourceState::DEPTH_WRITE | ResourceState::DEPTH_READ)
            {
                return Err(Error::InvalidArgument);
            }
            dsv_resource = SubresourceRange {
                resource: desc.dsv.resource,
                backbuffer: 0,
                first: 0,
                num: texture.sub_resource_count,
            };
        }

        let rtvs = device
            .rtv_heap_allocator
            .alloc(num_buffers * MAX_BOUND_RTVS as u32)?;
        rtvs.heap().write(rtvs.offset, &rtv_descriptors);
        let dsv = if dsv_resource.is_empty() {
            Default::default()
        } else {
            let dsv = device.dsv_heap_allocator.alloc(1)?;
            dsv.heap().write(dsv.offset, &[Descriptor::Dsv(desc.dsv)]);
            dsv
        };

        let mut fbs = self.frame_binding_sets.write(handle);
        *fbs = SwFrameBindingSet {
            desc: *desc,
            rtvs,
            dsv,
            rtv_resources,
            dsv_resource,
            swap_chain,
            num_rtvs,
            num_buffers,
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn create_command_list(&self, handle: Handle, debug_name: &str) -> Result<()> {
        self.device()?;
        let mut list = self.command_lists.write(handle);
        *list = SwCommandList::new(debug_name);
        Ok(())
    }

    fn create_fence(&self, handle: Handle, initial_value: u64, debug_name: &str) -> Result<()> {
        let mut fence = self.fences.write(handle);
        *fence = SwFence {
            inner: Some(Arc::new(FenceInner::new(initial_value))),
            debug_name: debug_name.to_string(),
        };
        Ok(())
    }

    fn destroy_resource(&self, handle: Handle) -> Result<()> {
        match handle.kind() {
            Some(ResourceKind::SwapChain) => *self.swap_chains.write(handle) = Default::default(),
            Some(ResourceKind::Buffer) => *self.buffers.write(handle) = Default::default(),
            Some(ResourceKind::Texture) => *self.textures.write(handle) = Default::default(),
            Some(ResourceKind::SamplerState) => {
                *self.sampler_states.write(handle) = Default::default()
            }
            Some(ResourceKind::Shader) => *self.shaders.write(handle) = Default::default(),
            Some(ResourceKind::GraphicsPipelineState) => {
                *self.graphics_pipelines.write(handle) = Default::default()
            }
            Some(ResourceKind::ComputePipelineState) => {
                *self.compute_pipelines.write(handle) = Default::default()
            }
            Some(ResourceKind::PipelineBindingSet) => {
                let mut pbs = self.pipeline_binding_sets.write(handle);
                if pbs.is_live() && !pbs.temporary {
                    // Persistent descriptor ranges go back to the pool;
                    // per-frame ranges are reclaimed wholesale on reset.
                    if let Ok(device) = self.device() {
                        device.view_heap_allocator.free(pbs.cbvs.clone());
                        device.view_heap_allocator.free(pbs.srvs.clone());
                        device.view_heap_allocator.free(pbs.uavs.clone());
                        device.sampler_heap_allocator.free(pbs.samplers.clone());
                    }
                }
                *pbs = Default::default();
            }
            Some(ResourceKind::DrawBindingSet) => {
                *self.draw_binding_sets.write(handle) = Default::default()
            }
            Some(ResourceKind::FrameBindingSet) => {
                let mut fbs = self.frame_binding_sets.write(handle);
                if fbs.is_live() {
                    if let Ok(device) = self.device() {
                        device.rtv_heap_allocator.free(fbs.rtvs.clone());
                        device.dsv_heap_allocator.free(fbs.dsv.clone());
                    }
                }
                *fbs = Default::default();
            }
            Some(ResourceKind::CommandList) => self.command_lists.write(handle).release(),
            Some(ResourceKind::Fence) => *self.fences.write(handle) = Default::default(),
            None => return Err(Error::InvalidArgument),
        }
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Pipeline binding updates.

    fn alloc_temporary_pipeline_binding_set(
        &self,
        handle: Handle,
        desc: &PipelineBindingSetDesc,
    ) -> Result<()> {
        let device = self.device()?;
        let root_signature = match desc.pipeline.kind() {
            Some(ResourceKind::GraphicsPipelineState) => RootSignatureKind::Graphics,
            Some(ResourceKind::ComputePipelineState) => RootSignatureKind::Compute,
            _ => return Err(Error::InvalidArgument),
        };

        let stream = device.frame_stream();
        let samplers = stream
            .samplers
            .alloc(desc.num_samplers, DescriptorHeapSubType::Sampler)?;
        let cbvs = stream.cbvs.alloc(desc.num_cbvs, MAX_CBV_BINDINGS as u32)?;
        let srvs = stream.srvs.alloc(desc.num_srvs, MAX_SRV_BINDINGS as u32)?;
        let uavs = stream.uavs.alloc(desc.num_uavs, MAX_UAV_BINDINGS as u32)?;

        debug_assert!(cbvs.size >= desc.num_cbvs);
        debug_assert!(srvs.size >= desc.num_srvs);
        debug_assert!(uavs.size >= desc.num_uavs);

        let mut pbs = self.pipeline_binding_sets.write(handle);
        *pbs = SwPipelineBindingSet {
            pipeline: desc.pipeline,
            root_signature: Some(root_signature),
            cbvs,
            srvs,
            uavs,
            samplers,
            cbv_transitions: vec![SubresourceRange::default(); desc.num_cbvs as usize],
            srv_transitions: vec![SubresourceRange::default(); desc.num_srvs as usize],
            uav_transitions: vec![SubresourceRange::default(); desc.num_uavs as usize],
            shader_visible: true,
            temporary: true,
            debug_name: String::new(),
        };
        Ok(())
    }

    fn update_cbvs(&self, handle: Handle, base: u32, descs: &[BindingCbv]) -> Result<()> {
        let mut pbs = self.pipeline_binding_sets.write(handle);
        if !pbs.is_live() {
            return Err(Error::InvalidArgument);
        }
        if (base as usize + descs.len()) > pbs.cbv_transitions.len() {
            return Err(Error::InvalidArgument);
        }
        for (i, desc) in descs.iter().enumerate() {
            let slot = base as usize + i;
            if desc.resource.is_null() {
                pbs.cbvs
                    .heap()
                    .write(pbs.cbvs.offset + slot as u32, &[Descriptor::Null(DescriptorHeapSubType::Cbv)]);
                pbs.cbv_transitions[slot] = SubresourceRange::default();
                continue;
            }
            let buffer = self.buffers.read(desc.resource)?;
            if !buffer
                .states
                .supported
                .contains(ResourceState::VERTEX_AND_CONSTANT_BUFFER)
            {
                return Err(Error::InvalidArgument);
            }
            pbs.cbvs
                .heap()
                .write(pbs.cbvs.offset + slot as u32, &[Descriptor::Cbv(*desc)]);
            pbs.cbv_transitions[slot] = SubresourceRange {
                resource: desc.resource,
                backbuffer: 0,
                first: 0,
                num: 1,
            };
        }
        Ok(())
    }

    fn update_srvs(&self, handle: Handle, base: u32, descs: &[BindingSrv]) -> Result<()> {
        let mut pbs = self.pipeline_binding_sets.write(handle);
        if !pbs.is_live() {
            return Err(Error::InvalidArgument);
        }
        if (base as usize + descs.len()) > pbs.srv_transitions.len() {
            return Err(Error::InvalidArgument);
        }
        for (i, desc) in descs.iter().enumerate() {
            let slot = base as usize + i;
            if desc.resource.is_null() {
                pbs.srvs
                    .heap()
                    .write(pbs.srvs.offset + slot as u32, &[Descriptor::Null(DescriptorHeapSubType::Srv)]);
                pbs.srv_transitions[slot] = SubresourceRange::default();
                continue;
            }
            let (supported, sub_count) = match desc.resource.kind() {
                Some(ResourceKind::Buffer) => {
                    (self.buffers.read(desc.resource)?.states.supported, 1)
                }
                Some(ResourceKind::Texture) => {
                    let texture = self.textures.read(desc.resource)?;
                    (texture.states.supported, texture.sub_resource_count)
                }
                _ => return Err(Error::InvalidArgument),
            };
            if !supported.contains(ResourceState::NON_PIXEL_SHADER_RESOURCE) {
                return Err(Error::InvalidArgument);
            }
            pbs.srvs
                .heap()
                .write(pbs.srvs.offset + slot as u32, &[Descriptor::Srv(*desc)]);
            pbs.srv_transitions[slot] = SubresourceRange {
                resource: desc.resource,
                backbuffer: 0,
                first: 0,
                num: sub_count,
            };
        }
        Ok(())
    }

    fn update_uavs(&self, handle: Handle, base: u32, descs: &[BindingUav]) -> Result<()> {
        let mut pbs = self.pipeline_binding_sets.write(handle);
        if !pbs.is_live() {
            return Err(Error::InvalidArgument);
        }
        if (base as usize + descs.len()) > pbs.uav_transitions.len() {
            return Err(Error::InvalidArgument);
        }
        for (i, desc) in descs.iter().enumerate() {
            let slot = base as usize + i;
            if desc.resource.is_null() {
                pbs.uavs
                    .heap()
                    .write(pbs.uavs.offset + slot as u32, &[Descriptor::Null(DescriptorHeapSubType::Uav)]);
                pbs.uav_transitions[slot] = SubresourceRange::default();
                continue;
            }
            let (supported, sub_count) = match desc.resource.kind() {
                Some(ResourceKind::Buffer) => {
                    (self.buffers.read(desc.resource)?.states.supported, 1)
                }
                Some(ResourceKind::Texture) => {
                    let texture = self.textures.read(desc.resource)?;
                    (texture.states.supported, texture.sub_resource_count)
                }
                _ => return Err(Error::InvalidArgument),
            };
            if !supported.contains(ResourceState::UNORDERED_ACCESS) {
                return Err(Error::InvalidArgument);
            }
            pbs.uavs
                .heap()
                .write(pbs.uavs.offset + slot as u32, &[Descriptor::Uav(*desc)]);
            pbs.uav_transitions[slot] = SubresourceRange {
                resource: desc.resource,
                backbuffer: 0,
                first: 0,
                num: sub_count,
            };
        }
        Ok(())
    }

    fn update_samplers(&self, handle: Handle, base: u32, descs: &[SamplerState]) -> Result<()> {
        let pbs = self.pipeline_binding_sets.write(handle);
        if !pbs.is_live() {
            return Err(Error::InvalidArgument);
        }
        if base + descs.len() as u32 > pbs.samplers.size {
            return Err(Error::InvalidArgument);
        }
        let descriptors: Vec<Descriptor> = descs.iter().map(|s| Descriptor::Sampler(*s)).collect();
        pbs.samplers
            .heap()
            .write(pbs.samplers.offset + base, &descriptors);
        Ok(())
    }

    fn copy_pipeline_bindings(
        &self,
        dst: &[PipelineBinding],
        src: &[PipelineBinding],
    ) -> Result<()> {
        for (dst_pb, src_pb) in dst.iter().zip(src.iter()) {
            if dst_pb.cbvs.num != src_pb.cbvs.num
                || dst_pb.srvs.num != src_pb.srvs.num
                || dst_pb.uavs.num != src_pb.uavs.num
                || dst_pb.samplers.num != src_pb.samplers.num
            {
                return Err(Error::InvalidArgument);
            }
            if dst_pb.pbs == src_pb.pbs {
                return Err(Error::InvalidArgument);
            }

            let src_set = self.pipeline_binding_sets.read(src_pb.pbs)?;
            let mut dst_set = self.pipeline_binding_sets.write(dst_pb.pbs);
            if !src_set.is_live() || !dst_set.is_live() {
                return Err(Error::InvalidArgument);
            }
            let dst_set = &mut *dst_set;

            copy_binding_class(
                &dst_set.cbvs,
                dst_pb.cbvs,
                &mut dst_set.cbv_transitions,
                &src_set.cbvs,
                src_pb.cbvs,
                &src_set.cbv_transitions,
            )?;
            copy_binding_class(
                &dst_set.srvs,
                dst_pb.srvs,
                &mut dst_set.srv_transitions,
                &src_set.srvs,
                src_pb.srvs,
                &src_set.srv_transitions,
            )?;
            copy_binding_class(
                &dst_set.uavs,
                dst_pb.uavs,
                &mut dst_set.uav_transitions,
                &src_set.uavs,
                src_pb.uavs,
                &src_set.uav_transitions,
            )?;
            // Samplers carry no transitions.
            if src_pb.samplers.num > 0 {
                DescriptorHeap::copy_descriptors(
                    dst_set.samplers.heap(),
                    dst_set.samplers.offset + dst_pb.samplers.base,
                    src_set.samplers.heap(),
                    src_set.samplers.offset + src_pb.samplers.base,
                    src_pb.samplers.num,
                );
            }
        }
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Command lists.

    fn compile_command_list(&self, handle: Handle, command_list: &CommandList) -> Result<()> {
        let device = self.device()?;
        let frame_idx = device.frame_idx();
        if !self.command_lists.read(handle)?.is_live() {
            return Err(Error::InvalidArgument);
        }

        // Build the native stream first; the target list stays untouched on
        // failure apart from being left closed and empty.
        let compiled = CompileContext::new(self, command_list).run();

        let mut list = self.command_lists.write(handle);
        list.open(frame_idx)?;
        match compiled {
            Ok(ops) => {
                for op in ops {
                    list.push(op);
                }
                list.mark_recorded(command_list.queue_type())?;
                list.close()
            }
            Err(e) => {
                log::error!("command list compile failed: {}", e);
                list.abort();
                Err(e)
            }
        }
    }

    fn submit_command_lists(&self, handles: &[Handle]) -> Result<()> {
        let device = self.device()?;
        for handle in handles {
            let (ops, queue) = {
                let mut list = self.command_lists.write(*handle);
                if !list.is_live() {
                    return Err(Error::InvalidArgument);
                }
                let required = list.queue_type();
                // The compiler recorded the queue class; route accordingly.
                let queue = if required.contains(CommandQueueType::GRAPHICS) {
                    QueueKind::Direct
                } else if required.contains(CommandQueueType::COMPUTE) {
                    QueueKind::AsyncCompute
                } else if required.contains(CommandQueueType::COPY) {
                    QueueKind::Copy
                } else {
                    QueueKind::Direct
                };
                (list.submit()?, queue)
            };
            device.execute(queue, ops);
        }
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Swap chains.

    fn present_swap_chain(&self, handle: Handle) -> Result<()> {
        let mut swap_chain = self.swap_chains.write(handle);
        if !swap_chain.is_live() {
            return Err(Error::InvalidArgument);
        }
        swap_chain.bb_idx = (swap_chain.bb_idx + 1) % swap_chain.textures.len() as u32;
        log::trace!("present: back buffer now {}", swap_chain.bb_idx);
        Ok(())
    }

    fn resize_swap_chain(&self, handle: Handle, width: u32, height: u32) -> Result<()> {
        // Drain every in-flight frame before touching the back buffers.
        self.device()?.wait_idle();

        let desc = {
            let swap_chain = self.swap_chains.read(handle)?;
            if !swap_chain.is_live() {
                return Err(Error::InvalidArgument);
            }
            SwapChainDesc {
                width,
                height,
                ..swap_chain.desc
            }
        };
        let debug_name = self.swap_chains.read(handle)?.debug_name.clone();
        let textures = (0..desc.buffer_count)
            .map(|idx| self.make_backbuffer(&desc, idx, &debug_name))
            .collect::<Result<Vec<_>>>()?;

        let mut swap_chain = self.swap_chains.write(handle);
        swap_chain.desc = desc;
        swap_chain.textures = textures;
        swap_chain.bb_idx = 0;
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Fences and readback.

    fn signal_fence(&self, handle: Handle, value: u64) -> Result<()> {
        let inner = {
            let fence = self.fences.read(handle)?;
            fence.inner.clone().ok_or(Error::InvalidArgument)?
        };
        self.device()?.signal(QueueKind::Direct, inner, value);
        Ok(())
    }

    fn wait_fence(&self, handle: Handle, value: u64) -> Result<()> {
        let inner = {
            let fence = self.fences.read(handle)?;
            fence.inner.clone().ok_or(Error::InvalidArgument)?
        };
        inner.wait(value);
        Ok(())
    }

    fn fence_completed_value(&self, handle: Handle) -> Result<u64> {
        let fence = self.fences.read(handle)?;
        Ok(fence
            .inner
            .as_ref()
            .ok_or(Error::InvalidArgument)?
            .completed_value())
    }

    fn readback_buffer(&self, handle: Handle, offset: u64, dest: &mut [u8]) -> Result<()> {
        let buffer = self.buffers.read(handle)?;
        let storage = buffer.storage.as_ref().ok_or(Error::InvalidArgument)?;
        let storage = storage.lock().unwrap();
        let start = offset as usize;
        let end = start + dest.len();
        if end > storage.len() {
            return Err(Error::InvalidArgument);
        }
        dest.copy_from_slice(&storage[start..end]);
        Ok(())
    }

    fn readback_texture_subresource(
        &self,
        handle: Handle,
        sub_resource_idx: u32,
        dest: &mut TextureSubResourceDataMut,
    ) -> Result<()> {
        let texture = self.textures.read(handle)?;
        let storage = texture.storage.as_ref().ok_or(Error::InvalidArgument)?;
        let sub = texture.sub_layout(sub_resource_idx)?;

        let dst_footprint = texture_footprint(
            texture.desc.format,
            sub.width,
            sub.height,
            sub.depth,
            Some(dest.row_pitch),
            Some(dest.slice_pitch),
        )?;
        let storage = storage.lock().unwrap();
        let src =
            &storage[sub.offset as usize..(sub.offset + sub.footprint.total_bytes) as usize];
        tachyon_gpu::format::copy_texture_data(
            dest.data,
            &dst_footprint,
            src,
            &sub.footprint,
            sub.footprint.num_rows,
            sub.depth,
        )
    }

    //----------------------------------------------------------------------------------------------

    fn next_frame(&self) {
        if let Ok(device) = self.device() {
            device.next_frame();
        }
    }
}

/// Copies one binding class between two sets: descriptors plus the cached
/// transition ranges the compiler consumes.
fn copy_binding_class(
    dst_alloc: &crate::descriptor::DescriptorAllocation,
    dst_range: BindingRange,
    dst_transitions: &mut [SubresourceRange],
    src_alloc: &crate::descriptor::DescriptorAllocation,
    src_range: BindingRange,
    src_transitions: &[SubresourceRange],
) -> Result<()> {
    if src_range.num == 0 {
        return Ok(());
    }
    if (src_range.base + src_range.num) as usize > src_transitions.len()
        || (dst_range.base + dst_range.num) as usize > dst_transitions.len()
    {
        return Err(Error::InvalidArgument);
    }
    DescriptorHeap::copy_descriptors(
        dst_alloc.heap(),
        dst_alloc.offset + dst_range.base,
        src_alloc.heap(),
        src_alloc.offset + src_range.base,
        src_range.num,
    );
    let src_slice =
        &src_transitions[src_range.base as usize..(src_range.base + src_range.num) as usize];
    dst_transitions[dst_range.base as usize..(dst_range.base + dst_range.num) as usize]
        .copy_from_slice(src_slice);
    Ok(())
}
