//! Facade over a backend.
//!
//! The manager owns the handle allocator and the selected backend, dispatches
//! create/destroy/compile/submit traffic, defers destruction behind the
//! in-flight frame window, and latches device loss.

use crate::backend::{Backend, BackendPlugin, LoadedBackendPlugin, SetupParams, AdapterInfo};
use crate::command_list::CommandList;
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleAllocator, ResourceKind};
use crate::resources::*;
use crate::types::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct FrameState {
    frame_idx: u64,
    /// `(retire_frame, handle)`, in enqueue order. A handle retires once
    /// `frame_idx >= retire_frame`, i.e. `MAX_GPU_FRAMES` frames after the
    /// destroy call.
    pending_destroys: VecDeque<(u64, Handle)>,
}

pub struct Manager {
    // Declaration order matters: the backend must drop before the plugin
    // library it was loaded from.
    backend: Option<Box<dyn Backend>>,
    plugin: BackendPlugin,
    _loaded: Option<LoadedBackendPlugin>,
    handles: Arc<HandleAllocator>,
    frame: Mutex<FrameState>,
    device_lost: AtomicBool,
}

impl Manager {
    /// Creates a facade over `plugin`, honouring `TACHYON_DEBUG_RUNTIME=1`
    /// from the environment on top of the requested debug flags.
    pub fn new(plugin: BackendPlugin, mut setup_params: SetupParams) -> Manager {
        if std::env::var("TACHYON_DEBUG_RUNTIME").map(|v| v == "1").unwrap_or(false) {
            log::info!("debug runtime forced on from the environment");
            setup_params.debug_flags |= DebugFlags::DEBUG_RUNTIME;
        }
        log::info!("creating {} backend", plugin.api_name);
        let backend = (plugin.create_backend)(&setup_params);
        Manager {
            backend: Some(backend),
            plugin,
            _loaded: None,
            handles: Arc::new(HandleAllocator::new()),
            frame: Mutex::new(FrameState {
                frame_idx: 0,
                pending_destroys: VecDeque::new(),
            }),
            device_lost: AtomicBool::new(false),
        }
    }

    /// Creates a facade over a plugin loaded from a shared library.
    pub fn from_plugin_file(path: &std::path::Path, setup_params: SetupParams) -> Result<Manager> {
        let loaded = crate::backend::load_backend_plugin(path)?;
        let mut manager = Manager::new(loaded.plugin, setup_params);
        manager._loaded = Some(loaded);
        Ok(manager)
    }

    pub fn api_name(&self) -> &'static str {
        self.plugin.api_name
    }

    pub fn handle_allocator(&self) -> &Arc<HandleAllocator> {
        &self.handles
    }

    /// Convenience: a recorder validating against this facade's handles.
    pub fn create_command_list_recorder(&self) -> CommandList {
        CommandList::new(Arc::clone(&self.handles))
    }

    fn backend(&self) -> &dyn Backend {
        self.backend.as_deref().unwrap()
    }

    /// Wraps a backend call: refuses work once the device is lost, and
    /// latches `DeviceLost` results.
    fn run<T>(&self, f: impl FnOnce(&dyn Backend) -> Result<T>) -> Result<T> {
        if self.device_lost.load(Ordering::Acquire) {
            return Err(Error::DeviceLost);
        }
        let result = f(self.backend());
        if let Err(Error::DeviceLost) = result {
            log::error!("device lost; facade disabled until teardown");
            self.device_lost.store(true, Ordering::Release);
        }
        result
    }

    pub fn enumerate_adapters(&self) -> Result<Vec<AdapterInfo>> {
        self.run(|b| b.enumerate_adapters())
    }

    pub fn initialize(&self, adapter_idx: usize) -> Result<()> {
        self.run(|b| b.initialize(adapter_idx))
    }

    pub fn is_initialized(&self) -> bool {
        self.backend().is_initialized()
    }

    //----------------------------------------------------------------------------------------------
    // Resource creation. Each allocates a handle, forwards to the backend,
    // and rolls the handle back if the backend fails.

    fn create(
        &self,
        kind: ResourceKind,
        f: impl FnOnce(&dyn Backend, Handle) -> Result<()>,
    ) -> Result<Handle> {
        let handle = self.handles.alloc(kind)?;
        match self.run(|b| f(b, handle)) {
            Ok(()) => Ok(handle),
            Err(e) => {
                let _ = self.handles.free(handle);
                Err(e)
            }
        }
    }

    pub fn create_swap_chain(&self, desc: &SwapChainDesc, debug_name: &str) -> Result<Handle> {
        if desc.buffer_count < 1 || desc.width == 0 || desc.height == 0 {
            return Err(Error::InvalidArgument);
        }
        self.create(ResourceKind::SwapChain, |b, h| {
            b.create_swap_chain(h, desc, debug_name)
        })
    }

    pub fn create_buffer(
        &self,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
        debug_name: &str,
    ) -> Result<Handle> {
        if desc.size == 0 {
            return Err(Error::InvalidArgument);
        }
        if let Some(data) = initial_data {
            if data.len() as u64 > desc.size {
                return Err(Error::InvalidArgument);
            }
        }
        self.create(ResourceKind::Buffer, |b, h| {
            b.create_buffer(h, desc, initial_data, debug_name)
        })
    }

    pub fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<&[TextureSubResourceData]>,
        debug_name: &str,
    ) -> Result<Handle> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(Error::InvalidArgument);
        }
        if desc.mip_levels == 0 || desc.array_elements == 0 {
            return Err(Error::InvalidArgument);
        }
        if let Some(data) = initial_data {
            if data.len() != desc.sub_resource_count() as usize {
                return Err(Error::InvalidArgument);
            }
        }
        self.create(ResourceKind::Texture, |b, h| {
            b.create_texture(h, desc, initial_data, debug_name)
        })
    }

    pub fn create_sampler_state(&self, state: &SamplerState, debug_name: &str) -> Result<Handle> {
        self.create(ResourceKind::SamplerState, |b, h| {
            b.create_sampler_state(h, state, debug_name)
        })
    }

    pub fn create_shader(&self, desc: &ShaderDesc, debug_name: &str) -> Result<Handle> {
        if desc.data.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.create(ResourceKind::Shader, |b, h| {
            b.create_shader(h, desc, debug_name)
        })
    }

    pub fn create_graphics_pipeline_state(
        &self,
        desc: &GraphicsPipelineStateDesc,
        debug_name: &str,
    ) -> Result<Handle> {
        if desc.num_vertex_elements > MAX_VERTEX_ELEMENTS || desc.num_rtvs > MAX_BOUND_RTVS {
            return Err(Error::InvalidArgument);
        }
        for shader in &desc.shaders {
            if !shader.is_null() && !self.handles.is_valid_kind(*shader, ResourceKind::Shader) {
                return Err(Error::InvalidArgument);
            }
        }
        if desc.shaders[ShaderType::Vertex as usize].is_null() {
            return Err(Error::InvalidArgument);
        }
        self.create(ResourceKind::GraphicsPipelineState, |b, h| {
            b.create_graphics_pipeline_state(h, desc, debug_name)
        })
    }

    pub fn create_compute_pipeline_state(
        &self,
        desc: &ComputePipelineStateDesc,
        debug_name: &str,
    ) -> Result<Handle> {
        if !self.handles.is_valid_kind(desc.shader, ResourceKind::Shader) {
            return Err(Error::InvalidArgument);
        }
        self.create(ResourceKind::ComputePipelineState, |b, h| {
            b.create_compute_pipeline_state(h, desc, debug_name)
        })
    }

    pub fn create_pipeline_binding_set(
        &self,
        desc: &PipelineBindingSetDesc,
        debug_name: &str,
    ) -> Result<Handle> {
        self.validate_pbs_desc(desc)?;
        self.create(ResourceKind::PipelineBindingSet, |b, h| {
            b.create_pipeline_binding_set(h, desc, debug_name)
        })
    }

    /// Allocates a binding set that lives in the per-frame descriptor stream
    /// instead of the persistent pool. Valid for the current frame only.
    pub fn alloc_temporary_pipeline_binding_set(
        &self,
        desc: &PipelineBindingSetDesc,
    ) -> Result<Handle> {
        self.validate_pbs_desc(desc)?;
        self.create(ResourceKind::PipelineBindingSet, |b, h| {
            b.alloc_temporary_pipeline_binding_set(h, desc)
        })
    }

    fn validate_pbs_desc(&self, desc: &PipelineBindingSetDesc) -> Result<()> {
        if desc.num_cbvs as usize > MAX_CBV_BINDINGS
            || desc.num_srvs as usize > MAX_SRV_BINDINGS
            || desc.num_uavs as usize > MAX_UAV_BINDINGS
            || desc.num_samplers as usize > MAX_SAMPLER_BINDINGS
        {
            return Err(Error::InvalidArgument);
        }
        let is_graphics = self
            .handles
            .is_valid_kind(desc.pipeline, ResourceKind::GraphicsPipelineState);
        let is_compute = self
            .handles
            .is_valid_kind(desc.pipeline, ResourceKind::ComputePipelineState);
        if !is_graphics && !is_compute {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    pub fn create_draw_binding_set(
        &self,
        desc: &DrawBindingSetDesc,
        debug_name: &str,
    ) -> Result<Handle> {
        if !desc.ib.resource.is_null() && desc.ib.stride != 2 && desc.ib.stride != 4 {
            return Err(Error::InvalidArgument);
        }
        for vb in &desc.vbs {
            if !vb.resource.is_null()
                && !self.handles.is_valid_kind(vb.resource, ResourceKind::Buffer)
            {
                return Err(Error::InvalidArgument);
            }
        }
        if !desc.ib.resource.is_null()
            && !self.handles.is_valid_kind(desc.ib.resource, ResourceKind::Buffer)
        {
            return Err(Error::InvalidArgument);
        }
        self.create(ResourceKind::DrawBindingSet, |b, h| {
            b.create_draw_binding_set(h, desc, debug_name)
        })
    }

    pub fn create_frame_binding_set(
        &self,
        desc: &FrameBindingSetDesc,
        debug_name: &str,
    ) -> Result<Handle> {
        // A swap chain may only be bound as RTV[0], and RTVs must be packed
        // without holes.
        let mut seen_hole = false;
        for (idx, rtv) in desc.rtvs.iter().enumerate() {
            if rtv.resource.is_null() {
                seen_hole = true;
                continue;
            }
            if seen_hole {
                return Err(Error::InvalidArgument);
            }
            let is_texture = self.handles.is_valid_kind(rtv.resource, ResourceKind::Texture);
            let is_swap_chain = self
                .handles
                .is_valid_kind(rtv.resource, ResourceKind::SwapChain);
            if !is_texture && !is_swap_chain {
                return Err(Error::InvalidArgument);
            }
            if is_swap_chain && idx != 0 {
                return Err(Error::InvalidArgument);
            }
        }
        if !desc.dsv.resource.is_null()
            && !self.handles.is_valid_kind(desc.dsv.resource, ResourceKind::Texture)
        {
            return Err(Error::InvalidArgument);
        }
        self.create(ResourceKind::FrameBindingSet, |b, h| {
            b.create_frame_binding_set(h, desc, debug_name)
        })
    }

    pub fn create_command_list(&self, debug_name: &str) -> Result<Handle> {
        self.create(ResourceKind::CommandList, |b, h| {
            b.create_command_list(h, debug_name)
        })
    }

    pub fn create_fence(&self, initial_value: u64, debug_name: &str) -> Result<Handle> {
        self.create(ResourceKind::Fence, |b, h| {
            b.create_fence(h, initial_value, debug_name)
        })
    }

    /// Schedules `handle` for destruction once the GPU can no longer be
    /// using it, `MAX_GPU_FRAMES` frames from now. The handle keeps
    /// validating until it actually retires.
    pub fn destroy_resource(&self, handle: Handle) -> Result<()> {
        if !self.handles.is_valid(handle) {
            return Err(Error::InvalidArgument);
        }
        let mut frame = self.frame.lock().unwrap();
        let retire_frame = frame.frame_idx + MAX_GPU_FRAMES;
        frame.pending_destroys.push_back((retire_frame, handle));
        Ok(())
    }

    //----------------------------------------------------------------------------------------------
    // Pipeline binding updates.

    pub fn update_cbvs(&self, handle: Handle, base: u32, descs: &[BindingCbv]) -> Result<()> {
        self.run(|b| b.update_cbvs(handle, base, descs))
    }

    pub fn update_srvs(&self, handle: Handle, base: u32, descs: &[BindingSrv]) -> Result<()> {
        self.run(|b| b.update_srvs(handle, base, descs))
    }

    pub fn update_uavs(&self, handle: Handle, base: u32, descs: &[BindingUav]) -> Result<()> {
        self.run(|b| b.update_uavs(handle, base, descs))
    }

    pub fn update_samplers(&self, handle: Handle, base: u32, descs: &[SamplerState]) -> Result<()> {
        self.run(|b| b.update_samplers(handle, base, descs))
    }

    pub fn copy_pipeline_bindings(
        &self,
        dst: &[PipelineBinding],
        src: &[PipelineBinding],
    ) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::InvalidArgument);
        }
        self.run(|b| b.copy_pipeline_bindings(dst, src))
    }

    //----------------------------------------------------------------------------------------------
    // Command lists.

    pub fn compile_command_list(&self, handle: Handle, command_list: &CommandList) -> Result<()> {
        if !self.handles.is_valid_kind(handle, ResourceKind::CommandList) {
            return Err(Error::InvalidArgument);
        }
        if command_list.event_depth() != 0 {
            return Err(Error::InvalidState);
        }
        self.run(|b| b.compile_command_list(handle, command_list))
    }

    pub fn submit_command_lists(&self, handles: &[Handle]) -> Result<()> {
        for handle in handles {
            if !self.handles.is_valid_kind(*handle, ResourceKind::CommandList) {
                return Err(Error::InvalidArgument);
            }
        }
        for batch in handles.chunks(COMMAND_LIST_BATCH_SIZE) {
            self.run(|b| b.submit_command_lists(batch))?;
        }
        Ok(())
    }

    pub fn submit_command_list(&self, handle: Handle) -> Result<()> {
        self.submit_command_lists(&[handle])
    }

    //----------------------------------------------------------------------------------------------
    // Swap chains.

    pub fn present_swap_chain(&self, handle: Handle) -> Result<()> {
        self.run(|b| b.present_swap_chain(handle))
    }

    pub fn resize_swap_chain(&self, handle: Handle, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument);
        }
        self.run(|b| b.resize_swap_chain(handle, width, height))
    }

    //----------------------------------------------------------------------------------------------
    // Fences and readback.

    pub fn signal_fence(&self, handle: Handle, value: u64) -> Result<()> {
        self.run(|b| b.signal_fence(handle, value))
    }

    pub fn wait_fence(&self, handle: Handle, value: u64) -> Result<()> {
        self.run(|b| b.wait_fence(handle, value))
    }

    pub fn fence_completed_value(&self, handle: Handle) -> Result<u64> {
        self.run(|b| b.fence_completed_value(handle))
    }

    pub fn readback_buffer(&self, handle: Handle, offset: u64, dest: &mut [u8]) -> Result<()> {
        self.run(|b| b.readback_buffer(handle, offset, dest))
    }

    pub fn readback_texture_subresource(
        &self,
        handle: Handle,
        sub_resource_idx: u32,
        dest: &mut TextureSubResourceDataMut,
    ) -> Result<()> {
        self.run(|b| b.readback_texture_subresource(handle, sub_resource_idx, dest))
    }

    //----------------------------------------------------------------------------------------------
    // Frame lifecycle.

    /// Steps the frame. Blocks while the in-flight window is full, then
    /// retires destroys that are now safely past the GPU.
    pub fn next_frame(&self) {
        self.backend().next_frame();

        let retired: Vec<Handle> = {
            let mut frame = self.frame.lock().unwrap();
            frame.frame_idx += 1;
            let frame_idx = frame.frame_idx;
            let mut retired = Vec::new();
            while let Some(&(retire_frame, handle)) = frame.pending_destroys.front() {
                if retire_frame > frame_idx {
                    break;
                }
                frame.pending_destroys.pop_front();
                retired.push(handle);
            }
            retired
        };

        for handle in retired {
            if let Err(e) = self.backend().destroy_resource(handle) {
                log::warn!("deferred destroy of {:?} failed: {}", handle, e);
            }
            let _ = self.handles.free(handle);
        }
    }

    pub fn frame_idx(&self) -> u64 {
        self.frame.lock().unwrap().frame_idx
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        // Flush whatever destruction is still pending; teardown implies the
        // GPU is done with everything.
        let pending: Vec<Handle> = {
            let mut frame = self.frame.lock().unwrap();
            frame.pending_destroys.drain(..).map(|(_, h)| h).collect()
        };
        if let Some(backend) = self.backend.take() {
            for handle in pending {
                let _ = backend.destroy_resource(handle);
                let _ = self.handles.free(handle);
            }
            (self.plugin.destroy_backend)(backend);
        }
    }
}
