//! Backend contract.
//!
//! A backend is the replaceable native half of the abstraction (D3D12,
//! Vulkan, Metal, or the bundled software implementation). It is selected at
//! runtime either directly, or through a shared-library plugin exporting a
//! single entry returning a [`BackendPlugin`] descriptor.

use crate::command_list::CommandList;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::resources::*;
use crate::types::{DebugFlags, SamplerState};
use std::path::Path;

/// Parameters handed to a backend at creation.
#[derive(Copy, Clone, Debug, Default)]
pub struct SetupParams {
    pub debug_flags: DebugFlags,
    /// Opaque native window handle from the windowing layer.
    pub device_window: WindowHandle,
}

/// A physical adapter plus its driver presentation.
#[derive(Clone, Debug, Default)]
pub struct AdapterInfo {
    pub description: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub dedicated_video_memory: u64,
    pub dedicated_system_memory: u64,
    pub shared_system_memory: u64,
}

/// Operations every backend must provide. All methods use interior
/// synchronisation; the facade calls them from multiple threads.
///
/// Creation calls receive the pre-allocated handle that will identify the
/// resource, plus a debug name recorded for logging and validation output.
pub trait Backend: Send + Sync {
    fn enumerate_adapters(&self) -> Result<Vec<AdapterInfo>>;
    fn is_initialized(&self) -> bool;
    fn initialize(&self, adapter_idx: usize) -> Result<()>;

    //----------------------------------------------------------------------------------------------
    // Resource creation/destruction.

    fn create_swap_chain(&self, handle: Handle, desc: &SwapChainDesc, debug_name: &str)
        -> Result<()>;
    fn create_buffer(
        &self,
        handle: Handle,
        desc: &BufferDesc,
        initial_data: Option<&[u8]>,
        debug_name: &str,
    ) -> Result<()>;
    fn create_texture(
        &self,
        handle: Handle,
        desc: &TextureDesc,
        initial_data: Option<&[TextureSubResourceData]>,
        debug_name: &str,
    ) -> Result<()>;
    fn create_sampler_state(
        &self,
        handle: Handle,
        state: &SamplerState,
        debug_name: &str,
    ) -> Result<()>;
    fn create_shader(&self, handle: Handle, desc: &ShaderDesc, debug_name: &str) -> Result<()>;
    fn create_graphics_pipeline_state(
        &self,
        handle: Handle,
        desc: &GraphicsPipelineStateDesc,
        debug_name: &str,
    ) -> Result<()>;
    fn create_compute_pipeline_state(
        &self,
        handle: Handle,
        desc: &ComputePipelineStateDesc,
        debug_name: &str,
    ) -> Result<()>;
    fn create_pipeline_binding_set(
        &self,
        handle: Handle,
        desc: &PipelineBindingSetDesc,
        debug_name: &str,
    ) -> Result<()>;
    fn create_draw_binding_set(
        &self,
        handle: Handle,
        desc: &DrawBindingSetDesc,
        debug_name: &str,
    ) -> Result<()>;
    fn create_frame_binding_set(
        &self,
        handle: Handle,
        desc: &FrameBindingSetDesc,
        debug_name: &str,
    ) -> Result<()>;
    fn create_command_list(&self, handle: Handle, debug_name: &str) -> Result<()>;
    fn create_fence(&self, handle: Handle, initial_value: u64, debug_name: &str) -> Result<()>;
    fn destroy_resource(&self, handle: Handle) -> Result<()>;

    //----------------------------------------------------------------------------------------------
    // Pipeline binding updates.

    /// Allocates a transient binding set from the per-frame descriptor
    /// stream. Valid for the current frame only.
    fn alloc_temporary_pipeline_binding_set(
        &self,
        handle: Handle,
        desc: &PipelineBindingSetDesc,
    ) -> Result<()>;
    fn update_cbvs(&self, handle: Handle, base: u32, descs: &[BindingCbv]) -> Result<()>;
    fn update_srvs(&self, handle: Handle, base: u32, descs: &[BindingSrv]) -> Result<()>;
    fn update_uavs(&self, handle: Handle, base: u32, descs: &[BindingUav]) -> Result<()>;
    fn update_samplers(&self, handle: Handle, base: u32, descs: &[SamplerState]) -> Result<()>;
    fn copy_pipeline_bindings(&self, dst: &[PipelineBinding], src: &[PipelineBinding])
        -> Result<()>;

    //----------------------------------------------------------------------------------------------
    // Command list management.

    fn compile_command_list(&self, handle: Handle, command_list: &CommandList) -> Result<()>;
    fn submit_command_lists(&self, handles: &[Handle]) -> Result<()>;

    //----------------------------------------------------------------------------------------------
    // Swap chain management.

    fn present_swap_chain(&self, handle: Handle) -> Result<()>;
    fn resize_swap_chain(&self, handle: Handle, width: u32, height: u32) -> Result<()>;

    //----------------------------------------------------------------------------------------------
    // Fences and readback.

    fn signal_fence(&self, handle: Handle, value: u64) -> Result<()>;
    fn wait_fence(&self, handle: Handle, value: u64) -> Result<()>;
    fn fence_completed_value(&self, handle: Handle) -> Result<u64>;
    fn readback_buffer(&self, handle: Handle, offset: u64, dest: &mut [u8]) -> Result<()>;
    fn readback_texture_subresource(
        &self,
        handle: Handle,
        sub_resource_idx: u32,
        dest: &mut TextureSubResourceDataMut,
    ) -> Result<()>;

    //----------------------------------------------------------------------------------------------
    // Frame management.

    fn next_frame(&self);
}

//--------------------------------------------------------------------------------------------------
// Plugin loading.

/// Descriptor returned by a backend plugin's entry point.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct BackendPlugin {
    /// Native API this backend drives ("D3D12", "Vulkan", "Software", ...).
    pub api_name: &'static str,
    pub create_backend: fn(&SetupParams) -> Box<dyn Backend>,
    pub destroy_backend: fn(Box<dyn Backend>),
}

impl BackendPlugin {
    /// Plugins that have no special teardown needs can use this; dropping the
    /// box releases the backend.
    pub fn drop_backend(backend: Box<dyn Backend>) {
        drop(backend);
    }
}

/// Entry point a backend shared library must export under
/// [`BACKEND_PLUGIN_ENTRY`].
pub type BackendPluginEntry = extern "C" fn() -> BackendPlugin;

pub const BACKEND_PLUGIN_ENTRY: &[u8] = b"tachyon_gpu_backend\0";

/// A plugin loaded from a shared library. The library stays mapped for as
/// long as this value lives; the descriptor must not outlive it.
pub struct LoadedBackendPlugin {
    pub plugin: BackendPlugin,
    // Dropped last; keeps the code the descriptor points into alive.
    _library: libloading::Library,
}

/// Loads a backend plugin from a shared library at `path`.
pub fn load_backend_plugin(path: &Path) -> Result<LoadedBackendPlugin> {
    unsafe {
        let library = libloading::Library::new(path).map_err(|e| {
            log::error!("failed to load backend plugin {:?}: {}", path, e);
            Error::Fail
        })?;
        let entry: libloading::Symbol<BackendPluginEntry> =
            library.get(BACKEND_PLUGIN_ENTRY).map_err(|e| {
                log::error!("backend plugin {:?} has no entry point: {}", path, e);
                Error::Fail
            })?;
        let plugin = entry();
        log::info!("loaded backend plugin {:?} (api: {})", path, plugin.api_name);
        Ok(LoadedBackendPlugin {
            plugin,
            _library: library,
        })
    }
}
