//! Backend-side resource records stored in the pools.

use crate::descriptor::DescriptorAllocation;
use std::sync::{Arc, Condvar, Mutex};
use tachyon_gpu::error::{Error, Result};
use tachyon_gpu::format::{format_info, texture_footprint, Footprint};
use tachyon_gpu::handle::Handle;
use tachyon_gpu::resources::*;
use tachyon_gpu::types::*;

/// CPU-side memory standing in for a native GPU allocation.
pub type Storage = Arc<Mutex<Vec<u8>>>;

pub fn new_storage(size: u64) -> Storage {
    Arc::new(Mutex::new(vec![0u8; size as usize]))
}

/// Identity of a tracked resource in the state tracker. Swap-chain accesses
/// resolve to one entry per back buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TrackKey {
    pub handle: Handle,
    pub backbuffer: u32,
}

impl TrackKey {
    pub fn new(handle: Handle) -> TrackKey {
        TrackKey {
            handle,
            backbuffer: 0,
        }
    }
}

/// Legal states plus the resting state of a resource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ResourceStates {
    pub supported: ResourceState,
    pub default: ResourceState,
}

/// The resource states a set of bind flags makes reachable.
pub fn resource_states(bind_flags: BindFlags) -> ResourceState {
    let mut states = ResourceState::COMMON;
    if bind_flags.intersects(BindFlags::VERTEX_BUFFER | BindFlags::CONSTANT_BUFFER) {
        states |= ResourceState::VERTEX_AND_CONSTANT_BUFFER;
    }
    if bind_flags.contains(BindFlags::INDEX_BUFFER) {
        states |= ResourceState::INDEX_BUFFER;
    }
    if bind_flags.contains(BindFlags::INDIRECT_BUFFER) {
        states |= ResourceState::INDIRECT_ARGUMENT;
    }
    if bind_flags.contains(BindFlags::SHADER_RESOURCE) {
        states |= ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE;
    }
    if bind_flags.contains(BindFlags::UNORDERED_ACCESS) {
        states |= ResourceState::UNORDERED_ACCESS;
    }
    if bind_flags.contains(BindFlags::RENDER_TARGET) {
        states |= ResourceState::RENDER_TARGET;
    }
    if bind_flags.contains(BindFlags::DEPTH_STENCIL) {
        states |= ResourceState::DEPTH_WRITE | ResourceState::DEPTH_READ;
    }
    if bind_flags.contains(BindFlags::PRESENT) {
        states |= ResourceState::PRESENT;
    }
    states
}

/// The single state a resource rests in between command lists.
pub fn default_resource_state(bind_flags: BindFlags) -> ResourceState {
    if bind_flags.contains(BindFlags::PRESENT) {
        ResourceState::PRESENT
    } else if bind_flags.contains(BindFlags::DEPTH_STENCIL) {
        ResourceState::DEPTH_WRITE
    } else if bind_flags.contains(BindFlags::RENDER_TARGET) {
        ResourceState::RENDER_TARGET
    } else if bind_flags.contains(BindFlags::UNORDERED_ACCESS) {
        ResourceState::UNORDERED_ACCESS
    } else if bind_flags.contains(BindFlags::SHADER_RESOURCE) {
        ResourceState::PIXEL_SHADER_RESOURCE | ResourceState::NON_PIXEL_SHADER_RESOURCE
    } else if bind_flags.intersects(BindFlags::VERTEX_BUFFER | BindFlags::CONSTANT_BUFFER) {
        ResourceState::VERTEX_AND_CONSTANT_BUFFER
    } else if bind_flags.contains(BindFlags::INDEX_BUFFER) {
        ResourceState::INDEX_BUFFER
    } else if bind_flags.contains(BindFlags::INDIRECT_BUFFER) {
        ResourceState::INDIRECT_ARGUMENT
    } else {
        ResourceState::COMMON
    }
}

//--------------------------------------------------------------------------------------------------

#[derive(Default)]
pub struct SwBuffer {
    pub desc: BufferDesc,
    pub storage: Option<Storage>,
    pub states: ResourceStates,
    pub debug_name: String,
}

impl SwBuffer {
    pub fn is_live(&self) -> bool {
        self.storage.is_some()
    }
}

/// Byte layout of one texture subresource inside the texture's storage.
#[derive(Copy, Clone, Debug, Default)]
pub struct SubResourceLayout {
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub footprint: Footprint,
}

/// Offsets of every subresource, ordered `mip + mip_levels * array_slice`
/// (cube faces count as array slices).
#[derive(Clone, Debug, Default)]
pub struct TextureLayout {
    pub subs: Vec<SubResourceLayout>,
    pub total_bytes: u64,
}

pub fn texture_layout(desc: &TextureDesc) -> Result<TextureLayout> {
    let info = format_info(desc.format);
    let faces = if desc.texture_type == TextureType::TexCube {
        6
    } else {
        1
    };
    let slices = desc.array_elements * faces;

    let mut layout = TextureLayout::default();
    let mut offset = 0u64;
    for _slice in 0..slices {
        for mip in 0..desc.mip_levels {
            let mut w = (desc.width >> mip).max(1);
            let mut h = (desc.height >> mip).max(1);
            let d = (desc.depth >> mip).max(1);
            // Block formats round the smallest mips up to whole blocks.
            if info.compressed {
                w = round_up(w, info.block_w);
                h = round_up(h, info.block_h);
            }
            let footprint = texture_footprint(desc.format, w, h, d, None, None)?;
            layout.subs.push(SubResourceLayout {
                offset,
                width: w,
                height: h,
                depth: d,
                footprint,
            });
            offset += footprint.total_bytes;
        }
    }
    layout.total_bytes = offset;
    Ok(layout)
}

fn round_up(value: u32, multiple: u32) -> u32 {
    (value + multiple - 1) / multiple * multiple
}

#[derive(Default)]
pub struct SwTexture {
    pub desc: TextureDesc,
    pub storage: Option<Storage>,
    pub layout: TextureLayout,
    pub states: ResourceStates,
    pub sub_resource_count: u32,
    pub debug_name: String,
}

impl SwTexture {
    pub fn is_live(&self) -> bool {
        self.storage.is_some()
    }

    pub fn sub_layout(&self, sub_resource_idx: u32) -> Result<&SubResourceLayout> {
        self.layout
            .subs
            .get(sub_resource_idx as usize)
            .ok_or(Error::InvalidArgument)
    }
}

#[derive(Default)]
pub struct SwSwapChain {
    pub desc: SwapChainDesc,
    pub textures: Vec<SwTexture>,
    pub bb_idx: u32,
    pub debug_name: String,
}

impl SwSwapChain {
    pub fn is_live(&self) -> bool {
        !self.textures.is_empty()
    }
}

#[derive(Default)]
pub struct SwShader {
    pub byte_code: Vec<u8>,
    pub debug_name: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RootSignatureKind {
    Graphics,
    Compute,
}

pub struct SwGraphicsPipelineState {
    pub root_signature: RootSignatureKind,
    pub desc: GraphicsPipelineStateDesc,
    pub live: bool,
    pub debug_name: String,
}

impl Default for SwGraphicsPipelineState {
    fn default() -> SwGraphicsPipelineState {
        SwGraphicsPipelineState {
            root_signature: RootSignatureKind::Graphics,
            desc: GraphicsPipelineStateDesc::default(),
            live: false,
            debug_name: String::new(),
        }
    }
}

pub struct SwComputePipelineState {
    pub root_signature: RootSignatureKind,
    pub shader: Handle,
    pub live: bool,
    pub debug_name: String,
}

impl Default for SwComputePipelineState {
    fn default() -> SwComputePipelineState {
        SwComputePipelineState {
            root_signature: RootSignatureKind::Compute,
            shader: Handle::default(),
            live: false,
            debug_name: String::new(),
        }
    }
}

#[derive(Default)]
pub struct SwSamplerState {
    pub state: Option<SamplerState>,
    pub debug_name: String,
}

/// Subresource span of one tracked resource, as cached on binding sets so
/// the compiler knows what state each bound descriptor demands.
#[derive(Copy, Clone, Debug, Default)]
pub struct SubresourceRange {
    pub resource: Handle,
    /// Back-buffer selector when `resource` is a swap chain.
    pub backbuffer: u32,
    pub first: u32,
    pub num: u32,
}

impl SubresourceRange {
    pub fn is_empty(&self) -> bool {
        self.resource.is_null() || self.num == 0
    }
}

#[derive(Default)]
pub struct SwPipelineBindingSet {
    pub pipeline: Handle,
    pub root_signature: Option<RootSignatureKind>,
    pub cbvs: DescriptorAllocation,
    pub srvs: DescriptorAllocation,
    pub uavs: DescriptorAllocation,
    pub samplers: DescriptorAllocation,
    pub cbv_transitions: Vec<SubresourceRange>,
    pub srv_transitions: Vec<SubresourceRange>,
    pub uav_transitions: Vec<SubresourceRange>,
    pub shader_visible: bool,
    pub temporary: bool,
    pub debug_name: String,
}

impl SwPipelineBindingSet {
    pub fn is_live(&self) -> bool {
        self.root_signature.is_some()
    }
}

#[derive(Default)]
pub struct SwDrawBindingSet {
    pub desc: DrawBindingSetDesc,
    pub live: bool,
    pub debug_name: String,
}

#[derive(Default)]
pub struct SwFrameBindingSet {
    pub desc: FrameBindingSetDesc,
    pub rtvs: DescriptorAllocation,
    pub dsv: DescriptorAllocation,
    /// `num_buffers x MAX_BOUND_RTVS` entries; buffer-major like the RTV
    /// descriptor layout.
    pub rtv_resources: Vec<SubresourceRange>,
    pub dsv_resource: SubresourceRange,
    pub swap_chain: Handle,
    pub num_rtvs: u32,
    pub num_buffers: u32,
    pub debug_name: String,
}

impl SwFrameBindingSet {
    pub fn is_live(&self) -> bool {
        self.num_buffers > 0
    }

    pub fn rtv_resource(&self, buffer_idx: u32, rtv_idx: u32) -> &SubresourceRange {
        &self.rtv_resources[(buffer_idx as usize) * MAX_BOUND_RTVS + rtv_idx as usize]
    }
}

//--------------------------------------------------------------------------------------------------

/// Native fence object: a monotonically signalled counter plus the condition
/// variable standing in for the OS event.
pub struct FenceInner {
    value: Mutex<u64>,
    cond: Condvar,
}

impl FenceInner {
    pub fn new(initial_value: u64) -> FenceInner {
        FenceInner {
            value: Mutex::new(initial_value),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self, value: u64) {
        let mut current = self.value.lock().unwrap();
        if value > *current {
            *current = value;
            self.cond.notify_all();
        }
    }

    pub fn completed_value(&self) -> u64 {
        *self.value.lock().unwrap()
    }

    /// Blocks until the completed value reaches `value`. Wait-forever; higher
    /// layers implement timeouts by polling `completed_value`.
    pub fn wait(&self, value: u64) {
        let mut current = self.value.lock().unwrap();
        while *current < value {
            current = self.cond.wait(current).unwrap();
        }
    }
}

#[derive(Default)]
pub struct SwFence {
    pub inner: Option<Arc<FenceInner>>,
    pub debug_name: String,
}

impl SwFence {
    pub fn is_live(&self) -> bool {
        self.inner.is_some()
    }
}
