//! Resource and binding-set descriptions passed to the facade at creation.

use crate::format::Format;
use crate::handle::Handle;
use crate::types::*;

/// Opaque native window handle supplied by the windowing layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct WindowHandle(pub usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub buffer_count: u32,
    pub window: WindowHandle,
}

impl Default for SwapChainDesc {
    fn default() -> SwapChainDesc {
        SwapChainDesc {
            width: 0,
            height: 0,
            format: Format::R8G8B8A8_UNORM,
            buffer_count: 2,
            window: WindowHandle::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct BufferDesc {
    pub size: u64,
    pub bind_flags: BindFlags,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TextureDesc {
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_elements: u32,
    pub mip_levels: u32,
    pub format: Format,
    pub bind_flags: BindFlags,
}

impl Default for TextureDesc {
    fn default() -> TextureDesc {
        TextureDesc {
            texture_type: TextureType::Tex2d,
            width: 1,
            height: 1,
            depth: 1,
            array_elements: 1,
            mip_levels: 1,
            format: Format::R8G8B8A8_UNORM,
            bind_flags: BindFlags::empty(),
        }
    }
}

impl TextureDesc {
    /// `mips x array elements x (6 if cube)`.
    pub fn sub_resource_count(&self) -> u32 {
        let faces = if self.texture_type == TextureType::TexCube {
            6
        } else {
            1
        };
        self.mip_levels * self.array_elements * faces
    }
}

/// One subresource worth of pixel data, with explicit pitches.
#[derive(Copy, Clone, Debug)]
pub struct TextureSubResourceData<'a> {
    pub data: &'a [u8],
    pub row_pitch: u32,
    pub slice_pitch: u32,
}

/// Mutable variant used by readback.
#[derive(Debug)]
pub struct TextureSubResourceDataMut<'a> {
    pub data: &'a mut [u8],
    pub row_pitch: u32,
    pub slice_pitch: u32,
}

/// Compiled shader bytecode. Taken as an opaque blob.
#[derive(Copy, Clone, Debug)]
pub struct ShaderDesc<'a> {
    pub shader_type: ShaderType,
    pub data: &'a [u8],
}

#[derive(Clone, Debug, PartialEq)]
pub struct GraphicsPipelineStateDesc {
    /// One slot per graphics stage, indexed by `ShaderType`. Null = unused.
    pub shaders: [Handle; NUM_GRAPHICS_SHADER_TYPES],
    pub render_state: RenderState,
    pub vertex_elements: [VertexElement; MAX_VERTEX_ELEMENTS],
    pub num_vertex_elements: usize,
    pub topology: PrimitiveTopology,
    pub num_rtvs: usize,
    pub rtv_formats: [Format; MAX_BOUND_RTVS],
    pub dsv_format: Format,
}

impl Default for GraphicsPipelineStateDesc {
    fn default() -> GraphicsPipelineStateDesc {
        GraphicsPipelineStateDesc {
            shaders: [Handle::default(); NUM_GRAPHICS_SHADER_TYPES],
            render_state: RenderState::default(),
            vertex_elements: [VertexElement {
                stream_idx: 0,
                offset: 0,
                format: Format::UNKNOWN,
                usage: VertexUsage::Position,
                usage_idx: 0,
            }; MAX_VERTEX_ELEMENTS],
            num_vertex_elements: 0,
            topology: PrimitiveTopology::TriangleList,
            num_rtvs: 0,
            rtv_formats: [Format::UNKNOWN; MAX_BOUND_RTVS],
            dsv_format: Format::UNKNOWN,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ComputePipelineStateDesc {
    pub shader: Handle,
}

/// Descriptor table shape of a pipeline binding set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct PipelineBindingSetDesc {
    /// Pipeline state this binding set feeds (graphics or compute).
    pub pipeline: Handle,
    pub num_cbvs: u32,
    pub num_srvs: u32,
    pub num_uavs: u32,
    pub num_samplers: u32,
    pub shader_visible: bool,
}

//--------------------------------------------------------------------------------------------------
// Draw binding set.

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct VertexBufferBinding {
    pub resource: Handle,
    pub offset: u64,
    pub size: u32,
    pub stride: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct IndexBufferBinding {
    pub resource: Handle,
    pub offset: u64,
    pub size: u32,
    /// Bytes per index; 2 or 4.
    pub stride: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct DrawBindingSetDesc {
    pub vbs: [VertexBufferBinding; MAX_VERTEX_STREAMS],
    pub ib: IndexBufferBinding,
}

//--------------------------------------------------------------------------------------------------
// Frame binding set.

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct BindingRtv {
    /// Texture, or (RTV[0] only) a swap chain.
    pub resource: Handle,
    pub format: Format,
    pub dimension: ViewDimension,
    pub mip_slice: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
    /// Plane slice for 2D views, first W slice for 3D views.
    pub plane_slice_or_first_w: u32,
    pub w_size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct BindingDsv {
    pub resource: Handle,
    pub format: Format,
    pub dimension: ViewDimension,
    pub flags: DsvFlags,
    pub mip_slice: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct FrameBindingSetDesc {
    pub rtvs: [BindingRtv; MAX_BOUND_RTVS],
    pub dsv: BindingDsv,
}

impl FrameBindingSetDesc {
    pub fn num_rtvs(&self) -> usize {
        self.rtvs.iter().take_while(|rtv| !rtv.resource.is_null()).count()
    }
}

//--------------------------------------------------------------------------------------------------
// Shader-visible bindings written into a pipeline binding set.

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct BindingCbv {
    pub resource: Handle,
    pub offset: u64,
    pub size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct BindingSrv {
    pub resource: Handle,
    pub format: Format,
    pub dimension: ViewDimension,
    /// First mip for texture views.
    pub base_mip: u32,
    /// Mip count for texture views; 0 = the rest of the chain.
    pub mip_levels: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
    /// First element for buffer views.
    pub first_element: u32,
    pub num_elements: u32,
    pub structure_byte_stride: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct BindingUav {
    pub resource: Handle,
    pub format: Format,
    pub dimension: ViewDimension,
    pub mip_slice: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
    pub first_element: u32,
    pub num_elements: u32,
    pub structure_byte_stride: u32,
}

/// Range of one binding class inside a pipeline binding set.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct BindingRange {
    pub base: u32,
    pub num: u32,
}

/// Slice of a pipeline binding set, used when copying bindings between sets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct PipelineBinding {
    pub pbs: Handle,
    pub cbvs: BindingRange,
    pub srvs: BindingRange,
    pub uavs: BindingRange,
    pub samplers: BindingRange,
}
