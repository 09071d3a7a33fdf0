//! Shared enums, flag sets and fixed-function state for the abstraction.

use crate::format::{format_info, Format};
use bitflags::bitflags;

//--------------------------------------------------------------------------------------------------
// Capacities. Backends must honour these.

pub const MAX_BOUND_RTVS: usize = 8;
pub const MAX_CBV_BINDINGS: usize = 8;
pub const MAX_SRV_BINDINGS: usize = 32;
pub const MAX_UAV_BINDINGS: usize = 8;
pub const MAX_SAMPLER_BINDINGS: usize = 16;
pub const MAX_VERTEX_STREAMS: usize = 16;
pub const MAX_VERTEX_ELEMENTS: usize = 16;

/// Maximum number of CPU-submitted, not-yet-completed frames.
pub const MAX_GPU_FRAMES: u64 = 3;

/// Default alignment of upload-heap allocations.
pub const UPLOAD_DEFAULT_ALIGN: u64 = 256;
/// Largest alignment an upload-heap allocation may request.
pub const UPLOAD_MAX_ALIGN: u64 = 64 * 1024;

/// Command lists are submitted to a queue in batches of this many.
pub const COMMAND_LIST_BATCH_SIZE: usize = 32;

//--------------------------------------------------------------------------------------------------

bitflags! {
    /// How a buffer or texture may be bound to the pipeline.
    #[derive(Default)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const CONSTANT_BUFFER = 0x4;
        const INDIRECT_BUFFER = 0x8;
        const SHADER_RESOURCE = 0x10;
        const UNORDERED_ACCESS = 0x20;
        const RENDER_TARGET = 0x40;
        const DEPTH_STENCIL = 0x80;
        const PRESENT = 0x100;
    }
}

bitflags! {
    /// Resource states tracked by the command-list compiler.
    ///
    /// `COMMON` is the empty set. A resource record stores the set of states
    /// it may legally be transitioned through (`supported_states`) and the
    /// single state it rests in between command lists (`default_state`).
    #[derive(Default)]
    pub struct ResourceState: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const INDIRECT_ARGUMENT = 0x100;
        const COPY_DEST = 0x200;
        const COPY_SOURCE = 0x400;
        const PRESENT = 0x800;
    }
}

impl ResourceState {
    pub const COMMON: ResourceState = ResourceState::empty();
}

bitflags! {
    /// Queue classes a command list may require. Ordered by capability:
    /// a graphics queue can consume compute and copy work, a compute queue
    /// can consume copy work.
    #[derive(Default)]
    pub struct CommandQueueType: u8 {
        const COPY = 0x1;
        const COMPUTE = 0x2;
        const GRAPHICS = 0x4;
    }
}

impl CommandQueueType {
    /// True if a queue of class `self` can execute a list requiring `required`.
    pub fn can_execute(self, required: CommandQueueType) -> bool {
        let rank = |q: CommandQueueType| {
            if q.contains(CommandQueueType::GRAPHICS) {
                3
            } else if q.contains(CommandQueueType::COMPUTE) {
                2
            } else if q.contains(CommandQueueType::COPY) {
                1
            } else {
                0
            }
        };
        rank(self) >= rank(required)
    }
}

bitflags! {
    /// Debug switches forwarded to the backend at setup.
    #[derive(Default)]
    pub struct DebugFlags: u32 {
        /// Enable deep semantic validation in the command-list compiler.
        const DEBUG_RUNTIME = 0x1;
        /// Ask the native runtime for GPU-based validation if it has any.
        const GPU_BASED_VALIDATION = 0x2;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct DsvFlags: u32 {
        const READ_ONLY_DEPTH = 0x1;
        const READ_ONLY_STENCIL = 0x2;
    }
}

//--------------------------------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TextureType {
    Tex1d,
    Tex2d,
    Tex3d,
    TexCube,
}

impl Default for TextureType {
    fn default() -> TextureType {
        TextureType::Tex2d
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ViewDimension {
    Invalid,
    Buffer,
    Tex1d,
    Tex1dArray,
    Tex2d,
    Tex2dArray,
    Tex3d,
    TexCube,
    TexCubeArray,
}

impl Default for ViewDimension {
    fn default() -> ViewDimension {
        ViewDimension::Invalid
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

impl Default for PrimitiveTopology {
    fn default() -> PrimitiveTopology {
        PrimitiveTopology::TriangleList
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(usize)]
pub enum ShaderType {
    Vertex,
    Hull,
    Domain,
    Geometry,
    Pixel,
    Compute,
}

pub const NUM_GRAPHICS_SHADER_TYPES: usize = ShaderType::Pixel as usize + 1;

//--------------------------------------------------------------------------------------------------
// Fixed-function state.

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FillMode {
    Solid,
    Wireframe,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlendState {
    pub enable: bool,
    pub src_blend: BlendFactor,
    pub dst_blend: BlendFactor,
    pub blend_op: BlendOp,
    pub src_blend_alpha: BlendFactor,
    pub dst_blend_alpha: BlendFactor,
    pub blend_op_alpha: BlendOp,
    pub write_mask: u8,
}

impl Default for BlendState {
    fn default() -> BlendState {
        BlendState {
            enable: false,
            src_blend: BlendFactor::One,
            dst_blend: BlendFactor::Zero,
            blend_op: BlendOp::Add,
            src_blend_alpha: BlendFactor::One,
            dst_blend_alpha: BlendFactor::Zero,
            blend_op_alpha: BlendOp::Add,
            write_mask: 0xf,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StencilFaceState {
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub func: CompareOp,
}

impl Default for StencilFaceState {
    fn default() -> StencilFaceState {
        StencilFaceState {
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Keep,
            func: CompareOp::Always,
        }
    }
}

/// Immutable rasteriser/output-merger state baked into a graphics pipeline.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RenderState {
    pub blend_states: [BlendState; MAX_BOUND_RTVS],
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_func: CompareOp,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub stencil_front: StencilFaceState,
    pub stencil_back: StencilFaceState,
}

impl Default for RenderState {
    fn default() -> RenderState {
        RenderState {
            blend_states: [BlendState::default(); MAX_BOUND_RTVS],
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            depth_enable: false,
            depth_write: true,
            depth_func: CompareOp::GreaterOrEqual,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            stencil_front: StencilFaceState::default(),
            stencil_back: StencilFaceState::default(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Samplers.

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AddressingMode {
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FilteringMode {
    Nearest,
    Linear,
}

/// Value-only sampler description.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SamplerState {
    pub address_u: AddressingMode,
    pub address_v: AddressingMode,
    pub address_w: AddressingMode,
    pub min_filter: FilteringMode,
    pub mag_filter: FilteringMode,
    pub mip_filter: FilteringMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub compare: Option<CompareOp>,
    pub border_color: [f32; 4],
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerState {
    fn default() -> SamplerState {
        SamplerState {
            address_u: AddressingMode::Wrap,
            address_v: AddressingMode::Wrap,
            address_w: AddressingMode::Wrap,
            min_filter: FilteringMode::Nearest,
            mag_filter: FilteringMode::Nearest,
            mip_filter: FilteringMode::Nearest,
            mip_lod_bias: 0.0,
            max_anisotropy: 1,
            compare: None,
            border_color: [1.0; 4],
            min_lod: std::f32::MIN,
            max_lod: std::f32::MAX,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Per-draw dynamic state and geometry descriptions.

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub z_min: f32,
    pub z_max: f32,
}

impl Default for Viewport {
    fn default() -> Viewport {
        Viewport {
            x: 0.0,
            y: 0.0,
            w: 0.0,
            h: 0.0,
            z_min: 0.0,
            z_max: 1.0,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Dynamic state recorded alongside a draw.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct DrawState {
    pub viewport: Viewport,
    pub scissor_rect: ScissorRect,
    pub stencil_ref: u8,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VertexUsage {
    Position,
    Normal,
    Texcoord,
    Color,
    Tangent,
    Binormal,
    BlendWeights,
    BlendIndices,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VertexElement {
    pub stream_idx: u32,
    pub offset: u32,
    pub format: Format,
    pub usage: VertexUsage,
    pub usage_idx: u32,
}

/// Sums the element sizes of one vertex stream.
pub fn vertex_stride(elements: &[VertexElement], stream_idx: u32) -> u32 {
    elements
        .iter()
        .filter(|e| e.stream_idx == stream_idx)
        .map(|e| format_info(e.format).block_bytes())
        .sum()
}

/// Integer offset into a texture subresource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

/// Integer region of a texture subresource.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Box3d {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
    pub h: i32,
    pub d: i32,
}

//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_ordering() {
        let copy = CommandQueueType::COPY;
        let compute = CommandQueueType::COMPUTE;
        let graphics = CommandQueueType::GRAPHICS;

        assert!(graphics.can_execute(copy | compute | graphics));
        assert!(compute.can_execute(copy));
        assert!(!copy.can_execute(compute));
        assert!(!compute.can_execute(graphics));
        assert!(copy.can_execute(CommandQueueType::empty()));
    }

    #[test]
    fn stride_sums_stream_elements() {
        let elements = [
            VertexElement {
                stream_idx: 0,
                offset: 0,
                format: Format::R32G32B32_FLOAT,
                usage: VertexUsage::Position,
                usage_idx: 0,
            },
            VertexElement {
                stream_idx: 0,
                offset: 12,
                format: Format::R8G8B8A8_UNORM,
                usage: VertexUsage::Color,
                usage_idx: 0,
            },
            VertexElement {
                stream_idx: 1,
                offset: 0,
                format: Format::R32G32_FLOAT,
                usage: VertexUsage::Texcoord,
                usage_idx: 0,
            },
        ];
        assert_eq!(vertex_stride(&elements, 0), 16);
        assert_eq!(vertex_stride(&elements, 1), 8);
        assert_eq!(vertex_stride(&elements, 2), 0);
    }
}
