use bitflags::bitflags;
use thiserror::Error;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Failure reported by the real driver. Wrappers propagate these unchanged
/// to the caller after doing their own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("driver out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unknown native handle")]
    UnknownHandle,
    #[error("device lost")]
    DeviceLost,
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

/// Opaque handle to a real driver object. Only meaningful to the driver that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

bitflags! {
    /// How a resource may be bound to the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER    = 1 << 0;
        const INDEX_BUFFER     = 1 << 1;
        const CONSTANT_BUFFER  = 1 << 2;
        const SHADER_RESOURCE  = 1 << 3;
        const RENDER_TARGET    = 1 << 4;
        const DEPTH_STENCIL    = 1 << 5;
        const UNORDERED_ACCESS = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
    R32Float,
    R32Uint,
    D24UnormS8,
    D32Float,
}

impl Format {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Rgba8Unorm),
            1 => Some(Self::Bgra8Unorm),
            2 => Some(Self::R32Float),
            3 => Some(Self::R32Uint),
            4 => Some(Self::D24UnormS8),
            5 => Some(Self::D32Float),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Rgba8Unorm => 0,
            Self::Bgra8Unorm => 1,
            Self::R32Float => 2,
            Self::R32Uint => 3,
            Self::D24UnormS8 => 4,
            Self::D32Float => 5,
        }
    }

    pub const fn bytes_per_texel(self) -> u32 {
        4
    }

    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D24UnormS8 | Self::D32Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Compute,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 3] = [ShaderStage::Vertex, ShaderStage::Pixel, ShaderStage::Compute];

    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Vertex),
            1 => Some(Self::Pixel),
            2 => Some(Self::Compute),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Vertex => 0,
            Self::Pixel => 1,
            Self::Compute => 2,
        }
    }

    pub const fn index(self) -> usize {
        self.as_u32() as usize
    }
}

impl core::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::Pixel => write!(f, "pixel"),
            ShaderStage::Compute => write!(f, "compute"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    #[default]
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Uint16),
            1 => Some(Self::Uint32),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Uint16 => 0,
            Self::Uint32 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
    /// Write access where the previous contents are discarded; the shadow
    /// diff can skip reading them back.
    WriteDiscard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub bind: BindFlags,
    pub cpu_writable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub mips: u32,
    pub format: Format,
    pub bind: BindFlags,
    pub sample_count: u32,
}

impl TextureDesc {
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_texel())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    #[default]
    Point,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Wrap,
    Clamp,
    Border,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub address: AddressMode,
    pub border: [f32; 4],
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: Filter::Point,
            address: AddressMode::Wrap,
            border: [0.0; 4],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderTargetViewDesc {
    pub mip: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DepthStencilViewDesc {
    pub mip: u32,
    pub read_only_depth: bool,
    pub read_only_stencil: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderResourceViewDesc {
    pub first_mip: u32,
    pub mip_count: u32,
}

impl Default for ShaderResourceViewDesc {
    fn default() -> Self {
        Self {
            first_mip: 0,
            mip_count: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnorderedAccessViewDesc {
    pub mip: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcAlpha,
    InvSrcAlpha,
}

impl BlendFactor {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Zero),
            1 => Some(Self::One),
            2 => Some(Self::SrcAlpha),
            3 => Some(Self::InvSrcAlpha),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::SrcAlpha => 2,
            Self::InvSrcAlpha => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendDesc {
    pub enable: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub write_mask: u8,
}

impl Default for BlendDesc {
    fn default() -> Self {
        Self {
            enable: false,
            src: BlendFactor::One,
            dst: BlendFactor::Zero,
            write_mask: 0xf,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareFunc {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    Always,
}

impl CompareFunc {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Never),
            1 => Some(Self::Less),
            2 => Some(Self::Equal),
            3 => Some(Self::LessEqual),
            4 => Some(Self::Greater),
            5 => Some(Self::Always),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Never => 0,
            Self::Less => 1,
            Self::Equal => 2,
            Self::LessEqual => 3,
            Self::Greater => 4,
            Self::Always => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthDesc {
    pub depth_test: bool,
    pub depth_write: bool,
    pub func: CompareFunc,
    pub stencil_enable: bool,
}

impl Default for DepthDesc {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            func: CompareFunc::Less,
            stencil_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

impl CullMode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Front),
            2 => Some(Self::Back),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Front => 1,
            Self::Back => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterDesc {
    pub cull: CullMode,
    pub scissor_enable: bool,
    pub depth_clip: bool,
}

impl Default for RasterDesc {
    fn default() -> Self {
        Self {
            cull: CullMode::Back,
            scissor_enable: false,
            depth_clip: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Vertex-buffer slot binding as the driver sees it (unwrapped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeVertexBinding {
    pub buffer: NativeHandle,
    pub stride: u32,
    pub offset: u64,
}

/// The opaque capability set of the real driver.
///
/// The interception core never interprets these operations; it forwards
/// unwrapped arguments in and receives real handles and results out. One
/// implementation exists per backend; [`crate::SoftwareDriver`] is the
/// in-tree one used by tests and headless replay.
pub trait NativeDriver: Send + Sync {
    fn create_buffer(&self, desc: &BufferDesc, init: Option<&[u8]>) -> DriverResult<NativeHandle>;
    fn create_texture2d(&self, desc: &TextureDesc, init: Option<&[u8]>)
        -> DriverResult<NativeHandle>;
    fn create_sampler(&self, desc: &SamplerDesc) -> DriverResult<NativeHandle>;
    fn create_shader(&self, stage: ShaderStage, bytecode: &[u8]) -> DriverResult<NativeHandle>;
    fn create_render_target_view(
        &self,
        resource: NativeHandle,
        desc: &RenderTargetViewDesc,
    ) -> DriverResult<NativeHandle>;
    fn create_depth_stencil_view(
        &self,
        resource: NativeHandle,
        desc: &DepthStencilViewDesc,
    ) -> DriverResult<NativeHandle>;
    fn create_shader_resource_view(
        &self,
        resource: NativeHandle,
        desc: &ShaderResourceViewDesc,
    ) -> DriverResult<NativeHandle>;
    fn create_unordered_access_view(
        &self,
        resource: NativeHandle,
        desc: &UnorderedAccessViewDesc,
    ) -> DriverResult<NativeHandle>;
    fn create_blend_state(&self, desc: &BlendDesc) -> DriverResult<NativeHandle>;
    fn create_depth_state(&self, desc: &DepthDesc) -> DriverResult<NativeHandle>;
    fn create_raster_state(&self, desc: &RasterDesc) -> DriverResult<NativeHandle>;
    fn create_context(&self) -> DriverResult<NativeHandle>;

    fn destroy(&self, handle: NativeHandle);

    /// Capability probing. Failures propagate to the caller unchanged.
    fn query_capability(&self, name: &str) -> DriverResult<bool>;

    fn update_resource(&self, resource: NativeHandle, offset: u64, data: &[u8])
        -> DriverResult<()>;
    fn read_resource(&self, resource: NativeHandle) -> DriverResult<Vec<u8>>;
    fn copy_resource(&self, dst: NativeHandle, src: NativeHandle) -> DriverResult<()>;

    fn bind_shader(
        &self,
        ctx: NativeHandle,
        stage: ShaderStage,
        shader: Option<NativeHandle>,
    ) -> DriverResult<()>;
    fn bind_constant_buffers(
        &self,
        ctx: NativeHandle,
        stage: ShaderStage,
        first_slot: u32,
        buffers: &[Option<NativeHandle>],
    ) -> DriverResult<()>;
    fn bind_shader_resources(
        &self,
        ctx: NativeHandle,
        stage: ShaderStage,
        first_slot: u32,
        views: &[Option<NativeHandle>],
    ) -> DriverResult<()>;
    fn bind_samplers(
        &self,
        ctx: NativeHandle,
        stage: ShaderStage,
        first_slot: u32,
        samplers: &[Option<NativeHandle>],
    ) -> DriverResult<()>;
    fn bind_vertex_buffers(
        &self,
        ctx: NativeHandle,
        first_slot: u32,
        bindings: &[Option<NativeVertexBinding>],
    ) -> DriverResult<()>;
    fn bind_index_buffer(
        &self,
        ctx: NativeHandle,
        buffer: Option<NativeHandle>,
        format: IndexFormat,
        offset: u64,
    ) -> DriverResult<()>;
    fn bind_render_targets(
        &self,
        ctx: NativeHandle,
        colors: &[Option<NativeHandle>],
        depth: Option<NativeHandle>,
    ) -> DriverResult<()>;
    fn bind_unordered_access_views(
        &self,
        ctx: NativeHandle,
        first_slot: u32,
        views: &[Option<NativeHandle>],
    ) -> DriverResult<()>;
    fn set_viewports(&self, ctx: NativeHandle, viewports: &[Viewport]) -> DriverResult<()>;
    fn set_scissors(&self, ctx: NativeHandle, rects: &[Rect]) -> DriverResult<()>;
    fn set_blend_state(
        &self,
        ctx: NativeHandle,
        state: Option<NativeHandle>,
        factor: [f32; 4],
    ) -> DriverResult<()>;
    fn set_depth_state(
        &self,
        ctx: NativeHandle,
        state: Option<NativeHandle>,
        stencil_ref: u32,
    ) -> DriverResult<()>;
    fn set_raster_state(&self, ctx: NativeHandle, state: Option<NativeHandle>) -> DriverResult<()>;

    fn draw(&self, ctx: NativeHandle, vertex_count: u32, first_vertex: u32) -> DriverResult<()>;
    fn draw_indexed(
        &self,
        ctx: NativeHandle,
        index_count: u32,
        first_index: u32,
        base_vertex: i32,
    ) -> DriverResult<()>;
    fn dispatch(&self, ctx: NativeHandle, x: u32, y: u32, z: u32) -> DriverResult<()>;
    fn clear_render_target(
        &self,
        ctx: NativeHandle,
        view: NativeHandle,
        color: [f32; 4],
    ) -> DriverResult<()>;
    fn clear_depth_stencil(
        &self,
        ctx: NativeHandle,
        view: NativeHandle,
        depth: f32,
        stencil: u8,
    ) -> DriverResult<()>;
    fn present(&self, ctx: NativeHandle) -> DriverResult<()>;
}
