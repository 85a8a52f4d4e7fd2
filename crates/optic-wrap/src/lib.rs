//! Wrapped-object layer: the machinery that lets proxy objects stand in for
//! real driver objects.
//!
//! The real driver is an opaque capability set behind [`NativeDriver`]; every
//! wrapped object is an [`arena`](ObjectArena) entry that exclusively owns
//! one native handle and carries the external/soft/view/pipeline reference
//! counters that decide when that handle is freed. Interceptable calls are
//! one descriptor table, the [`Call`] enum, from which the serialize and
//! replay paths both derive. The full pipeline binding state is the
//! [`RenderState`] value, mirrored live per context by [`LiveState`].

mod arena;
mod call;
mod driver;
mod object;
mod refcount;
mod software;
mod state;

pub use crate::arena::{
    CommandListData, DestroySink, ObjectArena, ObjectEntry, ObjectInfo, ObjectKind, ReleaseOutcome,
};
pub use crate::call::{kind as call_kind, Call, CALL_VERSION};
pub use crate::driver::{
    AddressMode, BindFlags, BlendDesc, BlendFactor, BufferDesc, CompareFunc, CullMode, DepthDesc,
    DepthStencilViewDesc, DriverError, DriverResult, Filter, Format, IndexFormat, MapMode,
    NativeDriver, NativeHandle, NativeVertexBinding, RasterDesc, Rect, RenderTargetViewDesc,
    SamplerDesc, ShaderResourceViewDesc, ShaderStage, TextureDesc, UnorderedAccessViewDesc,
    Viewport,
};
pub use crate::object::{
    BlendState, Buffer, CommandList, DepthState, DepthStencilView, RasterState, RenderTargetView,
    Sampler, Shader, ShaderResourceView, Texture2d, UnorderedAccessView, WrappedHandle,
};
pub use crate::refcount::{RefClass, RefCounts};
pub use crate::software::{SoftContextState, SoftStats, SoftwareDriver};
pub use crate::state::{
    InputAssembly, LiveState, OutputMerger, Rasterizer, RenderState, StageState,
    VertexBufferBinding, MAX_CONSTANT_BUFFER_SLOTS, MAX_RENDER_TARGETS, MAX_SAMPLER_SLOTS,
    MAX_SHADER_RESOURCE_SLOTS, MAX_UAV_SLOTS, MAX_VERTEX_BUFFER_SLOTS, MAX_VIEWPORTS,
};
