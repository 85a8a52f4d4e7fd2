use std::io::{Read, Seek};

use optic_chunk::{
    Chunk, ChunkError, ChunkHeader, ChunkKind, ChunkReader, ReadLeExt, Result, WriteLeExt,
};
use optic_resource::{IdReadExt, IdWriteExt, ResourceId};

use crate::driver::{
    BindFlags, BlendDesc, BlendFactor, BufferDesc, CompareFunc, CullMode, DepthDesc,
    DepthStencilViewDesc, Format, IndexFormat, RasterDesc, Rect, RenderTargetViewDesc,
    SamplerDesc, ShaderResourceViewDesc, ShaderStage, TextureDesc, UnorderedAccessViewDesc,
    Viewport,
};
use crate::state::VertexBufferBinding;

/// Chunk tags for the interceptable calls. Stable on the wire; new calls get
/// new tags and old readers skip them by length.
pub mod kind {
    use optic_chunk::ChunkKind;

    pub const CREATE_BUFFER: ChunkKind = ChunkKind(64);
    pub const CREATE_TEXTURE2D: ChunkKind = ChunkKind(65);
    pub const CREATE_SAMPLER: ChunkKind = ChunkKind(66);
    pub const CREATE_SHADER: ChunkKind = ChunkKind(67);
    pub const CREATE_RENDER_TARGET_VIEW: ChunkKind = ChunkKind(68);
    pub const CREATE_DEPTH_STENCIL_VIEW: ChunkKind = ChunkKind(69);
    pub const CREATE_SHADER_RESOURCE_VIEW: ChunkKind = ChunkKind(70);
    pub const CREATE_UNORDERED_ACCESS_VIEW: ChunkKind = ChunkKind(71);
    pub const CREATE_BLEND_STATE: ChunkKind = ChunkKind(72);
    pub const CREATE_DEPTH_STATE: ChunkKind = ChunkKind(73);
    pub const CREATE_RASTER_STATE: ChunkKind = ChunkKind(74);

    pub const UPDATE_RESOURCE: ChunkKind = ChunkKind(80);
    pub const UNMAP: ChunkKind = ChunkKind(81);
    pub const COPY_RESOURCE: ChunkKind = ChunkKind(82);

    pub const BIND_SHADER: ChunkKind = ChunkKind(90);
    pub const BIND_CONSTANT_BUFFERS: ChunkKind = ChunkKind(91);
    pub const BIND_SHADER_RESOURCES: ChunkKind = ChunkKind(92);
    pub const BIND_SAMPLERS: ChunkKind = ChunkKind(93);
    pub const BIND_VERTEX_BUFFERS: ChunkKind = ChunkKind(94);
    pub const BIND_INDEX_BUFFER: ChunkKind = ChunkKind(95);
    pub const BIND_RENDER_TARGETS: ChunkKind = ChunkKind(96);
    pub const BIND_UNORDERED_ACCESS_VIEWS: ChunkKind = ChunkKind(97);
    pub const SET_VIEWPORTS: ChunkKind = ChunkKind(98);
    pub const SET_SCISSORS: ChunkKind = ChunkKind(99);
    pub const SET_BLEND_STATE: ChunkKind = ChunkKind(100);
    pub const SET_DEPTH_STATE: ChunkKind = ChunkKind(101);
    pub const SET_RASTER_STATE: ChunkKind = ChunkKind(102);

    pub const DRAW: ChunkKind = ChunkKind(110);
    pub const DRAW_INDEXED: ChunkKind = ChunkKind(111);
    pub const DISPATCH: ChunkKind = ChunkKind(112);
    pub const CLEAR_RENDER_TARGET: ChunkKind = ChunkKind(113);
    pub const CLEAR_DEPTH_STENCIL: ChunkKind = ChunkKind(114);

    pub const SET_MARKER: ChunkKind = ChunkKind(120);
    pub const PUSH_MARKER: ChunkKind = ChunkKind(121);
    pub const POP_MARKER: ChunkKind = ChunkKind(122);

    pub const EXECUTE_COMMAND_LIST: ChunkKind = ChunkKind(130);

    /// Whether a call chunk of this kind is an action (drawcall-tree leaf).
    /// Usable without decoding the payload.
    pub fn is_action(kind: ChunkKind) -> bool {
        matches!(
            kind,
            DRAW | DRAW_INDEXED
                | DISPATCH
                | CLEAR_RENDER_TARGET
                | CLEAR_DEPTH_STENCIL
                | COPY_RESOURCE
                | EXECUTE_COMMAND_LIST
        )
    }
}

/// Wire version carried in each call chunk's header.
pub const CALL_VERSION: u16 = 1;

/// One interceptable call, with object arguments already translated to
/// [`ResourceId`]s. This enum is the descriptor table: the serialize,
/// replay and event-classification paths all derive from it instead of
/// being duplicated per call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateBuffer {
        id: ResourceId,
        desc: BufferDesc,
        init: Option<Vec<u8>>,
    },
    CreateTexture2d {
        id: ResourceId,
        desc: TextureDesc,
        init: Option<Vec<u8>>,
    },
    CreateSampler {
        id: ResourceId,
        desc: SamplerDesc,
    },
    CreateShader {
        id: ResourceId,
        stage: ShaderStage,
        bytecode: Vec<u8>,
    },
    CreateRenderTargetView {
        id: ResourceId,
        resource: ResourceId,
        desc: RenderTargetViewDesc,
    },
    CreateDepthStencilView {
        id: ResourceId,
        resource: ResourceId,
        desc: DepthStencilViewDesc,
    },
    CreateShaderResourceView {
        id: ResourceId,
        resource: ResourceId,
        desc: ShaderResourceViewDesc,
    },
    CreateUnorderedAccessView {
        id: ResourceId,
        resource: ResourceId,
        desc: UnorderedAccessViewDesc,
    },
    CreateBlendState {
        id: ResourceId,
        desc: BlendDesc,
    },
    CreateDepthState {
        id: ResourceId,
        desc: DepthDesc,
    },
    CreateRasterState {
        id: ResourceId,
        desc: RasterDesc,
    },

    UpdateResource {
        resource: ResourceId,
        offset: u64,
        data: Vec<u8>,
    },
    /// The contents written while the resource was mapped.
    Unmap {
        resource: ResourceId,
        data: Vec<u8>,
    },
    CopyResource {
        dst: ResourceId,
        src: ResourceId,
    },

    BindShader {
        stage: ShaderStage,
        shader: ResourceId,
    },
    BindConstantBuffers {
        stage: ShaderStage,
        first_slot: u32,
        buffers: Vec<ResourceId>,
    },
    BindShaderResources {
        stage: ShaderStage,
        first_slot: u32,
        views: Vec<ResourceId>,
    },
    BindSamplers {
        stage: ShaderStage,
        first_slot: u32,
        samplers: Vec<ResourceId>,
    },
    BindVertexBuffers {
        first_slot: u32,
        bindings: Vec<VertexBufferBinding>,
    },
    BindIndexBuffer {
        buffer: ResourceId,
        format: IndexFormat,
        offset: u64,
    },
    BindRenderTargets {
        colors: Vec<ResourceId>,
        depth: ResourceId,
    },
    BindUnorderedAccessViews {
        first_slot: u32,
        views: Vec<ResourceId>,
    },
    SetViewports {
        viewports: Vec<Viewport>,
    },
    SetScissors {
        rects: Vec<Rect>,
    },
    SetBlendState {
        state: ResourceId,
        factor: [f32; 4],
    },
    SetDepthState {
        state: ResourceId,
        stencil_ref: u32,
    },
    SetRasterState {
        state: ResourceId,
    },

    Draw {
        vertex_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        base_vertex: i32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    ClearRenderTarget {
        view: ResourceId,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: ResourceId,
        depth: f32,
        stencil: u8,
    },

    SetMarker {
        name: String,
    },
    PushMarker {
        name: String,
    },
    PopMarker,

    ExecuteCommandList {
        list: ResourceId,
    },
}

impl Call {
    pub fn kind(&self) -> ChunkKind {
        use kind::*;
        match self {
            Call::CreateBuffer { .. } => CREATE_BUFFER,
            Call::CreateTexture2d { .. } => CREATE_TEXTURE2D,
            Call::CreateSampler { .. } => CREATE_SAMPLER,
            Call::CreateShader { .. } => CREATE_SHADER,
            Call::CreateRenderTargetView { .. } => CREATE_RENDER_TARGET_VIEW,
            Call::CreateDepthStencilView { .. } => CREATE_DEPTH_STENCIL_VIEW,
            Call::CreateShaderResourceView { .. } => CREATE_SHADER_RESOURCE_VIEW,
            Call::CreateUnorderedAccessView { .. } => CREATE_UNORDERED_ACCESS_VIEW,
            Call::CreateBlendState { .. } => CREATE_BLEND_STATE,
            Call::CreateDepthState { .. } => CREATE_DEPTH_STATE,
            Call::CreateRasterState { .. } => CREATE_RASTER_STATE,
            Call::UpdateResource { .. } => UPDATE_RESOURCE,
            Call::Unmap { .. } => UNMAP,
            Call::CopyResource { .. } => COPY_RESOURCE,
            Call::BindShader { .. } => BIND_SHADER,
            Call::BindConstantBuffers { .. } => BIND_CONSTANT_BUFFERS,
            Call::BindShaderResources { .. } => BIND_SHADER_RESOURCES,
            Call::BindSamplers { .. } => BIND_SAMPLERS,
            Call::BindVertexBuffers { .. } => BIND_VERTEX_BUFFERS,
            Call::BindIndexBuffer { .. } => BIND_INDEX_BUFFER,
            Call::BindRenderTargets { .. } => BIND_RENDER_TARGETS,
            Call::BindUnorderedAccessViews { .. } => BIND_UNORDERED_ACCESS_VIEWS,
            Call::SetViewports { .. } => SET_VIEWPORTS,
            Call::SetScissors { .. } => SET_SCISSORS,
            Call::SetBlendState { .. } => SET_BLEND_STATE,
            Call::SetDepthState { .. } => SET_DEPTH_STATE,
            Call::SetRasterState { .. } => SET_RASTER_STATE,
            Call::Draw { .. } => DRAW,
            Call::DrawIndexed { .. } => DRAW_INDEXED,
            Call::Dispatch { .. } => DISPATCH,
            Call::ClearRenderTarget { .. } => CLEAR_RENDER_TARGET,
            Call::ClearDepthStencil { .. } => CLEAR_DEPTH_STENCIL,
            Call::SetMarker { .. } => SET_MARKER,
            Call::PushMarker { .. } => PUSH_MARKER,
            Call::PopMarker => POP_MARKER,
            Call::ExecuteCommandList { .. } => EXECUTE_COMMAND_LIST,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Call::CreateBuffer { .. } => "CreateBuffer",
            Call::CreateTexture2d { .. } => "CreateTexture2d",
            Call::CreateSampler { .. } => "CreateSampler",
            Call::CreateShader { .. } => "CreateShader",
            Call::CreateRenderTargetView { .. } => "CreateRenderTargetView",
            Call::CreateDepthStencilView { .. } => "CreateDepthStencilView",
            Call::CreateShaderResourceView { .. } => "CreateShaderResourceView",
            Call::CreateUnorderedAccessView { .. } => "CreateUnorderedAccessView",
            Call::CreateBlendState { .. } => "CreateBlendState",
            Call::CreateDepthState { .. } => "CreateDepthState",
            Call::CreateRasterState { .. } => "CreateRasterState",
            Call::UpdateResource { .. } => "UpdateResource",
            Call::Unmap { .. } => "Unmap",
            Call::CopyResource { .. } => "CopyResource",
            Call::BindShader { .. } => "BindShader",
            Call::BindConstantBuffers { .. } => "BindConstantBuffers",
            Call::BindShaderResources { .. } => "BindShaderResources",
            Call::BindSamplers { .. } => "BindSamplers",
            Call::BindVertexBuffers { .. } => "BindVertexBuffers",
            Call::BindIndexBuffer { .. } => "BindIndexBuffer",
            Call::BindRenderTargets { .. } => "BindRenderTargets",
            Call::BindUnorderedAccessViews { .. } => "BindUnorderedAccessViews",
            Call::SetViewports { .. } => "SetViewports",
            Call::SetScissors { .. } => "SetScissors",
            Call::SetBlendState { .. } => "SetBlendState",
            Call::SetDepthState { .. } => "SetDepthState",
            Call::SetRasterState { .. } => "SetRasterState",
            Call::Draw { .. } => "Draw",
            Call::DrawIndexed { .. } => "DrawIndexed",
            Call::Dispatch { .. } => "Dispatch",
            Call::ClearRenderTarget { .. } => "ClearRenderTarget",
            Call::ClearDepthStencil { .. } => "ClearDepthStencil",
            Call::SetMarker { .. } => "SetMarker",
            Call::PushMarker { .. } => "PushMarker",
            Call::PopMarker => "PopMarker",
            Call::ExecuteCommandList { .. } => "ExecuteCommandList",
        }
    }

    /// Whether this call is an action (a drawcall-tree leaf) rather than
    /// state plumbing.
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            Call::Draw { .. }
                | Call::DrawIndexed { .. }
                | Call::Dispatch { .. }
                | Call::ClearRenderTarget { .. }
                | Call::ClearDepthStencil { .. }
                | Call::CopyResource { .. }
                | Call::ExecuteCommandList { .. }
        )
    }

    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            Call::CreateBuffer { .. }
                | Call::CreateTexture2d { .. }
                | Call::CreateSampler { .. }
                | Call::CreateShader { .. }
                | Call::CreateRenderTargetView { .. }
                | Call::CreateDepthStencilView { .. }
                | Call::CreateShaderResourceView { .. }
                | Call::CreateUnorderedAccessView { .. }
                | Call::CreateBlendState { .. }
                | Call::CreateDepthState { .. }
                | Call::CreateRasterState { .. }
        )
    }

    pub fn to_chunk(&self) -> Result<Chunk> {
        Chunk::build(self.kind(), CALL_VERSION, |p| self.encode_payload(p))
    }

    fn encode_payload(&self, p: &mut Vec<u8>) -> Result<()> {
        match self {
            Call::CreateBuffer { id, desc, init } => {
                p.write_id(*id)?;
                encode_buffer_desc(p, desc)?;
                encode_opt_blob(p, init.as_deref())?;
            }
            Call::CreateTexture2d { id, desc, init } => {
                p.write_id(*id)?;
                encode_texture_desc(p, desc)?;
                encode_opt_blob(p, init.as_deref())?;
            }
            Call::CreateSampler { id, desc } => {
                p.write_id(*id)?;
                encode_sampler_desc(p, desc)?;
            }
            Call::CreateShader { id, stage, bytecode } => {
                p.write_id(*id)?;
                p.write_u32_le(stage.as_u32())?;
                p.write_blob(bytecode)?;
            }
            Call::CreateRenderTargetView { id, resource, desc } => {
                p.write_id(*id)?;
                p.write_id(*resource)?;
                p.write_u32_le(desc.mip)?;
            }
            Call::CreateDepthStencilView { id, resource, desc } => {
                p.write_id(*id)?;
                p.write_id(*resource)?;
                p.write_u32_le(desc.mip)?;
                p.write_bool(desc.read_only_depth)?;
                p.write_bool(desc.read_only_stencil)?;
            }
            Call::CreateShaderResourceView { id, resource, desc } => {
                p.write_id(*id)?;
                p.write_id(*resource)?;
                p.write_u32_le(desc.first_mip)?;
                p.write_u32_le(desc.mip_count)?;
            }
            Call::CreateUnorderedAccessView { id, resource, desc } => {
                p.write_id(*id)?;
                p.write_id(*resource)?;
                p.write_u32_le(desc.mip)?;
            }
            Call::CreateBlendState { id, desc } => {
                p.write_id(*id)?;
                p.write_bool(desc.enable)?;
                p.write_u32_le(desc.src.as_u32())?;
                p.write_u32_le(desc.dst.as_u32())?;
                p.write_u8(desc.write_mask)?;
            }
            Call::CreateDepthState { id, desc } => {
                p.write_id(*id)?;
                p.write_bool(desc.depth_test)?;
                p.write_bool(desc.depth_write)?;
                p.write_u32_le(desc.func.as_u32())?;
                p.write_bool(desc.stencil_enable)?;
            }
            Call::CreateRasterState { id, desc } => {
                p.write_id(*id)?;
                p.write_u32_le(desc.cull.as_u32())?;
                p.write_bool(desc.scissor_enable)?;
                p.write_bool(desc.depth_clip)?;
            }
            Call::UpdateResource {
                resource,
                offset,
                data,
            } => {
                p.write_id(*resource)?;
                p.write_u64_le(*offset)?;
                p.write_blob(data)?;
            }
            Call::Unmap { resource, data } => {
                p.write_id(*resource)?;
                p.write_blob(data)?;
            }
            Call::CopyResource { dst, src } => {
                p.write_id(*dst)?;
                p.write_id(*src)?;
            }
            Call::BindShader { stage, shader } => {
                p.write_u32_le(stage.as_u32())?;
                p.write_id(*shader)?;
            }
            Call::BindConstantBuffers {
                stage,
                first_slot,
                buffers,
            } => {
                p.write_u32_le(stage.as_u32())?;
                p.write_u32_le(*first_slot)?;
                encode_id_list(p, buffers)?;
            }
            Call::BindShaderResources {
                stage,
                first_slot,
                views,
            } => {
                p.write_u32_le(stage.as_u32())?;
                p.write_u32_le(*first_slot)?;
                encode_id_list(p, views)?;
            }
            Call::BindSamplers {
                stage,
                first_slot,
                samplers,
            } => {
                p.write_u32_le(stage.as_u32())?;
                p.write_u32_le(*first_slot)?;
                encode_id_list(p, samplers)?;
            }
            Call::BindVertexBuffers {
                first_slot,
                bindings,
            } => {
                p.write_u32_le(*first_slot)?;
                p.write_u32_le(bindings.len() as u32)?;
                for b in bindings {
                    p.write_id(b.buffer)?;
                    p.write_u32_le(b.stride)?;
                    p.write_u64_le(b.offset)?;
                }
            }
            Call::BindIndexBuffer {
                buffer,
                format,
                offset,
            } => {
                p.write_id(*buffer)?;
                p.write_u32_le(format.as_u32())?;
                p.write_u64_le(*offset)?;
            }
            Call::BindRenderTargets { colors, depth } => {
                encode_id_list(p, colors)?;
                p.write_id(*depth)?;
            }
            Call::BindUnorderedAccessViews { first_slot, views } => {
                p.write_u32_le(*first_slot)?;
                encode_id_list(p, views)?;
            }
            Call::SetViewports { viewports } => {
                p.write_u32_le(viewports.len() as u32)?;
                for v in viewports {
                    encode_viewport(p, v)?;
                }
            }
            Call::SetScissors { rects } => {
                p.write_u32_le(rects.len() as u32)?;
                for r in rects {
                    encode_rect(p, r)?;
                }
            }
            Call::SetBlendState { state, factor } => {
                p.write_id(*state)?;
                p.write_f32x4(factor)?;
            }
            Call::SetDepthState { state, stencil_ref } => {
                p.write_id(*state)?;
                p.write_u32_le(*stencil_ref)?;
            }
            Call::SetRasterState { state } => {
                p.write_id(*state)?;
            }
            Call::Draw {
                vertex_count,
                first_vertex,
            } => {
                p.write_u32_le(*vertex_count)?;
                p.write_u32_le(*first_vertex)?;
            }
            Call::DrawIndexed {
                index_count,
                first_index,
                base_vertex,
            } => {
                p.write_u32_le(*index_count)?;
                p.write_u32_le(*first_index)?;
                p.write_i32_le(*base_vertex)?;
            }
            Call::Dispatch { x, y, z } => {
                p.write_u32_le(*x)?;
                p.write_u32_le(*y)?;
                p.write_u32_le(*z)?;
            }
            Call::ClearRenderTarget { view, color } => {
                p.write_id(*view)?;
                p.write_f32x4(color)?;
            }
            Call::ClearDepthStencil {
                view,
                depth,
                stencil,
            } => {
                p.write_id(*view)?;
                p.write_f32_le(*depth)?;
                p.write_u8(*stencil)?;
            }
            Call::SetMarker { name } | Call::PushMarker { name } => {
                p.write_string(name)?;
            }
            Call::PopMarker => {}
            Call::ExecuteCommandList { list } => {
                p.write_id(*list)?;
            }
        }
        Ok(())
    }

    /// Rewrite every object argument through `f`. Replay uses this to
    /// translate captured ids into this session's live ids; ids that map to
    /// null become unbound arguments.
    pub fn map_ids(&self, f: &dyn Fn(ResourceId) -> ResourceId) -> Call {
        let mut call = self.clone();
        match &mut call {
            Call::CreateBuffer { id, .. }
            | Call::CreateTexture2d { id, .. }
            | Call::CreateSampler { id, .. }
            | Call::CreateShader { id, .. }
            | Call::CreateBlendState { id, .. }
            | Call::CreateDepthState { id, .. }
            | Call::CreateRasterState { id, .. } => *id = f(*id),
            Call::CreateRenderTargetView { id, resource, .. }
            | Call::CreateDepthStencilView { id, resource, .. }
            | Call::CreateShaderResourceView { id, resource, .. }
            | Call::CreateUnorderedAccessView { id, resource, .. } => {
                *id = f(*id);
                *resource = f(*resource);
            }
            Call::UpdateResource { resource, .. } | Call::Unmap { resource, .. } => {
                *resource = f(*resource)
            }
            Call::CopyResource { dst, src } => {
                *dst = f(*dst);
                *src = f(*src);
            }
            Call::BindShader { shader, .. } => *shader = f(*shader),
            Call::BindConstantBuffers { buffers, .. } => {
                for id in buffers {
                    *id = f(*id);
                }
            }
            Call::BindShaderResources { views, .. }
            | Call::BindUnorderedAccessViews { views, .. } => {
                for id in views {
                    *id = f(*id);
                }
            }
            Call::BindSamplers { samplers, .. } => {
                for id in samplers {
                    *id = f(*id);
                }
            }
            Call::BindVertexBuffers { bindings, .. } => {
                for binding in bindings {
                    binding.buffer = f(binding.buffer);
                }
            }
            Call::BindIndexBuffer { buffer, .. } => *buffer = f(*buffer),
            Call::BindRenderTargets { colors, depth } => {
                for id in colors {
                    *id = f(*id);
                }
                *depth = f(*depth);
            }
            Call::SetBlendState { state, .. }
            | Call::SetDepthState { state, .. }
            | Call::SetRasterState { state } => *state = f(*state),
            Call::ClearRenderTarget { view, .. } | Call::ClearDepthStencil { view, .. } => {
                *view = f(*view)
            }
            Call::ExecuteCommandList { list } => *list = f(*list),
            Call::Draw { .. }
            | Call::DrawIndexed { .. }
            | Call::Dispatch { .. }
            | Call::SetViewports { .. }
            | Call::SetScissors { .. }
            | Call::SetMarker { .. }
            | Call::PushMarker { .. }
            | Call::PopMarker => {}
        }
        call
    }

    /// Object arguments this call references directly, with the access
    /// direction implied by the call itself. Action calls additionally
    /// touch whatever the current pipeline state binds; the state walk
    /// covers those.
    pub fn direct_references(&self) -> Vec<(ResourceId, optic_resource::FrameRef)> {
        use optic_resource::FrameRef::{Read, Write};
        let mut out = Vec::new();
        match self {
            Call::UpdateResource { resource, .. } | Call::Unmap { resource, .. } => {
                out.push((*resource, Write));
            }
            Call::CopyResource { dst, src } => {
                out.push((*dst, Write));
                out.push((*src, Read));
            }
            Call::BindShader { shader, .. } => out.push((*shader, Read)),
            Call::BindConstantBuffers { buffers, .. } => {
                out.extend(buffers.iter().map(|&id| (id, Read)))
            }
            Call::BindShaderResources { views, .. } => {
                out.extend(views.iter().map(|&id| (id, Read)))
            }
            Call::BindSamplers { samplers, .. } => {
                out.extend(samplers.iter().map(|&id| (id, Read)))
            }
            Call::BindVertexBuffers { bindings, .. } => {
                out.extend(bindings.iter().map(|b| (b.buffer, Read)))
            }
            Call::BindIndexBuffer { buffer, .. } => out.push((*buffer, Read)),
            Call::BindRenderTargets { colors, depth } => {
                out.extend(colors.iter().map(|&id| (id, Read)));
                out.push((*depth, Read));
            }
            Call::BindUnorderedAccessViews { views, .. } => {
                for &id in views {
                    out.push((id, Read));
                    out.push((id, Write));
                }
            }
            Call::SetBlendState { state, .. }
            | Call::SetDepthState { state, .. }
            | Call::SetRasterState { state } => out.push((*state, Read)),
            Call::ClearRenderTarget { view, .. } | Call::ClearDepthStencil { view, .. } => {
                out.push((*view, Write))
            }
            _ => {}
        }
        out.retain(|(id, _)| !id.is_null());
        out
    }

    /// Decode the call whose chunk is currently open in `r`. Returns
    /// `Ok(None)` for chunk kinds that are not calls, so callers can skip
    /// them by length.
    pub fn decode<R: Read + Seek>(
        header: ChunkHeader,
        r: &mut ChunkReader<R>,
    ) -> Result<Option<Call>> {
        use kind::*;
        let call = match header.kind {
            CREATE_BUFFER => Call::CreateBuffer {
                id: r.read_id()?,
                desc: decode_buffer_desc(r)?,
                init: decode_opt_blob(r)?,
            },
            CREATE_TEXTURE2D => Call::CreateTexture2d {
                id: r.read_id()?,
                desc: decode_texture_desc(r)?,
                init: decode_opt_blob(r)?,
            },
            CREATE_SAMPLER => Call::CreateSampler {
                id: r.read_id()?,
                desc: decode_sampler_desc(r)?,
            },
            CREATE_SHADER => Call::CreateShader {
                id: r.read_id()?,
                stage: decode_stage(r)?,
                bytecode: r.read_blob()?,
            },
            CREATE_RENDER_TARGET_VIEW => Call::CreateRenderTargetView {
                id: r.read_id()?,
                resource: r.read_id()?,
                desc: RenderTargetViewDesc {
                    mip: r.read_u32_le()?,
                },
            },
            CREATE_DEPTH_STENCIL_VIEW => Call::CreateDepthStencilView {
                id: r.read_id()?,
                resource: r.read_id()?,
                desc: DepthStencilViewDesc {
                    mip: r.read_u32_le()?,
                    read_only_depth: r.read_bool()?,
                    read_only_stencil: r.read_bool()?,
                },
            },
            CREATE_SHADER_RESOURCE_VIEW => Call::CreateShaderResourceView {
                id: r.read_id()?,
                resource: r.read_id()?,
                desc: ShaderResourceViewDesc {
                    first_mip: r.read_u32_le()?,
                    mip_count: r.read_u32_le()?,
                },
            },
            CREATE_UNORDERED_ACCESS_VIEW => Call::CreateUnorderedAccessView {
                id: r.read_id()?,
                resource: r.read_id()?,
                desc: UnorderedAccessViewDesc {
                    mip: r.read_u32_le()?,
                },
            },
            CREATE_BLEND_STATE => Call::CreateBlendState {
                id: r.read_id()?,
                desc: BlendDesc {
                    enable: r.read_bool()?,
                    src: BlendFactor::from_u32(r.read_u32_le()?)
                        .ok_or(ChunkError::Corrupt("unknown blend factor"))?,
                    dst: BlendFactor::from_u32(r.read_u32_le()?)
                        .ok_or(ChunkError::Corrupt("unknown blend factor"))?,
                    write_mask: r.read_u8()?,
                },
            },
            CREATE_DEPTH_STATE => Call::CreateDepthState {
                id: r.read_id()?,
                desc: DepthDesc {
                    depth_test: r.read_bool()?,
                    depth_write: r.read_bool()?,
                    func: CompareFunc::from_u32(r.read_u32_le()?)
                        .ok_or(ChunkError::Corrupt("unknown compare func"))?,
                    stencil_enable: r.read_bool()?,
                },
            },
            CREATE_RASTER_STATE => Call::CreateRasterState {
                id: r.read_id()?,
                desc: RasterDesc {
                    cull: CullMode::from_u32(r.read_u32_le()?)
                        .ok_or(ChunkError::Corrupt("unknown cull mode"))?,
                    scissor_enable: r.read_bool()?,
                    depth_clip: r.read_bool()?,
                },
            },
            UPDATE_RESOURCE => Call::UpdateResource {
                resource: r.read_id()?,
                offset: r.read_u64_le()?,
                data: r.read_blob()?,
            },
            UNMAP => Call::Unmap {
                resource: r.read_id()?,
                data: r.read_blob()?,
            },
            COPY_RESOURCE => Call::CopyResource {
                dst: r.read_id()?,
                src: r.read_id()?,
            },
            BIND_SHADER => Call::BindShader {
                stage: decode_stage(r)?,
                shader: r.read_id()?,
            },
            BIND_CONSTANT_BUFFERS => Call::BindConstantBuffers {
                stage: decode_stage(r)?,
                first_slot: r.read_u32_le()?,
                buffers: decode_id_list(r)?,
            },
            BIND_SHADER_RESOURCES => Call::BindShaderResources {
                stage: decode_stage(r)?,
                first_slot: r.read_u32_le()?,
                views: decode_id_list(r)?,
            },
            BIND_SAMPLERS => Call::BindSamplers {
                stage: decode_stage(r)?,
                first_slot: r.read_u32_le()?,
                samplers: decode_id_list(r)?,
            },
            BIND_VERTEX_BUFFERS => {
                let first_slot = r.read_u32_le()?;
                let count = r.read_u32_le()?;
                if u64::from(count) * 20 > r.remaining_in_chunk() {
                    return Err(ChunkError::Corrupt("vertex binding count exceeds chunk"));
                }
                let mut bindings = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    bindings.push(VertexBufferBinding {
                        buffer: r.read_id()?,
                        stride: r.read_u32_le()?,
                        offset: r.read_u64_le()?,
                    });
                }
                Call::BindVertexBuffers {
                    first_slot,
                    bindings,
                }
            }
            BIND_INDEX_BUFFER => Call::BindIndexBuffer {
                buffer: r.read_id()?,
                format: IndexFormat::from_u32(r.read_u32_le()?)
                    .ok_or(ChunkError::Corrupt("unknown index format"))?,
                offset: r.read_u64_le()?,
            },
            BIND_RENDER_TARGETS => Call::BindRenderTargets {
                colors: decode_id_list(r)?,
                depth: r.read_id()?,
            },
            BIND_UNORDERED_ACCESS_VIEWS => Call::BindUnorderedAccessViews {
                first_slot: r.read_u32_le()?,
                views: decode_id_list(r)?,
            },
            SET_VIEWPORTS => {
                let count = r.read_u32_le()?;
                if u64::from(count) * 24 > r.remaining_in_chunk() {
                    return Err(ChunkError::Corrupt("viewport count exceeds chunk"));
                }
                let mut viewports = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    viewports.push(decode_viewport(r)?);
                }
                Call::SetViewports { viewports }
            }
            SET_SCISSORS => {
                let count = r.read_u32_le()?;
                if u64::from(count) * 16 > r.remaining_in_chunk() {
                    return Err(ChunkError::Corrupt("scissor count exceeds chunk"));
                }
                let mut rects = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    rects.push(decode_rect(r)?);
                }
                Call::SetScissors { rects }
            }
            SET_BLEND_STATE => Call::SetBlendState {
                state: r.read_id()?,
                factor: r.read_f32x4()?,
            },
            SET_DEPTH_STATE => Call::SetDepthState {
                state: r.read_id()?,
                stencil_ref: r.read_u32_le()?,
            },
            SET_RASTER_STATE => Call::SetRasterState { state: r.read_id()? },
            DRAW => Call::Draw {
                vertex_count: r.read_u32_le()?,
                first_vertex: r.read_u32_le()?,
            },
            DRAW_INDEXED => Call::DrawIndexed {
                index_count: r.read_u32_le()?,
                first_index: r.read_u32_le()?,
                base_vertex: r.read_i32_le()?,
            },
            DISPATCH => Call::Dispatch {
                x: r.read_u32_le()?,
                y: r.read_u32_le()?,
                z: r.read_u32_le()?,
            },
            CLEAR_RENDER_TARGET => Call::ClearRenderTarget {
                view: r.read_id()?,
                color: r.read_f32x4()?,
            },
            CLEAR_DEPTH_STENCIL => Call::ClearDepthStencil {
                view: r.read_id()?,
                depth: r.read_f32_le()?,
                stencil: r.read_u8()?,
            },
            SET_MARKER => Call::SetMarker {
                name: r.read_string()?,
            },
            PUSH_MARKER => Call::PushMarker {
                name: r.read_string()?,
            },
            POP_MARKER => Call::PopMarker,
            EXECUTE_COMMAND_LIST => Call::ExecuteCommandList { list: r.read_id()? },
            _ => return Ok(None),
        };
        Ok(Some(call))
    }
}

fn encode_opt_blob(p: &mut Vec<u8>, blob: Option<&[u8]>) -> Result<()> {
    match blob {
        Some(bytes) => {
            p.write_bool(true)?;
            p.write_blob(bytes)
        }
        None => p.write_bool(false),
    }
}

fn decode_opt_blob<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Option<Vec<u8>>> {
    if r.read_bool()? {
        Ok(Some(r.read_blob()?))
    } else {
        Ok(None)
    }
}

fn encode_id_list(p: &mut Vec<u8>, ids: &[ResourceId]) -> Result<()> {
    p.write_u32_le(ids.len() as u32)?;
    for id in ids {
        p.write_id(*id)?;
    }
    Ok(())
}

fn decode_id_list<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Vec<ResourceId>> {
    let count = r.read_u32_le()?;
    if u64::from(count) * 8 > r.remaining_in_chunk() {
        return Err(ChunkError::Corrupt("id list count exceeds chunk"));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(r.read_id()?);
    }
    Ok(out)
}

fn decode_stage<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<ShaderStage> {
    ShaderStage::from_u32(r.read_u32_le()?).ok_or(ChunkError::Corrupt("unknown shader stage"))
}

fn encode_buffer_desc(p: &mut Vec<u8>, desc: &BufferDesc) -> Result<()> {
    p.write_u64_le(desc.size)?;
    p.write_u32_le(desc.bind.bits())?;
    p.write_bool(desc.cpu_writable)
}

fn decode_buffer_desc<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<BufferDesc> {
    Ok(BufferDesc {
        size: r.read_u64_le()?,
        bind: BindFlags::from_bits(r.read_u32_le()?)
            .ok_or(ChunkError::Corrupt("unknown bind flags"))?,
        cpu_writable: r.read_bool()?,
    })
}

fn encode_texture_desc(p: &mut Vec<u8>, desc: &TextureDesc) -> Result<()> {
    p.write_u32_le(desc.width)?;
    p.write_u32_le(desc.height)?;
    p.write_u32_le(desc.mips)?;
    p.write_u32_le(desc.format.as_u32())?;
    p.write_u32_le(desc.bind.bits())?;
    p.write_u32_le(desc.sample_count)
}

fn decode_texture_desc<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<TextureDesc> {
    Ok(TextureDesc {
        width: r.read_u32_le()?,
        height: r.read_u32_le()?,
        mips: r.read_u32_le()?,
        format: Format::from_u32(r.read_u32_le()?)
            .ok_or(ChunkError::Corrupt("unknown texture format"))?,
        bind: BindFlags::from_bits(r.read_u32_le()?)
            .ok_or(ChunkError::Corrupt("unknown bind flags"))?,
        sample_count: r.read_u32_le()?,
    })
}

fn encode_sampler_desc(p: &mut Vec<u8>, desc: &SamplerDesc) -> Result<()> {
    p.write_u32_le(match desc.filter {
        crate::driver::Filter::Point => 0,
        crate::driver::Filter::Linear => 1,
    })?;
    p.write_u32_le(match desc.address {
        crate::driver::AddressMode::Wrap => 0,
        crate::driver::AddressMode::Clamp => 1,
        crate::driver::AddressMode::Border => 2,
    })?;
    p.write_f32x4(&desc.border)
}

fn decode_sampler_desc<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<SamplerDesc> {
    let filter = match r.read_u32_le()? {
        0 => crate::driver::Filter::Point,
        1 => crate::driver::Filter::Linear,
        _ => return Err(ChunkError::Corrupt("unknown sampler filter")),
    };
    let address = match r.read_u32_le()? {
        0 => crate::driver::AddressMode::Wrap,
        1 => crate::driver::AddressMode::Clamp,
        2 => crate::driver::AddressMode::Border,
        _ => return Err(ChunkError::Corrupt("unknown address mode")),
    };
    Ok(SamplerDesc {
        filter,
        address,
        border: r.read_f32x4()?,
    })
}

fn encode_viewport(p: &mut Vec<u8>, v: &Viewport) -> Result<()> {
    p.write_f32_le(v.x)?;
    p.write_f32_le(v.y)?;
    p.write_f32_le(v.width)?;
    p.write_f32_le(v.height)?;
    p.write_f32_le(v.min_depth)?;
    p.write_f32_le(v.max_depth)
}

fn decode_viewport<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Viewport> {
    Ok(Viewport {
        x: r.read_f32_le()?,
        y: r.read_f32_le()?,
        width: r.read_f32_le()?,
        height: r.read_f32_le()?,
        min_depth: r.read_f32_le()?,
        max_depth: r.read_f32_le()?,
    })
}

fn encode_rect(p: &mut Vec<u8>, rect: &Rect) -> Result<()> {
    p.write_i32_le(rect.left)?;
    p.write_i32_le(rect.top)?;
    p.write_i32_le(rect.right)?;
    p.write_i32_le(rect.bottom)
}

fn decode_rect<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<Rect> {
    Ok(Rect {
        left: r.read_i32_le()?,
        top: r.read_i32_le()?,
        right: r.read_i32_le()?,
        bottom: r.read_i32_le()?,
    })
}
