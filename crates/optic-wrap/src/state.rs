use std::io::{Read, Seek};
use std::sync::Arc;

use optic_chunk::{ChunkError, ChunkReader, ReadLeExt, Result, WriteLeExt};
use optic_resource::{FrameRef, IdReadExt, IdWriteExt, ResourceId};

use crate::arena::{ObjectArena, ObjectInfo};
use crate::driver::{DriverResult, IndexFormat, NativeDriver, NativeHandle, NativeVertexBinding, Rect, ShaderStage, Viewport};
use crate::refcount::RefClass;

pub const MAX_VERTEX_BUFFER_SLOTS: usize = 16;
pub const MAX_CONSTANT_BUFFER_SLOTS: usize = 14;
pub const MAX_SHADER_RESOURCE_SLOTS: usize = 32;
pub const MAX_SAMPLER_SLOTS: usize = 16;
pub const MAX_RENDER_TARGETS: usize = 8;
pub const MAX_UAV_SLOTS: usize = 8;
pub const MAX_VIEWPORTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexBufferBinding {
    pub buffer: ResourceId,
    pub stride: u32,
    pub offset: u64,
}

/// Bindings of one programmable stage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageState {
    pub shader: ResourceId,
    pub constant_buffers: [ResourceId; MAX_CONSTANT_BUFFER_SLOTS],
    pub shader_resources: [ResourceId; MAX_SHADER_RESOURCE_SLOTS],
    pub samplers: [ResourceId; MAX_SAMPLER_SLOTS],
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputAssembly {
    pub vertex_buffers: [VertexBufferBinding; MAX_VERTEX_BUFFER_SLOTS],
    pub index_buffer: ResourceId,
    pub index_format: IndexFormat,
    pub index_offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputMerger {
    pub render_targets: [ResourceId; MAX_RENDER_TARGETS],
    pub depth_view: ResourceId,
    pub uavs: [ResourceId; MAX_UAV_SLOTS],
    pub blend_state: ResourceId,
    pub blend_factor: [f32; 4],
    pub depth_state: ResourceId,
    pub stencil_ref: u32,
}

impl Default for OutputMerger {
    fn default() -> Self {
        Self {
            render_targets: Default::default(),
            depth_view: ResourceId::NULL,
            uavs: Default::default(),
            blend_state: ResourceId::NULL,
            blend_factor: [1.0; 4],
            depth_state: ResourceId::NULL,
            stencil_ref: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rasterizer {
    pub state: ResourceId,
    pub viewports: Vec<Viewport>,
    pub scissors: Vec<Rect>,
}

/// Everything mutable a context binds: the full pipeline state as one plain
/// value. Serializes by id; applying a fetched value back to a context and
/// re-fetching yields an equal value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderState {
    pub ia: InputAssembly,
    pub stages: [StageState; 3],
    pub om: OutputMerger,
    pub rs: Rasterizer,
}

impl RenderState {
    pub fn stage(&self, stage: ShaderStage) -> &StageState {
        &self.stages[stage.index()]
    }

    pub fn stage_mut(&mut self, stage: ShaderStage) -> &mut StageState {
        &mut self.stages[stage.index()]
    }

    pub fn clear(&mut self) {
        *self = RenderState::default();
    }

    /// Visit every id referenced by a binding point.
    pub fn for_each_id(&self, f: &mut dyn FnMut(ResourceId)) {
        for vb in &self.ia.vertex_buffers {
            f(vb.buffer);
        }
        f(self.ia.index_buffer);
        for stage in &self.stages {
            f(stage.shader);
            for &id in &stage.constant_buffers {
                f(id);
            }
            for &id in &stage.shader_resources {
                f(id);
            }
            for &id in &stage.samplers {
                f(id);
            }
        }
        f(self.rs.state);
        for &id in &self.om.render_targets {
            f(id);
        }
        f(self.om.depth_view);
        for &id in &self.om.uavs {
            f(id);
        }
        f(self.om.blend_state);
        f(self.om.depth_state);
    }

    fn for_each_id_mut(&mut self, f: &mut dyn FnMut(&mut ResourceId)) {
        for vb in &mut self.ia.vertex_buffers {
            f(&mut vb.buffer);
        }
        f(&mut self.ia.index_buffer);
        for stage in &mut self.stages {
            f(&mut stage.shader);
            for id in &mut stage.constant_buffers {
                f(id);
            }
            for id in &mut stage.shader_resources {
                f(id);
            }
            for id in &mut stage.samplers {
                f(id);
            }
        }
        f(&mut self.rs.state);
        for id in &mut self.om.render_targets {
            f(id);
        }
        f(&mut self.om.depth_view);
        for id in &mut self.om.uavs {
            f(id);
        }
        f(&mut self.om.blend_state);
        f(&mut self.om.depth_state);
    }

    /// Map every serialized id through `resolve`. Ids that resolve to
    /// nothing become null, i.e. unbound, which is the degraded-but-working
    /// outcome for partial captures.
    pub fn resolve_ids(&mut self, resolve: &dyn Fn(ResourceId) -> ResourceId) {
        self.for_each_id_mut(&mut |id| {
            if !id.is_null() {
                *id = resolve(*id);
            }
        });
    }

    pub fn encode(&self, p: &mut Vec<u8>) -> Result<()> {
        for vb in &self.ia.vertex_buffers {
            p.write_id(vb.buffer)?;
            p.write_u32_le(vb.stride)?;
            p.write_u64_le(vb.offset)?;
        }
        p.write_id(self.ia.index_buffer)?;
        p.write_u32_le(self.ia.index_format.as_u32())?;
        p.write_u64_le(self.ia.index_offset)?;

        for stage in &self.stages {
            p.write_id(stage.shader)?;
            for &id in &stage.constant_buffers {
                p.write_id(id)?;
            }
            for &id in &stage.shader_resources {
                p.write_id(id)?;
            }
            for &id in &stage.samplers {
                p.write_id(id)?;
            }
        }

        p.write_id(self.rs.state)?;
        p.write_u32_le(self.rs.viewports.len() as u32)?;
        for v in &self.rs.viewports {
            p.write_f32_le(v.x)?;
            p.write_f32_le(v.y)?;
            p.write_f32_le(v.width)?;
            p.write_f32_le(v.height)?;
            p.write_f32_le(v.min_depth)?;
            p.write_f32_le(v.max_depth)?;
        }
        p.write_u32_le(self.rs.scissors.len() as u32)?;
        for r in &self.rs.scissors {
            p.write_i32_le(r.left)?;
            p.write_i32_le(r.top)?;
            p.write_i32_le(r.right)?;
            p.write_i32_le(r.bottom)?;
        }

        for &id in &self.om.render_targets {
            p.write_id(id)?;
        }
        p.write_id(self.om.depth_view)?;
        for &id in &self.om.uavs {
            p.write_id(id)?;
        }
        p.write_id(self.om.blend_state)?;
        p.write_f32x4(&self.om.blend_factor)?;
        p.write_id(self.om.depth_state)?;
        p.write_u32_le(self.om.stencil_ref)?;
        Ok(())
    }

    pub fn decode<R: Read + Seek>(r: &mut ChunkReader<R>) -> Result<RenderState> {
        let mut state = RenderState::default();

        for vb in &mut state.ia.vertex_buffers {
            vb.buffer = r.read_id()?;
            vb.stride = r.read_u32_le()?;
            vb.offset = r.read_u64_le()?;
        }
        state.ia.index_buffer = r.read_id()?;
        state.ia.index_format = IndexFormat::from_u32(r.read_u32_le()?)
            .ok_or(ChunkError::Corrupt("unknown index format"))?;
        state.ia.index_offset = r.read_u64_le()?;

        for stage in &mut state.stages {
            stage.shader = r.read_id()?;
            for id in &mut stage.constant_buffers {
                *id = r.read_id()?;
            }
            for id in &mut stage.shader_resources {
                *id = r.read_id()?;
            }
            for id in &mut stage.samplers {
                *id = r.read_id()?;
            }
        }

        state.rs.state = r.read_id()?;
        let viewport_count = r.read_u32_le()?;
        if u64::from(viewport_count) * 24 > r.remaining_in_chunk() {
            return Err(ChunkError::Corrupt("viewport count exceeds chunk"));
        }
        for _ in 0..viewport_count {
            state.rs.viewports.push(Viewport {
                x: r.read_f32_le()?,
                y: r.read_f32_le()?,
                width: r.read_f32_le()?,
                height: r.read_f32_le()?,
                min_depth: r.read_f32_le()?,
                max_depth: r.read_f32_le()?,
            });
        }
        let scissor_count = r.read_u32_le()?;
        if u64::from(scissor_count) * 16 > r.remaining_in_chunk() {
            return Err(ChunkError::Corrupt("scissor count exceeds chunk"));
        }
        for _ in 0..scissor_count {
            state.rs.scissors.push(Rect {
                left: r.read_i32_le()?,
                top: r.read_i32_le()?,
                right: r.read_i32_le()?,
                bottom: r.read_i32_le()?,
            });
        }

        for id in &mut state.om.render_targets {
            *id = r.read_id()?;
        }
        state.om.depth_view = r.read_id()?;
        for id in &mut state.om.uavs {
            *id = r.read_id()?;
        }
        state.om.blend_state = r.read_id()?;
        state.om.blend_factor = r.read_f32x4()?;
        state.om.depth_state = r.read_id()?;
        state.om.stencil_ref = r.read_u32_le()?;
        Ok(state)
    }

    /// The minimum region the bound viewports (plus scissors, when the
    /// raster state enables them) allow writing to. If that region does not
    /// cover the whole of the first bound target, target writes are partial
    /// updates and their previous contents matter.
    fn viewport_scissor_partial(&self, arena: &ObjectArena) -> bool {
        let scissor_enable = self
            .rs
            .state
            .is_null()
            .then_some(false)
            .or_else(|| {
                arena
                    .get(self.rs.state)
                    .and_then(|e| e.info().raster_desc().map(|d| d.scissor_enable))
            })
            .unwrap_or(false);

        let mut min = Rect {
            left: 0,
            top: 0,
            right: i32::MAX,
            bottom: i32::MAX,
        };

        for (v, viewport) in self.rs.viewports.iter().enumerate() {
            let mut rect = Rect {
                left: viewport.x as i32,
                top: viewport.y as i32,
                right: viewport.width as i32,
                bottom: viewport.height as i32,
            };

            // The scissor (when enabled) is relative to its viewport.
            if scissor_enable {
                if let Some(scissor) = self.rs.scissors.get(v) {
                    rect.left += scissor.left;
                    rect.top += scissor.top;
                    rect.right = rect.right.min(scissor.right - scissor.left);
                    rect.bottom = rect.bottom.min(scissor.bottom - scissor.top);
                }
            }

            min.left = min.left.max(rect.left);
            min.top = min.top.max(rect.top);
            min.right = min.right.min(rect.right);
            min.bottom = min.bottom.min(rect.bottom);
        }

        if min.left > 0 || min.top > 0 {
            return true;
        }

        let target_view = self
            .om
            .render_targets
            .iter()
            .copied()
            .find(|id| !id.is_null())
            .or((!self.om.depth_view.is_null()).then_some(self.om.depth_view));
        let Some(view) = target_view else {
            return false;
        };

        let parent = arena.get(view).map(|e| e.parent()).unwrap_or(ResourceId::NULL);
        let Some(resource) = arena.get(parent) else {
            // Unknown target: assume a partial update.
            return true;
        };
        match resource.info() {
            ObjectInfo::Texture2d(desc) => {
                min.right < desc.width as i32 || min.bottom < desc.height as i32
            }
            // Writes through a buffer-backed target never cover "the whole
            // surface" in any sense we can prove.
            _ => true,
        }
    }

    /// Record a usage event per bound resource. Targets and unordered views
    /// mark their underlying resource, not just the view; unordered access
    /// is conservatively read+write; partially covered targets are
    /// read+write rather than write-only.
    pub fn mark_referenced(
        &self,
        arena: &ObjectArena,
        initial: bool,
        mark: &mut dyn FnMut(ResourceId, FrameRef),
    ) {
        let rd = if initial { FrameRef::Unknown } else { FrameRef::Read };
        let wr = if initial { FrameRef::Unknown } else { FrameRef::Write };

        for vb in &self.ia.vertex_buffers {
            mark(vb.buffer, rd);
        }
        mark(self.ia.index_buffer, rd);

        for stage in &self.stages {
            mark(stage.shader, rd);
            for &id in &stage.constant_buffers {
                mark(id, rd);
            }
            for &id in &stage.samplers {
                mark(id, rd);
            }
            for &view in &stage.shader_resources {
                if view.is_null() {
                    continue;
                }
                mark(view, rd);
                if let Some(entry) = arena.get(view) {
                    mark(entry.parent(), rd);
                }
            }
        }

        mark(self.rs.state, rd);
        mark(self.om.blend_state, rd);
        mark(self.om.depth_state, rd);

        let partial = self.viewport_scissor_partial(arena);

        for &view in &self.om.render_targets {
            if view.is_null() {
                continue;
            }
            mark(view, rd);
            if let Some(entry) = arena.get(view) {
                let parent = entry.parent();
                if partial {
                    mark(parent, rd);
                }
                mark(parent, wr);
            }
        }

        for &view in &self.om.uavs {
            if view.is_null() {
                continue;
            }
            // Unordered access patterns are unknown at bind time.
            mark(view, rd);
            mark(view, wr);
            if let Some(entry) = arena.get(view) {
                mark(entry.parent(), rd);
                mark(entry.parent(), wr);
            }
        }

        if !self.om.depth_view.is_null() {
            mark(self.om.depth_view, rd);
            if let Some(entry) = arena.get(self.om.depth_view) {
                let parent = entry.parent();
                if partial {
                    mark(parent, rd);
                }
                mark(parent, wr);
            }
        }
    }

    /// Resources the GPU may write through this state; their cached initial
    /// contents are suspect.
    pub fn mark_dirty_targets(&self, arena: &ObjectArena, mark_dirty: &mut dyn FnMut(ResourceId)) {
        for &view in self
            .om
            .render_targets
            .iter()
            .chain(self.om.uavs.iter())
            .chain(std::iter::once(&self.om.depth_view))
        {
            if view.is_null() {
                continue;
            }
            if let Some(entry) = arena.get(view) {
                mark_dirty(entry.parent());
            }
        }
    }

    /// Whether `id` (a resource or a view over it) is bound at any
    /// write-capable binding point. Depth/stencil views flagged read-only
    /// are exempt when the caller allows it.
    pub fn is_bound_for_write(
        &self,
        arena: &ObjectArena,
        id: ResourceId,
        allow_depth_read_only: bool,
        allow_stencil_read_only: bool,
    ) -> bool {
        let matches_target = |view: ResourceId| {
            !view.is_null()
                && (view == id
                    || arena.get(view).map(|e| e.parent() == id).unwrap_or(false))
        };

        if self.om.render_targets.iter().copied().any(matches_target) {
            return true;
        }
        if self.om.uavs.iter().copied().any(matches_target) {
            return true;
        }
        if matches_target(self.om.depth_view) {
            let read_only = arena
                .get(self.om.depth_view)
                .and_then(|e| e.info().depth_view_desc().copied())
                .unwrap_or_default();
            let depth_settled = read_only.read_only_depth && allow_depth_read_only;
            let stencil_settled = read_only.read_only_stencil && allow_stencil_read_only;
            if !(depth_settled && stencil_settled) {
                return true;
            }
        }
        false
    }
}

/// The live binding mirror of one context. Mutations keep pipeline
/// references on the arena in step with the slots, so an object the
/// application has released survives for as long as it stays bound.
pub struct LiveState {
    state: RenderState,
    arena: Arc<ObjectArena>,
}

impl LiveState {
    pub fn new(arena: Arc<ObjectArena>) -> Self {
        Self {
            state: RenderState::default(),
            arena,
        }
    }

    pub fn state(&self) -> &RenderState {
        &self.state
    }

    /// Read every binding point into a detached snapshot. Snapshots hold no
    /// pipeline references.
    pub fn fetch(&self) -> RenderState {
        self.state.clone()
    }

    fn set_slot(arena: &ObjectArena, slot: &mut ResourceId, new: ResourceId) -> bool {
        if *slot == new {
            return false;
        }
        if !slot.is_null() {
            arena.release(*slot, RefClass::Pipeline);
        }
        if new.is_null() || arena.add_ref(new, RefClass::Pipeline).is_some() {
            *slot = new;
        } else {
            tracing::warn!("binding dead object {new}; leaving the slot unbound");
            *slot = ResourceId::NULL;
        }
        true
    }

    pub fn set_shader(&mut self, stage: ShaderStage, shader: ResourceId) {
        Self::set_slot(&self.arena, &mut self.state.stages[stage.index()].shader, shader);
    }

    pub fn set_constant_buffers(&mut self, stage: ShaderStage, first_slot: u32, ids: &[ResourceId]) {
        let slots = &mut self.state.stages[stage.index()].constant_buffers;
        for (i, &id) in ids.iter().enumerate() {
            if let Some(slot) = slots.get_mut(first_slot as usize + i) {
                Self::set_slot(&self.arena, slot, id);
            }
        }
    }

    pub fn set_shader_resources(&mut self, stage: ShaderStage, first_slot: u32, ids: &[ResourceId]) {
        let slots = &mut self.state.stages[stage.index()].shader_resources;
        for (i, &id) in ids.iter().enumerate() {
            if let Some(slot) = slots.get_mut(first_slot as usize + i) {
                Self::set_slot(&self.arena, slot, id);
            }
        }
    }

    pub fn set_samplers(&mut self, stage: ShaderStage, first_slot: u32, ids: &[ResourceId]) {
        let slots = &mut self.state.stages[stage.index()].samplers;
        for (i, &id) in ids.iter().enumerate() {
            if let Some(slot) = slots.get_mut(first_slot as usize + i) {
                Self::set_slot(&self.arena, slot, id);
            }
        }
    }

    pub fn set_vertex_buffers(&mut self, first_slot: u32, bindings: &[VertexBufferBinding]) {
        for (i, binding) in bindings.iter().enumerate() {
            if let Some(slot) = self
                .state
                .ia
                .vertex_buffers
                .get_mut(first_slot as usize + i)
            {
                Self::set_slot(&self.arena, &mut slot.buffer, binding.buffer);
                slot.stride = binding.stride;
                slot.offset = binding.offset;
            }
        }
    }

    pub fn set_index_buffer(&mut self, buffer: ResourceId, format: IndexFormat, offset: u64) {
        Self::set_slot(&self.arena, &mut self.state.ia.index_buffer, buffer);
        self.state.ia.index_format = format;
        self.state.ia.index_offset = offset;
    }

    pub fn set_render_targets(&mut self, colors: &[ResourceId], depth: ResourceId) {
        for i in 0..MAX_RENDER_TARGETS {
            let id = colors.get(i).copied().unwrap_or(ResourceId::NULL);
            Self::set_slot(&self.arena, &mut self.state.om.render_targets[i], id);
        }
        Self::set_slot(&self.arena, &mut self.state.om.depth_view, depth);
    }

    pub fn set_unordered_access_views(&mut self, first_slot: u32, ids: &[ResourceId]) {
        for (i, &id) in ids.iter().enumerate() {
            if let Some(slot) = self.state.om.uavs.get_mut(first_slot as usize + i) {
                Self::set_slot(&self.arena, slot, id);
            }
        }
    }

    pub fn set_viewports(&mut self, viewports: &[Viewport]) {
        self.state.rs.viewports = viewports[..viewports.len().min(MAX_VIEWPORTS)].to_vec();
    }

    pub fn set_scissors(&mut self, rects: &[Rect]) {
        self.state.rs.scissors = rects[..rects.len().min(MAX_VIEWPORTS)].to_vec();
    }

    pub fn set_blend_state(&mut self, state: ResourceId, factor: [f32; 4]) {
        Self::set_slot(&self.arena, &mut self.state.om.blend_state, state);
        self.state.om.blend_factor = factor;
    }

    pub fn set_depth_state(&mut self, state: ResourceId, stencil_ref: u32) {
        Self::set_slot(&self.arena, &mut self.state.om.depth_state, state);
        self.state.om.stencil_ref = stencil_ref;
    }

    pub fn set_raster_state(&mut self, state: ResourceId) {
        Self::set_slot(&self.arena, &mut self.state.rs.state, state);
    }

    /// Drop every binding (and the pipeline references behind them) without
    /// touching the driver. Used when a deferred recording is finished and
    /// the context restarts clean.
    pub fn reset(&mut self) {
        self.release_all_refs();
        self.state = RenderState::default();
    }

    fn release_all_refs(&mut self) {
        let arena = self.arena.clone();
        self.state.for_each_id_mut(&mut |id| {
            if !id.is_null() {
                arena.release(*id, RefClass::Pipeline);
                *id = ResourceId::NULL;
            }
        });
        self.state.rs.viewports.clear();
        self.state.rs.scissors.clear();
    }

    /// Clear every binding point, releasing the pipeline references held by
    /// the mirror, and tell the driver to do the same.
    pub fn clear_to_driver(
        &mut self,
        driver: &dyn NativeDriver,
        ctx: NativeHandle,
    ) -> DriverResult<()> {
        self.release_all_refs();
        self.state = RenderState::default();

        let none_cb = [None; MAX_CONSTANT_BUFFER_SLOTS];
        let none_srv = [None; MAX_SHADER_RESOURCE_SLOTS];
        let none_samp = [None; MAX_SAMPLER_SLOTS];
        let none_vb: [Option<NativeVertexBinding>; MAX_VERTEX_BUFFER_SLOTS] =
            [None; MAX_VERTEX_BUFFER_SLOTS];
        for stage in ShaderStage::ALL {
            driver.bind_shader(ctx, stage, None)?;
            driver.bind_constant_buffers(ctx, stage, 0, &none_cb)?;
            driver.bind_shader_resources(ctx, stage, 0, &none_srv)?;
            driver.bind_samplers(ctx, stage, 0, &none_samp)?;
        }
        driver.bind_vertex_buffers(ctx, 0, &none_vb)?;
        driver.bind_index_buffer(ctx, None, IndexFormat::Uint16, 0)?;
        driver.set_raster_state(ctx, None)?;
        driver.set_viewports(ctx, &[])?;
        driver.set_scissors(ctx, &[])?;
        driver.bind_render_targets(ctx, &[None; MAX_RENDER_TARGETS], None)?;
        driver.bind_unordered_access_views(ctx, 0, &[None; MAX_UAV_SLOTS])?;
        driver.set_blend_state(ctx, None, [1.0; 4])?;
        driver.set_depth_state(ctx, None, 0)?;
        Ok(())
    }

    fn native(&self, id: ResourceId) -> Option<NativeHandle> {
        if id.is_null() {
            None
        } else {
            self.arena.native_of(id)
        }
    }

    /// Rebind every recorded binding point of `target` in fixed stage order:
    /// input assembly, then per-stage bindings, then rasterizer, then output
    /// merger. Target count must be settled before depth compatibility is
    /// checked, which is why the output merger comes last.
    pub fn apply(
        &mut self,
        target: &RenderState,
        driver: &dyn NativeDriver,
        ctx: NativeHandle,
    ) -> DriverResult<()> {
        self.clear_to_driver(driver, ctx)?;

        // Input assembly.
        let mut vbs: [Option<NativeVertexBinding>; MAX_VERTEX_BUFFER_SLOTS] =
            [None; MAX_VERTEX_BUFFER_SLOTS];
        for (i, vb) in target.ia.vertex_buffers.iter().enumerate() {
            vbs[i] = self.native(vb.buffer).map(|buffer| NativeVertexBinding {
                buffer,
                stride: vb.stride,
                offset: vb.offset,
            });
        }
        driver.bind_vertex_buffers(ctx, 0, &vbs)?;
        driver.bind_index_buffer(
            ctx,
            self.native(target.ia.index_buffer),
            target.ia.index_format,
            target.ia.index_offset,
        )?;
        self.set_vertex_buffers(0, &target.ia.vertex_buffers);
        self.set_index_buffer(
            target.ia.index_buffer,
            target.ia.index_format,
            target.ia.index_offset,
        );

        // Per-stage bindings.
        for stage in ShaderStage::ALL {
            let src = target.stage(stage);
            let cbs: Vec<Option<NativeHandle>> =
                src.constant_buffers.iter().map(|&id| self.native(id)).collect();
            driver.bind_constant_buffers(ctx, stage, 0, &cbs)?;
            let srvs: Vec<Option<NativeHandle>> =
                src.shader_resources.iter().map(|&id| self.native(id)).collect();
            driver.bind_shader_resources(ctx, stage, 0, &srvs)?;
            let samps: Vec<Option<NativeHandle>> =
                src.samplers.iter().map(|&id| self.native(id)).collect();
            driver.bind_samplers(ctx, stage, 0, &samps)?;
            driver.bind_shader(ctx, stage, self.native(src.shader))?;

            self.set_constant_buffers(stage, 0, &src.constant_buffers);
            self.set_shader_resources(stage, 0, &src.shader_resources);
            self.set_samplers(stage, 0, &src.samplers);
            self.set_shader(stage, src.shader);
        }

        // Rasterizer.
        driver.set_raster_state(ctx, self.native(target.rs.state))?;
        driver.set_viewports(ctx, &target.rs.viewports)?;
        driver.set_scissors(ctx, &target.rs.scissors)?;
        self.set_raster_state(target.rs.state);
        self.set_viewports(&target.rs.viewports);
        self.set_scissors(&target.rs.scissors);

        // Output merger.
        let colors: Vec<Option<NativeHandle>> =
            target.om.render_targets.iter().map(|&id| self.native(id)).collect();
        driver.bind_render_targets(ctx, &colors, self.native(target.om.depth_view))?;
        let uavs: Vec<Option<NativeHandle>> =
            target.om.uavs.iter().map(|&id| self.native(id)).collect();
        driver.bind_unordered_access_views(ctx, 0, &uavs)?;
        driver.set_blend_state(ctx, self.native(target.om.blend_state), target.om.blend_factor)?;
        driver.set_depth_state(ctx, self.native(target.om.depth_state), target.om.stencil_ref)?;
        self.set_render_targets(&target.om.render_targets, target.om.depth_view);
        self.set_unordered_access_views(0, &target.om.uavs);
        self.set_blend_state(target.om.blend_state, target.om.blend_factor);
        self.set_depth_state(target.om.depth_state, target.om.stencil_ref);

        Ok(())
    }

    /// Force-unbind every write-capable binding of `id` before the caller
    /// maps or reads it back, re-issuing the affected output-merger binds.
    /// Returns whether anything was unbound.
    pub fn unbind_for_write(
        &mut self,
        id: ResourceId,
        driver: &dyn NativeDriver,
        ctx: NativeHandle,
    ) -> DriverResult<bool> {
        if !self.state.is_bound_for_write(&self.arena, id, true, true) {
            return Ok(false);
        }
        let matches_target = |arena: &ObjectArena, view: ResourceId| {
            !view.is_null()
                && (view == id || arena.get(view).map(|e| e.parent() == id).unwrap_or(false))
        };

        let mut targets = self.state.om.render_targets;
        let mut depth = self.state.om.depth_view;
        let mut uavs = self.state.om.uavs;
        for slot in &mut targets {
            if matches_target(&self.arena, *slot) {
                *slot = ResourceId::NULL;
            }
        }
        if matches_target(&self.arena, depth) {
            let read_only = self
                .arena
                .get(depth)
                .and_then(|e| e.info().depth_view_desc().copied())
                .unwrap_or_default();
            if !(read_only.read_only_depth && read_only.read_only_stencil) {
                depth = ResourceId::NULL;
            }
        }
        for slot in &mut uavs {
            if matches_target(&self.arena, *slot) {
                *slot = ResourceId::NULL;
            }
        }

        let colors: Vec<Option<NativeHandle>> = targets.iter().map(|&t| self.native(t)).collect();
        driver.bind_render_targets(ctx, &colors, self.native(depth))?;
        let native_uavs: Vec<Option<NativeHandle>> = uavs.iter().map(|&u| self.native(u)).collect();
        driver.bind_unordered_access_views(ctx, 0, &native_uavs)?;

        self.set_render_targets(&targets, depth);
        self.set_unordered_access_views(0, &uavs);
        Ok(true)
    }

    /// Unbind every read-capable binding of `id` before the caller performs
    /// a write that would otherwise race a stale read binding.
    pub fn unbind_for_read(
        &mut self,
        id: ResourceId,
        driver: &dyn NativeDriver,
        ctx: NativeHandle,
    ) -> DriverResult<bool> {
        let arena = self.arena.clone();
        let matches_view = |view: ResourceId| {
            !view.is_null()
                && (view == id || arena.get(view).map(|e| e.parent() == id).unwrap_or(false))
        };

        let mut changed = false;
        for stage in ShaderStage::ALL {
            let srvs = self.state.stages[stage.index()].shader_resources;
            if srvs.iter().copied().any(|v| matches_view(v)) {
                let new: Vec<ResourceId> = srvs
                    .iter()
                    .map(|&v| if matches_view(v) { ResourceId::NULL } else { v })
                    .collect();
                let natives: Vec<Option<NativeHandle>> =
                    new.iter().map(|&v| self.native(v)).collect();
                driver.bind_shader_resources(ctx, stage, 0, &natives)?;
                self.set_shader_resources(stage, 0, &new);
                changed = true;
            }
            let cbs = self.state.stages[stage.index()].constant_buffers;
            if cbs.contains(&id) {
                let new: Vec<ResourceId> = cbs
                    .iter()
                    .map(|&v| if v == id { ResourceId::NULL } else { v })
                    .collect();
                let natives: Vec<Option<NativeHandle>> =
                    new.iter().map(|&v| self.native(v)).collect();
                driver.bind_constant_buffers(ctx, stage, 0, &natives)?;
                self.set_constant_buffers(stage, 0, &new);
                changed = true;
            }
        }

        if self.state.ia.vertex_buffers.iter().any(|vb| vb.buffer == id) {
            let mut new = self.state.ia.vertex_buffers;
            let mut natives: [Option<NativeVertexBinding>; MAX_VERTEX_BUFFER_SLOTS] =
                [None; MAX_VERTEX_BUFFER_SLOTS];
            for (i, vb) in new.iter_mut().enumerate() {
                if vb.buffer == id {
                    vb.buffer = ResourceId::NULL;
                }
                natives[i] = self.native(vb.buffer).map(|buffer| NativeVertexBinding {
                    buffer,
                    stride: vb.stride,
                    offset: vb.offset,
                });
            }
            driver.bind_vertex_buffers(ctx, 0, &natives)?;
            self.set_vertex_buffers(0, &new);
            changed = true;
        }
        if self.state.ia.index_buffer == id {
            driver.bind_index_buffer(ctx, None, self.state.ia.index_format, 0)?;
            self.set_index_buffer(ResourceId::NULL, self.state.ia.index_format, 0);
            changed = true;
        }
        Ok(changed)
    }
}

impl Drop for LiveState {
    fn drop(&mut self) {
        self.release_all_refs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ObjectKind, ObjectInfo};
    use crate::driver::{
        BindFlags, DepthStencilViewDesc, Format, RenderTargetViewDesc, TextureDesc,
    };
    use optic_chunk::{Chunk, ChunkKind, ChunkWriter};
    use optic_resource::FrameRefs;
    use std::io::Cursor;

    fn arena_with_target(width: u32, height: u32) -> (ObjectArena, ResourceId, ResourceId) {
        let arena = ObjectArena::new();
        let tex = ResourceId::from_raw(1);
        let view = ResourceId::from_raw(2);
        arena.insert(
            tex,
            ObjectKind::Texture2d,
            ObjectInfo::Texture2d(TextureDesc {
                width,
                height,
                mips: 1,
                format: Format::Rgba8Unorm,
                bind: BindFlags::RENDER_TARGET,
                sample_count: 1,
            }),
            NativeHandle(0x1),
        );
        arena.insert(
            view,
            ObjectKind::RenderTargetView,
            ObjectInfo::RenderTargetView {
                parent: tex,
                desc: RenderTargetViewDesc::default(),
            },
            NativeHandle(0x2),
        );
        (arena, tex, view)
    }

    fn collect_refs(state: &RenderState, arena: &ObjectArena) -> FrameRefs {
        let mut refs = FrameRefs::new();
        state.mark_referenced(arena, false, &mut |id, r| {
            refs.mark(id, r);
        });
        refs
    }

    #[test]
    fn half_covered_render_target_is_read_and_write() {
        let (arena, tex, view) = arena_with_target(100, 100);
        let mut state = RenderState::default();
        state.om.render_targets[0] = view;
        state.rs.viewports = vec![Viewport {
            x: 0.0,
            y: 0.0,
            width: 50.0,
            height: 100.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }];

        let refs = collect_refs(&state, &arena);
        assert_eq!(refs.get(tex), Some(FrameRef::ReadBeforeWrite));
        assert!(refs.get(tex).unwrap().needs_initial_contents());
    }

    #[test]
    fn fully_covered_render_target_is_write_only() {
        let (arena, tex, view) = arena_with_target(100, 100);
        let mut state = RenderState::default();
        state.om.render_targets[0] = view;
        state.rs.viewports = vec![Viewport {
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 100.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }];

        let refs = collect_refs(&state, &arena);
        assert_eq!(refs.get(tex), Some(FrameRef::Write));
        assert!(!refs.get(tex).unwrap().needs_initial_contents());
    }

    #[test]
    fn unordered_views_are_always_read_and_write() {
        let (arena, tex, view) = arena_with_target(16, 16);
        let mut state = RenderState::default();
        state.om.uavs[0] = view;

        let refs = collect_refs(&state, &arena);
        assert_eq!(refs.get(tex), Some(FrameRef::ReadBeforeWrite));
        assert_eq!(refs.get(view), Some(FrameRef::ReadBeforeWrite));
    }

    #[test]
    fn encode_decode_round_trips_and_resolves() {
        let mut state = RenderState::default();
        state.ia.vertex_buffers[0] = VertexBufferBinding {
            buffer: ResourceId::from_raw(10),
            stride: 16,
            offset: 0,
        };
        state.stages[0].shader = ResourceId::from_raw(11);
        state.om.render_targets[0] = ResourceId::from_raw(12);
        state.om.stencil_ref = 3;
        state.rs.viewports = vec![Viewport {
            x: 0.0,
            y: 0.0,
            width: 64.0,
            height: 64.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }];

        let chunk = Chunk::build(ChunkKind(900), 1, |p| state.encode(p)).unwrap();
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.write_stream_version().unwrap();
        w.write_chunk(&chunk).unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut r = ChunkReader::open(Cursor::new(bytes)).unwrap();
        r.read_stream_version().unwrap();
        r.begin_chunk().unwrap().unwrap();
        let mut decoded = RenderState::decode(&mut r).unwrap();
        r.end_chunk().unwrap();
        assert_eq!(decoded, state);

        // Ids that resolve to nothing become unbound rather than erroring.
        decoded.resolve_ids(&|id| {
            if id == ResourceId::from_raw(11) {
                ResourceId::from_raw(111)
            } else {
                ResourceId::NULL
            }
        });
        assert_eq!(decoded.stages[0].shader, ResourceId::from_raw(111));
        assert!(decoded.om.render_targets[0].is_null());
        assert!(decoded.ia.vertex_buffers[0].buffer.is_null());
    }

    #[test]
    fn bound_object_survives_release_until_unbound() {
        let (arena, _tex, view) = arena_with_target(8, 8);
        let arena = Arc::new(arena);
        let mut live = LiveState::new(arena.clone());

        live.set_render_targets(&[view], ResourceId::NULL);
        // The app drops its only reference; the pipeline ref keeps it alive.
        assert!(matches!(
            arena.release(view, RefClass::External),
            crate::arena::ReleaseOutcome::Alive { .. }
        ));
        assert!(arena.contains(view));

        // Rebinding away drops the pipeline ref and destroys the view.
        live.set_render_targets(&[], ResourceId::NULL);
        assert!(!arena.contains(view));
    }

    #[test]
    fn read_only_depth_view_is_exempt_from_write_detection() {
        let arena = ObjectArena::new();
        let tex = ResourceId::from_raw(1);
        let dsv = ResourceId::from_raw(2);
        arena.insert(
            tex,
            ObjectKind::Texture2d,
            ObjectInfo::Texture2d(TextureDesc {
                width: 32,
                height: 32,
                mips: 1,
                format: Format::D24UnormS8,
                bind: BindFlags::DEPTH_STENCIL,
                sample_count: 1,
            }),
            NativeHandle(0x1),
        );
        arena.insert(
            dsv,
            ObjectKind::DepthStencilView,
            ObjectInfo::DepthStencilView {
                parent: tex,
                desc: DepthStencilViewDesc {
                    mip: 0,
                    read_only_depth: true,
                    read_only_stencil: true,
                },
            },
            NativeHandle(0x2),
        );

        let mut state = RenderState::default();
        state.om.depth_view = dsv;

        assert!(!state.is_bound_for_write(&arena, tex, true, true));
        // Without permission to treat read-only views as reads, the binding
        // still counts as a write hazard.
        assert!(state.is_bound_for_write(&arena, tex, false, false));
    }
}
