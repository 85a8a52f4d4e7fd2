use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use optic_chunk::Chunk;
use optic_resource::{FrameRef, FrameRefs, ResourceId, Role};
use optic_wrap::{
    Buffer, Call, CommandList, CommandListData, DepthStencilView, DriverError, IndexFormat,
    LiveState, MapMode, NativeDriver, NativeHandle, NativeVertexBinding, ObjectArena, ObjectInfo,
    ObjectKind, RasterState, Rect, RenderState, RenderTargetView, Sampler, Shader,
    ShaderResourceView, ShaderStage, UnorderedAccessView, VertexBufferBinding, Viewport,
    WrappedHandle,
};

use crate::container::section;
use crate::device::{DeviceShared, WrappedDevice};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Calls forward to the driver as they arrive.
    Immediate,
    /// Calls are recorded without forwarding; the recording becomes a
    /// command list at `finish_command_list`.
    Deferred,
}

/// Vertex-buffer slot binding at the wrapped API surface.
#[derive(Clone, Copy, Default)]
pub struct VertexBufferRef<'a> {
    pub buffer: Option<&'a Buffer>,
    pub stride: u32,
    pub offset: u64,
}

/// CPU-side window into a mapped resource. The application writes into
/// `data`; `Context::unmap` pushes it back to the driver and, when
/// recording, into the capture.
pub struct Mapping {
    pub data: Vec<u8>,
    id: ResourceId,
    mode: MapMode,
}

impl Mapping {
    pub fn resource(&self) -> ResourceId {
        self.id
    }

    pub fn mode(&self) -> MapMode {
        self.mode
    }
}

#[derive(Default)]
struct RecordedStream {
    chunks: Vec<Chunk>,
    calls: Vec<Call>,
}

pub(crate) struct ContextShared {
    device: Weak<DeviceShared>,
    index: u32,
    kind: ContextKind,
    native: Option<NativeHandle>,
    state: Mutex<LiveState>,
    record: Mutex<RecordedStream>,
    refs: Mutex<FrameRefs>,
    open_maps: Mutex<HashMap<ResourceId, MapMode>>,
    /// Annotation queue: fillable from any thread, drained into the chunk
    /// stream by the next ordinary call on this context.
    markers: Mutex<Vec<Call>>,
}

impl ContextShared {
    pub(crate) fn new(
        device: Weak<DeviceShared>,
        index: u32,
        kind: ContextKind,
        native: Option<NativeHandle>,
    ) -> Arc<ContextShared> {
        let arena = device
            .upgrade()
            .expect("context created against a dead device")
            .arena
            .clone();
        Arc::new(ContextShared {
            device,
            index,
            kind,
            native,
            state: Mutex::new(LiveState::new(arena)),
            record: Mutex::new(RecordedStream::default()),
            refs: Mutex::new(FrameRefs::new()),
            open_maps: Mutex::new(HashMap::new()),
            markers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn kind(&self) -> ContextKind {
        self.kind
    }

    pub(crate) fn fetch_state(&self) -> RenderState {
        self.state.lock().unwrap().fetch()
    }

    pub(crate) fn clear_recording(&self) {
        let mut record = self.record.lock().unwrap();
        record.chunks.clear();
        record.calls.clear();
        if self.kind == ContextKind::Deferred {
            self.refs.lock().unwrap().clear();
        }
    }

    pub(crate) fn has_recorded_chunks(&self) -> bool {
        !self.record.lock().unwrap().chunks.is_empty()
    }

    pub(crate) fn take_recorded_chunks(&self) -> Vec<Chunk> {
        std::mem::take(&mut self.record.lock().unwrap().chunks)
    }

    pub(crate) fn first_open_map(&self) -> Option<ResourceId> {
        self.open_maps.lock().unwrap().keys().next().copied()
    }

    fn is_recording(&self, device: &DeviceShared) -> bool {
        match self.kind {
            ContextKind::Deferred => true,
            ContextKind::Immediate => device.is_capturing(),
        }
    }

    /// The one path every intercepted call takes: serialize (when a
    /// recording mode is active), update the binding mirror and tracking
    /// side effects, then forward to the real context. Driver failures
    /// propagate unchanged after the bookkeeping, and are additionally
    /// logged into the capture as a diagnostic chunk.
    fn issue(&self, device: &Arc<DeviceShared>, call: Call, record: bool) -> Result<()> {
        let recording = self.is_recording(device);

        if record {
            // The annotation queue drains on every ordinary call; queued
            // markers are dropped when nothing is recording.
            let queued: Vec<Call> = std::mem::take(&mut *self.markers.lock().unwrap());
            if recording {
                let mut rec = self.record.lock().unwrap();
                for marker in queued {
                    rec.chunks.push(marker.to_chunk()?);
                    if self.kind == ContextKind::Deferred {
                        rec.calls.push(marker);
                    }
                }
                rec.chunks.push(call.to_chunk()?);
                if self.kind == ContextKind::Deferred {
                    rec.calls.push(call.clone());
                }
            }
        }

        self.apply_to_mirror(&call);
        self.track(device, &call);

        let result = match self.native {
            Some(native) => forward_call(&call, &*device.driver, native, &device.arena),
            None => Ok(()),
        };
        if let Err(err) = &result {
            if record && recording {
                let text = format!("{} failed: {err}", call.name());
                if let Ok(chunk) = Chunk::build(section::DEBUG_MESSAGE, 1, |p| {
                    use optic_chunk::WriteLeExt;
                    p.write_u32_le(2)?; // severity: error
                    p.write_string(&text)
                }) {
                    self.record.lock().unwrap().chunks.push(chunk);
                }
            }
        }
        result.map_err(Into::into)
    }

    /// Keep the live binding mirror (and its pipeline references) in step
    /// with the call.
    fn apply_to_mirror(&self, call: &Call) {
        let mut state = self.state.lock().unwrap();
        match call {
            Call::BindShader { stage, shader } => state.set_shader(*stage, *shader),
            Call::BindConstantBuffers {
                stage,
                first_slot,
                buffers,
            } => state.set_constant_buffers(*stage, *first_slot, buffers),
            Call::BindShaderResources {
                stage,
                first_slot,
                views,
            } => state.set_shader_resources(*stage, *first_slot, views),
            Call::BindSamplers {
                stage,
                first_slot,
                samplers,
            } => state.set_samplers(*stage, *first_slot, samplers),
            Call::BindVertexBuffers {
                first_slot,
                bindings,
            } => state.set_vertex_buffers(*first_slot, bindings),
            Call::BindIndexBuffer {
                buffer,
                format,
                offset,
            } => state.set_index_buffer(*buffer, *format, *offset),
            Call::BindRenderTargets { colors, depth } => {
                state.set_render_targets(colors, *depth)
            }
            Call::BindUnorderedAccessViews { first_slot, views } => {
                state.set_unordered_access_views(*first_slot, views)
            }
            Call::SetViewports { viewports } => state.set_viewports(viewports),
            Call::SetScissors { rects } => state.set_scissors(rects),
            Call::SetBlendState { state: id, factor } => state.set_blend_state(*id, *factor),
            Call::SetDepthState {
                state: id,
                stencil_ref,
            } => state.set_depth_state(*id, *stencil_ref),
            Call::SetRasterState { state: id } => state.set_raster_state(*id),
            _ => {}
        }
    }

    /// Reference marking and dirty propagation for one call.
    fn track(&self, device: &Arc<DeviceShared>, call: &Call) {
        let deferred = self.kind == ContextKind::Deferred;
        let capturing = device.is_capturing();

        if deferred || capturing {
            let mut mark = |id: ResourceId, frame_ref: FrameRef| {
                if deferred {
                    self.refs.lock().unwrap().mark(id, frame_ref);
                } else {
                    device.registry.mark_frame_referenced(id, frame_ref);
                }
            };
            for (id, frame_ref) in call.direct_references() {
                mark(id, frame_ref);
            }
            if call.is_action() {
                let state = self.state.lock().unwrap();
                state.state().mark_referenced(&device.arena, false, &mut mark);
            }
        }

        // Dirty propagation happens in every mode: the GPU may write these
        // resources, so cached initial contents become stale.
        if device.registry.role() == Role::Capture && !deferred {
            if call.is_action() {
                let state = self.state.lock().unwrap();
                state
                    .state()
                    .mark_dirty_targets(&device.arena, &mut |id| {
                        device.registry.mark_pending_dirty(id)
                    });
            }
            for (id, frame_ref) in call.direct_references() {
                if frame_ref == FrameRef::Write {
                    let target = resolve_write_target(&device.arena, id);
                    device.registry.mark_pending_dirty(target);
                }
            }
        }
    }
}

/// Views dirty their underlying resource, not themselves.
fn resolve_write_target(arena: &ObjectArena, id: ResourceId) -> ResourceId {
    match arena.get(id) {
        Some(entry) if entry.kind().is_view() => entry.parent(),
        _ => id,
    }
}

fn native_opt(arena: &ObjectArena, id: ResourceId) -> Option<NativeHandle> {
    if id.is_null() {
        None
    } else {
        arena.native_of(id)
    }
}

/// Translate one non-creation call into the driver operation it wraps,
/// unwrapping object arguments immediately before the call. Ids that no
/// longer resolve bind as nothing; data operations on missing targets are
/// skipped with a warning, which is the degraded-but-running outcome for
/// partial captures.
pub(crate) fn forward_call(
    call: &Call,
    driver: &dyn NativeDriver,
    ctx: NativeHandle,
    arena: &ObjectArena,
) -> optic_wrap::DriverResult<()> {
    match call {
        Call::UpdateResource {
            resource,
            offset,
            data,
        } => match native_opt(arena, *resource) {
            Some(native) => driver.update_resource(native, *offset, data),
            None => {
                warn!("update of unresolved resource {resource} skipped");
                Ok(())
            }
        },
        Call::Unmap { resource, data } => match native_opt(arena, *resource) {
            Some(native) => driver.update_resource(native, 0, data),
            None => {
                warn!("unmap of unresolved resource {resource} skipped");
                Ok(())
            }
        },
        Call::CopyResource { dst, src } => {
            match (native_opt(arena, *dst), native_opt(arena, *src)) {
                (Some(dst), Some(src)) => driver.copy_resource(dst, src),
                _ => {
                    warn!("copy with unresolved endpoint skipped");
                    Ok(())
                }
            }
        }
        Call::BindShader { stage, shader } => {
            driver.bind_shader(ctx, *stage, native_opt(arena, *shader))
        }
        Call::BindConstantBuffers {
            stage,
            first_slot,
            buffers,
        } => {
            let natives: Vec<Option<NativeHandle>> =
                buffers.iter().map(|&id| native_opt(arena, id)).collect();
            driver.bind_constant_buffers(ctx, *stage, *first_slot, &natives)
        }
        Call::BindShaderResources {
            stage,
            first_slot,
            views,
        } => {
            let natives: Vec<Option<NativeHandle>> =
                views.iter().map(|&id| native_opt(arena, id)).collect();
            driver.bind_shader_resources(ctx, *stage, *first_slot, &natives)
        }
        Call::BindSamplers {
            stage,
            first_slot,
            samplers,
        } => {
            let natives: Vec<Option<NativeHandle>> =
                samplers.iter().map(|&id| native_opt(arena, id)).collect();
            driver.bind_samplers(ctx, *stage, *first_slot, &natives)
        }
        Call::BindVertexBuffers {
            first_slot,
            bindings,
        } => {
            let natives: Vec<Option<NativeVertexBinding>> = bindings
                .iter()
                .map(|b| {
                    native_opt(arena, b.buffer).map(|buffer| NativeVertexBinding {
                        buffer,
                        stride: b.stride,
                        offset: b.offset,
                    })
                })
                .collect();
            driver.bind_vertex_buffers(ctx, *first_slot, &natives)
        }
        Call::BindIndexBuffer {
            buffer,
            format,
            offset,
        } => driver.bind_index_buffer(ctx, native_opt(arena, *buffer), *format, *offset),
        Call::BindRenderTargets { colors, depth } => {
            let natives: Vec<Option<NativeHandle>> =
                colors.iter().map(|&id| native_opt(arena, id)).collect();
            driver.bind_render_targets(ctx, &natives, native_opt(arena, *depth))
        }
        Call::BindUnorderedAccessViews { first_slot, views } => {
            let natives: Vec<Option<NativeHandle>> =
                views.iter().map(|&id| native_opt(arena, id)).collect();
            driver.bind_unordered_access_views(ctx, *first_slot, &natives)
        }
        Call::SetViewports { viewports } => driver.set_viewports(ctx, viewports),
        Call::SetScissors { rects } => driver.set_scissors(ctx, rects),
        Call::SetBlendState { state, factor } => {
            driver.set_blend_state(ctx, native_opt(arena, *state), *factor)
        }
        Call::SetDepthState { state, stencil_ref } => {
            driver.set_depth_state(ctx, native_opt(arena, *state), *stencil_ref)
        }
        Call::SetRasterState { state } => driver.set_raster_state(ctx, native_opt(arena, *state)),
        Call::Draw {
            vertex_count,
            first_vertex,
        } => driver.draw(ctx, *vertex_count, *first_vertex),
        Call::DrawIndexed {
            index_count,
            first_index,
            base_vertex,
        } => driver.draw_indexed(ctx, *index_count, *first_index, *base_vertex),
        Call::Dispatch { x, y, z } => driver.dispatch(ctx, *x, *y, *z),
        Call::ClearRenderTarget { view, color } => match native_opt(arena, *view) {
            Some(native) => driver.clear_render_target(ctx, native, *color),
            None => {
                warn!("clear of unresolved view {view} skipped");
                Ok(())
            }
        },
        Call::ClearDepthStencil {
            view,
            depth,
            stencil,
        } => match native_opt(arena, *view) {
            Some(native) => driver.clear_depth_stencil(ctx, native, *depth, *stencil),
            None => {
                warn!("clear of unresolved view {view} skipped");
                Ok(())
            }
        },
        // Markers, creation calls and command-list submission have no
        // direct driver operation; their effects happen at the wrap layer.
        _ => Ok(()),
    }
}

/// Proxy for one execution context. Presents the same call surface as the
/// real context; forwards everything, and serializes everything while a
/// recording mode is active.
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    pub(crate) fn from_shared(shared: Arc<ContextShared>) -> Context {
        Context { shared }
    }

    fn device(&self) -> Result<Arc<DeviceShared>> {
        self.shared
            .device
            .upgrade()
            .ok_or_else(|| DriverError::DeviceLost.into())
    }

    fn issue(&self, call: Call) -> Result<()> {
        let device = self.device()?;
        self.shared.issue(&device, call, true)
    }

    /// Replay path: mirror and forward a decoded call without re-recording
    /// it.
    pub(crate) fn issue_replay(&self, call: Call) -> Result<()> {
        let device = self.device()?;
        self.shared.issue(&device, call, false)
    }

    pub fn kind(&self) -> ContextKind {
        self.shared.kind
    }

    ///////////////////////////////////////////
    // State binding surface

    pub fn bind_shader(&self, stage: ShaderStage, shader: Option<&Shader>) -> Result<()> {
        self.issue(Call::BindShader {
            stage,
            shader: id_of(shader.map(Shader::handle)),
        })
    }

    pub fn bind_constant_buffers(
        &self,
        stage: ShaderStage,
        first_slot: u32,
        buffers: &[Option<&Buffer>],
    ) -> Result<()> {
        self.issue(Call::BindConstantBuffers {
            stage,
            first_slot,
            buffers: buffers.iter().map(|b| id_of(b.map(Buffer::handle))).collect(),
        })
    }

    pub fn bind_shader_resources(
        &self,
        stage: ShaderStage,
        first_slot: u32,
        views: &[Option<&ShaderResourceView>],
    ) -> Result<()> {
        self.issue(Call::BindShaderResources {
            stage,
            first_slot,
            views: views
                .iter()
                .map(|v| id_of(v.map(ShaderResourceView::handle)))
                .collect(),
        })
    }

    pub fn bind_samplers(
        &self,
        stage: ShaderStage,
        first_slot: u32,
        samplers: &[Option<&Sampler>],
    ) -> Result<()> {
        self.issue(Call::BindSamplers {
            stage,
            first_slot,
            samplers: samplers
                .iter()
                .map(|s| id_of(s.map(Sampler::handle)))
                .collect(),
        })
    }

    pub fn bind_vertex_buffers(
        &self,
        first_slot: u32,
        bindings: &[VertexBufferRef<'_>],
    ) -> Result<()> {
        self.issue(Call::BindVertexBuffers {
            first_slot,
            bindings: bindings
                .iter()
                .map(|b| VertexBufferBinding {
                    buffer: id_of(b.buffer.map(Buffer::handle)),
                    stride: b.stride,
                    offset: b.offset,
                })
                .collect(),
        })
    }

    pub fn bind_index_buffer(
        &self,
        buffer: Option<&Buffer>,
        format: IndexFormat,
        offset: u64,
    ) -> Result<()> {
        self.issue(Call::BindIndexBuffer {
            buffer: id_of(buffer.map(Buffer::handle)),
            format,
            offset,
        })
    }

    pub fn bind_render_targets(
        &self,
        colors: &[Option<&RenderTargetView>],
        depth: Option<&DepthStencilView>,
    ) -> Result<()> {
        self.issue(Call::BindRenderTargets {
            colors: colors
                .iter()
                .map(|c| id_of(c.map(RenderTargetView::handle)))
                .collect(),
            depth: id_of(depth.map(DepthStencilView::handle)),
        })
    }

    pub fn bind_unordered_access_views(
        &self,
        first_slot: u32,
        views: &[Option<&UnorderedAccessView>],
    ) -> Result<()> {
        self.issue(Call::BindUnorderedAccessViews {
            first_slot,
            views: views
                .iter()
                .map(|v| id_of(v.map(UnorderedAccessView::handle)))
                .collect(),
        })
    }

    pub fn set_viewports(&self, viewports: &[Viewport]) -> Result<()> {
        self.issue(Call::SetViewports {
            viewports: viewports.to_vec(),
        })
    }

    pub fn set_scissors(&self, rects: &[Rect]) -> Result<()> {
        self.issue(Call::SetScissors {
            rects: rects.to_vec(),
        })
    }

    pub fn set_blend_state(
        &self,
        state: Option<&optic_wrap::BlendState>,
        factor: [f32; 4],
    ) -> Result<()> {
        self.issue(Call::SetBlendState {
            state: id_of(state.map(optic_wrap::BlendState::handle)),
            factor,
        })
    }

    pub fn set_depth_state(
        &self,
        state: Option<&optic_wrap::DepthState>,
        stencil_ref: u32,
    ) -> Result<()> {
        self.issue(Call::SetDepthState {
            state: id_of(state.map(optic_wrap::DepthState::handle)),
            stencil_ref,
        })
    }

    pub fn set_raster_state(&self, state: Option<&RasterState>) -> Result<()> {
        self.issue(Call::SetRasterState {
            state: id_of(state.map(RasterState::handle)),
        })
    }

    ///////////////////////////////////////////
    // Actions

    pub fn draw(&self, vertex_count: u32, first_vertex: u32) -> Result<()> {
        self.issue(Call::Draw {
            vertex_count,
            first_vertex,
        })
    }

    pub fn draw_indexed(&self, index_count: u32, first_index: u32, base_vertex: i32) -> Result<()> {
        self.issue(Call::DrawIndexed {
            index_count,
            first_index,
            base_vertex,
        })
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<()> {
        self.issue(Call::Dispatch { x, y, z })
    }

    pub fn clear_render_target(&self, view: &RenderTargetView, color: [f32; 4]) -> Result<()> {
        self.issue(Call::ClearRenderTarget {
            view: view.id(),
            color,
        })
    }

    pub fn clear_depth_stencil(
        &self,
        view: &DepthStencilView,
        depth: f32,
        stencil: u8,
    ) -> Result<()> {
        self.issue(Call::ClearDepthStencil {
            view: view.id(),
            depth,
            stencil,
        })
    }

    pub fn copy_resource(&self, dst: &WrappedHandle, src: &WrappedHandle) -> Result<()> {
        self.issue(Call::CopyResource {
            dst: dst.id(),
            src: src.id(),
        })
    }

    ///////////////////////////////////////////
    // Resource data

    pub fn update_resource(
        &self,
        resource: &WrappedHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let call = Call::UpdateResource {
            resource: resource.id(),
            offset,
            data: data.to_vec(),
        };
        self.record_data_write(resource.id(), &call)?;
        self.issue(call)
    }

    /// Map a resource for CPU access. Write-capable bindings of the
    /// resource are force-unbound first to avoid the stale-binding hazard;
    /// read-only depth/stencil bindings stay.
    pub fn map(&self, resource: &WrappedHandle, mode: MapMode) -> Result<Mapping> {
        let device = self.device()?;
        let Some(native_ctx) = self.shared.native else {
            return Err(DriverError::Unsupported("map on a deferred context").into());
        };
        let id = resource.id();

        self.shared
            .state
            .lock()
            .unwrap()
            .unbind_for_write(id, &*device.driver, native_ctx)?;

        let data = match mode {
            MapMode::WriteDiscard => vec![0u8; resource_byte_size(&device.arena, id)],
            // Write maps can start from the CPU shadow kept by the record;
            // read maps must see what the GPU actually produced.
            MapMode::Write => match device.registry.get_record(id).and_then(|r| r.shadow()) {
                Some(shadow) => shadow,
                None => device.driver.read_resource(resource.native())?,
            },
            MapMode::Read => device.driver.read_resource(resource.native())?,
        };
        self.shared.open_maps.lock().unwrap().insert(id, mode);
        Ok(Mapping { data, id, mode })
    }

    pub fn unmap(&self, mapping: Mapping) -> Result<()> {
        let device = self.device()?;
        if self
            .shared
            .open_maps
            .lock()
            .unwrap()
            .remove(&mapping.id)
            .is_none()
        {
            warn!("unmap of {} which was not mapped", mapping.id);
            return Ok(());
        }
        if mapping.mode == MapMode::Read {
            return Ok(());
        }

        if let Some(record) = device.registry.get_record(mapping.id) {
            record.set_shadow(Some(mapping.data.clone()));
        }
        let call = Call::Unmap {
            resource: mapping.id,
            data: mapping.data,
        };
        self.record_data_write(mapping.id, &call)?;
        self.issue(call)
    }

    /// Record-side bookkeeping for an in-place content write while no frame
    /// capture is active: append the update to the resource's record until
    /// the amortization threshold, then fall back to coarse assume-dirty
    /// tracking.
    fn record_data_write(&self, id: ResourceId, call: &Call) -> Result<()> {
        let device = self.device()?;
        if device.registry.role() != Role::Capture || device.is_capturing() {
            return Ok(());
        }
        if let Some(record) = device.registry.get_record(id) {
            let updates = record.bump_update_count();
            if record.is_special() || updates <= device.options.coarse_dirty_threshold {
                record.add_chunk(call.to_chunk()?);
            } else {
                if updates == device.options.coarse_dirty_threshold + 1 {
                    tracing::debug!(
                        "{id} exceeded {} updates; falling back to coarse dirty tracking",
                        device.options.coarse_dirty_threshold
                    );
                }
                device.registry.mark_dirty(id);
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////
    // Annotations (thread-safe)

    pub fn set_marker(&self, name: &str) {
        self.shared.markers.lock().unwrap().push(Call::SetMarker {
            name: name.to_owned(),
        });
    }

    pub fn push_marker(&self, name: &str) {
        self.shared.markers.lock().unwrap().push(Call::PushMarker {
            name: name.to_owned(),
        });
    }

    pub fn pop_marker(&self) {
        self.shared.markers.lock().unwrap().push(Call::PopMarker);
    }

    ///////////////////////////////////////////
    // Deferred recording

    /// Deferred contexts only: freeze the recording into a command list and
    /// restart clean.
    pub fn finish_command_list(&self) -> Result<CommandList> {
        let device = self.device()?;
        if self.shared.kind != ContextKind::Deferred {
            return Err(DriverError::Unsupported("finish on the immediate context").into());
        }
        let data = {
            let mut record = self.shared.record.lock().unwrap();
            let refs = std::mem::take(&mut *self.shared.refs.lock().unwrap());
            CommandListData {
                chunks: std::mem::take(&mut record.chunks),
                calls: std::mem::take(&mut record.calls),
                refs,
            }
        };
        self.shared.state.lock().unwrap().reset();

        let id = device.registry.register_unbacked();
        let entry = device.arena.insert(
            id,
            ObjectKind::CommandList,
            ObjectInfo::CommandList(Arc::new(data)),
            NativeHandle(0),
        );
        device
            .soft_refs
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        Ok(CommandList::from_handle(WrappedHandle::new(
            entry,
            device.arena.clone(),
        )))
    }

    /// Immediate context only: run a finished command list. While capturing,
    /// the list's chunks splice into the frame stream at this point, which
    /// is what fixes their order relative to the rest of the frame.
    pub fn execute_command_list(&self, list: &CommandList) -> Result<()> {
        let device = self.device()?;
        if self.shared.kind != ContextKind::Immediate {
            return Err(DriverError::Unsupported("execute on a deferred context").into());
        }
        let Some(data) = list.data() else {
            return Err(DriverError::UnknownHandle.into());
        };

        if device.is_capturing() {
            let mut rec = self.shared.record.lock().unwrap();
            rec.chunks.push(
                Call::PushMarker {
                    name: "ExecuteCommandList".to_owned(),
                }
                .to_chunk()?,
            );
            rec.chunks.extend(data.chunks.iter().cloned());
            rec.chunks.push(Call::PopMarker.to_chunk()?);
            drop(rec);
            device.registry.merge_frame_refs(&data.refs);
        }

        for call in &data.calls {
            if matches!(call, Call::ExecuteCommandList { .. }) {
                warn!("nested command list execution ignored");
                continue;
            }
            self.shared.issue(&device, call.clone(), false)?;
        }
        Ok(())
    }

    ///////////////////////////////////////////
    // Frame boundary and state snapshot surface

    pub fn present(&self) -> Result<()> {
        let device = self.device()?;
        let Some(native) = self.shared.native else {
            return Err(DriverError::Unsupported("present on a deferred context").into());
        };
        device.driver.present(native)?;
        WrappedDevice::from_shared(device).on_present();
        Ok(())
    }

    /// Read every binding point into a detached snapshot.
    pub fn fetch_state(&self) -> RenderState {
        self.shared.fetch_state()
    }

    /// Clear the context then rebind every binding point of `target` in
    /// fixed stage order.
    pub fn apply_state(&self, target: &RenderState) -> Result<()> {
        let device = self.device()?;
        match self.shared.native {
            Some(native) => {
                self.shared
                    .state
                    .lock()
                    .unwrap()
                    .apply(target, &*device.driver, native)?;
                Ok(())
            }
            None => Err(DriverError::Unsupported("apply on a deferred context").into()),
        }
    }

    pub fn is_bound_for_write(
        &self,
        resource: &WrappedHandle,
        allow_depth_read_only: bool,
        allow_stencil_read_only: bool,
    ) -> bool {
        let Ok(device) = self.device() else {
            return false;
        };
        self.shared.state.lock().unwrap().state().is_bound_for_write(
            &device.arena,
            resource.id(),
            allow_depth_read_only,
            allow_stencil_read_only,
        )
    }

    pub fn unbind_for_write(&self, resource: &WrappedHandle) -> Result<bool> {
        let device = self.device()?;
        let Some(native) = self.shared.native else {
            return Ok(false);
        };
        Ok(self
            .shared
            .state
            .lock()
            .unwrap()
            .unbind_for_write(resource.id(), &*device.driver, native)?)
    }

    pub fn unbind_for_read(&self, resource: &WrappedHandle) -> Result<bool> {
        let device = self.device()?;
        let Some(native) = self.shared.native else {
            return Ok(false);
        };
        Ok(self
            .shared
            .state
            .lock()
            .unwrap()
            .unbind_for_read(resource.id(), &*device.driver, native)?)
    }
}

fn id_of(handle: Option<&WrappedHandle>) -> ResourceId {
    handle.map(WrappedHandle::id).unwrap_or(ResourceId::NULL)
}

fn resource_byte_size(arena: &ObjectArena, id: ResourceId) -> usize {
    arena
        .get(id)
        .map(|entry| match entry.info() {
            ObjectInfo::Buffer(desc) => desc.size as usize,
            ObjectInfo::Texture2d(desc) => desc.byte_size() as usize,
            _ => 0,
        })
        .unwrap_or(0)
}
