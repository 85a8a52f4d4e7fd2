use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info};

use optic_chunk::Chunk;
use optic_resource::{FrameRef, InitialContents, Registry, ResourceId, Role};
use optic_wrap::{
    call_kind, BlendDesc, BlendState, Buffer, BufferDesc, Call, DepthDesc, DepthState,
    DepthStencilView, DepthStencilViewDesc, DestroySink, NativeDriver, NativeHandle, ObjectArena,
    ObjectEntry, ObjectInfo, ObjectKind, RasterDesc, RasterState, RefClass, RenderState,
    RenderTargetView, RenderTargetViewDesc, Sampler, SamplerDesc, Shader, ShaderResourceView,
    ShaderResourceViewDesc, ShaderStage, Texture2d, TextureDesc, UnorderedAccessView,
    UnorderedAccessViewDesc, WrappedHandle,
};

use crate::container::CaptureWriter;
use crate::context::{Context, ContextKind, ContextShared};
use crate::error::{CaptureError, CaptureFailReason, Result};
use crate::options::{CaptureMeta, CaptureOptions, DeviceConfig};

/// Process-wide interception mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Calls pass straight through; records accumulate, nothing is framed.
    Idle,
    /// Every intercepted call is forwarded and serialized into the frame.
    Capturing,
    /// A capture is being read back to drive reconstruction.
    Replaying,
}

impl CaptureState {
    fn from_u8(v: u8) -> CaptureState {
        match v {
            1 => CaptureState::Capturing,
            2 => CaptureState::Replaying,
            _ => CaptureState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CaptureState::Idle => 0,
            CaptureState::Capturing => 1,
            CaptureState::Replaying => 2,
        }
    }
}

/// A finalized capture written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub path: PathBuf,
    pub frame: u64,
    pub events: u32,
}

pub(crate) struct ActiveCapture {
    pub frame: u64,
    pub begin_states: Vec<(u32, RenderState)>,
    /// Resources created during the frame: their creation chunks are in the
    /// frame stream, so their records must not be serialized again.
    pub created_during: HashSet<ResourceId>,
}

#[derive(Default)]
pub(crate) struct CaptureControl {
    pub frame_counter: u64,
    pub trigger: bool,
    pub queued: HashSet<u64>,
    pub failures: u32,
    pub last_failure: Option<(u64, CaptureFailReason)>,
    pub last_report: Option<CaptureReport>,
    pub active: Option<ActiveCapture>,
    pub callstack: Option<Vec<u64>>,
}

pub(crate) struct DeviceShared {
    pub(crate) driver: Arc<dyn NativeDriver>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) arena: Arc<ObjectArena>,
    pub(crate) options: CaptureOptions,
    pub(crate) config: DeviceConfig,
    mode: AtomicU8,
    pub(crate) soft_refs: Arc<AtomicI64>,
    pub(crate) immediate: Mutex<Option<Arc<ContextShared>>>,
    pub(crate) deferred: Mutex<Vec<Weak<ContextShared>>>,
    /// Creation chunks recorded while capturing; merged ahead of the
    /// immediate context's stream at finalize.
    pub(crate) frame_chunks: Mutex<Vec<Chunk>>,
    pub(crate) control: Mutex<CaptureControl>,
}

impl DeviceShared {
    pub(crate) fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CaptureState) {
        self.mode.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    fn all_contexts(&self) -> Vec<Arc<ContextShared>> {
        let mut out = Vec::new();
        if let Some(immediate) = self.immediate.lock().unwrap().as_ref() {
            out.push(immediate.clone());
        }
        out.extend(self.deferred.lock().unwrap().iter().filter_map(Weak::upgrade));
        out
    }
}

/// Frees the real object and unwinds identity state once the arena decides a
/// wrapped object is dead. Releasing a view cascades into a view-reference
/// release on its resource.
struct DeviceCleanup {
    driver: Arc<dyn NativeDriver>,
    registry: Arc<Registry>,
    arena: Weak<ObjectArena>,
    soft_refs: Arc<AtomicI64>,
}

impl DestroySink for DeviceCleanup {
    fn destroyed(&self, entry: &Arc<ObjectEntry>) {
        if entry.native().0 != 0 {
            self.driver.destroy(entry.native());
            self.registry.unregister(entry.native().0);
        }
        self.registry.remove_record(entry.id());
        let parent = entry.parent();
        if !parent.is_null() {
            if let Some(arena) = self.arena.upgrade() {
                arena.release(parent, RefClass::View);
            }
        }
        self.soft_refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Proxy for the driver's device object: creates wrapped resources,
/// serializing each creation into the owning resource record, and runs the
/// capture state machine at frame boundaries.
#[derive(Clone)]
pub struct WrappedDevice {
    shared: Arc<DeviceShared>,
}

impl WrappedDevice {
    pub fn new(
        driver: Arc<dyn NativeDriver>,
        config: DeviceConfig,
        options: CaptureOptions,
    ) -> Result<(WrappedDevice, Context)> {
        Self::with_role(driver, config, options, Role::Capture)
    }

    /// Device for the replay side: ids it mints live in the replay
    /// numbering space and no capture-side records are kept.
    pub fn new_replay(
        driver: Arc<dyn NativeDriver>,
        config: DeviceConfig,
    ) -> Result<(WrappedDevice, Context)> {
        let (device, context) =
            Self::with_role(driver, config, CaptureOptions::default(), Role::Replay)?;
        device.shared.set_state(CaptureState::Replaying);
        Ok((device, context))
    }

    fn with_role(
        driver: Arc<dyn NativeDriver>,
        config: DeviceConfig,
        options: CaptureOptions,
        role: Role,
    ) -> Result<(WrappedDevice, Context)> {
        let registry = Arc::new(Registry::new(role));
        let arena = Arc::new(ObjectArena::new());
        let soft_refs = Arc::new(AtomicI64::new(0));
        let shared = Arc::new(DeviceShared {
            driver: driver.clone(),
            registry: registry.clone(),
            arena: arena.clone(),
            options,
            config,
            mode: AtomicU8::new(CaptureState::Idle.as_u8()),
            soft_refs: soft_refs.clone(),
            immediate: Mutex::new(None),
            deferred: Mutex::new(Vec::new()),
            frame_chunks: Mutex::new(Vec::new()),
            control: Mutex::new(CaptureControl::default()),
        });
        arena.set_destroy_sink(Arc::new(DeviceCleanup {
            driver,
            registry,
            arena: Arc::downgrade(&arena),
            soft_refs,
        }));

        let native = shared.driver.create_context()?;
        let immediate = ContextShared::new(Arc::downgrade(&shared), 0, ContextKind::Immediate, Some(native));
        *shared.immediate.lock().unwrap() = Some(immediate.clone());

        let device = WrappedDevice { shared };
        Ok((device, Context::from_shared(immediate)))
    }

    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub(crate) fn from_shared(shared: Arc<DeviceShared>) -> WrappedDevice {
        WrappedDevice { shared }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn arena(&self) -> &Arc<ObjectArena> {
        &self.shared.arena
    }

    pub fn capture_state(&self) -> CaptureState {
        self.shared.state()
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.shared.options
    }

    /// Internal device-lifetime references currently held by wrappers.
    pub fn soft_ref_count(&self) -> i64 {
        self.shared.soft_refs.load(Ordering::Acquire)
    }

    /// Capability probing; driver failures propagate unchanged.
    pub fn query_capability(&self, name: &str) -> Result<bool> {
        Ok(self.shared.driver.query_capability(name)?)
    }

    ///////////////////////////////////////////
    // Object creation

    fn finish_create(
        &self,
        native: NativeHandle,
        kind: ObjectKind,
        info: ObjectInfo,
        parent: ResourceId,
        make_call: impl FnOnce(ResourceId) -> Call,
    ) -> Result<WrappedHandle> {
        let shared = &self.shared;
        let id = if native.0 != 0 {
            shared.registry.register(native.0)
        } else {
            shared.registry.register_unbacked()
        };
        let entry = shared.arena.insert(id, kind, info, native);
        shared.soft_refs.fetch_add(1, Ordering::AcqRel);

        if !parent.is_null() {
            shared.arena.add_ref(parent, RefClass::View);
        }

        if shared.registry.role() == Role::Capture && kind != ObjectKind::CommandList {
            let record = shared.registry.add_resource_record(id);
            if !parent.is_null() {
                record.add_parent(parent);
            }
            let chunk = make_call(id).to_chunk()?;
            record.set_length(chunk.encoded_len());
            record.add_chunk(chunk.clone());

            if shared.is_capturing() {
                {
                    let mut control = shared.control.lock().unwrap();
                    if let Some(active) = control.active.as_mut() {
                        active.created_during.insert(id);
                    }
                }
                shared.frame_chunks.lock().unwrap().push(chunk);
                shared.registry.mark_frame_referenced(id, FrameRef::Read);
            }
        }

        debug!("wrapped {kind:?} as {id}");
        Ok(WrappedHandle::new(entry, shared.arena.clone()))
    }

    pub fn create_buffer(&self, desc: &BufferDesc, init: Option<&[u8]>) -> Result<Buffer> {
        let native = self.shared.driver.create_buffer(desc, init)?;
        let handle = self.finish_create(
            native,
            ObjectKind::Buffer,
            ObjectInfo::Buffer(*desc),
            ResourceId::NULL,
            |id| Call::CreateBuffer {
                id,
                desc: *desc,
                init: init.map(<[u8]>::to_vec),
            },
        )?;
        Ok(Buffer::from_handle(handle))
    }

    pub fn create_texture2d(&self, desc: &TextureDesc, init: Option<&[u8]>) -> Result<Texture2d> {
        let native = self.shared.driver.create_texture2d(desc, init)?;
        let handle = self.finish_create(
            native,
            ObjectKind::Texture2d,
            ObjectInfo::Texture2d(*desc),
            ResourceId::NULL,
            |id| Call::CreateTexture2d {
                id,
                desc: *desc,
                init: init.map(<[u8]>::to_vec),
            },
        )?;
        Ok(Texture2d::from_handle(handle))
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler> {
        let native = self.shared.driver.create_sampler(desc)?;
        let handle = self.finish_create(
            native,
            ObjectKind::Sampler,
            ObjectInfo::Sampler(*desc),
            ResourceId::NULL,
            |id| Call::CreateSampler { id, desc: *desc },
        )?;
        Ok(Sampler::from_handle(handle))
    }

    pub fn create_shader(&self, stage: ShaderStage, bytecode: &[u8]) -> Result<Shader> {
        let native = self.shared.driver.create_shader(stage, bytecode)?;
        let handle = self.finish_create(
            native,
            ObjectKind::Shader,
            ObjectInfo::Shader { stage },
            ResourceId::NULL,
            |id| Call::CreateShader {
                id,
                stage,
                bytecode: bytecode.to_vec(),
            },
        )?;
        Ok(Shader::from_handle(handle))
    }

    pub fn create_render_target_view(
        &self,
        resource: &Texture2d,
        desc: &RenderTargetViewDesc,
    ) -> Result<RenderTargetView> {
        let parent = resource.id();
        let native = self
            .shared
            .driver
            .create_render_target_view(resource.handle().native(), desc)?;
        let handle = self.finish_create(
            native,
            ObjectKind::RenderTargetView,
            ObjectInfo::RenderTargetView {
                parent,
                desc: *desc,
            },
            parent,
            |id| Call::CreateRenderTargetView {
                id,
                resource: parent,
                desc: *desc,
            },
        )?;
        Ok(RenderTargetView::from_handle(handle))
    }

    pub fn create_depth_stencil_view(
        &self,
        resource: &Texture2d,
        desc: &DepthStencilViewDesc,
    ) -> Result<DepthStencilView> {
        let parent = resource.id();
        let native = self
            .shared
            .driver
            .create_depth_stencil_view(resource.handle().native(), desc)?;
        let handle = self.finish_create(
            native,
            ObjectKind::DepthStencilView,
            ObjectInfo::DepthStencilView {
                parent,
                desc: *desc,
            },
            parent,
            |id| Call::CreateDepthStencilView {
                id,
                resource: parent,
                desc: *desc,
            },
        )?;
        Ok(DepthStencilView::from_handle(handle))
    }

    /// Shader-resource views may sit over a buffer or a texture.
    pub fn create_shader_resource_view(
        &self,
        resource: &WrappedHandle,
        desc: &ShaderResourceViewDesc,
    ) -> Result<ShaderResourceView> {
        if !matches!(resource.kind(), ObjectKind::Buffer | ObjectKind::Texture2d) {
            return Err(optic_wrap::DriverError::InvalidArgument(
                "shader resource view over a non-resource",
            )
            .into());
        }
        let parent = resource.id();
        let native = self
            .shared
            .driver
            .create_shader_resource_view(resource.native(), desc)?;
        let handle = self.finish_create(
            native,
            ObjectKind::ShaderResourceView,
            ObjectInfo::ShaderResourceView {
                parent,
                desc: *desc,
            },
            parent,
            |id| Call::CreateShaderResourceView {
                id,
                resource: parent,
                desc: *desc,
            },
        )?;
        Ok(ShaderResourceView::from_handle(handle))
    }

    pub fn create_unordered_access_view(
        &self,
        resource: &WrappedHandle,
        desc: &UnorderedAccessViewDesc,
    ) -> Result<UnorderedAccessView> {
        if !matches!(resource.kind(), ObjectKind::Buffer | ObjectKind::Texture2d) {
            return Err(optic_wrap::DriverError::InvalidArgument(
                "unordered access view over a non-resource",
            )
            .into());
        }
        let parent = resource.id();
        let native = self
            .shared
            .driver
            .create_unordered_access_view(resource.native(), desc)?;
        let handle = self.finish_create(
            native,
            ObjectKind::UnorderedAccessView,
            ObjectInfo::UnorderedAccessView {
                parent,
                desc: *desc,
            },
            parent,
            |id| Call::CreateUnorderedAccessView {
                id,
                resource: parent,
                desc: *desc,
            },
        )?;
        Ok(UnorderedAccessView::from_handle(handle))
    }

    pub fn create_blend_state(&self, desc: &BlendDesc) -> Result<BlendState> {
        let native = self.shared.driver.create_blend_state(desc)?;
        let handle = self.finish_create(
            native,
            ObjectKind::BlendState,
            ObjectInfo::BlendState(*desc),
            ResourceId::NULL,
            |id| Call::CreateBlendState { id, desc: *desc },
        )?;
        Ok(BlendState::from_handle(handle))
    }

    pub fn create_depth_state(&self, desc: &DepthDesc) -> Result<DepthState> {
        let native = self.shared.driver.create_depth_state(desc)?;
        let handle = self.finish_create(
            native,
            ObjectKind::DepthState,
            ObjectInfo::DepthState(*desc),
            ResourceId::NULL,
            |id| Call::CreateDepthState { id, desc: *desc },
        )?;
        Ok(DepthState::from_handle(handle))
    }

    pub fn create_raster_state(&self, desc: &RasterDesc) -> Result<RasterState> {
        let native = self.shared.driver.create_raster_state(desc)?;
        let handle = self.finish_create(
            native,
            ObjectKind::RasterState,
            ObjectInfo::RasterState(*desc),
            ResourceId::NULL,
            |id| Call::CreateRasterState { id, desc: *desc },
        )?;
        Ok(RasterState::from_handle(handle))
    }

    /// A deferred context records calls without forwarding them; its
    /// recording becomes a command list.
    pub fn create_deferred_context(&self) -> Result<Context> {
        let index = self.shared.deferred.lock().unwrap().len() as u32 + 1;
        let context = ContextShared::new(
            Arc::downgrade(&self.shared),
            index,
            ContextKind::Deferred,
            None,
        );
        self.shared
            .deferred
            .lock()
            .unwrap()
            .push(Arc::downgrade(&context));
        Ok(Context::from_shared(context))
    }

    /// Replay-side creation: run a captured creation call against this
    /// session's driver and return the id of the freshly created live
    /// object. `resolve` maps captured ids of dependencies (a view's
    /// resource) to live ids.
    pub(crate) fn replay_create(
        &self,
        call: &Call,
        resolve: &dyn Fn(ResourceId) -> ResourceId,
    ) -> Result<ResourceId> {
        let driver = &self.shared.driver;
        let handle = match call {
            Call::CreateBuffer { desc, init, .. } => {
                let native = driver.create_buffer(desc, init.as_deref())?;
                self.finish_create(
                    native,
                    ObjectKind::Buffer,
                    ObjectInfo::Buffer(*desc),
                    ResourceId::NULL,
                    |_| call.clone(),
                )?
            }
            Call::CreateTexture2d { desc, init, .. } => {
                let native = driver.create_texture2d(desc, init.as_deref())?;
                self.finish_create(
                    native,
                    ObjectKind::Texture2d,
                    ObjectInfo::Texture2d(*desc),
                    ResourceId::NULL,
                    |_| call.clone(),
                )?
            }
            Call::CreateSampler { desc, .. } => {
                let native = driver.create_sampler(desc)?;
                self.finish_create(
                    native,
                    ObjectKind::Sampler,
                    ObjectInfo::Sampler(*desc),
                    ResourceId::NULL,
                    |_| call.clone(),
                )?
            }
            Call::CreateShader { stage, bytecode, .. } => {
                let native = driver.create_shader(*stage, bytecode)?;
                self.finish_create(
                    native,
                    ObjectKind::Shader,
                    ObjectInfo::Shader { stage: *stage },
                    ResourceId::NULL,
                    |_| call.clone(),
                )?
            }
            Call::CreateRenderTargetView { resource, desc, .. } => {
                let (parent, parent_native) = resolve_parent(&self.shared, resolve, *resource)?;
                let native = driver.create_render_target_view(parent_native, desc)?;
                self.finish_create(
                    native,
                    ObjectKind::RenderTargetView,
                    ObjectInfo::RenderTargetView {
                        parent,
                        desc: *desc,
                    },
                    parent,
                    |_| call.clone(),
                )?
            }
            Call::CreateDepthStencilView { resource, desc, .. } => {
                let (parent, parent_native) = resolve_parent(&self.shared, resolve, *resource)?;
                let native = driver.create_depth_stencil_view(parent_native, desc)?;
                self.finish_create(
                    native,
                    ObjectKind::DepthStencilView,
                    ObjectInfo::DepthStencilView {
                        parent,
                        desc: *desc,
                    },
                    parent,
                    |_| call.clone(),
                )?
            }
            Call::CreateShaderResourceView { resource, desc, .. } => {
                let (parent, parent_native) = resolve_parent(&self.shared, resolve, *resource)?;
                let native = driver.create_shader_resource_view(parent_native, desc)?;
                self.finish_create(
                    native,
                    ObjectKind::ShaderResourceView,
                    ObjectInfo::ShaderResourceView {
                        parent,
                        desc: *desc,
                    },
                    parent,
                    |_| call.clone(),
                )?
            }
            Call::CreateUnorderedAccessView { resource, desc, .. } => {
                let (parent, parent_native) = resolve_parent(&self.shared, resolve, *resource)?;
                let native = driver.create_unordered_access_view(parent_native, desc)?;
                self.finish_create(
                    native,
                    ObjectKind::UnorderedAccessView,
                    ObjectInfo::UnorderedAccessView {
                        parent,
                        desc: *desc,
                    },
                    parent,
                    |_| call.clone(),
                )?
            }
            Call::CreateBlendState { desc, .. } => {
                let native = driver.create_blend_state(desc)?;
                self.finish_create(
                    native,
                    ObjectKind::BlendState,
                    ObjectInfo::BlendState(*desc),
                    ResourceId::NULL,
                    |_| call.clone(),
                )?
            }
            Call::CreateDepthState { desc, .. } => {
                let native = driver.create_depth_state(desc)?;
                self.finish_create(
                    native,
                    ObjectKind::DepthState,
                    ObjectInfo::DepthState(*desc),
                    ResourceId::NULL,
                    |_| call.clone(),
                )?
            }
            Call::CreateRasterState { desc, .. } => {
                let native = driver.create_raster_state(desc)?;
                self.finish_create(
                    native,
                    ObjectKind::RasterState,
                    ObjectInfo::RasterState(*desc),
                    ResourceId::NULL,
                    |_| call.clone(),
                )?
            }
            _ => {
                return Err(
                    optic_wrap::DriverError::InvalidArgument("not a creation call").into(),
                )
            }
        };
        Ok(handle.id())
    }

    ///////////////////////////////////////////
    // Capture state machine

    /// Capture the next presented frame.
    pub fn trigger_capture(&self) {
        self.shared.control.lock().unwrap().trigger = true;
    }

    /// Capture a specific future frame number.
    pub fn queue_capture(&self, frame: u64) {
        self.shared.control.lock().unwrap().queued.insert(frame);
    }

    pub fn last_failure(&self) -> Option<(u64, CaptureFailReason)> {
        self.shared.control.lock().unwrap().last_failure
    }

    pub fn last_capture(&self) -> Option<CaptureReport> {
        self.shared.control.lock().unwrap().last_report.clone()
    }

    pub fn frame_counter(&self) -> u64 {
        self.shared.control.lock().unwrap().frame_counter
    }

    /// Attach a callstack to the frame record of the next finalized
    /// capture. Gathering the addresses is the caller's concern.
    pub fn set_frame_callstack(&self, frames: Vec<u64>) {
        self.shared.control.lock().unwrap().callstack = Some(frames);
    }

    /// Begin capturing immediately (application-controlled capture).
    pub fn start_frame_capture(&self) -> Result<()> {
        if self.shared.state() != CaptureState::Idle {
            return Ok(());
        }
        let mut control = self.shared.control.lock().unwrap();
        let frame = control.frame_counter;
        begin_capture(&self.shared, &mut control, frame);
        Ok(())
    }

    /// Finish an application-controlled capture: no automatic retry; a
    /// validity failure surfaces as the structured reason.
    pub fn end_frame_capture(&self) -> Result<CaptureReport> {
        if !self.shared.is_capturing() {
            return Err(CaptureError::NotCapturing);
        }
        let mut control = self.shared.control.lock().unwrap();
        let active = control.active.take().expect("capturing without active state");
        match finalize_capture(&self.shared, &mut control, active) {
            Ok(report) => {
                control.failures = 0;
                control.last_report = Some(report.clone());
                self.shared.set_state(CaptureState::Idle);
                Ok(report)
            }
            Err(reason) => {
                discard_capture(&self.shared);
                self.shared.set_state(CaptureState::Idle);
                control.last_failure = Some((control.frame_counter, reason));
                Err(CaptureError::CaptureFailed {
                    reason,
                    failures: 1,
                })
            }
        }
    }

    /// Frame boundary. Ends or begins captures according to the trigger and
    /// retry policy; the present itself always succeeds for the caller.
    pub(crate) fn on_present(&self) {
        let shared = &self.shared;
        let mut control = shared.control.lock().unwrap();
        control.frame_counter += 1;
        let frame = control.frame_counter;

        match shared.state() {
            CaptureState::Replaying => {}
            CaptureState::Capturing => {
                let active = control.active.take().expect("capturing without active state");
                let capture_frame = active.frame;
                match finalize_capture(shared, &mut control, active) {
                    Ok(report) => {
                        info!("finished capture of frame {capture_frame}");
                        control.failures = 0;
                        control.last_report = Some(report);
                        shared.set_state(CaptureState::Idle);
                    }
                    Err(reason) => {
                        error!("capture of frame {capture_frame} failed: {reason}");
                        discard_capture(shared);
                        control.failures += 1;
                        if control.failures > shared.options.max_capture_retries {
                            control.last_failure = Some((capture_frame, reason));
                            control.failures = 0;
                            shared.set_state(CaptureState::Idle);
                        } else {
                            // Retry with the next frame.
                            begin_capture(shared, &mut control, frame);
                        }
                    }
                }
            }
            CaptureState::Idle => {
                let wants_capture = control.trigger || control.queued.remove(&frame);
                if wants_capture {
                    control.trigger = false;
                    begin_capture(shared, &mut control, frame);
                }
            }
        }
    }
}

/// A view's resource must already be live before the view can be recreated.
/// Missing parents degrade the view, not the replay.
fn resolve_parent(
    shared: &Arc<DeviceShared>,
    resolve: &dyn Fn(ResourceId) -> ResourceId,
    captured: ResourceId,
) -> Result<(ResourceId, NativeHandle)> {
    let live = resolve(captured);
    match shared.arena.get(live) {
        Some(entry) => Ok((live, entry.native())),
        None => Err(optic_wrap::DriverError::UnknownHandle.into()),
    }
}

/// Transition Idle -> Capturing: flush pending dirty state, snapshot initial
/// contents for dirty resources, and record the current render state of
/// every context, since a frame capture always starts mid-stream.
fn begin_capture(shared: &Arc<DeviceShared>, control: &mut CaptureControl, frame: u64) {
    let registry = &shared.registry;
    registry.flush_pending_dirty();
    registry.clear_frame_refs();

    // Snapshot the pre-frame contents of every resource now, before the
    // first recorded call can touch them. Which snapshots end up in the
    // file is decided at finalize from the frame's reference set; a capture
    // abandoned before then just drops them.
    for id in shared.arena.ids() {
        let Some(entry) = shared.arena.get(id) else {
            continue;
        };
        if !matches!(entry.kind(), ObjectKind::Buffer | ObjectKind::Texture2d) {
            continue;
        }
        match shared.driver.read_resource(entry.native()) {
            Ok(data) => {
                registry.set_initial_contents(
                    id,
                    InitialContents {
                        data: Some(Arc::new(data)),
                    },
                );
                registry.mark_clean(id);
            }
            Err(err) => {
                error!("could not snapshot initial contents of {id}: {err}");
            }
        }
    }

    let mut begin_states = Vec::new();
    for context in shared.all_contexts() {
        let state = context.fetch_state();
        state.mark_referenced(&shared.arena, true, &mut |id, frame_ref| {
            registry.mark_frame_referenced(id, frame_ref);
        });
        begin_states.push((context.index(), state));
        context.clear_recording();
    }
    shared.frame_chunks.lock().unwrap().clear();

    control.active = Some(ActiveCapture {
        frame,
        begin_states,
        created_during: HashSet::new(),
    });
    shared.set_state(CaptureState::Capturing);
    info!("starting capture, frame {frame}");
}

fn discard_capture(shared: &Arc<DeviceShared>) {
    for context in shared.all_contexts() {
        context.clear_recording();
    }
    shared.frame_chunks.lock().unwrap().clear();
    shared.registry.clear_frame_refs();
}

/// Capturing -> Finalizing -> Idle: validity-check the frame, then flush the
/// setup section (referenced records + initial contents), the frame's chunk
/// stream and the event seek table to disk.
fn finalize_capture(
    shared: &Arc<DeviceShared>,
    control: &mut CaptureControl,
    active: ActiveCapture,
) -> std::result::Result<CaptureReport, CaptureFailReason> {
    let registry = &shared.registry;

    // Validity checks: a dangling mapped write or an unfinished deferred
    // recording means the frame cannot be reconstructed faithfully.
    for context in shared.all_contexts() {
        if let Some(resource) = context.first_open_map() {
            return Err(CaptureFailReason::UncappedMap { resource });
        }
        if context.kind() == ContextKind::Deferred && context.has_recorded_chunks() {
            return Err(CaptureFailReason::UncappedCommandList);
        }
    }

    if shared.options.ref_all_resources {
        for id in shared.arena.ids() {
            registry.mark_frame_referenced(id, FrameRef::Read);
        }
    }

    let report = write_capture_file(shared, control, &active).map_err(|err| {
        error!("failed to write capture file: {err}");
        CaptureFailReason::WriteFailed
    });

    registry.clear_frame_refs();
    for context in shared.all_contexts() {
        context.clear_recording();
    }
    shared.frame_chunks.lock().unwrap().clear();
    report
}

fn write_capture_file(
    shared: &Arc<DeviceShared>,
    control: &mut CaptureControl,
    active: &ActiveCapture,
) -> Result<CaptureReport> {
    let registry = &shared.registry;
    let refs = registry.frame_refs_snapshot();

    let mut referenced: Vec<(ResourceId, FrameRef)> = refs.iter().collect();
    referenced.sort_by_key(|(id, _)| *id);

    std::fs::create_dir_all(&shared.options.output_dir)?;
    let path = shared
        .options
        .output_dir
        .join(format!("frame{}.optic", active.frame));
    let file = File::create(&path)?;
    let meta = CaptureMeta::new(&shared.config, active.frame);
    let mut writer = CaptureWriter::new(file, &meta)?;

    for (index, state) in &active.begin_states {
        writer.write_begin_state(*index, state)?;
    }

    registry.mark_unwritten_resources();
    let mut setup_chunks = Vec::new();
    for (id, _) in &referenced {
        if active.created_during.contains(id) {
            continue;
        }
        if let Some(record) = registry.get_record(*id) {
            record.insert_chunks(registry, &mut setup_chunks);
        }
    }
    for chunk in &setup_chunks {
        writer.write_chunk(chunk)?;
    }

    let mut needed = Vec::new();
    for (id, frame_ref) in &referenced {
        if active.created_during.contains(id) {
            continue;
        }
        let has_contents = shared
            .arena
            .get(*id)
            .map(|e| matches!(e.kind(), ObjectKind::Buffer | ObjectKind::Texture2d))
            .unwrap_or(false);
        if !has_contents {
            continue;
        }
        if frame_ref.needs_initial_contents() {
            if let Some(initial) = registry.initial_contents(*id) {
                if let Some(data) = initial.data {
                    let compress =
                        shared.options.compress_initial_contents && data.len() >= 64;
                    writer.write_initial_contents(*id, &data, compress)?;
                }
            }
        } else {
            // Write-only targets: replay clears them on frame init instead
            // of carrying their bytes.
            needed.push(*id);
        }
    }
    writer.write_initial_needed(&needed)?;

    writer.write_capture_scope(active.frame)?;

    let device_chunks: Vec<Chunk> = shared.frame_chunks.lock().unwrap().clone();
    for chunk in &device_chunks {
        writer.write_event_chunk(chunk, call_kind::is_action(chunk.kind()))?;
    }
    if let Some(immediate) = shared.immediate.lock().unwrap().as_ref() {
        for chunk in immediate.take_recorded_chunks() {
            writer.write_event_chunk(&chunk, call_kind::is_action(chunk.kind()))?;
        }
    }

    let events = writer.event_count();
    let callstack = if shared.options.capture_callstacks {
        control.callstack.take()
    } else {
        None
    };
    writer.finish(callstack.as_deref())?;

    Ok(CaptureReport {
        path,
        frame: active.frame,
        events,
    })
}
