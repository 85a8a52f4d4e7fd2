use std::collections::HashMap;
use std::sync::Mutex;

use crate::driver::{
    BlendDesc, BufferDesc, DepthDesc, DepthStencilViewDesc, DriverError, DriverResult, Format,
    IndexFormat, NativeDriver, NativeHandle, NativeVertexBinding, RasterDesc, Rect,
    RenderTargetViewDesc, SamplerDesc, ShaderResourceViewDesc, ShaderStage, TextureDesc,
    UnorderedAccessViewDesc, Viewport,
};

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub creates: u64,
    pub destroys: u64,
    pub updates: u64,
    pub copies: u64,
    pub binds: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub clears: u64,
    pub presents: u64,
}

/// Observable binding state of one software context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftContextState {
    pub shaders: [Option<u64>; 3],
    pub render_targets: Vec<Option<u64>>,
    pub depth: Option<u64>,
    pub viewport_count: usize,
}

enum SoftObject {
    Buffer { data: Vec<u8> },
    Texture { desc: TextureDesc, data: Vec<u8> },
    Sampler,
    Shader,
    View { target: u64 },
    BlendState,
    DepthState,
    RasterState,
    Context(SoftContextState),
}

impl SoftObject {
    fn data(&self) -> Option<&Vec<u8>> {
        match self {
            SoftObject::Buffer { data } => Some(data),
            SoftObject::Texture { data, .. } => Some(data),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    next: u64,
    objects: HashMap<u64, SoftObject>,
    stats: SoftStats,
    fail_next_create: Option<DriverError>,
}

/// In-memory implementation of the driver capability set: resources are
/// plain byte vectors, draws are counted, clears actually write texel data.
/// Used by tests and by headless replay.
#[derive(Default)]
pub struct SoftwareDriver {
    inner: Mutex<Inner>,
}

impl SoftwareDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> SoftStats {
        self.inner.lock().unwrap().stats
    }

    pub fn live_objects(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    /// Make the next `create_*` call fail with `err`, for exercising the
    /// driver-error propagation path.
    pub fn fail_next_create(&self, err: DriverError) {
        self.inner.lock().unwrap().fail_next_create = Some(err);
    }

    pub fn context_state(&self, ctx: NativeHandle) -> Option<SoftContextState> {
        match self.inner.lock().unwrap().objects.get(&ctx.0) {
            Some(SoftObject::Context(state)) => Some(state.clone()),
            _ => None,
        }
    }

    /// Raw contents of a buffer or texture, for asserting on replay output.
    pub fn resource_data(&self, resource: NativeHandle) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&resource.0)
            .and_then(|o| o.data().cloned())
    }
}

impl Inner {
    fn alloc(&mut self, object: SoftObject) -> DriverResult<NativeHandle> {
        if let Some(err) = self.fail_next_create.take() {
            return Err(err);
        }
        self.next += 1;
        let handle = NativeHandle(self.next);
        self.objects.insert(handle.0, object);
        self.stats.creates += 1;
        Ok(handle)
    }

    fn check(&self, handle: NativeHandle) -> DriverResult<()> {
        if self.objects.contains_key(&handle.0) {
            Ok(())
        } else {
            Err(DriverError::UnknownHandle)
        }
    }

    fn check_opt(&self, handle: Option<NativeHandle>) -> DriverResult<()> {
        match handle {
            Some(h) => self.check(h),
            None => Ok(()),
        }
    }

    fn view_target(&self, view: NativeHandle) -> DriverResult<u64> {
        match self.objects.get(&view.0) {
            Some(SoftObject::View { target }) => Ok(*target),
            Some(_) => Err(DriverError::InvalidArgument("handle is not a view")),
            None => Err(DriverError::UnknownHandle),
        }
    }

    fn context_mut(&mut self, ctx: NativeHandle) -> DriverResult<&mut SoftContextState> {
        match self.objects.get_mut(&ctx.0) {
            Some(SoftObject::Context(state)) => Ok(state),
            Some(_) => Err(DriverError::InvalidArgument("handle is not a context")),
            None => Err(DriverError::UnknownHandle),
        }
    }

    fn bind(&mut self, ctx: NativeHandle, handles: &[Option<NativeHandle>]) -> DriverResult<()> {
        self.context_mut(ctx)?;
        for &h in handles {
            self.check_opt(h)?;
        }
        self.stats.binds += 1;
        Ok(())
    }
}

fn texel_bytes(format: Format, color: [f32; 4]) -> [u8; 4] {
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0) as u8;
    match format {
        Format::Rgba8Unorm => [to_u8(color[0]), to_u8(color[1]), to_u8(color[2]), to_u8(color[3])],
        Format::Bgra8Unorm => [to_u8(color[2]), to_u8(color[1]), to_u8(color[0]), to_u8(color[3])],
        Format::R32Float => color[0].to_le_bytes(),
        Format::R32Uint => (color[0] as u32).to_le_bytes(),
        Format::D24UnormS8 | Format::D32Float => color[0].to_le_bytes(),
    }
}

impl NativeDriver for SoftwareDriver {
    fn create_buffer(&self, desc: &BufferDesc, init: Option<&[u8]>) -> DriverResult<NativeHandle> {
        if desc.size == 0 {
            return Err(DriverError::InvalidArgument("zero-sized buffer"));
        }
        let size = usize::try_from(desc.size)
            .map_err(|_| DriverError::InvalidArgument("buffer size overflow"))?;
        let mut data = vec![0u8; size];
        if let Some(init) = init {
            if init.len() > size {
                return Err(DriverError::InvalidArgument("init data larger than buffer"));
            }
            data[..init.len()].copy_from_slice(init);
        }
        self.inner.lock().unwrap().alloc(SoftObject::Buffer { data })
    }

    fn create_texture2d(
        &self,
        desc: &TextureDesc,
        init: Option<&[u8]>,
    ) -> DriverResult<NativeHandle> {
        if desc.width == 0 || desc.height == 0 || desc.mips == 0 {
            return Err(DriverError::InvalidArgument("zero-sized texture"));
        }
        if desc.sample_count == 0 {
            return Err(DriverError::InvalidArgument("zero sample count"));
        }
        let size = usize::try_from(desc.byte_size())
            .map_err(|_| DriverError::InvalidArgument("texture size overflow"))?;
        let mut data = vec![0u8; size];
        if let Some(init) = init {
            if init.len() > size {
                return Err(DriverError::InvalidArgument("init data larger than texture"));
            }
            data[..init.len()].copy_from_slice(init);
        }
        self.inner
            .lock()
            .unwrap()
            .alloc(SoftObject::Texture { desc: *desc, data })
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> DriverResult<NativeHandle> {
        self.inner.lock().unwrap().alloc(SoftObject::Sampler)
    }

    fn create_shader(&self, _stage: ShaderStage, bytecode: &[u8]) -> DriverResult<NativeHandle> {
        if bytecode.is_empty() {
            return Err(DriverError::InvalidArgument("empty shader bytecode"));
        }
        self.inner.lock().unwrap().alloc(SoftObject::Shader)
    }

    fn create_render_target_view(
        &self,
        resource: NativeHandle,
        _desc: &RenderTargetViewDesc,
    ) -> DriverResult<NativeHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(resource)?;
        inner.alloc(SoftObject::View { target: resource.0 })
    }

    fn create_depth_stencil_view(
        &self,
        resource: NativeHandle,
        _desc: &DepthStencilViewDesc,
    ) -> DriverResult<NativeHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(resource)?;
        inner.alloc(SoftObject::View { target: resource.0 })
    }

    fn create_shader_resource_view(
        &self,
        resource: NativeHandle,
        _desc: &ShaderResourceViewDesc,
    ) -> DriverResult<NativeHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(resource)?;
        inner.alloc(SoftObject::View { target: resource.0 })
    }

    fn create_unordered_access_view(
        &self,
        resource: NativeHandle,
        _desc: &UnorderedAccessViewDesc,
    ) -> DriverResult<NativeHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(resource)?;
        inner.alloc(SoftObject::View { target: resource.0 })
    }

    fn create_blend_state(&self, _desc: &BlendDesc) -> DriverResult<NativeHandle> {
        self.inner.lock().unwrap().alloc(SoftObject::BlendState)
    }

    fn create_depth_state(&self, _desc: &DepthDesc) -> DriverResult<NativeHandle> {
        self.inner.lock().unwrap().alloc(SoftObject::DepthState)
    }

    fn create_raster_state(&self, _desc: &RasterDesc) -> DriverResult<NativeHandle> {
        self.inner.lock().unwrap().alloc(SoftObject::RasterState)
    }

    fn create_context(&self) -> DriverResult<NativeHandle> {
        self.inner
            .lock()
            .unwrap()
            .alloc(SoftObject::Context(SoftContextState::default()))
    }

    fn destroy(&self, handle: NativeHandle) {
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.remove(&handle.0).is_some() {
            inner.stats.destroys += 1;
        }
    }

    fn query_capability(&self, name: &str) -> DriverResult<bool> {
        match name {
            "compute" | "deferred-contexts" | "read-only-depth" => Ok(true),
            _ => Ok(false),
        }
    }

    fn update_resource(
        &self,
        resource: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get_mut(&resource.0)
            .ok_or(DriverError::UnknownHandle)?;
        let dst = match object {
            SoftObject::Buffer { data } => data,
            SoftObject::Texture { data, .. } => data,
            _ => return Err(DriverError::InvalidArgument("object has no contents")),
        };
        let offset = usize::try_from(offset)
            .map_err(|_| DriverError::InvalidArgument("update offset overflow"))?;
        let end = offset
            .checked_add(data.len())
            .ok_or(DriverError::InvalidArgument("update range overflow"))?;
        if end > dst.len() {
            return Err(DriverError::InvalidArgument("update outside resource bounds"));
        }
        dst[offset..end].copy_from_slice(data);
        inner.stats.updates += 1;
        Ok(())
    }

    fn read_resource(&self, resource: NativeHandle) -> DriverResult<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let object = inner
            .objects
            .get(&resource.0)
            .ok_or(DriverError::UnknownHandle)?;
        object
            .data()
            .cloned()
            .ok_or(DriverError::InvalidArgument("object has no contents"))
    }

    fn copy_resource(&self, dst: NativeHandle, src: NativeHandle) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let src_data = inner
            .objects
            .get(&src.0)
            .ok_or(DriverError::UnknownHandle)?
            .data()
            .cloned()
            .ok_or(DriverError::InvalidArgument("source has no contents"))?;
        let dst_obj = inner
            .objects
            .get_mut(&dst.0)
            .ok_or(DriverError::UnknownHandle)?;
        let dst_data = match dst_obj {
            SoftObject::Buffer { data } => data,
            SoftObject::Texture { data, .. } => data,
            _ => return Err(DriverError::InvalidArgument("destination has no contents")),
        };
        if dst_data.len() != src_data.len() {
            return Err(DriverError::InvalidArgument("copy size mismatch"));
        }
        *dst_data = src_data;
        inner.stats.copies += 1;
        Ok(())
    }

    fn bind_shader(
        &self,
        ctx: NativeHandle,
        stage: ShaderStage,
        shader: Option<NativeHandle>,
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_opt(shader)?;
        let state = inner.context_mut(ctx)?;
        state.shaders[stage.index()] = shader.map(|h| h.0);
        inner.stats.binds += 1;
        Ok(())
    }

    fn bind_constant_buffers(
        &self,
        ctx: NativeHandle,
        _stage: ShaderStage,
        _first_slot: u32,
        buffers: &[Option<NativeHandle>],
    ) -> DriverResult<()> {
        self.inner.lock().unwrap().bind(ctx, buffers)
    }

    fn bind_shader_resources(
        &self,
        ctx: NativeHandle,
        _stage: ShaderStage,
        _first_slot: u32,
        views: &[Option<NativeHandle>],
    ) -> DriverResult<()> {
        self.inner.lock().unwrap().bind(ctx, views)
    }

    fn bind_samplers(
        &self,
        ctx: NativeHandle,
        _stage: ShaderStage,
        _first_slot: u32,
        samplers: &[Option<NativeHandle>],
    ) -> DriverResult<()> {
        self.inner.lock().unwrap().bind(ctx, samplers)
    }

    fn bind_vertex_buffers(
        &self,
        ctx: NativeHandle,
        _first_slot: u32,
        bindings: &[Option<NativeVertexBinding>],
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        for binding in bindings.iter().flatten() {
            inner.check(binding.buffer)?;
        }
        inner.stats.binds += 1;
        Ok(())
    }

    fn bind_index_buffer(
        &self,
        ctx: NativeHandle,
        buffer: Option<NativeHandle>,
        _format: IndexFormat,
        _offset: u64,
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.check_opt(buffer)?;
        inner.stats.binds += 1;
        Ok(())
    }

    fn bind_render_targets(
        &self,
        ctx: NativeHandle,
        colors: &[Option<NativeHandle>],
        depth: Option<NativeHandle>,
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for &h in colors {
            inner.check_opt(h)?;
        }
        inner.check_opt(depth)?;
        let state = inner.context_mut(ctx)?;
        state.render_targets = colors.iter().map(|h| h.map(|h| h.0)).collect();
        state.depth = depth.map(|h| h.0);
        inner.stats.binds += 1;
        Ok(())
    }

    fn bind_unordered_access_views(
        &self,
        ctx: NativeHandle,
        _first_slot: u32,
        views: &[Option<NativeHandle>],
    ) -> DriverResult<()> {
        self.inner.lock().unwrap().bind(ctx, views)
    }

    fn set_viewports(&self, ctx: NativeHandle, viewports: &[Viewport]) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.context_mut(ctx)?;
        state.viewport_count = viewports.len();
        inner.stats.binds += 1;
        Ok(())
    }

    fn set_scissors(&self, ctx: NativeHandle, _rects: &[Rect]) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.stats.binds += 1;
        Ok(())
    }

    fn set_blend_state(
        &self,
        ctx: NativeHandle,
        state: Option<NativeHandle>,
        _factor: [f32; 4],
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.check_opt(state)?;
        inner.stats.binds += 1;
        Ok(())
    }

    fn set_depth_state(
        &self,
        ctx: NativeHandle,
        state: Option<NativeHandle>,
        _stencil_ref: u32,
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.check_opt(state)?;
        inner.stats.binds += 1;
        Ok(())
    }

    fn set_raster_state(&self, ctx: NativeHandle, state: Option<NativeHandle>) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.check_opt(state)?;
        inner.stats.binds += 1;
        Ok(())
    }

    fn draw(&self, ctx: NativeHandle, _vertex_count: u32, _first_vertex: u32) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.stats.draws += 1;
        Ok(())
    }

    fn draw_indexed(
        &self,
        ctx: NativeHandle,
        _index_count: u32,
        _first_index: u32,
        _base_vertex: i32,
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.stats.draws += 1;
        Ok(())
    }

    fn dispatch(&self, ctx: NativeHandle, _x: u32, _y: u32, _z: u32) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.stats.dispatches += 1;
        Ok(())
    }

    fn clear_render_target(
        &self,
        ctx: NativeHandle,
        view: NativeHandle,
        color: [f32; 4],
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        let target = inner.view_target(view)?;
        let Some(SoftObject::Texture { desc, data }) = inner.objects.get_mut(&target) else {
            return Err(DriverError::InvalidArgument("cleared view over non-texture"));
        };
        let texel = texel_bytes(desc.format, color);
        for chunk in data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&texel);
        }
        inner.stats.clears += 1;
        Ok(())
    }

    fn clear_depth_stencil(
        &self,
        ctx: NativeHandle,
        view: NativeHandle,
        depth: f32,
        _stencil: u8,
    ) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        let target = inner.view_target(view)?;
        let Some(SoftObject::Texture { data, .. }) = inner.objects.get_mut(&target) else {
            return Err(DriverError::InvalidArgument("cleared view over non-texture"));
        };
        let texel = depth.to_le_bytes();
        for chunk in data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&texel);
        }
        inner.stats.clears += 1;
        Ok(())
    }

    fn present(&self, ctx: NativeHandle) -> DriverResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.context_mut(ctx)?;
        inner.stats.presents += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BindFlags;

    #[test]
    fn buffer_create_update_read_round_trip() {
        let driver = SoftwareDriver::new();
        let buffer = driver
            .create_buffer(
                &BufferDesc {
                    size: 16,
                    bind: BindFlags::VERTEX_BUFFER,
                    cpu_writable: true,
                },
                Some(&[1u8; 16]),
            )
            .unwrap();
        driver.update_resource(buffer, 4, &[9u8; 4]).unwrap();
        let data = driver.read_resource(buffer).unwrap();
        assert_eq!(&data[..4], &[1u8; 4]);
        assert_eq!(&data[4..8], &[9u8; 4]);
        assert_eq!(&data[8..], &[1u8; 8]);
    }

    #[test]
    fn clear_writes_format_ordered_texels() {
        let driver = SoftwareDriver::new();
        let ctx = driver.create_context().unwrap();
        let tex = driver
            .create_texture2d(
                &TextureDesc {
                    width: 2,
                    height: 1,
                    mips: 1,
                    format: Format::Bgra8Unorm,
                    bind: BindFlags::RENDER_TARGET,
                    sample_count: 1,
                },
                None,
            )
            .unwrap();
        let view = driver
            .create_render_target_view(tex, &RenderTargetViewDesc::default())
            .unwrap();
        driver
            .clear_render_target(ctx, view, [1.0, 0.5, 0.0, 1.0])
            .unwrap();
        let data = driver.read_resource(tex).unwrap();
        // BGRA ordering: blue first.
        assert_eq!(&data[..4], &[0, 127, 255, 255]);
    }

    #[test]
    fn update_outside_bounds_is_rejected() {
        let driver = SoftwareDriver::new();
        let buffer = driver
            .create_buffer(
                &BufferDesc {
                    size: 8,
                    bind: BindFlags::CONSTANT_BUFFER,
                    cpu_writable: true,
                },
                None,
            )
            .unwrap();
        assert!(matches!(
            driver.update_resource(buffer, 6, &[0u8; 4]),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn injected_create_failure_surfaces_unchanged() {
        let driver = SoftwareDriver::new();
        driver.fail_next_create(DriverError::OutOfMemory);
        let result = driver.create_sampler(&SamplerDesc::default());
        assert_eq!(result.unwrap_err(), DriverError::OutOfMemory);
        // The failure is one-shot.
        assert!(driver.create_sampler(&SamplerDesc::default()).is_ok());
    }
}
