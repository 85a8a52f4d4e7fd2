//! Fetch/apply round-trip identity on a live context, and the write-hazard
//! unbind helpers.

use std::sync::Arc;

use optic_capture::{CaptureOptions, DeviceConfig, VertexBufferRef, WrappedDevice};
use optic_wrap::{
    BindFlags, BlendDesc, BufferDesc, DepthStencilViewDesc, Format, MapMode, RasterDesc, Rect,
    RenderTargetViewDesc, SamplerDesc, ShaderResourceViewDesc, ShaderStage, SoftwareDriver,
    TextureDesc, UnorderedAccessViewDesc, Viewport,
};

fn device_pair() -> (WrappedDevice, optic_capture::Context) {
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), CaptureOptions::default()).unwrap();
    (device, ctx)
}

#[test]
fn fetch_apply_fetch_is_identity() {
    let (device, ctx) = device_pair();

    let vb = device
        .create_buffer(
            &BufferDesc {
                size: 256,
                bind: BindFlags::VERTEX_BUFFER,
                cpu_writable: false,
            },
            None,
        )
        .unwrap();
    let cb = device
        .create_buffer(
            &BufferDesc {
                size: 64,
                bind: BindFlags::CONSTANT_BUFFER,
                cpu_writable: true,
            },
            None,
        )
        .unwrap();
    let tex = device
        .create_texture2d(
            &TextureDesc {
                width: 128,
                height: 128,
                mips: 1,
                format: Format::Bgra8Unorm,
                bind: BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE,
                sample_count: 1,
            },
            None,
        )
        .unwrap();
    let rtv = device
        .create_render_target_view(&tex, &RenderTargetViewDesc::default())
        .unwrap();
    let srv = device
        .create_shader_resource_view(tex.handle(), &ShaderResourceViewDesc::default())
        .unwrap();
    let sampler = device.create_sampler(&SamplerDesc::default()).unwrap();
    let vs = device.create_shader(ShaderStage::Vertex, &[1]).unwrap();
    let ps = device.create_shader(ShaderStage::Pixel, &[2]).unwrap();
    let blend = device.create_blend_state(&BlendDesc::default()).unwrap();
    let raster = device.create_raster_state(&RasterDesc::default()).unwrap();

    ctx.bind_shader(ShaderStage::Vertex, Some(&vs)).unwrap();
    ctx.bind_shader(ShaderStage::Pixel, Some(&ps)).unwrap();
    ctx.bind_vertex_buffers(
        1,
        &[VertexBufferRef {
            buffer: Some(&vb),
            stride: 24,
            offset: 48,
        }],
    )
    .unwrap();
    ctx.bind_constant_buffers(ShaderStage::Pixel, 3, &[Some(&cb)])
        .unwrap();
    ctx.bind_shader_resources(ShaderStage::Pixel, 2, &[Some(&srv)])
        .unwrap();
    ctx.bind_samplers(ShaderStage::Pixel, 0, &[Some(&sampler)])
        .unwrap();
    ctx.bind_render_targets(&[Some(&rtv)], None).unwrap();
    ctx.set_blend_state(Some(&blend), [0.5, 0.5, 0.5, 1.0]).unwrap();
    ctx.set_raster_state(Some(&raster)).unwrap();
    ctx.set_viewports(&[Viewport {
        x: 0.0,
        y: 0.0,
        width: 128.0,
        height: 128.0,
        min_depth: 0.0,
        max_depth: 1.0,
    }])
    .unwrap();
    ctx.set_scissors(&[Rect {
        left: 8,
        top: 8,
        right: 120,
        bottom: 120,
    }])
    .unwrap();

    let fetched = ctx.fetch_state();
    // Apply clears the context and rebinds everything; fetching again must
    // observe exactly the fetched value.
    ctx.apply_state(&fetched).unwrap();
    let refetched = ctx.fetch_state();
    assert_eq!(fetched, refetched);

    // Applying an empty state is a full clear.
    ctx.apply_state(&Default::default()).unwrap();
    let cleared = ctx.fetch_state();
    assert!(cleared.stage(ShaderStage::Pixel).shader.is_null());
    assert!(cleared.om.render_targets[0].is_null());
    assert!(cleared.rs.viewports.is_empty());

    // And round-tripping the fetched value a second time still holds.
    ctx.apply_state(&fetched).unwrap();
    assert_eq!(ctx.fetch_state(), fetched);
}

#[test]
fn map_force_unbinds_write_capable_bindings() {
    let (device, ctx) = device_pair();

    let buffer = device
        .create_buffer(
            &BufferDesc {
                size: 64,
                bind: BindFlags::UNORDERED_ACCESS,
                cpu_writable: true,
            },
            None,
        )
        .unwrap();
    let uav = device
        .create_unordered_access_view(buffer.handle(), &UnorderedAccessViewDesc::default())
        .unwrap();
    ctx.bind_unordered_access_views(0, &[Some(&uav)]).unwrap();
    assert!(ctx.is_bound_for_write(buffer.handle(), false, false));

    let mapping = ctx.map(buffer.handle(), MapMode::Write).unwrap();
    assert!(!ctx.is_bound_for_write(buffer.handle(), false, false));
    assert!(ctx.fetch_state().om.uavs[0].is_null());
    ctx.unmap(mapping).unwrap();
}

#[test]
fn read_only_depth_binding_survives_map() {
    let (device, ctx) = device_pair();

    let depth_tex = device
        .create_texture2d(
            &TextureDesc {
                width: 32,
                height: 32,
                mips: 1,
                format: Format::D24UnormS8,
                bind: BindFlags::DEPTH_STENCIL,
                sample_count: 1,
            },
            None,
        )
        .unwrap();
    let read_only_dsv = device
        .create_depth_stencil_view(
            &depth_tex,
            &DepthStencilViewDesc {
                mip: 0,
                read_only_depth: true,
                read_only_stencil: true,
            },
        )
        .unwrap();
    ctx.bind_render_targets(&[], Some(&read_only_dsv)).unwrap();

    // A fully read-only depth view is not a write hazard.
    assert!(!ctx.is_bound_for_write(depth_tex.handle(), true, true));
    let mapping = ctx.map(depth_tex.handle(), MapMode::Read).unwrap();
    // The binding survived the map.
    assert!(!ctx.fetch_state().om.depth_view.is_null());
    ctx.unmap(mapping).unwrap();
}

#[test]
fn unbind_for_read_clears_read_bindings() {
    let (device, ctx) = device_pair();

    let buffer = device
        .create_buffer(
            &BufferDesc {
                size: 64,
                bind: BindFlags::CONSTANT_BUFFER | BindFlags::VERTEX_BUFFER,
                cpu_writable: true,
            },
            None,
        )
        .unwrap();
    ctx.bind_constant_buffers(ShaderStage::Vertex, 0, &[Some(&buffer)])
        .unwrap();
    ctx.bind_vertex_buffers(
        0,
        &[VertexBufferRef {
            buffer: Some(&buffer),
            stride: 16,
            offset: 0,
        }],
    )
    .unwrap();

    assert!(ctx.unbind_for_read(buffer.handle()).unwrap());
    let state = ctx.fetch_state();
    assert!(state.stage(ShaderStage::Vertex).constant_buffers[0].is_null());
    assert!(state.ia.vertex_buffers[0].buffer.is_null());
}
