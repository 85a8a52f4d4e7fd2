//! End-to-end: intercept a frame against the software driver, write the
//! capture, then replay it against a fresh driver and check both the driver
//! effects and the reconstructed pipeline state.

use std::sync::Arc;

use optic_capture::{
    CaptureOptions, CaptureState, DeviceConfig, ReplayController, VertexBufferRef, WrappedDevice,
};
use optic_wrap::{
    BindFlags, BufferDesc, Format, MapMode, RenderTargetViewDesc, ShaderResourceViewDesc,
    ShaderStage, SoftwareDriver, TextureDesc, Viewport,
};

fn options(dir: &tempfile::TempDir) -> CaptureOptions {
    CaptureOptions {
        output_dir: dir.path().to_path_buf(),
        ..CaptureOptions::default()
    }
}

fn full_viewport(size: f32) -> Viewport {
    Viewport {
        x: 0.0,
        y: 0.0,
        width: size,
        height: size,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

#[test]
fn captured_frame_replays_with_identical_effects() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver.clone(), DeviceConfig::default(), options(&dir)).unwrap();

    let vb = device
        .create_buffer(
            &BufferDesc {
                size: 64,
                bind: BindFlags::VERTEX_BUFFER,
                cpu_writable: true,
            },
            Some(&[7u8; 64]),
        )
        .unwrap();
    let cb = device
        .create_buffer(
            &BufferDesc {
                size: 16,
                bind: BindFlags::CONSTANT_BUFFER,
                cpu_writable: true,
            },
            Some(&[3u8; 16]),
        )
        .unwrap();
    let tex = device
        .create_texture2d(
            &TextureDesc {
                width: 64,
                height: 64,
                mips: 1,
                format: Format::Rgba8Unorm,
                bind: BindFlags::RENDER_TARGET | BindFlags::SHADER_RESOURCE,
                sample_count: 1,
            },
            None,
        )
        .unwrap();
    let rtv = device
        .create_render_target_view(&tex, &RenderTargetViewDesc::default())
        .unwrap();
    let vs = device.create_shader(ShaderStage::Vertex, &[1, 2, 3]).unwrap();
    let ps = device.create_shader(ShaderStage::Pixel, &[4, 5, 6]).unwrap();

    // Device setup that predates the capture; the frame capture must pick
    // this up as beginning state.
    ctx.bind_shader(ShaderStage::Vertex, Some(&vs)).unwrap();
    ctx.set_viewports(&[full_viewport(64.0)]).unwrap();

    device.trigger_capture();
    ctx.present().unwrap();
    assert_eq!(device.capture_state(), CaptureState::Capturing);

    ctx.push_marker("main pass");
    ctx.bind_render_targets(&[Some(&rtv)], None).unwrap();
    ctx.clear_render_target(&rtv, [0.0, 0.0, 1.0, 1.0]).unwrap();
    ctx.bind_shader(ShaderStage::Pixel, Some(&ps)).unwrap();
    ctx.bind_vertex_buffers(
        0,
        &[VertexBufferRef {
            buffer: Some(&vb),
            stride: 16,
            offset: 0,
        }],
    )
    .unwrap();
    ctx.bind_constant_buffers(ShaderStage::Pixel, 0, &[Some(&cb)])
        .unwrap();
    ctx.pop_marker();
    ctx.draw(3, 0).unwrap();

    ctx.present().unwrap();
    assert_eq!(device.capture_state(), CaptureState::Idle);

    let report = device.last_capture().expect("capture should have finalized");
    assert_eq!(report.frame, 1);
    assert_eq!(report.events, 8);
    assert!(report.path.exists());

    // Replay against a fresh driver.
    let replay_driver = Arc::new(SoftwareDriver::new());
    let mut replay =
        ReplayController::open_path(&report.path, replay_driver.clone()).unwrap();
    assert_eq!(replay.meta().width, 1280);
    assert_eq!(replay.frame_log().last_event(), 8);

    // Drawcall tree: the marker region holds the clear, the draw follows.
    let root = replay.drawcall_tree();
    assert_eq!(root.children.len(), 2);
    assert_eq!(root.children[0].name, "main pass");
    assert_eq!(root.children[0].children[0].name, "ClearRenderTarget");
    assert_eq!(root.children[1].name, "Draw");

    replay.replay_all().unwrap();
    let stats = replay_driver.stats();
    assert_eq!(stats.draws, 1);
    assert_eq!(stats.clears, 1);

    // The cleared texture really holds the clear color in the replay
    // driver's memory.
    let registry = replay.device().registry();
    let live_tex = registry.get_live_resource(tex.id()).unwrap();
    let native_tex = replay.device().arena().native_of(live_tex).unwrap();
    let texels = replay_driver.resource_data(native_tex).unwrap();
    assert_eq!(&texels[..4], &[0, 0, 255, 255]);

    // Reconstructed bindings point at the live objects standing in for the
    // captured ones.
    let state = replay.fetch_state();
    assert_eq!(
        state.stage(ShaderStage::Vertex).shader,
        registry.get_live_id(vs.id())
    );
    assert_eq!(
        state.stage(ShaderStage::Pixel).shader,
        registry.get_live_id(ps.id())
    );
    assert_eq!(state.om.render_targets[0], registry.get_live_id(rtv.id()));
    assert_eq!(
        state.ia.vertex_buffers[0].buffer,
        registry.get_live_id(vb.id())
    );
    assert_eq!(state.rs.viewports.len(), 1);
}

#[test]
fn partial_replay_matches_continuous_replay_at_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    let cb = device
        .create_buffer(
            &BufferDesc {
                size: 16,
                bind: BindFlags::CONSTANT_BUFFER,
                cpu_writable: true,
            },
            Some(&[1u8; 16]),
        )
        .unwrap();
    let tex = device
        .create_texture2d(
            &TextureDesc {
                width: 32,
                height: 32,
                mips: 1,
                format: Format::Rgba8Unorm,
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
    let vs = device.create_shader(ShaderStage::Vertex, &[9]).unwrap();

    device.trigger_capture();
    ctx.present().unwrap();

    ctx.bind_shader(ShaderStage::Vertex, Some(&vs)).unwrap();
    ctx.set_viewports(&[full_viewport(32.0)]).unwrap();
    ctx.bind_render_targets(&[Some(&rtv)], None).unwrap();
    ctx.clear_render_target(&rtv, [1.0, 0.0, 0.0, 1.0]).unwrap();
    ctx.draw(3, 0).unwrap();
    ctx.update_resource(cb.handle(), 0, &[5u8; 16]).unwrap();
    ctx.bind_render_targets(&[], None).unwrap();
    ctx.bind_shader_resources(ShaderStage::Pixel, 0, &[Some(&srv)])
        .unwrap();
    ctx.draw(6, 0).unwrap();
    ctx.present().unwrap();

    let report = device.last_capture().unwrap();
    let replay_driver = Arc::new(SoftwareDriver::new());
    let mut replay =
        ReplayController::open_path(&report.path, replay_driver.clone()).unwrap();
    let last = replay.frame_log().last_event();
    assert!(last >= 9);

    let live_cb = replay
        .device()
        .registry()
        .get_live_resource(cb.id())
        .unwrap();
    let native_cb = replay.device().arena().native_of(live_cb).unwrap();

    // Continuous pass: execute each event once, snapshotting state and the
    // constant buffer contents after each.
    let mut states = Vec::new();
    let mut cb_contents = Vec::new();
    for k in 1..=last {
        replay
            .replay_log(k, k, optic_capture::ReplayMode::Full)
            .unwrap();
        states.push(replay.fetch_state());
        cb_contents.push(replay_driver.resource_data(native_cb).unwrap());
    }

    // Partial passes: jumping to event k must reconstruct exactly the state
    // the continuous pass had there.
    for k in (1..=last).rev() {
        replay.replay_to(k).unwrap();
        assert_eq!(
            replay.fetch_state(),
            states[(k - 1) as usize],
            "pipeline state diverged at event {k}"
        );
        assert_eq!(
            replay_driver.resource_data(native_cb).unwrap(),
            cb_contents[(k - 1) as usize],
            "buffer contents diverged at event {k}"
        );
    }
}

#[test]
fn mapped_writes_are_captured_and_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    let vb = device
        .create_buffer(
            &BufferDesc {
                size: 32,
                bind: BindFlags::VERTEX_BUFFER,
                cpu_writable: true,
            },
            None,
        )
        .unwrap();

    device.trigger_capture();
    ctx.present().unwrap();

    let mut mapping = ctx.map(vb.handle(), MapMode::WriteDiscard).unwrap();
    mapping.data.copy_from_slice(&[0xabu8; 32]);
    ctx.unmap(mapping).unwrap();
    ctx.bind_vertex_buffers(
        0,
        &[VertexBufferRef {
            buffer: Some(&vb),
            stride: 8,
            offset: 0,
        }],
    )
    .unwrap();
    ctx.draw(4, 0).unwrap();
    ctx.present().unwrap();

    let report = device.last_capture().unwrap();
    let replay_driver = Arc::new(SoftwareDriver::new());
    let mut replay =
        ReplayController::open_path(&report.path, replay_driver.clone()).unwrap();
    replay.replay_all().unwrap();

    let live = replay
        .device()
        .registry()
        .get_live_resource(vb.id())
        .unwrap();
    let native = replay.device().arena().native_of(live).unwrap();
    assert_eq!(replay_driver.resource_data(native).unwrap(), vec![0xabu8; 32]);
}
