//! Deferred-context command lists merging at their submission point, and
//! initial-contents invalidation across captures.

use std::sync::Arc;

use optic_capture::{CaptureOptions, DeviceConfig, ReplayController, WrappedDevice};
use optic_wrap::{
    BindFlags, Format, RenderTargetViewDesc, ShaderResourceViewDesc, ShaderStage, SoftwareDriver,
    TextureDesc, Viewport,
};

fn options(dir: &tempfile::TempDir) -> CaptureOptions {
    CaptureOptions {
        output_dir: dir.path().to_path_buf(),
        ..CaptureOptions::default()
    }
}

#[test]
fn command_list_chunks_splice_at_their_submission_point() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver.clone(), DeviceConfig::default(), options(&dir)).unwrap();

    let vs = device.create_shader(ShaderStage::Vertex, &[1]).unwrap();
    let deferred = device.create_deferred_context().unwrap();

    device.trigger_capture();
    ctx.present().unwrap();

    // Record a command list while the capture is open.
    deferred.bind_shader(ShaderStage::Vertex, Some(&vs)).unwrap();
    deferred.draw(3, 0).unwrap();
    let list = deferred.finish_command_list().unwrap();

    // Deferred recording does not reach the driver until submission.
    assert_eq!(driver.stats().draws, 0);
    ctx.execute_command_list(&list).unwrap();
    assert_eq!(driver.stats().draws, 1);

    ctx.draw(6, 0).unwrap();
    ctx.present().unwrap();

    let report = device.last_capture().unwrap();
    let replay_driver = Arc::new(SoftwareDriver::new());
    let mut replay =
        ReplayController::open_path(&report.path, replay_driver.clone()).unwrap();

    // The submitted list shows up as a nested region holding its calls,
    // positioned before the immediate context's own draw.
    let root = replay.drawcall_tree();
    assert_eq!(root.children[0].name, "ExecuteCommandList");
    assert_eq!(root.children[0].children[0].name, "Draw");
    assert_eq!(root.children[1].name, "Draw");

    replay.replay_all().unwrap();
    assert_eq!(replay_driver.stats().draws, 2);
    // The list's shader binding applied during replay as well.
    assert!(!replay
        .fetch_state()
        .stage(ShaderStage::Vertex)
        .shader
        .is_null());
}

#[test]
fn initial_contents_refresh_when_resource_changes_between_captures() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    let tex = device
        .create_texture2d(
            &TextureDesc {
                width: 4,
                height: 4,
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

    let capture_reading_texture = |color: [f32; 4]| {
        // GPU write outside any capture: marks the texture dirty.
        ctx.clear_render_target(&rtv, color).unwrap();
        device.trigger_capture();
        ctx.present().unwrap();
        // The frame reads the texture, so its pre-frame contents must be
        // carried in the capture.
        ctx.bind_shader_resources(ShaderStage::Pixel, 0, &[Some(&srv)])
            .unwrap();
        ctx.set_viewports(&[Viewport {
            x: 0.0,
            y: 0.0,
            width: 4.0,
            height: 4.0,
            min_depth: 0.0,
            max_depth: 1.0,
        }])
        .unwrap();
        ctx.draw(3, 0).unwrap();
        ctx.present().unwrap();
        device.last_capture().unwrap()
    };

    let red_capture = capture_reading_texture([1.0, 0.0, 0.0, 1.0]);
    let green_capture = capture_reading_texture([0.0, 1.0, 0.0, 1.0]);

    let replayed_texel = |path: &std::path::Path| {
        let replay_driver = Arc::new(SoftwareDriver::new());
        let replay = ReplayController::open_path(path, replay_driver.clone()).unwrap();
        let live = replay
            .device()
            .registry()
            .get_live_resource(tex.id())
            .unwrap();
        let native = replay.device().arena().native_of(live).unwrap();
        let data = replay_driver.resource_data(native).unwrap();
        data[..4].to_vec()
    };

    // The snapshot taken for the second capture must reflect the write that
    // happened in between, not the stale first snapshot.
    assert_eq!(replayed_texel(&red_capture.path), vec![255, 0, 0, 255]);
    assert_eq!(replayed_texel(&green_capture.path), vec![0, 255, 0, 255]);
}
