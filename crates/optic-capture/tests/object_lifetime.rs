//! Reference-count behavior across the wrapped API surface: an object dies
//! exactly when its external, soft/view and pipeline references are all
//! gone, wherever the last one is dropped from.

use std::sync::Arc;

use optic_capture::{CaptureError, CaptureOptions, DeviceConfig, WrappedDevice};
use optic_wrap::{
    BindFlags, BufferDesc, DriverError, Format, RenderTargetViewDesc, SoftwareDriver, TextureDesc,
};

fn device_pair() -> (Arc<SoftwareDriver>, WrappedDevice, optic_capture::Context) {
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) = WrappedDevice::new(
        driver.clone(),
        DeviceConfig::default(),
        CaptureOptions::default(),
    )
    .unwrap();
    (driver, device, ctx)
}

fn render_target(device: &WrappedDevice) -> (optic_wrap::Texture2d, optic_wrap::RenderTargetView) {
    let tex = device
        .create_texture2d(
            &TextureDesc {
                width: 8,
                height: 8,
                mips: 1,
                format: Format::Rgba8Unorm,
                bind: BindFlags::RENDER_TARGET,
                sample_count: 1,
            },
            None,
        )
        .unwrap();
    let rtv = device
        .create_render_target_view(&tex, &RenderTargetViewDesc::default())
        .unwrap();
    (tex, rtv)
}

#[test]
fn view_keeps_resource_alive_past_external_release() {
    let (driver, device, _ctx) = device_pair();
    let (tex, rtv) = render_target(&device);
    let destroys_before = driver.stats().destroys;

    // The application drops its only reference to the texture; the view's
    // dependent reference must keep the real object alive.
    assert_eq!(tex.release(), 0);
    assert!(device.arena().contains(tex.id()));
    assert_eq!(driver.stats().destroys, destroys_before);

    // Releasing the view destroys it and cascades into the texture.
    rtv.release();
    assert!(!device.arena().contains(rtv.id()));
    assert!(!device.arena().contains(tex.id()));
    assert_eq!(driver.stats().destroys, destroys_before + 2);
}

#[test]
fn pipeline_binding_keeps_released_object_alive() {
    let (driver, device, ctx) = device_pair();
    let (tex, rtv) = render_target(&device);

    ctx.bind_render_targets(&[Some(&rtv)], None).unwrap();

    // App releases both; the bound view (and through it the texture) must
    // survive until the binding goes away.
    tex.release();
    rtv.release();
    assert!(device.arena().contains(rtv.id()));
    assert!(device.arena().contains(tex.id()));

    let destroys_before = driver.stats().destroys;
    ctx.bind_render_targets(&[], None).unwrap();
    assert!(!device.arena().contains(rtv.id()));
    assert!(!device.arena().contains(tex.id()));
    assert_eq!(driver.stats().destroys, destroys_before + 2);
}

#[test]
fn soft_refs_track_wrapper_population() {
    let (_driver, device, _ctx) = device_pair();
    assert_eq!(device.soft_ref_count(), 0);

    let (tex, rtv) = render_target(&device);
    assert_eq!(device.soft_ref_count(), 2);

    rtv.release();
    tex.release();
    assert_eq!(device.soft_ref_count(), 0);
}

#[test]
fn add_ref_balances_release() {
    let (_driver, device, _ctx) = device_pair();
    let buffer = device
        .create_buffer(
            &BufferDesc {
                size: 4,
                bind: BindFlags::CONSTANT_BUFFER,
                cpu_writable: false,
            },
            None,
        )
        .unwrap();

    assert_eq!(buffer.add_ref(), 2);
    assert_eq!(buffer.release(), 1);
    assert!(device.arena().contains(buffer.id()));
    assert_eq!(buffer.release(), 0);
    assert!(!device.arena().contains(buffer.id()));
}

#[test]
fn failed_creation_leaks_no_wrapper() {
    let (driver, device, _ctx) = device_pair();
    let live_before = driver.live_objects();
    let soft_before = device.soft_ref_count();

    driver.fail_next_create(DriverError::OutOfMemory);
    let result = device.create_buffer(
        &BufferDesc {
            size: 4,
            bind: BindFlags::CONSTANT_BUFFER,
            cpu_writable: false,
        },
        None,
    );

    // The exact driver failure propagates, and no half-built wrapper
    // remains behind.
    match result {
        Err(CaptureError::Driver(DriverError::OutOfMemory)) => {}
        other => panic!("expected the driver's own error, got {other:?}"),
    }
    assert_eq!(driver.live_objects(), live_before);
    assert_eq!(device.soft_ref_count(), soft_before);
    assert_eq!(device.arena().len(), 0);
}

#[test]
fn capability_probe_results_pass_through() {
    let (_driver, device, _ctx) = device_pair();
    assert!(device.query_capability("compute").unwrap());
    assert!(!device.query_capability("mesh-shaders").unwrap());
}
