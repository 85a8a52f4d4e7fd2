//! Capture validity checks, the bounded retry policy, and the structured
//! failure reasons it surfaces.

use std::sync::Arc;

use optic_capture::{
    CaptureError, CaptureFailReason, CaptureOptions, CaptureState, DeviceConfig, WrappedDevice,
};
use optic_wrap::{BindFlags, BufferDesc, MapMode, ShaderStage, SoftwareDriver};

fn options(dir: &tempfile::TempDir) -> CaptureOptions {
    CaptureOptions {
        output_dir: dir.path().to_path_buf(),
        ..CaptureOptions::default()
    }
}

#[test]
fn open_map_fails_capture_and_retries_until_giving_up() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    let buffer = device
        .create_buffer(
            &BufferDesc {
                size: 16,
                bind: BindFlags::CONSTANT_BUFFER,
                cpu_writable: true,
            },
            None,
        )
        .unwrap();

    device.trigger_capture();
    ctx.present().unwrap();
    assert_eq!(device.capture_state(), CaptureState::Capturing);

    // The application maps for write and never unmaps.
    let mapping = ctx.map(buffer.handle(), MapMode::Write).unwrap();

    // Each frame boundary fails validity and retries, up to the bound.
    let retries = device.options().max_capture_retries;
    for _ in 0..retries {
        ctx.present().unwrap();
        assert_eq!(device.capture_state(), CaptureState::Capturing);
        assert!(device.last_failure().is_none());
    }

    // One more failure exhausts the retry budget: capture is abandoned with
    // its reason, not a crash and not a bare boolean.
    ctx.present().unwrap();
    assert_eq!(device.capture_state(), CaptureState::Idle);
    let (_, reason) = device.last_failure().expect("failure should be recorded");
    assert_eq!(
        reason,
        CaptureFailReason::UncappedMap {
            resource: buffer.id()
        }
    );
    assert!(device.last_capture().is_none());

    ctx.unmap(mapping).unwrap();
}

#[test]
fn app_controlled_capture_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    let buffer = device
        .create_buffer(
            &BufferDesc {
                size: 16,
                bind: BindFlags::CONSTANT_BUFFER,
                cpu_writable: true,
            },
            None,
        )
        .unwrap();

    device.start_frame_capture().unwrap();
    let mapping = ctx.map(buffer.handle(), MapMode::Write).unwrap();

    match device.end_frame_capture() {
        Err(CaptureError::CaptureFailed { reason, failures }) => {
            assert_eq!(
                reason,
                CaptureFailReason::UncappedMap {
                    resource: buffer.id()
                }
            );
            assert_eq!(failures, 1);
        }
        other => panic!("expected capture failure, got {other:?}"),
    }
    assert_eq!(device.capture_state(), CaptureState::Idle);

    ctx.unmap(mapping).unwrap();
}

#[test]
fn unfinished_deferred_recording_fails_capture() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, _ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    let deferred = device.create_deferred_context().unwrap();
    let shader = device.create_shader(ShaderStage::Vertex, &[1]).unwrap();

    device.start_frame_capture().unwrap();
    // Recorded after capture began, never turned into a command list.
    deferred.bind_shader(ShaderStage::Vertex, Some(&shader)).unwrap();

    match device.end_frame_capture() {
        Err(CaptureError::CaptureFailed { reason, .. }) => {
            assert_eq!(reason, CaptureFailReason::UncappedCommandList);
        }
        other => panic!("expected capture failure, got {other:?}"),
    }
}

#[test]
fn queued_frame_number_starts_a_capture() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    device.queue_capture(3);
    ctx.present().unwrap(); // frame 1
    ctx.present().unwrap(); // frame 2
    assert_eq!(device.capture_state(), CaptureState::Idle);
    ctx.present().unwrap(); // frame 3: capture begins
    assert_eq!(device.capture_state(), CaptureState::Capturing);

    ctx.draw(3, 0).unwrap();
    ctx.present().unwrap();
    assert_eq!(device.last_capture().unwrap().frame, 3);
}

#[test]
fn driver_failure_mid_capture_is_propagated_and_logged_as_an_event() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    let buffer = device
        .create_buffer(
            &BufferDesc {
                size: 8,
                bind: BindFlags::CONSTANT_BUFFER,
                cpu_writable: true,
            },
            None,
        )
        .unwrap();

    device.trigger_capture();
    ctx.present().unwrap();

    // An update outside the resource bounds: the driver's own error must
    // reach the caller unchanged.
    let err = ctx
        .update_resource(buffer.handle(), 64, &[1u8; 8])
        .unwrap_err();
    assert!(matches!(
        err,
        CaptureError::Driver(optic_wrap::DriverError::InvalidArgument(_))
    ));

    ctx.draw(3, 0).unwrap();
    ctx.present().unwrap();
    let report = device.last_capture().expect("capture should still finalize");

    // The failure also appears inside the capture as a diagnostic event.
    let replay_driver = Arc::new(SoftwareDriver::new());
    let replay = optic_capture::ReplayController::open_path(&report.path, replay_driver).unwrap();
    assert!(replay
        .frame_log()
        .events
        .iter()
        .any(|e| e.name == "DebugMessage"));
}

#[test]
fn capture_succeeds_on_retry_after_the_map_closes() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(SoftwareDriver::new());
    let (device, ctx) =
        WrappedDevice::new(driver, DeviceConfig::default(), options(&dir)).unwrap();

    let buffer = device
        .create_buffer(
            &BufferDesc {
                size: 16,
                bind: BindFlags::CONSTANT_BUFFER,
                cpu_writable: true,
            },
            None,
        )
        .unwrap();

    device.trigger_capture();
    ctx.present().unwrap();

    let mapping = ctx.map(buffer.handle(), MapMode::Write).unwrap();
    // First boundary fails and re-arms for the next frame.
    ctx.present().unwrap();
    assert_eq!(device.capture_state(), CaptureState::Capturing);

    // The retried frame is clean.
    ctx.unmap(mapping).unwrap();
    ctx.draw(3, 0).unwrap();
    ctx.present().unwrap();

    assert_eq!(device.capture_state(), CaptureState::Idle);
    let report = device.last_capture().expect("retried capture should succeed");
    assert!(report.path.exists());
    assert!(report.events >= 2);
}
