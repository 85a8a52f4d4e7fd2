//! Replay robustness: missing creation chunks degrade bindings to unbound,
//! unknown chunk kinds are skipped, and replay still completes.

use std::io::Cursor;
use std::sync::Arc;

use optic_capture::{CaptureMeta, CaptureWriter, ReplayController};
use optic_chunk::{Chunk, ChunkKind, WriteLeExt};
use optic_resource::ResourceId;
use optic_wrap::{Call, ShaderStage, SoftwareDriver};

fn meta() -> CaptureMeta {
    CaptureMeta {
        width: 16,
        height: 16,
        color_format: 0,
        depth_format: None,
        sample_count: 1,
        frame: 1,
    }
}

#[test]
fn missing_creation_chunk_degrades_to_unbound() {
    let shader_id = ResourceId::from_raw(50);
    let missing_view = ResourceId::from_raw(99);

    let mut w = CaptureWriter::new(Cursor::new(Vec::new()), &meta()).unwrap();
    // Shader creation is present; the render-target view referenced by the
    // frame was never serialized (a partial capture).
    w.write_chunk(
        &Call::CreateShader {
            id: shader_id,
            stage: ShaderStage::Vertex,
            bytecode: vec![1, 2],
        }
        .to_chunk()
        .unwrap(),
    )
    .unwrap();
    w.write_initial_needed(&[]).unwrap();
    w.write_capture_scope(1).unwrap();
    w.write_event_chunk(
        &Call::BindShader {
            stage: ShaderStage::Vertex,
            shader: shader_id,
        }
        .to_chunk()
        .unwrap(),
        false,
    )
    .unwrap();
    w.write_event_chunk(
        &Call::BindRenderTargets {
            colors: vec![missing_view],
            depth: ResourceId::NULL,
        }
        .to_chunk()
        .unwrap(),
        false,
    )
    .unwrap();
    w.write_event_chunk(
        &Call::Draw {
            vertex_count: 3,
            first_vertex: 0,
        }
        .to_chunk()
        .unwrap(),
        true,
    )
    .unwrap();
    let bytes = w.finish(None).unwrap().into_inner();

    let driver = Arc::new(SoftwareDriver::new());
    let mut replay = ReplayController::open(Cursor::new(bytes), driver.clone()).unwrap();

    // All three events replay without aborting.
    replay.replay_all().unwrap();
    assert_eq!(replay.current_event(), 3);
    assert_eq!(driver.stats().draws, 1);

    let state = replay.fetch_state();
    // The shader resolved; the unresolvable target became unbound.
    assert!(!state.stage(ShaderStage::Vertex).shader.is_null());
    assert!(state.om.render_targets[0].is_null());
}

#[test]
fn unknown_event_chunk_kind_is_skipped() {
    let mut w = CaptureWriter::new(Cursor::new(Vec::new()), &meta()).unwrap();
    w.write_initial_needed(&[]).unwrap();
    w.write_capture_scope(1).unwrap();
    w.write_event_chunk(
        &Call::Draw {
            vertex_count: 3,
            first_vertex: 0,
        }
        .to_chunk()
        .unwrap(),
        true,
    )
    .unwrap();
    // A chunk kind from some future recorder version.
    let future = Chunk::build(ChunkKind(9000), 7, |p| {
        p.write_u64_le(0xffee_ddcc)?;
        p.write_blob(&[9u8; 40])
    })
    .unwrap();
    w.write_event_chunk(&future, false).unwrap();
    w.write_event_chunk(
        &Call::Dispatch { x: 1, y: 1, z: 1 }.to_chunk().unwrap(),
        true,
    )
    .unwrap();
    let bytes = w.finish(None).unwrap().into_inner();

    let driver = Arc::new(SoftwareDriver::new());
    let mut replay = ReplayController::open(Cursor::new(bytes), driver.clone()).unwrap();

    assert_eq!(replay.frame_log().last_event(), 3);
    assert_eq!(replay.get_event(2).unwrap().name, "Unknown");

    replay.replay_all().unwrap();
    assert_eq!(driver.stats().draws, 1);
    assert_eq!(driver.stats().dispatches, 1);
}

#[test]
fn setup_section_without_capture_scope_is_fatal() {
    let mut w = CaptureWriter::new(Cursor::new(Vec::new()), &meta()).unwrap();
    w.write_initial_needed(&[]).unwrap();
    // No capture-scope chunk at all.
    let bytes = w.finish(None).unwrap().into_inner();

    let driver = Arc::new(SoftwareDriver::new());
    assert!(ReplayController::open(Cursor::new(bytes), driver).is_err());
}
