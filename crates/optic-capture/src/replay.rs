use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use optic_resource::ResourceId;
use optic_wrap::{Call, Format, NativeDriver, ObjectInfo, RenderState};

use crate::container::{decode, section, CaptureReader};
use crate::context::Context;
use crate::device::WrappedDevice;
use crate::error::{CaptureError, Result};
use crate::options::{CaptureMeta, DeviceConfig};
use crate::recorder::{DrawcallNode, EventDesc, FrameLog, FrameLogBuilder};

/// How much of the requested range actually executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Every event in the range.
    Full,
    /// Everything up to but excluding the final action.
    WithoutDraw,
    /// Only the final event.
    OnlyDraw,
}

/// Drives a capture back through a driver: full replay to reconstruct the
/// frame, or partial replay to reconstruct state as of any event. Setup
/// (resource creation, initial contents, beginning render state) runs once
/// at open; the frame's events re-execute on demand.
pub struct ReplayController<R: Read + Seek> {
    device: WrappedDevice,
    context: Context,
    reader: CaptureReader<R>,
    meta: CaptureMeta,
    log: FrameLog,
    begin_states: Vec<(u32, RenderState)>,
    initial_contents: Vec<(ResourceId, Vec<u8>)>,
    initial_needed: Vec<ResourceId>,
    /// Last executed event; 0 means the frame-start state is current.
    current_event: u32,
}

impl ReplayController<File> {
    pub fn open_path(path: &Path, driver: Arc<dyn NativeDriver>) -> Result<Self> {
        Self::open(File::open(path)?, driver)
    }
}

impl<R: Read + Seek> ReplayController<R> {
    pub fn open(source: R, driver: Arc<dyn NativeDriver>) -> Result<Self> {
        let mut reader = CaptureReader::open(source)?;
        let meta = reader.meta().clone();

        let config = DeviceConfig {
            width: meta.width,
            height: meta.height,
            color_format: Format::from_u32(meta.color_format).unwrap_or(Format::Rgba8Unorm),
            depth_format: meta.depth_format.and_then(Format::from_u32),
            sample_count: meta.sample_count.max(1),
        };
        let (device, context) = WrappedDevice::new_replay(driver, config)?;

        let mut controller = Self {
            device,
            context,
            reader,
            meta,
            log: FrameLogBuilder::new(0).finish(None),
            begin_states: Vec::new(),
            initial_contents: Vec::new(),
            initial_needed: Vec::new(),
            current_event: 0,
        };
        let frame = controller.run_setup_section()?;
        controller.scan_frame_section(frame)?;
        controller.reset_to_frame_start()?;
        info!(
            "opened capture of frame {frame}: {} events",
            controller.log.last_event()
        );
        Ok(controller)
    }

    /// Execute everything before the capture-scope chunk: creations, record
    /// update chunks, initial contents, beginning states. A corrupt chunk
    /// here aborts only the object it described; a missing capture scope is
    /// fatal to the whole replay.
    fn run_setup_section(&mut self) -> Result<u64> {
        loop {
            let Some(header) = self.reader.chunks().begin_chunk()? else {
                return Err(optic_chunk::ChunkError::Corrupt(
                    "capture ended before its capture-scope chunk",
                )
                .into());
            };
            match header.kind {
                section::CAPTURE_SCOPE => {
                    let frame = decode::capture_scope(self.reader.chunks())?;
                    self.reader.chunks().end_chunk()?;
                    return Ok(frame);
                }
                section::BEGIN_STATE => {
                    match decode::begin_state(self.reader.chunks()) {
                        Ok((index, state)) => self.begin_states.push((index, state)),
                        Err(err) => error!("discarding corrupt beginning state: {err}"),
                    }
                    self.reader.chunks().end_chunk()?;
                }
                section::INITIAL_CONTENTS => {
                    match decode::initial_contents(header, self.reader.chunks()) {
                        Ok((id, data)) => self.initial_contents.push((id, data)),
                        Err(err) => error!("discarding corrupt initial contents: {err}"),
                    }
                    self.reader.chunks().end_chunk()?;
                }
                section::INITIAL_NEEDED => {
                    match decode::initial_needed(self.reader.chunks()) {
                        Ok(ids) => self.initial_needed.extend(ids),
                        Err(err) => error!("discarding corrupt initial-needed list: {err}"),
                    }
                    self.reader.chunks().end_chunk()?;
                }
                _ => {
                    match Call::decode(header, self.reader.chunks()) {
                        Ok(Some(call)) => {
                            self.reader.chunks().end_chunk()?;
                            self.execute_setup_call(call);
                        }
                        Ok(None) => {
                            // Unknown chunk kind: skip by length.
                            self.reader.chunks().end_chunk()?;
                        }
                        Err(err) => {
                            // Malformed payload aborts this object only.
                            error!("skipping corrupt setup chunk {}: {err}", header.kind);
                            self.reader.chunks().end_chunk()?;
                        }
                    }
                }
            }
        }
    }

    fn execute_setup_call(&mut self, call: Call) {
        if call.is_creation() {
            let orig = creation_id(&call);
            if self.device.registry().has_live_resource(orig) {
                // Already recreated by an earlier pass; restore its
                // creation-time contents so repeat passes start identical.
                let init = match &call {
                    Call::CreateBuffer { init, .. } | Call::CreateTexture2d { init, .. } => {
                        init.clone()
                    }
                    _ => return,
                };
                if let Some(live) = self.device.registry().get_live_resource(orig) {
                    if let Some(entry) = self.device.arena().get(live) {
                        let size = match entry.info() {
                            ObjectInfo::Buffer(desc) => desc.size as usize,
                            ObjectInfo::Texture2d(desc) => desc.byte_size() as usize,
                            _ => 0,
                        };
                        let mut data = init.unwrap_or_default();
                        data.resize(size, 0);
                        if let Err(err) = self
                            .device
                            .shared()
                            .driver
                            .update_resource(entry.native(), 0, &data)
                        {
                            error!("could not restore creation contents of {orig}: {err}");
                        }
                    }
                }
                return;
            }
            let registry = self.device.registry().clone();
            let resolve =
                move |id: ResourceId| registry.get_live_resource(id).unwrap_or(ResourceId::NULL);
            match self.device.replay_create(&call, &resolve) {
                Ok(live) => {
                    self.device.registry().add_live_resource(orig, live);
                    debug!("recreated {orig} as {live}");
                }
                Err(err) => {
                    // Degraded replay: dependents of this object resolve to
                    // unbound.
                    error!("could not recreate {orig}: {err}");
                }
            }
        } else {
            let translated = self.translate(&call);
            if let Err(err) = self.context.issue_replay(translated) {
                error!("setup call {} failed: {err}", call.name());
            }
        }
    }

    fn translate(&self, call: &Call) -> Call {
        let registry = self.device.registry().clone();
        call.map_ids(&move |id| {
            if id.is_null() {
                id
            } else {
                registry.get_live_resource(id).unwrap_or(ResourceId::NULL)
            }
        })
    }

    /// Build the event list and drawcall tree from the frame's chunks. The
    /// whole frame section is pulled into memory first so the per-event
    /// replay passes run without file I/O.
    fn scan_frame_section(&mut self, frame: u64) -> Result<()> {
        self.reader.chunks().load_remainder()?;
        let mut builder = FrameLogBuilder::new(frame);
        let mut callstack = None;
        loop {
            let offset = self.reader.chunks().position();
            let Some(header) = self.reader.chunks().begin_chunk()? else {
                break;
            };
            match header.kind {
                section::FRAME_FOOTER => {
                    callstack = decode::frame_footer(header, self.reader.chunks())?;
                    self.reader.chunks().end_chunk()?;
                }
                section::DEBUG_MESSAGE => {
                    builder.add_misc_event(offset, "DebugMessage");
                    self.reader.chunks().end_chunk()?;
                }
                _ => {
                    match Call::decode(header, self.reader.chunks()) {
                        Ok(Some(call)) => {
                            builder.add_event(offset, &call);
                        }
                        Ok(None) => {
                            builder.add_misc_event(offset, "Unknown");
                        }
                        Err(err) => {
                            error!("corrupt frame chunk at {offset}: {err}");
                            builder.add_misc_event(offset, "Corrupt");
                        }
                    }
                    self.reader.chunks().end_chunk()?;
                }
            }
        }
        self.log = builder.finish(callstack);
        Ok(())
    }

    /// Re-establish the frame's starting conditions: initial contents for
    /// resources the frame read, clears for write-only targets, and the
    /// beginning render state.
    pub fn reset_to_frame_start(&mut self) -> Result<()> {
        let registry = self.device.registry().clone();
        let arena = self.device.arena().clone();

        for (orig, data) in &self.initial_contents {
            let Some(live) = registry.get_live_resource(*orig) else {
                continue;
            };
            if let Some(entry) = arena.get(live) {
                if let Err(err) = self
                    .device
                    .shared()
                    .driver
                    .update_resource(entry.native(), 0, data)
                {
                    error!("could not apply initial contents of {orig}: {err}");
                }
            }
        }

        for orig in &self.initial_needed {
            let Some(live) = registry.get_live_resource(*orig) else {
                continue;
            };
            if let Some(entry) = arena.get(live) {
                let size = match entry.info() {
                    ObjectInfo::Buffer(desc) => desc.size as usize,
                    ObjectInfo::Texture2d(desc) => desc.byte_size() as usize,
                    _ => 0,
                };
                if size > 0 {
                    let zeros = vec![0u8; size];
                    if let Err(err) = self
                        .device
                        .shared()
                        .driver
                        .update_resource(entry.native(), 0, &zeros)
                    {
                        error!("could not clear initial target {orig}: {err}");
                    }
                }
            }
        }

        for (index, state) in &self.begin_states {
            if *index != 0 {
                // Deferred contexts rebuild their recordings from the frame
                // stream; only the immediate context carries state across
                // the frame boundary.
                continue;
            }
            let mut resolved = state.clone();
            resolved.resolve_ids(&|id| {
                registry.get_live_resource(id).unwrap_or(ResourceId::NULL)
            });
            self.context.apply_state(&resolved)?;
        }

        self.current_event = 0;
        Ok(())
    }

    /// Replay the event range `[start, end]`. The controller tracks which
    /// event is current; a range that does not continue from it first
    /// resets and replays the prefix, so state is always the state the
    /// unabridged capture would have produced.
    pub fn replay_log(&mut self, start: u32, end: u32, mode: ReplayMode) -> Result<()> {
        let last = self.log.last_event();
        if end > last || start > end || start == 0 {
            return Err(CaptureError::UnknownEvent(end.max(start)));
        }

        if start != self.current_event + 1 {
            self.reset_to_frame_start()?;
            if start > 1 {
                self.execute_range(1, start - 1, ReplayMode::Full)?;
            }
        }
        self.execute_range(start, end, mode)?;
        self.current_event = end;
        Ok(())
    }

    /// Replay the whole frame.
    pub fn replay_all(&mut self) -> Result<()> {
        let last = self.log.last_event();
        if last == 0 {
            return Ok(());
        }
        self.replay_log(1, last, ReplayMode::Full)
    }

    /// Replay `[1, end]`, leaving state as of immediately after `end`.
    pub fn replay_to(&mut self, end: u32) -> Result<()> {
        if end == 0 {
            return self.reset_to_frame_start();
        }
        self.replay_log(1, end, ReplayMode::Full)
    }

    fn execute_range(&mut self, start: u32, end: u32, mode: ReplayMode) -> Result<()> {
        for event in start..=end {
            let desc = self
                .log
                .event(event)
                .ok_or(CaptureError::UnknownEvent(event))?;
            let offset = desc.offset;
            let is_action = desc.is_action;

            match mode {
                ReplayMode::OnlyDraw if event != end => continue,
                ReplayMode::WithoutDraw if event == end && is_action => continue,
                _ => {}
            }

            self.reader.chunks().seek_to(offset)?;
            let Some(header) = self.reader.chunks().begin_chunk()? else {
                return Err(optic_chunk::ChunkError::Corrupt("event offset at stream end").into());
            };
            let call = Call::decode(header, self.reader.chunks());
            self.reader.chunks().end_chunk()?;

            match call {
                Ok(Some(call)) if call.is_creation() => {
                    // Mid-frame creation: recreate on the first pass; on
                    // later passes restore the creation-time contents.
                    self.execute_setup_call(call);
                }
                Ok(Some(call)) => {
                    let translated = self.translate(&call);
                    if let Err(err) = self.context.issue_replay(translated) {
                        error!("event {event} ({}) failed: {err}", call.name());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("skipping corrupt event {event}: {err}");
                }
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////
    // Inspection surface

    pub fn meta(&self) -> &CaptureMeta {
        &self.meta
    }

    pub fn frame_log(&self) -> &FrameLog {
        &self.log
    }

    pub fn get_event(&self, event: u32) -> Option<&EventDesc> {
        self.log.event(event)
    }

    pub fn drawcall_tree(&self) -> &DrawcallNode {
        self.log.drawcall_tree()
    }

    pub fn current_event(&self) -> u32 {
        self.current_event
    }

    /// Pipeline state of the replay context as of the last replayed event.
    pub fn fetch_state(&self) -> RenderState {
        self.context.fetch_state()
    }

    pub fn device(&self) -> &WrappedDevice {
        &self.device
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

fn creation_id(call: &Call) -> ResourceId {
    match call {
        Call::CreateBuffer { id, .. }
        | Call::CreateTexture2d { id, .. }
        | Call::CreateSampler { id, .. }
        | Call::CreateShader { id, .. }
        | Call::CreateRenderTargetView { id, .. }
        | Call::CreateDepthStencilView { id, .. }
        | Call::CreateShaderResourceView { id, .. }
        | Call::CreateUnorderedAccessView { id, .. }
        | Call::CreateBlendState { id, .. }
        | Call::CreateDepthState { id, .. }
        | Call::CreateRasterState { id, .. } => *id,
        _ => ResourceId::NULL,
    }
}
