//! Capture/replay engine: wrapped device and context proxies, the capture
//! state machine, the on-disk capture container, and the replay controller.
//!
//! A [`WrappedDevice`] sits between the application and a [`NativeDriver`]
//! implementation, forwarding every call. Triggering a capture records one
//! frame of calls as a chunk stream, prefixed with whatever setup (resource
//! records, initial contents, beginning pipeline state) the frame needs to
//! stand alone, and a [`ReplayController`] later drives that file back
//! through a driver, fully or up to an arbitrary event.
//!
//! [`NativeDriver`]: optic_wrap::NativeDriver

mod container;
mod context;
mod device;
mod error;
mod options;
mod recorder;
mod replay;

pub use crate::container::{
    chunk_name, section, CaptureReader, CaptureWriter, TocEntry, CONTAINER_VERSION,
    CONTAINER_VERSION_V1,
};
pub use crate::context::{Context, ContextKind, Mapping, VertexBufferRef};
pub use crate::device::{CaptureReport, CaptureState, WrappedDevice};
pub use crate::error::{CaptureError, CaptureFailReason, Result};
pub use crate::options::{CaptureMeta, CaptureOptions, DeviceConfig};
pub use crate::recorder::{DrawcallNode, EventDesc, EventUsage, FrameLog};
pub use crate::replay::{ReplayController, ReplayMode};
