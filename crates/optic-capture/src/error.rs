use std::io;

use thiserror::Error;

use optic_chunk::ChunkError;
use optic_resource::ResourceId;
use optic_wrap::DriverError;

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Why a frame failed its pre-finalize validity check. Surfaced as data,
/// not a boolean, so the caller can tell the user what the application did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFailReason {
    /// A resource was still mapped for write at the frame boundary; the
    /// written range can't be known until unmap.
    UncappedMap { resource: ResourceId },
    /// A deferred context had recorded calls but no finished command list
    /// at the frame boundary.
    UncappedCommandList,
    /// The finalize-time disk flush failed; the frame is discarded like any
    /// other capture failure.
    WriteFailed,
}

impl core::fmt::Display for CaptureFailReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CaptureFailReason::UncappedMap { resource } => {
                write!(f, "resource {resource} was never unmapped")
            }
            CaptureFailReason::UncappedCommandList => {
                write!(f, "a deferred context had an unfinished command list")
            }
            CaptureFailReason::WriteFailed => {
                write!(f, "the capture file could not be written")
            }
        }
    }
}

/// One result type across the engine, keeping the error tiers distinct:
/// driver-reported failures propagate unchanged, capture-level failures are
/// recoverable for the process, stream/container errors are fatal to the
/// replay that hit them. Invariant violations (double registration, negative
/// refcounts) are not errors at all; they panic at the violation site.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("capture abandoned after {failures} attempts: {reason}")]
    CaptureFailed {
        reason: CaptureFailReason,
        failures: u32,
    },

    #[error("no capture in progress")]
    NotCapturing,

    #[error("stream error: {0}")]
    Stream(#[from] ChunkError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid capture file magic")]
    InvalidMagic,

    #[error("unsupported capture container version {0}")]
    UnsupportedContainerVersion(u32),

    #[error("capture table of contents out of bounds")]
    TocOutOfBounds,

    #[error("capture metadata invalid: {0}")]
    MetaInvalid(#[from] serde_json::Error),

    #[error("initial contents decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("unknown event {0}")]
    UnknownEvent(u32),
}
