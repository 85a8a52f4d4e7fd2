use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use optic_wrap::Format;

/// Capture-time tunables. Persisted as JSON alongside user settings; the
/// thresholds here are amortization policy, not correctness requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Directory capture files are written into.
    pub output_dir: PathBuf,
    /// How many consecutive frames a failed capture retries before the
    /// request is abandoned with its failure reason.
    pub max_capture_retries: u32,
    /// In-place updates a resource record accumulates before fine-grained
    /// tracking stops and the resource falls back to coarse assume-dirty
    /// tracking.
    pub coarse_dirty_threshold: u32,
    /// LZ4-compress initial-contents payloads above a small size floor.
    pub compress_initial_contents: bool,
    /// Store a caller-provided callstack in the frame record.
    pub capture_callstacks: bool,
    /// Serialize every live resource into the capture, referenced or not.
    pub ref_all_resources: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            max_capture_retries: 5,
            coarse_dirty_threshold: 64,
            compress_initial_contents: true,
            capture_callstacks: false,
            ref_all_resources: false,
        }
    }
}

/// Capture-time surface parameters for the device being intercepted.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub width: u32,
    pub height: u32,
    pub color_format: Format,
    pub depth_format: Option<Format>,
    pub sample_count: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            color_format: Format::Rgba8Unorm,
            depth_format: Some(Format::D24UnormS8),
            sample_count: 1,
        }
    }
}

/// JSON document embedded in the capture header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMeta {
    pub width: u32,
    pub height: u32,
    pub color_format: u32,
    pub depth_format: Option<u32>,
    pub sample_count: u32,
    pub frame: u64,
}

impl CaptureMeta {
    pub fn new(config: &DeviceConfig, frame: u64) -> Self {
        Self {
            width: config.width,
            height: config.height,
            color_format: config.color_format.as_u32(),
            depth_format: config.depth_format.map(|f| f.as_u32()),
            sample_count: config.sample_count,
            frame,
        }
    }
}
