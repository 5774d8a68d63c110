//! Core data types shared across the pipeline, session, and simulation layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

/// Logical request identifier assigned by the owning session. Monotonic per pipeline.
pub type RequestId = u64;

/// Identifier the hardware layer uses to correlate its messages with a submitted request.
pub type SyncId = u64;

/// Framework frame number of one batched frame inside a request.
pub type SequenceId = u32;

/// Pixel format carried by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImageFormat {
    Raw10,
    Raw16,
    #[default]
    Nv12,
    Nv21,
    P010,
    Ubwc,
    Jpeg,
    /// Opaque byte stream (stats, debug data).
    Blob,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Raw10 => "RAW10",
            ImageFormat::Raw16 => "RAW16",
            ImageFormat::Nv12 => "NV12",
            ImageFormat::Nv21 => "NV21",
            ImageFormat::P010 => "P010",
            ImageFormat::Ubwc => "UBWC",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Blob => "BLOB",
        };
        f.write_str(name)
    }
}

/// Bitmask describing how far a stream-off or resource release should go.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DeactivateMode(pub u32);

impl DeactivateMode {
    /// Full deactivation of every device.
    pub const DEFAULT: DeactivateMode = DeactivateMode(1 << 0);
    /// Leave the sensor in standby; a resume is expected.
    pub const SENSOR_STANDBY: DeactivateMode = DeactivateMode(1 << 1);
    /// Unlink the device group after stream-off.
    pub const UNLINK_PIPELINE: DeactivateMode = DeactivateMode(1 << 2);
    /// Deactivate only the real-time devices.
    pub const REALTIME_DEVICES: DeactivateMode = DeactivateMode(1 << 3);

    pub const fn empty() -> Self {
        DeactivateMode(0)
    }

    #[inline]
    pub fn contains(self, other: DeactivateMode) -> bool {
        (self.0 & other.0) == other.0 && other.0 != 0
    }

    #[inline]
    pub fn intersects(self, other: DeactivateMode) -> bool {
        (self.0 & other.0) != 0
    }

    /// Whether this mode leaves part of the pipeline streaming.
    pub fn is_partial(self) -> bool {
        self.intersects(DeactivateMode::SENSOR_STANDBY | DeactivateMode::REALTIME_DEVICES)
    }
}

impl BitOr for DeactivateMode {
    type Output = DeactivateMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        DeactivateMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for DeactivateMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DeactivateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (DeactivateMode::DEFAULT, "DEFAULT"),
            (DeactivateMode::SENSOR_STANDBY, "SENSOR_STANDBY"),
            (DeactivateMode::UNLINK_PIPELINE, "UNLINK_PIPELINE"),
            (DeactivateMode::REALTIME_DEVICES, "REALTIME_DEVICES"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        if names.is_empty() {
            write!(f, "DeactivateMode(empty)")
        } else {
            write!(f, "DeactivateMode({})", names.join(" | "))
        }
    }
}

/// Opaque handle to a hardware fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

/// Description of an externally owned image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferInfo {
    /// Native buffer handle.
    pub handle: u64,
    /// Size in bytes.
    pub size: usize,
}

/// Buffer attached to one output stream of one batched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBuffer {
    pub stream_id: u32,
    pub batch_index: u8,
    pub buffer: BufferInfo,
}

/// Per-batched-frame information supplied with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchFrameInfo {
    pub sequence_id: SequenceId,
    /// Bitmask of streams active in this frame. The first batch carries the superset.
    pub active_stream_mask: u32,
}

/// Caller-supplied opaque per-request data, returned untouched with every result.
pub type PrivData = Option<Arc<dyn std::any::Any + Send + Sync>>;

/// A capture request as submitted by the owning session.
#[derive(Clone)]
pub struct CaptureRequest {
    pub request_id: RequestId,
    pub sync_id: SyncId,
    pub batches: Vec<BatchFrameInfo>,
    pub buffers: Vec<StreamBuffer>,
    pub priv_data: PrivData,
}

impl CaptureRequest {
    /// Single-frame request with one active stream.
    pub fn new(request_id: RequestId, sequence_id: SequenceId) -> Self {
        Self {
            request_id,
            sync_id: request_id,
            batches: vec![BatchFrameInfo {
                sequence_id,
                active_stream_mask: 1,
            }],
            buffers: Vec::new(),
            priv_data: None,
        }
    }

    pub fn with_sync_id(mut self, sync_id: SyncId) -> Self {
        self.sync_id = sync_id;
        self
    }

    pub fn with_batches(mut self, batches: Vec<BatchFrameInfo>) -> Self {
        self.batches = batches;
        self
    }

    pub fn with_buffer(mut self, buffer: StreamBuffer) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn with_priv_data(mut self, data: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        self.priv_data = Some(data);
        self
    }

    /// Number of batched frames carried by this request.
    #[inline]
    pub fn num_batched_frames(&self) -> usize {
        self.batches.len()
    }

    /// Stream mask of the first batch, which holds every stream any batch may enable.
    pub fn active_stream_mask(&self) -> u32 {
        self.batches.first().map(|b| b.active_stream_mask).unwrap_or(0)
    }
}

impl fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureRequest")
            .field("request_id", &self.request_id)
            .field("sync_id", &self.sync_id)
            .field("batches", &self.batches)
            .field("buffers", &self.buffers.len())
            .field("priv_data", &self.priv_data.is_some())
            .finish()
    }
}
