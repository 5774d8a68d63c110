//! Hardware device group seam.
//!
//! The device group is the hardware session abstraction: link/unlink, stream
//! on/off, per-request open, and a single asynchronous message handler. The
//! pipeline drives it through [`DeviceGroupController`], which keeps the link
//! and handler registration idempotent.

use crate::pipeline::error::PipelineResult;
use crate::types::{DeactivateMode, SyncId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How the hardware stamped a frame message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampType {
    #[default]
    Monotonic,
    /// Global hardware timer; published as its own metadata tag.
    QTimer,
}

/// Start-of-frame style boundary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMessage {
    /// Hardware sync id of the frame's request, if the frame belongs to one.
    pub sync_id: Option<SyncId>,
    pub frame_count: u64,
    /// Nanoseconds.
    pub timestamp: u64,
    pub timestamp_type: TimestampType,
    /// Set on boundaries that should produce SOF and shutter notifications.
    pub notify: bool,
}

/// Error subtypes reported by the hardware layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwErrorType {
    Device,
    Request,
    Buffer,
    SofFreeze,
    Recovery,
    FullRecovery,
    Unknown(u32),
}

impl HwErrorType {
    /// Subtypes that are pipeline-global and may arrive without a request.
    pub fn allows_missing_request(self) -> bool {
        matches!(
            self,
            HwErrorType::Device
                | HwErrorType::Recovery
                | HwErrorType::SofFreeze
                | HwErrorType::FullRecovery
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error_type: HwErrorType,
    pub sync_id: Option<SyncId>,
    pub device_handle: i32,
}

/// Asynchronous message from the device group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwMessage {
    Frame(FrameMessage),
    Error(ErrorMessage),
}

/// Whether an opened request is synchronized with a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Sync,
    NoSync,
}

pub type MessageHandler = Arc<dyn Fn(HwMessage) + Send + Sync>;

/// Hardware session operations consumed by the pipeline.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceGroup: Send + Sync {
    fn link(&self) -> PipelineResult<()>;
    fn unlink(&self) -> PipelineResult<()>;
    fn stream_on(&self, devices: &[i32]) -> PipelineResult<()>;
    fn stream_off(&self, devices: &[i32], mode: DeactivateMode) -> PipelineResult<()>;
    fn register_message_handler(&self, handler: MessageHandler) -> PipelineResult<()>;
    fn open_request(&self, sync_id: SyncId, mode: SyncMode, timeout_ms: u64) -> PipelineResult<()>;
}

/// Owns the link state for one pipeline.
pub struct DeviceGroupController {
    group: Arc<dyn DeviceGroup>,
    devices: Vec<i32>,
    linked: AtomicBool,
    handler_registered: AtomicBool,
}

impl DeviceGroupController {
    pub fn new(group: Arc<dyn DeviceGroup>, devices: Vec<i32>) -> Self {
        Self {
            group,
            devices,
            linked: AtomicBool::new(false),
            handler_registered: AtomicBool::new(false),
        }
    }

    pub fn devices(&self) -> &[i32] {
        &self.devices
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    /// Link the device group; no-op when already linked.
    pub fn link(&self) -> PipelineResult<()> {
        if self.is_linked() {
            return Ok(());
        }
        self.group.link()?;
        self.linked.store(true, Ordering::Release);
        tracing::debug!("device group linked ({} devices)", self.devices.len());
        Ok(())
    }

    /// Unlink the device group; no-op when not linked.
    pub fn unlink(&self) -> PipelineResult<()> {
        if !self.linked.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.handler_registered.store(false, Ordering::Release);
        self.group.unlink()?;
        tracing::debug!("device group unlinked");
        Ok(())
    }

    /// Register the message handler once per link.
    pub fn register_handler(&self, handler: MessageHandler) -> PipelineResult<()> {
        if self.handler_registered.load(Ordering::Acquire) {
            return Ok(());
        }
        self.group.register_message_handler(handler)?;
        self.handler_registered.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stream_on(&self) -> PipelineResult<()> {
        self.group.stream_on(&self.devices)
    }

    pub fn stream_off(&self, mode: DeactivateMode) -> PipelineResult<()> {
        self.group.stream_off(&self.devices, mode)
    }

    pub fn open_request(&self, sync_id: SyncId, mode: SyncMode, timeout_ms: u64) -> PipelineResult<()> {
        self.group.open_request(sync_id, mode, timeout_ms)
    }
}

impl fmt::Debug for DeviceGroupController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGroupController")
            .field("devices", &self.devices)
            .field("linked", &self.is_linked())
            .field("handler_registered", &self.handler_registered.load(Ordering::Acquire))
            .finish()
    }
}
