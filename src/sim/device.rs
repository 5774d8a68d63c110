//! In-process device group.
//!
//! Records every call and keeps the registered message handler, so that a
//! test or the demo binary can inject frame and error messages with
//! [`SimDeviceGroup::emit`] as if they came from hardware.

use crate::pipeline::device::{DeviceGroup, HwMessage, MessageHandler, SyncMode};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::sync::lock;
use crate::types::{DeactivateMode, SyncId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Link,
    Unlink,
    StreamOn(Vec<i32>),
    StreamOff(Vec<i32>, DeactivateMode),
    RegisterHandler,
    OpenRequest {
        sync_id: SyncId,
        mode: SyncMode,
        timeout_ms: u64,
    },
}

#[derive(Default)]
pub struct SimDeviceGroup {
    calls: Mutex<Vec<DeviceCall>>,
    handler: Mutex<Option<MessageHandler>>,
    fail_link: AtomicBool,
    fail_stream_on: AtomicBool,
    fail_stream_off: AtomicBool,
}

impl SimDeviceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn set_fail_link(&self, fail: bool) {
        self.fail_link.store(fail, Ordering::Release);
    }

    pub fn set_fail_stream_on(&self, fail: bool) {
        self.fail_stream_on.store(fail, Ordering::Release);
    }

    pub fn set_fail_stream_off(&self, fail: bool) {
        self.fail_stream_off.store(fail, Ordering::Release);
    }

    pub fn has_handler(&self) -> bool {
        lock(&self.handler).is_some()
    }

    /// Deliver a message to the registered handler on the caller's thread.
    /// Returns false if no handler is registered.
    pub fn emit(&self, message: HwMessage) -> bool {
        // Clone out so the handler never runs under our lock.
        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => {
                handler(message);
                true
            }
            None => false,
        }
    }

    fn record(&self, call: DeviceCall) {
        lock(&self.calls).push(call);
    }
}

impl DeviceGroup for SimDeviceGroup {
    fn link(&self) -> PipelineResult<()> {
        self.record(DeviceCall::Link);
        if self.fail_link.load(Ordering::Acquire) {
            return Err(PipelineError::Device("link refused".to_string()));
        }
        Ok(())
    }

    fn unlink(&self) -> PipelineResult<()> {
        self.record(DeviceCall::Unlink);
        *lock(&self.handler) = None;
        Ok(())
    }

    fn stream_on(&self, devices: &[i32]) -> PipelineResult<()> {
        self.record(DeviceCall::StreamOn(devices.to_vec()));
        if self.fail_stream_on.load(Ordering::Acquire) {
            return Err(PipelineError::Device("stream on refused".to_string()));
        }
        Ok(())
    }

    fn stream_off(&self, devices: &[i32], mode: DeactivateMode) -> PipelineResult<()> {
        self.record(DeviceCall::StreamOff(devices.to_vec(), mode));
        if self.fail_stream_off.load(Ordering::Acquire) {
            return Err(PipelineError::Device("stream off refused".to_string()));
        }
        Ok(())
    }

    fn register_message_handler(&self, handler: MessageHandler) -> PipelineResult<()> {
        self.record(DeviceCall::RegisterHandler);
        *lock(&self.handler) = Some(handler);
        Ok(())
    }

    fn open_request(&self, sync_id: SyncId, mode: SyncMode, timeout_ms: u64) -> PipelineResult<()> {
        self.record(DeviceCall::OpenRequest {
            sync_id,
            mode,
            timeout_ms,
        });
        Ok(())
    }
}
