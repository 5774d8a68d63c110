//! Scriptable processing node.
//!
//! [`SimNode`] implements every node trait and records each call it receives
//! in a shared [`SimLog`]. [`SimBehavior`] injects failures per node name, so
//! tests can fail creation, setup, acquire, release or stream-on of one
//! specific node.

use crate::pipeline::descriptor::NodeDescriptor;
use crate::pipeline::device::FrameMessage;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::NodeId;
use crate::pipeline::node::{
    NodeFactory, NodeIdentity, NodeRequestStatus, ProcessingNode, RequestSetup, ResourceOwning,
    StreamToggleable,
};
use crate::pipeline::port::OutputPort;
use crate::pipeline::sync::lock;
use crate::types::{DeactivateMode, ImageFormat, RequestId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Per-node failure injection and capabilities.
#[derive(Debug, Clone, Default)]
pub struct SimBehavior {
    pub fail_create: bool,
    pub fail_setup: bool,
    /// Setup succeeds but reports the node as not enabled.
    pub disabled: bool,
    pub fail_acquire: bool,
    pub fail_release: bool,
    pub fail_stream_on: bool,
    /// Output formats this node refuses during buffer negotiation.
    pub rejected_formats: Vec<ImageFormat>,
    pub notifies_config_done: bool,
    pub device_indices: Vec<i32>,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Create(String),
    Destroy(String),
    Acquire(String),
    Release(String, DeactivateMode),
    StreamOn(String),
    StreamOff(String, DeactivateMode),
    Setup { node: String, request_id: RequestId },
    Invalidate { node: String, request_id: RequestId },
    Flush { node: String, request_id: RequestId },
    HwMessage {
        node: String,
        request_id: Option<RequestId>,
    },
}

/// Shared, ordered record of node calls.
#[derive(Debug, Clone, Default)]
pub struct SimLog {
    events: Arc<Mutex<Vec<SimEvent>>>,
}

impl SimLog {
    pub fn push(&self, event: SimEvent) {
        lock(&self.events).push(event);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

type StatusMap = Arc<Mutex<HashMap<(String, RequestId), NodeRequestStatus>>>;

/// Node whose behaviour is driven by a [`SimBehavior`].
pub struct SimNode {
    identity: NodeIdentity,
    behavior: SimBehavior,
    log: SimLog,
    statuses: StatusMap,
    acquired: AtomicBool,
}

impl SimNode {
    fn name(&self) -> String {
        self.identity.name.clone()
    }

    fn set_status(&self, request_id: RequestId, status: NodeRequestStatus) {
        lock(&self.statuses).insert((self.name(), request_id), status);
    }

    /// Whether this node currently holds its resources.
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }
}

impl ProcessingNode for SimNode {
    fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn finalize_buffer_requirement(&mut self, outputs: &[OutputPort]) -> PipelineResult<()> {
        match outputs
            .iter()
            .find(|port| self.behavior.rejected_formats.contains(&port.format))
        {
            Some(port) => Err(PipelineError::Negotiation {
                node: self.identity.id,
                port: port.port_id,
            }),
            None => Ok(()),
        }
    }

    fn device_indices(&self) -> &[i32] {
        &self.behavior.device_indices
    }

    fn notifies_config_done(&self) -> bool {
        self.behavior.notifies_config_done
    }

    fn invalidate_request(&self, request_id: RequestId) {
        self.log.push(SimEvent::Invalidate {
            node: self.name(),
            request_id,
        });
    }

    fn setup_request(&self, setup: &RequestSetup<'_>) -> PipelineResult<bool> {
        self.log.push(SimEvent::Setup {
            node: self.name(),
            request_id: setup.request_id,
        });
        if self.behavior.fail_setup {
            self.set_status(setup.request_id, NodeRequestStatus::Error);
            return Err(PipelineError::node(self.identity.id, "setup failed"));
        }
        if self.behavior.disabled {
            return Ok(false);
        }
        self.set_status(setup.request_id, NodeRequestStatus::Deferred);
        Ok(true)
    }

    fn flush(&self, request_id: RequestId) {
        self.log.push(SimEvent::Flush {
            node: self.name(),
            request_id,
        });
        self.set_status(request_id, NodeRequestStatus::Cancelled);
    }

    fn request_status(&self, request_id: RequestId) -> NodeRequestStatus {
        lock(&self.statuses)
            .get(&(self.name(), request_id))
            .copied()
            .unwrap_or_default()
    }

    fn notify_hw_message(&self, request_id: Option<RequestId>, _message: &FrameMessage) {
        self.log.push(SimEvent::HwMessage {
            node: self.name(),
            request_id,
        });
    }

    fn dump_debug_info(&self) {
        tracing::info!(
            "sim node {}: acquired {}",
            self.identity,
            self.is_acquired()
        );
    }

    fn destroy(&mut self) {
        self.log.push(SimEvent::Destroy(self.name()));
    }

    fn resources(&self) -> Option<&dyn ResourceOwning> {
        Some(self)
    }

    fn streaming(&self) -> Option<&dyn StreamToggleable> {
        Some(self)
    }
}

impl ResourceOwning for SimNode {
    fn acquire_resources(&self) -> PipelineResult<()> {
        self.log.push(SimEvent::Acquire(self.name()));
        if self.behavior.fail_acquire {
            return Err(PipelineError::node(self.identity.id, "acquire failed"));
        }
        self.acquired.store(true, Ordering::Release);
        Ok(())
    }

    fn release_resources(&self, mode: DeactivateMode) -> PipelineResult<()> {
        self.log.push(SimEvent::Release(self.name(), mode));
        self.acquired.store(false, Ordering::Release);
        if self.behavior.fail_release {
            return Err(PipelineError::node(self.identity.id, "release failed"));
        }
        Ok(())
    }
}

impl StreamToggleable for SimNode {
    fn stream_on(&self) -> PipelineResult<()> {
        self.log.push(SimEvent::StreamOn(self.name()));
        if self.behavior.fail_stream_on {
            return Err(PipelineError::node(self.identity.id, "stream on failed"));
        }
        Ok(())
    }

    fn stream_off(&self, mode: DeactivateMode) -> PipelineResult<()> {
        self.log.push(SimEvent::StreamOff(self.name(), mode));
        Ok(())
    }
}

/// Builds [`SimNode`]s, applying per-name behaviour overrides.
#[derive(Clone, Default)]
pub struct SimNodeFactory {
    behaviors: HashMap<String, SimBehavior>,
    log: SimLog,
    statuses: StatusMap,
}

impl SimNodeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, name: impl Into<String>, behavior: SimBehavior) -> Self {
        self.behaviors.insert(name.into(), behavior);
        self
    }

    pub fn log(&self) -> SimLog {
        self.log.clone()
    }

    /// Override what a node reports for one request.
    pub fn set_request_status(&self, node: &str, request_id: RequestId, status: NodeRequestStatus) {
        lock(&self.statuses).insert((node.to_string(), request_id), status);
    }
}

impl NodeFactory for SimNodeFactory {
    fn create(&self, id: NodeId, desc: &NodeDescriptor) -> PipelineResult<Box<dyn ProcessingNode>> {
        let behavior = self.behaviors.get(&desc.name).cloned().unwrap_or_default();
        if behavior.fail_create {
            return Err(PipelineError::node(id, format!("cannot create '{}'", desc.name)));
        }
        self.log.push(SimEvent::Create(desc.name.clone()));
        Ok(Box::new(SimNode {
            identity: NodeIdentity::from_descriptor(id, desc),
            behavior,
            log: self.log.clone(),
            statuses: Arc::clone(&self.statuses),
            acquired: AtomicBool::new(false),
        }))
    }
}
