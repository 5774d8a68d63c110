//! Node abstraction for the pipeline.
//!
//! Node implementations (what a sensor, ISP stage or JPEG encoder actually
//! computes) live outside this crate. The pipeline only sees them through
//! the traits below:
//!
//! - **`ProcessingNode`**: identity, construction-time negotiation hooks and
//!   per-request hooks. Every node implements it.
//! - **`ResourceOwning`**: nodes that hold hardware resources expose this
//!   through [`ProcessingNode::resources`].
//! - **`StreamToggleable`**: nodes that must be told about stream on/off
//!   expose this through [`ProcessingNode::streaming`].
//!
//! Construction hooks take `&mut self` because the graph is single-threaded
//! until finalization. Runtime hooks take `&self`; completion callbacks for
//! the same request arrive from several threads, so nodes synchronize their
//! own per-request state.

use crate::pipeline::descriptor::NodeDescriptor;
use crate::pipeline::device::FrameMessage;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::id::NodeId;
use crate::pipeline::port::OutputPort;
use crate::types::{BatchFrameInfo, DeactivateMode, RequestId, SyncId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node type, used for capability flags and log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Sensor,
    /// Image front end (real-time ISP).
    Ife,
    /// Bayer processing segment (offline ISP).
    Bps,
    /// Image processing engine (offline ISP).
    Ipe,
    Jpeg,
    JpegAggregator,
    StatsProcessing,
    AutoFocus,
    FaceDetection,
    /// Any vendor or test node.
    Custom(u32),
}

impl NodeKind {
    pub fn label(self) -> String {
        match self {
            NodeKind::Sensor => "Sensor".to_string(),
            NodeKind::Ife => "IFE".to_string(),
            NodeKind::Bps => "BPS".to_string(),
            NodeKind::Ipe => "IPE".to_string(),
            NodeKind::Jpeg => "JPEG".to_string(),
            NodeKind::JpegAggregator => "JPEGAggregator".to_string(),
            NodeKind::StatsProcessing => "StatsProcessing".to_string(),
            NodeKind::AutoFocus => "AutoFocus".to_string(),
            NodeKind::FaceDetection => "FD".to_string(),
            NodeKind::Custom(id) => format!("Custom{}", id),
        }
    }
}

/// Identity of a node instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub kind: NodeKind,
    pub instance_id: u32,
    pub name: String,
}

impl NodeIdentity {
    pub fn from_descriptor(id: NodeId, desc: &NodeDescriptor) -> Self {
        Self {
            id,
            kind: desc.kind,
            instance_id: desc.instance_id,
            name: desc.name.clone(),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", self.kind.label(), self.instance_id, self.name)
    }
}

/// Per-request processing status a node reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeRequestStatus {
    #[default]
    Uninitialized,
    /// Setup done, not yet handed to the scheduler.
    Setup,
    /// Waiting in the deferred queue for its dependencies.
    Deferred,
    /// Executing.
    Running,
    Error,
    Cancelled,
    Success,
    /// Submitted to hardware, waiting for completion.
    Submit,
}

/// Everything a node needs to prepare one request.
#[derive(Debug, Clone, Copy)]
pub struct RequestSetup<'a> {
    pub request_id: RequestId,
    pub sync_id: SyncId,
    pub batches: &'a [BatchFrameInfo],
    pub active_stream_mask: u32,
    /// The active stream mask differs from the previous request's.
    pub different_streams: bool,
}

/// Core node interface.
pub trait ProcessingNode: Send + Sync {
    fn identity(&self) -> &NodeIdentity;

    /// Validate that the node can produce the given output requirements.
    /// Called once per negotiation pass, after every consumer of this node
    /// has been negotiated.
    fn finalize_buffer_requirement(&mut self, _outputs: &[OutputPort]) -> PipelineResult<()> {
        Ok(())
    }

    /// Forget everything learned during a failed negotiation pass.
    fn reset_buffer_negotiation(&mut self) {}

    /// Forward pass after ordering, in execution order.
    fn finalize_buffer_properties(&mut self, _outputs: &[OutputPort]) {}

    fn finalize_initialization(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    fn create_buffer_managers(&mut self, _outputs: &[OutputPort]) -> PipelineResult<()> {
        Ok(())
    }

    fn notify_pipeline_created(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    /// Hardware device indices this node drives.
    fn device_indices(&self) -> &[i32] {
        &[]
    }

    /// Whether this node reports config-done for every request.
    fn notifies_config_done(&self) -> bool {
        false
    }

    /// Drop any stale state kept for the slot this request is about to reuse.
    fn invalidate_request(&self, _request_id: RequestId) {}

    /// Prepare a request. `Ok(false)` means the node has no work for it.
    fn setup_request(&self, setup: &RequestSetup<'_>) -> PipelineResult<bool>;

    /// Abort work for a request. The node must still report it done.
    fn flush(&self, _request_id: RequestId) {}

    fn request_status(&self, _request_id: RequestId) -> NodeRequestStatus {
        NodeRequestStatus::Uninitialized
    }

    /// Hardware frame message fan-out.
    fn notify_hw_message(&self, _request_id: Option<RequestId>, _message: &FrameMessage) {}

    fn dump_debug_info(&self) {}

    /// Called once before the node is dropped.
    fn destroy(&mut self) {}

    fn resources(&self) -> Option<&dyn ResourceOwning> {
        None
    }

    fn streaming(&self) -> Option<&dyn StreamToggleable> {
        None
    }
}

/// Nodes holding hardware resources.
pub trait ResourceOwning: Send + Sync {
    fn acquire_resources(&self) -> PipelineResult<()>;
    fn release_resources(&self, mode: DeactivateMode) -> PipelineResult<()>;
}

/// Nodes that react to stream on/off.
pub trait StreamToggleable: Send + Sync {
    fn stream_on(&self) -> PipelineResult<()>;
    fn stream_off(&self, mode: DeactivateMode) -> PipelineResult<()>;
}

/// Instantiates nodes from their descriptors.
pub trait NodeFactory {
    fn create(&self, id: NodeId, desc: &NodeDescriptor) -> PipelineResult<Box<dyn ProcessingNode>>;
}
