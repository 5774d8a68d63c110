//! Pipeline-specific error types.

use crate::pipeline::id::NodeId;
use crate::pipeline::status::PipelineStatus;
use crate::types::RequestId;
use thiserror::Error;

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Out of memory")]
    NoMemory,

    #[error("Operation failed: {0}")]
    Failed(String),

    /// The request was dropped because the pipeline is flushing or nothing was enabled.
    #[error("Request cancelled")]
    Cancelled,

    #[error("Timed out waiting for {0}")]
    TimedOut(&'static str),

    #[error("{operation} is not legal in status {status:?}")]
    InvalidState {
        operation: &'static str,
        status: PipelineStatus,
    },

    #[error("Buffer negotiation failed for {node:?} output port {port}")]
    Negotiation { node: NodeId, port: u32 },

    #[error("Execution order has {ordered} nodes but {created} were created")]
    OrderingMismatch { created: usize, ordered: usize },

    #[error("Input port {port} of node '{node}' links to unknown parent '{parent}'")]
    UnknownParent {
        node: String,
        port: u32,
        parent: String,
    },

    #[error("Cycle detected in pipeline graph")]
    CycleDetected,

    #[error("Invariant violated: {0}")]
    InvariantViolation(#[from] InvariantViolation),

    #[error("Node {node_id:?} error: {message}")]
    Node { node_id: NodeId, message: String },

    #[error("Device group error: {0}")]
    Device(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Shorthand for a node-scoped failure.
    pub fn node(node_id: NodeId, message: impl Into<String>) -> Self {
        PipelineError::Node {
            node_id,
            message: message.into(),
        }
    }

    /// Whether this error represents a request-scoped cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

/// Programming invariants whose violation means request/slot correlation can no longer be trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error(
        "slot {slot} reused by request {request_id} while request {previous:?} is still in flight ({pending_fences} fences pending)"
    )]
    SlotReuse {
        request_id: RequestId,
        slot: usize,
        previous: Option<RequestId>,
        pending_fences: usize,
    },

    #[error("shutter for request {got} arrived but {expected} was expected next")]
    ShutterOutOfOrder { expected: RequestId, got: RequestId },

    #[error("shutter timestamp for request {request_id} went backwards ({previous} -> {current})")]
    ShutterTimestampRegression {
        request_id: RequestId,
        previous: u64,
        current: u64,
    },
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
