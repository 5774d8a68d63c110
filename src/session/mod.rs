//! Owning-session interface.
//!
//! A pipeline never talks to the application directly. Every shutter, SOF,
//! metadata, buffer and error event is wrapped in a [`ResultsData`] and handed
//! to the [`SessionNotifier`] that owns the pipeline, tagged with the pipeline
//! index and the opaque private data the caller attached to the request.
//!
//! [`SessionBridge`] is the stock notifier: it forwards events over a
//! crossbeam channel to whichever thread plays the session.

pub mod bridge;

pub use bridge::{SessionBridge, SessionEvent, SessionHandle};

use crate::pipeline::error::InvariantViolation;
use crate::types::{BufferInfo, PrivData, RequestId, SequenceId};
use chrono::{DateTime, Utc};
use std::fmt;

/// Outward error category, as the session sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The device is gone; the session must be torn down.
    Device,
    /// The whole request failed.
    Request,
    /// Metadata for the request will not be produced.
    Result,
    /// One stream buffer failed.
    Buffer,
    /// The pipeline is stuck and must be recovered. `full` asks for a full
    /// session restart instead of a pipeline-level one.
    Recovery { full: bool },
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultPayload {
    Metadata {
        request_id: RequestId,
        sequence_id: SequenceId,
        timestamp: u64,
    },
    PartialMetadata {
        request_id: RequestId,
        sequence_id: SequenceId,
    },
    Buffer {
        request_id: RequestId,
        stream_id: u32,
        sequence_id: SequenceId,
        buffer: BufferInfo,
    },
    Shutter {
        request_id: RequestId,
        sequence_id: SequenceId,
        timestamp: u64,
    },
    Sof {
        frame_num: u64,
        timestamp: u64,
        /// `None` when the frame could not be tied to a request.
        sequence_id: Option<SequenceId>,
    },
    Error {
        code: ErrorCode,
        request_id: Option<RequestId>,
        /// `None` for pipeline-global errors.
        sequence_id: Option<SequenceId>,
        stream_id: Option<u32>,
    },
}

impl ResultPayload {
    pub fn is_error(&self) -> bool {
        matches!(self, ResultPayload::Error { .. })
    }
}

/// One notification to the owning session.
#[derive(Clone)]
pub struct ResultsData {
    pub pipeline_index: u32,
    pub priv_data: PrivData,
    pub payload: ResultPayload,
}

impl fmt::Debug for ResultsData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultsData")
            .field("pipeline_index", &self.pipeline_index)
            .field("priv_data", &self.priv_data.is_some())
            .field("payload", &self.payload)
            .finish()
    }
}

/// Callbacks a pipeline makes into its owning session.
#[cfg_attr(test, mockall::automock)]
pub trait SessionNotifier: Send + Sync {
    fn notify_result(&self, results: ResultsData);

    /// In-order completion advanced up to and including `last_in_order`.
    fn notify_processing_done(&self, pipeline_index: u32, last_in_order: RequestId);

    /// Requests the session keeps in flight at once.
    fn current_request_queue_depth(&self) -> u32;

    /// No results are waiting to be delivered upward.
    fn is_result_holder_empty(&self) -> bool;

    fn update_current_exposure_time(&self, exposure_ns: u64);
}

/// An invariant violation handed to the host for a process-level decision.
#[derive(Debug, Clone, PartialEq)]
pub struct FatalReport {
    /// `"{name}_{index}"` of the reporting pipeline.
    pub pipeline: String,
    pub violation: InvariantViolation,
    pub at: DateTime<Utc>,
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.at.format("%H:%M:%S%.3f"),
            self.pipeline,
            self.violation
        )
    }
}
