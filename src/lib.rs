//! # Capture Pipeline: per-session camera pipeline orchestration
//!
//! A capture session owns one or more pipelines. Each pipeline is a graph of
//! processing nodes (sensor, front end, offline ISP stages, encoders) built
//! from a descriptor, and this crate coordinates everything around the nodes
//! without running their image processing itself.
//!
//! ## Architecture
//!
//! - **Pipeline**: graph construction, buffer negotiation and execution
//!   order, then the runtime orchestrator (request submission, per-node
//!   completion, in-order retirement, shutter/SOF/metadata results, flush,
//!   recovery, stream on/off)
//! - **Session**: the result sink a pipeline notifies, plus a channel bridge
//!   for hosts that drain results on their own thread
//! - **Sim**: in-process nodes, device group and worker pool for demos and tests
//! - **Communication**: crossbeam channels between the pipeline and its host
//!
//! ## Configuration
//!
//! [`PipelineConfig`] is stored as TOML in the platform config directory
//! under `capture-pipeline`:
//!
//! - **Linux**: `~/.config/capture-pipeline/pipeline.toml`
//! - **macOS**: `~/Library/Application Support/capture-pipeline/pipeline.toml`
//! - **Windows**: `%APPDATA%\capture-pipeline\pipeline.toml`
//!
//! ## Example
//!
//! ```ignore
//! use capture_pipeline::{
//!     pipeline::{MetadataPoolSet, PipelineBuilder, PipelineContext, PipelineDescriptor, QueueScheduler},
//!     session::SessionBridge,
//!     sim::{SimDeviceGroup, SimNodeFactory, SimWorkers},
//!     types::CaptureRequest,
//!     PipelineConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::load_or_default();
//! let (scheduler, work_rx) = QueueScheduler::new();
//! let (bridge, session) = SessionBridge::new(config.request_queue_depth);
//! let context = PipelineContext {
//!     metadata: MetadataPoolSet::in_memory(config.max_per_request_info),
//!     config,
//!     pipeline_index: 0,
//!     device: Arc::new(SimDeviceGroup::new()),
//!     scheduler: Arc::new(scheduler),
//!     session: Arc::new(bridge),
//!     fatal: None,
//! };
//!
//! let descriptor = PipelineDescriptor::load("preview.json")?;
//! let pipeline = PipelineBuilder::new(descriptor, context)
//!     .initialize(&SimNodeFactory::new())?
//!     .finalize()?;
//! let _workers = SimWorkers::spawn(work_rx, &pipeline, 2);
//!
//! pipeline.process_request(&CaptureRequest::new(0, 0))?;
//! for event in session.drain() {
//!     // Shutter, metadata, buffer and processing-done events
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod sim;
pub mod types;

// Re-export commonly used types
pub use config::{LogConfig, PipelineConfig};
pub use error::{CaptureError, Result, ResultExt};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineContext, PipelineDescriptor, PipelineError, PipelineResult,
    PipelineStatus,
};
pub use session::{SessionBridge, SessionEvent, SessionHandle, SessionNotifier};
pub use types::{CaptureRequest, DeactivateMode, RequestId, SequenceId, SyncId};
