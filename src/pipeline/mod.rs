//! Camera pipeline: graph construction, request lifecycle and device-group
//! control for one session.
//!
//! A pipeline is built from a [`PipelineDescriptor`] through a node factory,
//! negotiated and ordered into a [`NodeGraph`], and then driven at runtime by
//! the [`Pipeline`] orchestrator.
//!
//! # Architecture
//!
//! ```text
//!   descriptor ──► NodeGraph (create, link, negotiate, order)
//!                      │
//!                      ▼
//!   session ◄──── Pipeline ────► DeferredScheduler ──► node workers
//!                   │    ▲
//!                   ▼    │ frame / error messages
//!               DeviceGroup
//! ```
//!
//! # Seams
//!
//! Everything hardware- or framework-specific sits behind a trait:
//! [`ProcessingNode`] (and its capability traits), [`DeviceGroup`],
//! [`DeferredScheduler`], [`MetadataPool`] and
//! [`SessionNotifier`](crate::session::SessionNotifier).

pub mod descriptor;
pub mod device;
pub mod error;
pub mod graph;
pub mod id;
pub mod metadata;
pub mod node;
pub mod orchestrator;
pub mod port;
pub mod scheduler;
pub mod slot_table;
pub mod status;
pub mod sync;

pub use descriptor::{NodeDescriptor, PipelineDescriptor};
pub use device::{
    DeviceGroup, DeviceGroupController, ErrorMessage, FrameMessage, HwErrorType, HwMessage,
    MessageHandler, SyncMode, TimestampType,
};
pub use error::{InvariantViolation, PipelineError, PipelineResult};
pub use graph::{CapabilityFlags, NodeGraph};
pub use id::{NodeId, PortId};
pub use metadata::{MemoryPool, MetaTag, MetaValue, MetadataPool, MetadataPoolSet, MetadataSlot};
pub use node::{
    NodeFactory, NodeIdentity, NodeKind, NodeRequestStatus, ProcessingNode, RequestSetup,
    ResourceOwning, StreamToggleable,
};
pub use orchestrator::{InitializedPipeline, Pipeline, PipelineBuilder, PipelineContext};
pub use port::{InputPortDescriptor, InputSource, OutputPortDescriptor, SinkKind};
pub use scheduler::{DeferredScheduler, DeferredWork, QueueScheduler, SchedulerEvent};
pub use status::PipelineStatus;
pub use sync::{Ready, TimedOut, WaitOutcome};
