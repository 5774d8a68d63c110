//! Pipeline orchestrator: the per-session owner of a node graph.
//!
//! # Architecture
//!
//! ```text
//!   session ──process_request──► Pipeline ──add_deferred_node──► scheduler ──► node workers
//!      ▲                            │  ▲                                            │
//!      │                            │  └──notify_node_*_done────────────────────────┘
//!      └──────notify_result─────────┤
//!                                   │◄──handle_hw_message── device group (frame / error)
//!                                   └──link / stream_on / stream_off──► device group
//! ```
//!
//! Construction is typestate-checked: [`PipelineBuilder::initialize`] creates
//! and links the nodes (INITIALIZED), [`InitializedPipeline::finalize`]
//! negotiates buffers, orders the graph and returns the shared [`Pipeline`]
//! (FINALIZED). From there the status machine in [`PipelineStatus`] is driven
//! at runtime by acquire/release and stream on/off.
//!
//! The orchestrator has no thread of its own. Every method runs on the caller's
//! thread: the session's submit thread, a node worker reporting completion, or
//! the device group's message thread. Per-request state lives in the
//! [`RequestSlotTable`]; pipeline-wide cursors are atomics.
//!
//! The behaviour is split by concern:
//! - `request`: submission, open request, request errors, fences.
//! - `completion`: per-node done callbacks, in-order retirement, metadata results.
//! - `stream`: resource acquire/release and the stream on/off state machine.
//! - `messages`: hardware frame/error messages, shutter, SOF and the watchdog.
//! - `flush`: flush mode and recovery helpers.

mod completion;
mod flush;
mod messages;
mod request;
mod stream;
#[cfg(test)]
mod testing;

use crate::config::PipelineConfig;
use crate::pipeline::descriptor::PipelineDescriptor;
use crate::pipeline::device::{DeviceGroup, DeviceGroupController, MessageHandler};
use crate::pipeline::error::{InvariantViolation, PipelineError, PipelineResult};
use crate::pipeline::graph::{CapabilityFlags, NodeGraph};
use crate::pipeline::id::NodeId;
use crate::pipeline::metadata::MetadataPoolSet;
use crate::pipeline::node::NodeFactory;
use crate::pipeline::port::SinkKind;
use crate::pipeline::scheduler::DeferredScheduler;
use crate::pipeline::slot_table::{RequestCursor, RequestSlotTable};
use crate::pipeline::status::{PipelineStatus, StatusCell};
use crate::pipeline::sync::WaitCell;
use crate::session::{FatalReport, ResultPayload, ResultsData, SessionNotifier};
use crate::types::{DeactivateMode, PrivData, RequestId, SequenceId, StreamBuffer};
use chrono::Utc;
use crossbeam_channel::Sender;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Everything a pipeline is wired to. Passed in at construction; the
/// pipeline never reaches for global state.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    /// Index of this pipeline inside its session; tags every result.
    pub pipeline_index: u32,
    pub device: Arc<dyn DeviceGroup>,
    pub scheduler: Arc<dyn DeferredScheduler>,
    pub session: Arc<dyn SessionNotifier>,
    pub metadata: MetadataPoolSet,
    /// Where invariant violations are escalated to the host.
    pub fatal: Option<Sender<FatalReport>>,
}

/// Start of construction.
pub struct PipelineBuilder {
    descriptor: PipelineDescriptor,
    context: PipelineContext,
}

impl PipelineBuilder {
    pub fn new(descriptor: PipelineDescriptor, context: PipelineContext) -> Self {
        Self {
            descriptor,
            context,
        }
    }

    /// Create every node and link the ports.
    pub fn initialize(self, factory: &dyn NodeFactory) -> PipelineResult<InitializedPipeline> {
        let ident = format!("{}_{}", self.descriptor.name, self.context.pipeline_index);
        self.context
            .config
            .validate()
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        let mut graph = NodeGraph::create_nodes(
            &self.descriptor,
            factory,
            self.context.config.fallback_format,
        )
        .inspect_err(|e| tracing::error!("{}: node creation failed: {}", ident, e))?;

        graph
            .link_ports(&self.descriptor)
            .inspect_err(|e| tracing::error!("{}: port linking failed: {}", ident, e))?;

        tracing::info!(
            "{}: initialized with {} nodes ({})",
            ident,
            graph.len(),
            if self.descriptor.realtime {
                "realtime"
            } else {
                "offline"
            }
        );

        Ok(InitializedPipeline {
            descriptor: self.descriptor,
            context: self.context,
            graph,
            ident,
        })
    }
}

/// A pipeline whose nodes exist and are linked, but not yet negotiated.
pub struct InitializedPipeline {
    descriptor: PipelineDescriptor,
    context: PipelineContext,
    graph: NodeGraph,
    ident: String,
}

impl InitializedPipeline {
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus::Initialized
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    /// Negotiate buffers, fix the execution order and size the request table.
    ///
    /// Realtime pipelines also link the device group and register the
    /// message handler. Any failure drops the partial pipeline, which
    /// destroys its nodes.
    pub fn finalize(self) -> PipelineResult<Arc<Pipeline>> {
        let InitializedPipeline {
            descriptor,
            context,
            mut graph,
            ident,
        } = self;

        graph
            .finalize()
            .inspect_err(|e| tracing::error!("{}: finalize failed: {}", ident, e))?;

        let config = &context.config;
        let slots = RequestSlotTable::new(
            config.max_per_request_info,
            config.max_batched_frames,
            config.max_fences_per_request,
        );
        let controller = DeviceGroupController::new(Arc::clone(&context.device), graph.device_indices());
        let node_count = graph.len() as u32;
        let config_done_nodes = graph.config_done_nodes() as u32;

        let pipeline = Arc::new_cyclic(|weak_self| Pipeline {
            ident,
            realtime: descriptor.realtime,
            ctx: context,
            graph,
            slots,
            controller,
            node_count,
            config_done_nodes,
            status: StatusCell::new(PipelineStatus::Finalized),
            resource_lock: Mutex::new(()),
            completion_lock: Mutex::new(()),
            config_done: WaitCell::new(ConfigDoneState::default()),
            stream_on_done: WaitCell::new(StreamOnState::default()),
            all_done: WaitCell::new(()),
            last_submitted: RequestCursor::new(),
            first_submitted: RequestCursor::new(),
            last_completed: RequestCursor::new(),
            last_in_order: RequestCursor::new(),
            last_shutter: RequestCursor::new(),
            last_valid_before_flush: RequestCursor::new(),
            last_flush_request_id: RequestCursor::new(),
            last_shutter_timestamp: AtomicU64::new(0),
            live_pending: AtomicU64::new(0),
            invalid_sof_counter: AtomicU32::new(0),
            last_stream_mask: AtomicU32::new(0),
            flushing: AtomicBool::new(false),
            has_flush_occurred: AtomicBool::new(false),
            triggering_recovery: AtomicBool::new(false),
            initial_config_pending: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        if pipeline.realtime {
            pipeline.link_device_group()?;
        }

        tracing::info!(
            "{}: finalized, execution order {:?}, flags {:?}",
            pipeline.ident,
            pipeline.graph.execution_order(),
            pipeline.graph.flags()
        );
        Ok(pipeline)
    }
}

/// Config-done bookkeeping guarded by its own lock.
#[derive(Debug, Default)]
struct ConfigDoneState {
    /// Requests whose config-done nodes have all reported.
    count: u64,
    /// Requests submitted since the last stream-off.
    expected: u64,
    aborted: bool,
    waiting: bool,
}

#[derive(Debug, Default)]
struct StreamOnState {
    done: bool,
    /// Bumped by every explicit wakeup.
    wakeups: u64,
}

/// A finalized pipeline. Shared between the session, node workers and the
/// device group's message thread.
pub struct Pipeline {
    ident: String,
    realtime: bool,
    ctx: PipelineContext,
    graph: NodeGraph,
    slots: RequestSlotTable,
    controller: DeviceGroupController,
    node_count: u32,
    config_done_nodes: u32,

    status: StatusCell,
    /// Serializes acquire/release and stream on/off.
    resource_lock: Mutex<()>,
    /// Serializes in-order completion advancement.
    completion_lock: Mutex<()>,
    config_done: WaitCell<ConfigDoneState>,
    stream_on_done: WaitCell<StreamOnState>,
    all_done: WaitCell<()>,

    last_submitted: RequestCursor,
    first_submitted: RequestCursor,
    last_completed: RequestCursor,
    last_in_order: RequestCursor,
    last_shutter: RequestCursor,
    last_valid_before_flush: RequestCursor,
    last_flush_request_id: RequestCursor,
    last_shutter_timestamp: AtomicU64,
    /// Submitted requests not yet retired.
    live_pending: AtomicU64,
    invalid_sof_counter: AtomicU32,
    last_stream_mask: AtomicU32,

    flushing: AtomicBool,
    has_flush_occurred: AtomicBool,
    triggering_recovery: AtomicBool,
    /// The first request after (re)start only carries initial configuration.
    initial_config_pending: AtomicBool,
    destroyed: AtomicBool,
    weak_self: Weak<Pipeline>,
}

impl Pipeline {
    /// `"{name}_{index}"`, used in every log line.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn pipeline_index(&self) -> u32 {
        self.ctx.pipeline_index
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.get()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn flags(&self) -> CapabilityFlags {
        self.graph.flags()
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Whether `node` reports config-done for every request.
    pub fn node_notifies_config_done(&self, node: NodeId) -> bool {
        self.graph.node(node).notifies_config_done()
    }

    /// Whether `node` fills external stream buffers.
    pub fn is_sink_node(&self, node: NodeId) -> bool {
        self.graph
            .outputs(node)
            .iter()
            .any(|port| port.sink == SinkKind::Buffer)
    }

    pub fn last_submitted(&self) -> Option<RequestId> {
        self.last_submitted.get()
    }

    pub fn last_completed(&self) -> Option<RequestId> {
        self.last_completed.get()
    }

    pub fn last_in_order_completed(&self) -> Option<RequestId> {
        self.last_in_order.get()
    }

    /// Submitted requests that have not yet retired.
    pub fn pending_requests(&self) -> u64 {
        self.live_pending.load(Ordering::Acquire)
    }

    /// Output buffers of an in-flight request, paired with the sequence id
    /// of the batched frame each belongs to.
    pub fn request_buffers(&self, request_id: RequestId) -> Vec<(SequenceId, StreamBuffer)> {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            return Vec::new();
        }
        let sequence_ids = slot.sequence_ids();
        slot.buffers()
            .into_iter()
            .filter_map(|buffer| {
                sequence_ids
                    .get(buffer.batch_index as usize)
                    .map(|&sequence_id| (sequence_id, buffer))
            })
            .collect()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn is_triggering_recovery(&self) -> bool {
        self.triggering_recovery.load(Ordering::Acquire)
    }

    pub fn is_linked(&self) -> bool {
        self.controller.is_linked()
    }

    fn link_device_group(&self) -> PipelineResult<()> {
        self.controller
            .link()
            .inspect_err(|e| tracing::error!("{}: link failed: {}", self.ident, e))?;

        let weak = self.weak_self.clone();
        let handler: MessageHandler = Arc::new(move |message| {
            if let Some(pipeline) = weak.upgrade() {
                pipeline.handle_hw_message(message);
            }
        });
        self.controller
            .register_handler(handler)
            .inspect_err(|e| tracing::error!("{}: failed to register message handler: {}", self.ident, e))
    }

    fn unlink_device_group(&self) {
        if let Err(e) = self.controller.unlink() {
            tracing::error!("{}: unlink failed: {}", self.ident, e);
        }
    }

    /// Deliver one result to the owning session.
    fn notify(&self, priv_data: PrivData, payload: ResultPayload) {
        self.ctx.session.notify_result(ResultsData {
            pipeline_index: self.ctx.pipeline_index,
            priv_data,
            payload,
        });
    }

    /// Log a violated invariant and hand it to the host's fatal channel.
    fn report_violation(&self, violation: InvariantViolation) {
        tracing::error!("{}: {}", self.ident, violation);
        if !self.ctx.config.abort_on_invariant_violation {
            return;
        }
        if let Some(fatal) = &self.ctx.fatal {
            let report = FatalReport {
                pipeline: self.ident.clone(),
                violation,
                at: Utc::now(),
            };
            if fatal.try_send(report).is_err() {
                tracing::warn!("{}: fatal channel unavailable", self.ident);
            }
        }
    }

    /// Log status, cursors and every outstanding request's per-node state.
    pub fn dump_state(&self) {
        tracing::info!(
            "{}: status {:?}, flushing {}, live {}, submitted {:?}, completed {:?}, in-order {:?}, shutter {:?}",
            self.ident,
            self.status.get(),
            self.is_flushing(),
            self.pending_requests(),
            self.last_submitted.get(),
            self.last_completed.get(),
            self.last_in_order.get(),
            self.last_shutter.get()
        );

        for slot in self.slots.iter() {
            let Some(request_id) = slot.request_id() else {
                continue;
            };
            if slot.is_retired() {
                continue;
            }
            tracing::info!(
                "{}: request {} nodes done {}/{}, metadata done {}, config done {}, fences {}, metadata ready {}, sof {}, error {}",
                self.ident,
                request_id,
                slot.nodes_request_done(),
                self.node_count,
                slot.nodes_metadata_done(),
                slot.nodes_config_done(),
                slot.pending_fences(),
                slot.is_metadata_ready(),
                slot.is_sof_dispatched(),
                slot.is_in_error()
            );
            for node in self.graph.iter_ordered() {
                tracing::info!(
                    "{}:   {} -> {:?}",
                    self.ident,
                    node.identity(),
                    node.request_status(request_id)
                );
            }
        }

        for node in self.graph.iter() {
            node.dump_debug_info();
        }
    }

    /// Stream off, release and unlink. Idempotent; nodes themselves are
    /// destroyed when the pipeline is dropped.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("{}: destroying", self.ident);

        if self.status.get().is_streaming() {
            if let Err(e) = self.stream_off(DeactivateMode::DEFAULT) {
                tracing::warn!("{}: stream off during destroy failed: {}", self.ident, e);
            }
        }
        if self.status.get().holds_resources() {
            if let Err(e) = self.release_resources(DeactivateMode::DEFAULT) {
                tracing::warn!("{}: release during destroy failed: {}", self.ident, e);
            }
        }
        self.unlink_device_group();
        self.notify_stream_on_wait();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("ident", &self.ident)
            .field("realtime", &self.realtime)
            .field("status", &self.status.get())
            .field("nodes", &self.node_count)
            .field("live", &self.pending_requests())
            .field("controller", &self.controller)
            .finish()
    }
}

/// Host clock in nanoseconds.
fn now_ns() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .map_or(0, |ns| ns.max(0) as u64)
}

/// True if moving a counter from `before` to `after` reached `target`.
#[inline]
fn crossed(before: u32, after: u32, target: u32) -> bool {
    before < target && after >= target
}
