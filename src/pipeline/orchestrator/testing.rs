//! Fixture shared by the orchestrator unit tests.

use super::{Pipeline, PipelineBuilder, PipelineContext};
use crate::config::PipelineConfig;
use crate::pipeline::descriptor::{NodeDescriptor, PipelineDescriptor};
use crate::pipeline::device::{DeviceGroup, FrameMessage, HwMessage, TimestampType};
use crate::pipeline::metadata::MetadataPoolSet;
use crate::pipeline::node::NodeKind;
use crate::pipeline::port::{InputPortDescriptor, OutputPortDescriptor, SinkKind};
use crate::pipeline::scheduler::{DeferredScheduler, QueueScheduler, SchedulerEvent};
use crate::session::{
    FatalReport, ResultPayload, SessionBridge, SessionEvent, SessionHandle, SessionNotifier,
};
use crate::sim::{run_work, SimDeviceGroup, SimNodeFactory};
use crate::types::{BufferInfo, CaptureRequest, ImageFormat, RequestId, StreamBuffer};
use crate::pipeline::sync::lock;
use crossbeam_channel::Receiver;
use std::sync::{Arc, Mutex};

/// A linear chain `names[0] -> ... -> names[n-1]`, the last node owning a sink port.
pub fn chain(realtime: bool, names: &[&str]) -> PipelineDescriptor {
    let mut desc = PipelineDescriptor::new("test", realtime);
    for (i, name) in names.iter().enumerate() {
        let mut node = NodeDescriptor::new(*name, NodeKind::Custom(i as u32));
        node = if i == 0 {
            node.input(InputPortDescriptor::source_buffer(0))
        } else {
            node.input(InputPortDescriptor::link(0, names[i - 1], 0))
        };
        let mut out = OutputPortDescriptor::new(0, ImageFormat::Nv12);
        if i == names.len() - 1 {
            out = out.sink(SinkKind::Buffer);
        }
        desc.nodes.push(node.output(out));
    }
    desc
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        max_per_request_info: 8,
        request_queue_depth: 4,
        stream_on_timeout_ms: 200,
        nodes_request_done_timeout_ms: 200,
        stream_on_done_timeout_ms: 200,
        ..Default::default()
    }
}

pub struct Seams {
    pub device: Arc<dyn DeviceGroup>,
    pub scheduler: Arc<dyn DeferredScheduler>,
    pub session: Arc<dyn SessionNotifier>,
}

/// Build and finalize a pipeline over explicit seams.
pub fn build_with(
    desc: PipelineDescriptor,
    factory: &SimNodeFactory,
    config: PipelineConfig,
    seams: Seams,
    fatal: Option<crossbeam_channel::Sender<FatalReport>>,
) -> Arc<Pipeline> {
    let context = PipelineContext {
        metadata: MetadataPoolSet::in_memory(config.max_per_request_info),
        config,
        pipeline_index: 0,
        device: seams.device,
        scheduler: seams.scheduler,
        session: seams.session,
        fatal,
    };
    PipelineBuilder::new(desc, context)
        .initialize(factory)
        .unwrap()
        .finalize()
        .unwrap()
}

/// Pipeline over the sim device group, a queue scheduler and a session bridge.
pub struct Rig {
    pub pipeline: Arc<Pipeline>,
    pub work: Receiver<SchedulerEvent>,
    pub session: SessionHandle,
    pub device: Arc<SimDeviceGroup>,
    pub fatal: Receiver<FatalReport>,
    pub factory: SimNodeFactory,
    /// Work skipped by `run_request`, kept in submission order.
    backlog: Mutex<Vec<SchedulerEvent>>,
}

impl Rig {
    pub fn new(desc: PipelineDescriptor, factory: SimNodeFactory) -> Self {
        Self::with_config(desc, factory, test_config())
    }

    pub fn with_config(desc: PipelineDescriptor, factory: SimNodeFactory, config: PipelineConfig) -> Self {
        let device = Arc::new(SimDeviceGroup::new());
        let (scheduler, work) = QueueScheduler::new();
        let (bridge, session) = SessionBridge::new(config.request_queue_depth);
        let (fatal_tx, fatal) = crossbeam_channel::unbounded();
        let pipeline = build_with(
            desc,
            &factory,
            config,
            Seams {
                device: Arc::clone(&device) as Arc<dyn DeviceGroup>,
                scheduler: Arc::new(scheduler),
                session: Arc::new(bridge),
            },
            Some(fatal_tx),
        );
        Self {
            pipeline,
            work,
            session,
            device,
            fatal,
            factory,
            backlog: Mutex::new(Vec::new()),
        }
    }

    fn take_work(&self) -> Vec<SchedulerEvent> {
        let mut events = std::mem::take(&mut *lock(&self.backlog));
        events.extend(self.work.try_iter());
        events
    }

    pub fn submit(&self, id: RequestId) -> crate::pipeline::error::PipelineResult<()> {
        self.session.mark_submitted(id);
        self.pipeline.process_request(&request(id))
    }

    /// Run every queued work item on this thread.
    pub fn run_all(&self) -> usize {
        let events = self.take_work();
        let count = events.len();
        for event in events {
            run_work(&self.pipeline, event);
        }
        count
    }

    /// Run queued work for one request only; the rest stays queued, in order.
    pub fn run_request(&self, id: RequestId) {
        let mut others = Vec::new();
        for event in self.take_work() {
            let request_id = match &event {
                SchedulerEvent::Ready(w) | SchedulerEvent::Cancelled(w) => w.request_id,
            };
            if request_id == id {
                run_work(&self.pipeline, event);
            } else {
                others.push(event);
            }
        }
        *lock(&self.backlog) = others;
    }

    pub fn frame(&self, sync_id: Option<u64>, frame_count: u64, timestamp: u64) -> bool {
        self.device.emit(HwMessage::Frame(FrameMessage {
            sync_id,
            frame_count,
            timestamp,
            timestamp_type: TimestampType::Monotonic,
            notify: true,
        }))
    }

    /// A boundary that produces no SOF; only feeds the watchdog.
    pub fn boundary(&self, sync_id: Option<u64>, frame_count: u64) -> bool {
        self.device.emit(HwMessage::Frame(FrameMessage {
            sync_id,
            frame_count,
            timestamp: 0,
            timestamp_type: TimestampType::Monotonic,
            notify: false,
        }))
    }

    pub fn results(&self) -> Vec<ResultPayload> {
        self.session
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Result(result) => Some(result.payload),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.session.drain()
    }
}

pub fn request(id: RequestId) -> CaptureRequest {
    CaptureRequest::new(id, id as u32).with_buffer(StreamBuffer {
        stream_id: 0,
        batch_index: 0,
        buffer: BufferInfo {
            handle: 0x100 + id,
            size: 64,
        },
    })
}

/// Processing-done ids from a list of session events.
pub fn processing_done(events: &[SessionEvent]) -> Vec<RequestId> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::ProcessingDone { last_in_order, .. } => Some(*last_in_order),
            _ => None,
        })
        .collect()
}
