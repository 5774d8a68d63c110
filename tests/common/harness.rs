//! A pipeline wired to the sim device group, a queue scheduler and a
//! session bridge, optionally with worker threads.

use capture_pipeline::pipeline::{
    DeviceGroup, FrameMessage, HwMessage, MetadataPoolSet, Pipeline, PipelineBuilder,
    PipelineContext, PipelineDescriptor, PipelineResult, QueueScheduler, SchedulerEvent,
    TimestampType,
};
use capture_pipeline::session::{FatalReport, SessionBridge, SessionEvent, SessionHandle};
use capture_pipeline::sim::{run_work, SimDeviceGroup, SimNodeFactory, SimWorkers};
use capture_pipeline::types::CaptureRequest;
use capture_pipeline::PipelineConfig;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        max_per_request_info: 16,
        request_queue_depth: 8,
        stream_on_timeout_ms: 300,
        nodes_request_done_timeout_ms: 1_000,
        stream_on_done_timeout_ms: 300,
        ..Default::default()
    }
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub session: SessionHandle,
    pub device: Arc<SimDeviceGroup>,
    pub fatal: Receiver<FatalReport>,
    pub factory: SimNodeFactory,
    work: Receiver<SchedulerEvent>,
    workers: Option<SimWorkers>,
}

impl Harness {
    pub fn build(descriptor: PipelineDescriptor, factory: SimNodeFactory) -> PipelineResult<Self> {
        Self::build_with_config(descriptor, factory, test_config())
    }

    pub fn build_with_config(
        descriptor: PipelineDescriptor,
        factory: SimNodeFactory,
        config: PipelineConfig,
    ) -> PipelineResult<Self> {
        let device = Arc::new(SimDeviceGroup::new());
        let (scheduler, work) = QueueScheduler::new();
        let (bridge, session) = SessionBridge::new(config.request_queue_depth);
        let (fatal_tx, fatal) = crossbeam_channel::unbounded();

        let context = PipelineContext {
            metadata: MetadataPoolSet::in_memory(config.max_per_request_info),
            config,
            pipeline_index: 0,
            device: Arc::clone(&device) as Arc<dyn DeviceGroup>,
            scheduler: Arc::new(scheduler),
            session: Arc::new(bridge),
            fatal: Some(fatal_tx),
        };
        let pipeline = PipelineBuilder::new(descriptor, context)
            .initialize(&factory)?
            .finalize()?;

        Ok(Self {
            pipeline,
            session,
            device,
            fatal,
            factory,
            work,
            workers: None,
        })
    }

    /// Run node work on `threads` background workers from now on
    pub fn with_workers(mut self, threads: usize) -> Self {
        self.workers = Some(SimWorkers::spawn(self.work.clone(), &self.pipeline, threads));
        self
    }

    pub fn submit(&self, request: &CaptureRequest) -> PipelineResult<()> {
        self.session.mark_submitted(request.request_id);
        self.pipeline.process_request(request)
    }

    /// Run every queued work item on this thread (no workers)
    pub fn run_all(&self) -> usize {
        let events: Vec<_> = self.work.try_iter().collect();
        let count = events.len();
        for event in events {
            run_work(&self.pipeline, event);
        }
        count
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

    /// Collect session events until `done` holds for the collected list or the timeout passes
    pub fn collect_until(
        &self,
        timeout: Duration,
        done: impl Fn(&[SessionEvent]) -> bool,
    ) -> Vec<SessionEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while !done(&events) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if let Some(event) = self.session.recv_timeout(deadline - now) {
                events.push(event);
            }
        }
        events
    }

    pub fn stop_workers(&mut self) {
        if let Some(mut workers) = self.workers.take() {
            workers.shutdown();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
