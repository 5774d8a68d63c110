//! Capture Pipeline - Demo Entry Point
//!
//! Builds a small realtime preview pipeline on simulated nodes and a
//! simulated device group, streams it on, feeds it requests and frame
//! boundaries, and logs what the session receives.
//!
//! Usage: `capture-pipeline [CONFIG.toml] [REQUESTS]`

use anyhow::Context;
use capture_pipeline::{
    pipeline::{
        FrameMessage, HwMessage, InputPortDescriptor, MetadataPoolSet, NodeDescriptor, NodeKind,
        OutputPortDescriptor, PipelineBuilder, PipelineContext, PipelineDescriptor,
        QueueScheduler, SinkKind, SyncMode, TimestampType,
    },
    session::{ResultPayload, SessionBridge, SessionEvent},
    sim::{SimBehavior, SimDeviceGroup, SimNodeFactory, SimWorkers},
    types::{BufferInfo, CaptureRequest, DeactivateMode, ImageFormat, StreamBuffer},
    LogConfig, PipelineConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FRAME_INTERVAL_NS: u64 = 33_333_333;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => PipelineConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => PipelineConfig::load_or_default(),
    };
    let requests: u64 = match args.next() {
        Some(n) => n.parse().context("REQUESTS must be a number")?,
        None => 30,
    };

    // Keep the guard alive so buffered log lines are flushed on exit.
    let _log_guard = init_logging(&config.log);
    tracing::info!("Starting capture pipeline demo ({} requests)", requests);

    let device = Arc::new(SimDeviceGroup::new());
    let (scheduler, work_rx) = QueueScheduler::new();
    let (bridge, session) = SessionBridge::new(config.request_queue_depth);
    let (fatal_tx, fatal_rx) = crossbeam_channel::bounded(16);

    let context = PipelineContext {
        metadata: MetadataPoolSet::in_memory(config.max_per_request_info),
        config,
        pipeline_index: 0,
        device: Arc::clone(&device) as _,
        scheduler: Arc::new(scheduler),
        session: Arc::new(bridge),
        fatal: Some(fatal_tx),
    };

    let factory = SimNodeFactory::new()
        .with_behavior(
            "sensor",
            SimBehavior {
                notifies_config_done: true,
                device_indices: vec![1],
                ..Default::default()
            },
        )
        .with_behavior(
            "ife",
            SimBehavior {
                device_indices: vec![2],
                ..Default::default()
            },
        );

    let pipeline = PipelineBuilder::new(preview_descriptor(), context)
        .initialize(&factory)
        .context("Failed to initialize pipeline")?
        .finalize()
        .context("Failed to finalize pipeline")?;
    let mut workers = SimWorkers::spawn(work_rx, &pipeline, 2);

    // The first request carries the initial configuration; stream-on waits for it.
    pipeline.open_request(0, 0, SyncMode::NoSync, 100)?;
    session.mark_submitted(0);
    pipeline
        .process_request(&request(0))
        .context("Initial request failed")?;
    pipeline.stream_on().context("Stream on failed")?;

    let mut timestamp = FRAME_INTERVAL_NS;
    for id in 0..requests {
        if id > 0 {
            pipeline.open_request(id, id, SyncMode::NoSync, 100)?;
            session.mark_submitted(id);
            if let Err(e) = pipeline.process_request(&request(id)) {
                tracing::warn!("Request {} not processed: {}", id, e);
                continue;
            }
        }
        device.emit(HwMessage::Frame(FrameMessage {
            sync_id: Some(id),
            frame_count: id,
            timestamp,
            timestamp_type: TimestampType::Monotonic,
            notify: true,
        }));
        timestamp += FRAME_INTERVAL_NS;
    }

    if let Err(e) = pipeline.wait_for_all_nodes_request() {
        tracing::warn!("Not every request retired: {}", e);
    }
    pipeline.stream_off(DeactivateMode::DEFAULT | DeactivateMode::UNLINK_PIPELINE)?;
    workers.shutdown();

    let (mut shutters, mut metadata, mut buffers, mut errors, mut last_done) = (0, 0, 0, 0, None);
    while let Some(event) = session.recv_timeout(Duration::from_millis(50)) {
        match event {
            SessionEvent::Result(result) => match result.payload {
                ResultPayload::Shutter { .. } => shutters += 1,
                ResultPayload::Metadata { .. } => metadata += 1,
                ResultPayload::Buffer { .. } => buffers += 1,
                ResultPayload::Error { .. } => errors += 1,
                _ => {}
            },
            SessionEvent::ProcessingDone { last_in_order, .. } => last_done = Some(last_in_order),
            SessionEvent::ExposureTime(_) => {}
        }
    }
    for report in fatal_rx.try_iter() {
        tracing::error!("Fatal report: {}", report);
    }

    tracing::info!(
        "Session received {} shutters, {} metadata, {} buffers, {} errors; last in-order request {:?}; {} events dropped",
        shutters,
        metadata,
        buffers,
        errors,
        last_done,
        session.dropped()
    );
    tracing::info!("Shutting down...");
    Ok(())
}

fn init_logging(log: &LogConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));

    let (file_layer, guard) = match &log.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "capture-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn preview_descriptor() -> PipelineDescriptor {
    PipelineDescriptor::new("preview", true)
        .node(
            NodeDescriptor::new("sensor", NodeKind::Sensor)
                .output(OutputPortDescriptor::new(0, ImageFormat::Raw10)),
        )
        .node(
            NodeDescriptor::new("ife", NodeKind::Ife)
                .input(InputPortDescriptor::link(0, "sensor", 0))
                .output(OutputPortDescriptor::new(0, ImageFormat::Nv12).sink(SinkKind::Buffer))
                .output(OutputPortDescriptor::new(1, ImageFormat::Blob)),
        )
        .node(
            NodeDescriptor::new("stats", NodeKind::StatsProcessing)
                .input(InputPortDescriptor::link(0, "ife", 1)),
        )
}

fn request(id: u64) -> CaptureRequest {
    CaptureRequest::new(id, id as u32).with_buffer(StreamBuffer {
        stream_id: 0,
        batch_index: 0,
        buffer: BufferInfo {
            handle: 0x1000 + id,
            size: 1920 * 1080 * 3 / 2,
        },
    })
}
