//! Worker pool that executes scheduled node work against a pipeline.
//!
//! Each worker drains [`SchedulerEvent`]s from a [`QueueScheduler`] and
//! reports completion back through the pipeline's per-node callbacks, in the
//! order a real node would: config done, metadata, partial metadata, output
//! buffers, then request done.
//!
//! [`QueueScheduler`]: crate::pipeline::scheduler::QueueScheduler

use crate::pipeline::orchestrator::Pipeline;
use crate::pipeline::scheduler::{DeferredWork, SchedulerEvent};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// How often an idle worker re-checks the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Run one scheduler event to completion on the calling thread.
pub fn run_work(pipeline: &Pipeline, event: SchedulerEvent) {
    match event {
        SchedulerEvent::Ready(work) => complete(pipeline, work),
        SchedulerEvent::Cancelled(work) => {
            tracing::trace!(
                "{}: {:?} cancelled for request {}",
                pipeline.ident(),
                work.node,
                work.request_id
            );
            pipeline.notify_node_metadata_done(work.request_id);
            pipeline.notify_node_request_done(work.request_id, work.node);
        }
    }
}

fn complete(pipeline: &Pipeline, work: DeferredWork) {
    let DeferredWork {
        request_id, node, ..
    } = work;

    if pipeline.node_notifies_config_done(node) {
        pipeline.notify_node_config_done(request_id);
    }
    pipeline.notify_node_partial_metadata_done(request_id);
    pipeline.notify_node_metadata_done(request_id);

    if pipeline.is_sink_node(node) {
        for (sequence_id, buffer) in pipeline.request_buffers(request_id) {
            if pipeline.is_flushing() {
                pipeline.sink_port_fence_error_signaled(
                    buffer.stream_id,
                    sequence_id,
                    request_id,
                    buffer.buffer,
                );
            } else {
                pipeline.sink_port_fence_signaled(
                    buffer.stream_id,
                    sequence_id,
                    request_id,
                    buffer.buffer,
                );
            }
        }
    }

    pipeline.notify_node_request_done(request_id, node);
}

/// A fixed set of worker threads bound to one pipeline.
pub struct SimWorkers {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl SimWorkers {
    /// Spawn `threads` workers. They hold the pipeline weakly and exit once
    /// it is dropped, the channel closes, or [`SimWorkers::shutdown`] runs.
    pub fn spawn(rx: Receiver<SchedulerEvent>, pipeline: &Arc<Pipeline>, threads: usize) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let handles = (0..threads.max(1))
            .map(|_| {
                let rx = rx.clone();
                let running = Arc::clone(&running);
                let pipeline = Arc::downgrade(pipeline);
                std::thread::spawn(move || worker_loop(rx, pipeline, running))
            })
            .collect();
        Self { running, handles }
    }

    /// Stop and join every worker.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("sim worker panicked");
            }
        }
    }
}

impl Drop for SimWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<SchedulerEvent>, pipeline: Weak<Pipeline>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let event = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(pipeline) = pipeline.upgrade() else {
            break;
        };
        run_work(&pipeline, event);
    }
}
