//! Deferred-work scheduler seam.
//!
//! The pipeline does not execute nodes. It hands `(request, node)` work items
//! to a scheduler and triggers a single "dispatch ready work" pass once a whole
//! request has been set up. [`QueueScheduler`] is a channel-backed scheduler:
//! dispatched work is delivered as [`SchedulerEvent`]s to whatever worker pool
//! the host runs.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::id::NodeId;
use crate::pipeline::sync::lock;
use crate::types::{RequestId, SyncId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Mutex;

/// One node's work for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredWork {
    pub pipeline_index: u32,
    pub request_id: RequestId,
    pub sync_id: SyncId,
    pub node: NodeId,
}

/// Scheduler interface consumed by the pipeline.
#[cfg_attr(test, mockall::automock)]
pub trait DeferredScheduler: Send + Sync {
    /// Queue work without running it.
    fn add_deferred_node(&self, work: DeferredWork) -> PipelineResult<()>;

    /// Release every queued item whose dependencies are met.
    fn dispatch_ready_nodes(&self);

    /// Cancel every queued item of a request.
    fn notify_request_error(&self, pipeline_index: u32, request_id: RequestId);
}

/// What a worker receives from a [`QueueScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Run this node for this request.
    Ready(DeferredWork),
    /// The item was cancelled before running; the node must still report done.
    Cancelled(DeferredWork),
}

/// Channel-backed scheduler. Work has no inter-node dependencies here:
/// every queued item is ready at the next dispatch pass.
pub struct QueueScheduler {
    pending: Mutex<Vec<DeferredWork>>,
    tx: Sender<SchedulerEvent>,
}

impl QueueScheduler {
    /// Create the scheduler and the receiving end for the worker pool.
    pub fn new() -> (Self, Receiver<SchedulerEvent>) {
        let (tx, rx) = unbounded();
        (
            Self {
                pending: Mutex::new(Vec::new()),
                tx,
            },
            rx,
        )
    }

    /// Number of queued, not yet dispatched items.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl DeferredScheduler for QueueScheduler {
    fn add_deferred_node(&self, work: DeferredWork) -> PipelineResult<()> {
        tracing::trace!(
            "queueing {:?} for request {} on pipeline {}",
            work.node,
            work.request_id,
            work.pipeline_index
        );
        lock(&self.pending).push(work);
        Ok(())
    }

    fn dispatch_ready_nodes(&self) {
        let ready: Vec<DeferredWork> = lock(&self.pending).drain(..).collect();
        for work in ready {
            if self.tx.send(SchedulerEvent::Ready(work)).is_err() {
                tracing::warn!("scheduler has no workers, dropping {:?}", work);
            }
        }
    }

    fn notify_request_error(&self, pipeline_index: u32, request_id: RequestId) {
        let cancelled: Vec<DeferredWork> = {
            let mut pending = lock(&self.pending);
            let (cancelled, kept): (Vec<_>, Vec<_>) = pending.drain(..).partition(|w| {
                w.pipeline_index == pipeline_index && w.request_id == request_id
            });
            *pending = kept;
            cancelled
        };

        for work in cancelled {
            if self.tx.send(SchedulerEvent::Cancelled(work)).is_err() {
                tracing::warn!("scheduler has no workers, dropping cancelled {:?}", work);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(request_id: RequestId, node: u32) -> DeferredWork {
        DeferredWork {
            pipeline_index: 0,
            request_id,
            sync_id: request_id,
            node: NodeId(node),
        }
    }

    #[test]
    fn test_nothing_delivered_before_dispatch() {
        let (scheduler, rx) = QueueScheduler::new();
        scheduler.add_deferred_node(work(1, 0)).unwrap();
        scheduler.add_deferred_node(work(1, 1)).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending(), 2);

        scheduler.dispatch_ready_nodes();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                SchedulerEvent::Ready(work(1, 0)),
                SchedulerEvent::Ready(work(1, 1))
            ]
        );
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_request_error_cancels_only_that_request() {
        let (scheduler, rx) = QueueScheduler::new();
        scheduler.add_deferred_node(work(1, 0)).unwrap();
        scheduler.add_deferred_node(work(2, 0)).unwrap();
        scheduler.notify_request_error(0, 1);

        assert_eq!(rx.try_recv().unwrap(), SchedulerEvent::Cancelled(work(1, 0)));
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.pending(), 1);
    }
}
