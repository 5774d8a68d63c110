//! Thread boundary between a pipeline and the session that owns it.
//!
//! The pipeline side holds a [`SessionBridge`] (the `SessionNotifier`
//! implementation); the session side holds the [`SessionHandle`] and drains
//! events on its own thread.

use super::{ResultsData, SessionNotifier};
use crate::types::RequestId;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Events sent from the pipeline to the session thread.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Result(ResultsData),
    ProcessingDone {
        pipeline_index: u32,
        last_in_order: RequestId,
    },
    ExposureTime(u64),
}

/// Channel capacity for pipeline → session events.
/// Sized for several frames' worth of results on a deep queue.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Counters shared between both ends.
#[derive(Debug, Default)]
struct BridgeShared {
    queue_depth: AtomicU32,
    dropped: AtomicU64,
    exposure_ns: AtomicU64,
    /// Highest submitted request id plus one; 0 before the first submission.
    submitted: AtomicU64,
    /// Highest in-order completed request id plus one.
    completed: AtomicU64,
}

/// Pipeline-side end: forwards every notification over the channel.
#[derive(Debug, Clone)]
pub struct SessionBridge {
    tx: Sender<SessionEvent>,
    shared: Arc<BridgeShared>,
}

/// Session-side end.
#[derive(Debug)]
pub struct SessionHandle {
    rx: Receiver<SessionEvent>,
    shared: Arc<BridgeShared>,
}

impl SessionBridge {
    /// Create a bridge pair for a session running `queue_depth` requests deep.
    pub fn new(queue_depth: u32) -> (Self, SessionHandle) {
        let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(BridgeShared {
            queue_depth: AtomicU32::new(queue_depth),
            ..Default::default()
        });
        (
            Self {
                tx,
                shared: Arc::clone(&shared),
            },
            SessionHandle { rx, shared },
        )
    }

    fn send(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("session channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("session handle dropped, discarding event");
            }
        }
    }
}

impl SessionNotifier for SessionBridge {
    fn notify_result(&self, results: ResultsData) {
        self.send(SessionEvent::Result(results));
    }

    fn notify_processing_done(&self, pipeline_index: u32, last_in_order: RequestId) {
        self.shared
            .completed
            .fetch_max(last_in_order.saturating_add(1), Ordering::AcqRel);
        self.send(SessionEvent::ProcessingDone {
            pipeline_index,
            last_in_order,
        });
    }

    fn current_request_queue_depth(&self) -> u32 {
        self.shared.queue_depth.load(Ordering::Relaxed)
    }

    /// Empty once every submitted request has completed in order.
    fn is_result_holder_empty(&self) -> bool {
        let completed = self.shared.completed.load(Ordering::Acquire);
        completed >= self.shared.submitted.load(Ordering::Acquire)
    }

    fn update_current_exposure_time(&self, exposure_ns: u64) {
        self.shared.exposure_ns.store(exposure_ns, Ordering::Relaxed);
        self.send(SessionEvent::ExposureTime(exposure_ns));
    }
}

impl SessionHandle {
    /// Drain all pending events.
    pub fn drain(&self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Try to receive a single event without blocking.
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Block for the next event, up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Record that the session handed `request_id` to the pipeline.
    pub fn mark_submitted(&self, request_id: RequestId) {
        self.shared
            .submitted
            .fetch_max(request_id.saturating_add(1), Ordering::AcqRel);
    }

    /// Change the depth reported to the pipeline's watchdog.
    pub fn set_queue_depth(&self, depth: u32) {
        self.shared.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Events lost because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Last exposure time the pipeline forwarded.
    pub fn exposure_ns(&self) -> u64 {
        self.shared.exposure_ns.load(Ordering::Relaxed)
    }
}
