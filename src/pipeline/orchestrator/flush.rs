//! Flush mode and recovery helpers.

use super::Pipeline;
use crate::pipeline::node::NodeRequestStatus;
use std::sync::atomic::Ordering;

impl Pipeline {
    /// Enter or leave flush mode.
    ///
    /// Entering records the flush boundary: requests completed before it
    /// keep their metadata, and shutters for requests submitted before it are
    /// exempt from the ordering check.
    pub fn set_flush_status(&self, flushing: bool) {
        if flushing {
            if let Some(completed) = self.last_completed.get() {
                self.last_valid_before_flush.set(completed);
            }
            self.has_flush_occurred.store(true, Ordering::Release);
            match self.last_submitted.get() {
                Some(id) => self.last_flush_request_id.set(id),
                None => self.last_flush_request_id.clear(),
            }
            self.flushing.store(true, Ordering::Release);
            tracing::info!(
                "{}: flush started (last submitted {:?}, last valid {:?})",
                self.ident,
                self.last_submitted.get(),
                self.last_valid_before_flush.get()
            );
        } else {
            self.flushing.store(false, Ordering::Release);
            self.all_done.notify_all();
            tracing::info!("{}: flush finished", self.ident);
        }
    }

    /// Push every node's outstanding work for unfinished requests out of the
    /// pipeline: deferred work is cancelled at the scheduler, set-up or
    /// running work is flushed on the node.
    pub fn flush_pending_nodes(&self) {
        let Some(last_submitted) = self.last_submitted.get() else {
            return;
        };
        let start = match self.last_in_order.get() {
            Some(id) => id + 1,
            None => self.first_submitted.get().unwrap_or(0),
        };

        for request_id in start..=last_submitted {
            let slot = self.slots.slot(request_id);
            if !slot.holds(request_id) || slot.is_retired() {
                continue;
            }
            let mut cancelled = false;
            for node in self.graph.iter_ordered() {
                match node.request_status(request_id) {
                    NodeRequestStatus::Deferred => {
                        if !cancelled {
                            tracing::debug!(
                                "{}: cancelling deferred work of request {}",
                                self.ident,
                                request_id
                            );
                            self.ctx
                                .scheduler
                                .notify_request_error(self.ctx.pipeline_index, request_id);
                            cancelled = true;
                        }
                    }
                    NodeRequestStatus::Setup | NodeRequestStatus::Running => {
                        tracing::debug!(
                            "{}: flushing {} for request {}",
                            self.ident,
                            node.identity(),
                            request_id
                        );
                        node.flush(request_id);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Drop per-frame metadata of requests that completed after the flush point.
    pub fn flush_metadata(&self) {
        let Some(last_completed) = self.last_completed.get() else {
            return;
        };
        let from = self.last_valid_before_flush.get().map_or(0, |id| id + 1);
        if from > last_completed {
            return;
        }
        tracing::debug!(
            "{}: flushing metadata for requests {}..={}",
            self.ident,
            from,
            last_completed
        );
        self.ctx.metadata.flush(from, last_completed);
    }

    /// Forget config-done progress and release a stream-on blocked on it.
    pub fn clear_pending_resources(&self) {
        self.config_done.update(|state| {
            state.count = 0;
            if state.waiting {
                state.aborted = true;
            }
        });
        tracing::debug!("{}: pending resources cleared", self.ident);
    }

    /// While set, shutter, SOF and hardware error results are suppressed.
    pub fn set_triggering_recovery(&self, triggering: bool) {
        self.triggering_recovery.store(triggering, Ordering::Release);
        tracing::info!("{}: triggering recovery = {}", self.ident, triggering);
    }
}
