//! Request submission.
//!
//! ```text
//! process_request
//!   ├─ claim slot (retirement + fence check), map sync id
//!   ├─ offline shutter (non-realtime only)
//!   ├─ lazy resource acquire
//!   ├─ invalidate + setup every node in execution order
//!   └─ flushing?  flush enabled nodes, request error, Cancelled
//!      otherwise  enqueue enabled nodes, dispatch once
//! ```

use super::{crossed, now_ns, Pipeline};
use crate::pipeline::device::SyncMode;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::NodeId;
use crate::pipeline::metadata::{MetaTag, MetadataPoolSet};
use crate::pipeline::node::RequestSetup;
use crate::pipeline::scheduler::DeferredWork;
use crate::pipeline::status::PipelineStatus;
use crate::pipeline::sync::lock;
use crate::session::{ErrorCode, ResultPayload};
use crate::types::{CaptureRequest, FenceHandle, RequestId, SyncId};
use std::sync::atomic::Ordering;

impl Pipeline {
    /// Turn a capture request into per-node work.
    ///
    /// Nodes that fail setup or report themselves disabled are skipped for
    /// this request and credited as done. Returns [`PipelineError::Cancelled`]
    /// when no node is enabled or the pipeline is flushing; in both cases the
    /// request is retired immediately and nothing reaches the scheduler.
    pub fn process_request(&self, request: &CaptureRequest) -> PipelineResult<()> {
        let status = self.status.get();
        if !status.accepts_requests() {
            return Err(PipelineError::InvalidState {
                operation: "process_request",
                status,
            });
        }

        let request_id = request.request_id;
        match self.slots.begin_request(request) {
            Ok(_) => {}
            Err(PipelineError::InvariantViolation(violation)) => {
                self.report_violation(violation.clone());
                return Err(violation.into());
            }
            Err(e) => {
                tracing::error!("{}: cannot accept request {}: {}", self.ident, request_id, e);
                return Err(e);
            }
        }

        let mask = request.active_stream_mask();
        let different_streams = self.last_stream_mask.swap(mask, Ordering::AcqRel) != mask;

        self.live_pending.fetch_add(1, Ordering::AcqRel);
        self.last_submitted.fetch_max(request_id);
        self.first_submitted.set_if_empty(request_id);
        if self.realtime {
            self.config_done.update(|state| state.expected += 1);
        }

        tracing::debug!(
            "{}: processing request {} (sync {}, {} batches, mask {:#x}{})",
            self.ident,
            request_id,
            request.sync_id,
            request.num_batched_frames(),
            mask,
            if different_streams { ", streams changed" } else { "" }
        );

        // A request cancelled by the flush below must not see a shutter.
        if !self.realtime && !self.is_flushing() {
            self.send_offline_shutter(request_id);
        }

        if let Err(e) = self.ensure_resources() {
            tracing::error!(
                "{}: acquiring resources for request {} failed: {}",
                self.ident,
                request_id,
                e
            );
            self.abandon_request(request_id, self.node_count, self.config_done_nodes);
            return Err(e);
        }

        for node in self.graph.iter() {
            node.invalidate_request(request_id);
        }

        let setup = RequestSetup {
            request_id,
            sync_id: request.sync_id,
            batches: &request.batches,
            active_stream_mask: mask,
            different_streams,
        };

        let mut enabled: Vec<NodeId> = Vec::with_capacity(self.node_count as usize);
        for &id in self.graph.execution_order() {
            let node = self.graph.node(id);
            match node.setup_request(&setup) {
                Ok(true) => enabled.push(id),
                Ok(false) => {
                    tracing::trace!(
                        "{}: {} not enabled for request {}",
                        self.ident,
                        node.identity(),
                        request_id
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "{}: {} failed setup for request {}, skipping it: {}",
                        self.ident,
                        node.identity(),
                        request_id,
                        e
                    );
                }
            }
        }

        if enabled.is_empty() {
            tracing::info!(
                "{}: no node enabled for request {}, cancelling",
                self.ident,
                request_id
            );
            self.abandon_request(request_id, self.node_count, self.config_done_nodes);
            return Err(PipelineError::Cancelled);
        }

        if self.is_flushing() {
            tracing::info!(
                "{}: flushing, request {} not submitted",
                self.ident,
                request_id
            );
            for &id in &enabled {
                self.graph.node(id).flush(request_id);
            }
            self.trigger_request_error(request_id);
            self.abandon_request(request_id, self.node_count, self.config_done_nodes);
            return Err(PipelineError::Cancelled);
        }

        let (disabled, disabled_config) = self.count_excluded(&enabled);
        if disabled > 0 || disabled_config > 0 {
            self.credit_nodes(request_id, disabled, disabled_config);
        }

        let mut submitted = 0usize;
        let mut failure = None;
        for &node in &enabled {
            let work = DeferredWork {
                pipeline_index: self.ctx.pipeline_index,
                request_id,
                sync_id: request.sync_id,
                node,
            };
            if let Err(e) = self.ctx.scheduler.add_deferred_node(work) {
                failure = Some(e);
                break;
            }
            submitted += 1;
        }

        // One dispatch pass for the whole request, after every node is set up.
        if submitted > 0 {
            self.ctx.scheduler.dispatch_ready_nodes();
        }

        if let Some(e) = failure {
            tracing::error!(
                "{}: scheduler rejected request {} after {} of {} nodes: {}",
                self.ident,
                request_id,
                submitted,
                enabled.len(),
                e
            );
            let unsent = &enabled[submitted..];
            let unsent_config = unsent
                .iter()
                .filter(|&&id| self.graph.node(id).notifies_config_done())
                .count() as u32;
            self.credit_nodes(request_id, unsent.len() as u32, unsent_config);
            self.last_stream_mask.store(0, Ordering::Release);
            return Err(match e {
                PipelineError::Scheduler(_) => e,
                other => PipelineError::Scheduler(other.to_string()),
            });
        }

        tracing::trace!(
            "{}: request {} dispatched to {} of {} nodes",
            self.ident,
            request_id,
            submitted,
            self.node_count
        );
        Ok(())
    }

    /// Acquire resources on first use, unless already held.
    fn ensure_resources(&self) -> PipelineResult<()> {
        if self.status.get().holds_resources() {
            return Ok(());
        }
        let _guard = lock(&self.resource_lock);
        let status = self.status.get();
        if status.can_acquire() && status != PipelineStatus::PartialStreamOn {
            self.acquire_locked()
        } else {
            Ok(())
        }
    }

    /// Nodes (and config-done nodes) outside `enabled`.
    fn count_excluded(&self, enabled: &[NodeId]) -> (u32, u32) {
        let disabled = self.node_count - enabled.len() as u32;
        let enabled_config = enabled
            .iter()
            .filter(|&&id| self.graph.node(id).notifies_config_done())
            .count() as u32;
        (disabled, self.config_done_nodes - enabled_config)
    }

    /// Retire a request no node will ever report on.
    fn abandon_request(&self, request_id: RequestId, nodes: u32, config_nodes: u32) {
        self.last_stream_mask.store(0, Ordering::Release);
        self.credit_nodes(request_id, nodes, config_nodes);
    }

    /// Count nodes as done for a request without them reporting.
    pub(super) fn credit_nodes(&self, request_id: RequestId, nodes: u32, config_nodes: u32) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            return;
        }
        if config_nodes > 0 {
            let total = slot.credit_config_done(config_nodes);
            if crossed(total - config_nodes, total, self.config_done_nodes) {
                self.config_done_reached(request_id);
            }
        }
        if nodes > 0 {
            let total = slot.credit_nodes(nodes);
            if crossed(total - nodes, total, self.node_count) {
                self.request_retired(request_id);
            }
        }
    }

    /// Shutter for pipelines with no sensor: fired at submission time.
    fn send_offline_shutter(&self, request_id: RequestId) {
        let timestamp = MetadataPoolSet::read_u64(
            self.ctx.metadata.input.as_ref(),
            request_id,
            MetaTag::SensorTimestamp,
        )
        .filter(|&ts| ts != 0)
        .unwrap_or_else(now_ns);
        self.dispatch_shutter(request_id, timestamp);
    }

    /// Open a request with the device group ahead of submission.
    ///
    /// The first request after initialization or stream-off only carries the
    /// initial configuration and is not opened.
    pub fn open_request(
        &self,
        request_id: RequestId,
        sync_id: SyncId,
        sync_mode: SyncMode,
        exposure_timeout_ms: u64,
    ) -> PipelineResult<()> {
        if !self.realtime {
            return Ok(());
        }

        if self.initial_config_pending.load(Ordering::Acquire) && !self.status.get().is_streaming() {
            self.initial_config_pending.store(false, Ordering::Release);
            tracing::debug!(
                "{}: request {} carries initial config, not opened",
                self.ident,
                request_id
            );
            return Ok(());
        }

        if self.is_flushing() {
            tracing::info!(
                "{}: open request {} (sync {}) cancelled by flush",
                self.ident,
                request_id,
                sync_id
            );
            return Err(PipelineError::Cancelled);
        }

        tracing::debug!(
            "{}: opening request {} (sync {}, {:?}, exposure timeout {} ms)",
            self.ident,
            request_id,
            sync_id,
            sync_mode,
            exposure_timeout_ms
        );
        self.controller
            .open_request(sync_id, sync_mode, exposure_timeout_ms)
    }

    /// Mark a request in error and report a request error for each of its frames.
    pub fn trigger_request_error(&self, request_id: RequestId) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            tracing::error!(
                "{}: cannot raise error for unknown request {}",
                self.ident,
                request_id
            );
            return;
        }
        slot.set_in_error();
        let priv_data = slot.priv_data();
        for sequence_id in slot.sequence_ids() {
            self.notify(
                priv_data.clone(),
                ResultPayload::Error {
                    code: ErrorCode::Request,
                    request_id: Some(request_id),
                    sequence_id: Some(sequence_id),
                    stream_id: None,
                },
            );
        }
    }

    /// Track a fence the request's buffers wait on. The slot cannot be
    /// reused until every registered fence is removed.
    pub fn register_request_fence(&self, fence: FenceHandle, request_id: RequestId) -> PipelineResult<()> {
        self.slots.register_fence(fence, request_id).inspect_err(|_| {
            tracing::error!(
                "{}: fence list full for request {}",
                self.ident,
                request_id
            )
        })
    }

    /// Returns whether the fence was registered.
    pub fn remove_request_fence(&self, fence: FenceHandle, request_id: RequestId) -> bool {
        let removed = self.slots.remove_fence(fence, request_id);
        if !removed {
            tracing::warn!(
                "{}: fence {:?} not registered for request {}",
                self.ident,
                fence,
                request_id
            );
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{build_with, chain, processing_done, request, test_config, Rig, Seams};
    use super::*;
    use crate::pipeline::device::DeviceGroup;
    use crate::pipeline::error::InvariantViolation;
    use crate::pipeline::scheduler::MockDeferredScheduler;
    use crate::session::SessionBridge;
    use crate::sim::{DeviceCall, SimBehavior, SimDeviceGroup, SimEvent, SimNodeFactory};
    use std::sync::Arc;

    #[test]
    fn test_offline_request_flows_to_completion() {
        let rig = Rig::new(chain(false, &["a", "b", "c"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        assert_eq!(rig.pipeline.status(), PipelineStatus::ResourcesAcquired);
        assert_eq!(rig.pipeline.pending_requests(), 1);

        assert_eq!(rig.run_all(), 3);
        let events = rig.events();
        assert_eq!(processing_done(&events), vec![0]);
        assert_eq!(rig.pipeline.pending_requests(), 0);
        assert_eq!(rig.pipeline.last_in_order_completed(), Some(0));

        let payloads: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                crate::session::SessionEvent::Result(r) => Some(r.payload),
                _ => None,
            })
            .collect();
        let shutter = payloads
            .iter()
            .position(|p| matches!(p, ResultPayload::Shutter { request_id: 0, .. }))
            .unwrap();
        let metadata = payloads
            .iter()
            .position(|p| matches!(p, ResultPayload::Metadata { request_id: 0, .. }))
            .unwrap();
        assert!(shutter < metadata);
        assert!(payloads.iter().any(|p| matches!(
            p,
            ResultPayload::Buffer {
                request_id: 0,
                stream_id: 0,
                ..
            }
        )));
    }

    #[test]
    fn test_nodes_are_set_up_in_execution_order() {
        let mut desc = chain(false, &["a", "b", "c"]);
        desc.nodes.reverse();
        let rig = Rig::new(desc, SimNodeFactory::new());
        rig.submit(0).unwrap();

        let setups: Vec<_> = rig
            .factory
            .log()
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Setup { node, .. } => Some(node),
                _ => None,
            })
            .collect();
        assert_eq!(setups, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_disabled_node_is_credited() {
        let factory = SimNodeFactory::new().with_behavior(
            "b",
            SimBehavior {
                disabled: true,
                ..Default::default()
            },
        );
        let rig = Rig::new(chain(false, &["a", "b", "c"]), factory);
        rig.submit(0).unwrap();
        assert_eq!(rig.run_all(), 2);
        assert_eq!(processing_done(&rig.events()), vec![0]);
    }

    #[test]
    fn test_failed_setup_is_skipped() {
        let factory = SimNodeFactory::new().with_behavior(
            "a",
            SimBehavior {
                fail_setup: true,
                ..Default::default()
            },
        );
        let rig = Rig::new(chain(false, &["a", "b"]), factory);
        rig.submit(0).unwrap();
        assert_eq!(rig.run_all(), 1);
        assert_eq!(rig.pipeline.pending_requests(), 0);
    }

    #[test]
    fn test_no_enabled_node_cancels() {
        let disabled = SimBehavior {
            disabled: true,
            ..Default::default()
        };
        let factory = SimNodeFactory::new()
            .with_behavior("a", disabled.clone())
            .with_behavior("b", disabled);
        let rig = Rig::new(chain(false, &["a", "b"]), factory);

        let err = rig.submit(0).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(rig.run_all(), 0);
        assert_eq!(rig.pipeline.pending_requests(), 0);
        assert_eq!(processing_done(&rig.events()), vec![0]);
    }

    #[test]
    fn test_submission_while_flushing_is_cancelled() {
        let rig = Rig::new(chain(false, &["a", "b"]), SimNodeFactory::new());
        rig.pipeline.set_flush_status(true);

        assert!(rig.submit(0).unwrap_err().is_cancelled());
        assert_eq!(rig.run_all(), 0);
        let results = rig.results();
        assert!(results.iter().any(|p| matches!(
            p,
            ResultPayload::Error {
                code: ErrorCode::Request,
                request_id: Some(0),
                ..
            }
        )));
        assert!(!results
            .iter()
            .any(|p| matches!(p, ResultPayload::Shutter { .. })));
        let flushed = rig
            .factory
            .log()
            .events()
            .into_iter()
            .filter(|e| matches!(e, SimEvent::Flush { request_id: 0, .. }))
            .count();
        assert_eq!(flushed, 2);
        assert_eq!(rig.pipeline.pending_requests(), 0);
    }

    #[test]
    fn test_scheduler_rejection_credits_unsent_nodes() {
        let mut scheduler = MockDeferredScheduler::new();
        scheduler
            .expect_add_deferred_node()
            .withf(|work| work.node == NodeId(0))
            .returning(|_| Ok(()));
        scheduler
            .expect_add_deferred_node()
            .withf(|work| work.node == NodeId(1))
            .returning(|_| Err(PipelineError::Scheduler("queue full".to_string())));
        scheduler.expect_dispatch_ready_nodes().times(1).return_const(());

        let (bridge, _session) = SessionBridge::new(4);
        let pipeline = build_with(
            chain(false, &["a", "b", "c"]),
            &SimNodeFactory::new(),
            test_config(),
            Seams {
                device: Arc::new(SimDeviceGroup::new()) as Arc<dyn DeviceGroup>,
                scheduler: Arc::new(scheduler),
                session: Arc::new(bridge),
            },
            None,
        );

        let err = pipeline.process_request(&request(0)).unwrap_err();
        assert!(matches!(err, PipelineError::Scheduler(_)));
        // Only node 0 is still owed a completion.
        assert_eq!(pipeline.pending_requests(), 1);
        pipeline.notify_node_metadata_done(0);
        pipeline.notify_node_request_done(0, NodeId(0));
        assert_eq!(pipeline.pending_requests(), 0);
    }

    #[test]
    fn test_slot_reuse_is_reported() {
        let config = crate::config::PipelineConfig {
            max_per_request_info: 2,
            request_queue_depth: 2,
            ..test_config()
        };
        let rig = Rig::with_config(chain(true, &["a"]), SimNodeFactory::new(), config);
        rig.submit(0).unwrap();
        rig.submit(1).unwrap();

        let err = rig.submit(2).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvariantViolation(InvariantViolation::SlotReuse {
                request_id: 2,
                slot: 0,
                previous: Some(0),
                ..
            })
        ));
        let report = rig.fatal.try_recv().unwrap();
        assert!(matches!(report.violation, InvariantViolation::SlotReuse { .. }));
        assert_eq!(rig.pipeline.pending_requests(), 2);
    }

    #[test]
    fn test_pending_fence_blocks_slot_reuse() {
        let rig = Rig::new(chain(true, &["a"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        rig.pipeline.register_request_fence(FenceHandle(7), 0).unwrap();
        rig.run_all();
        assert_eq!(rig.pipeline.pending_requests(), 0);

        assert!(rig.submit(8).is_err());
        assert!(rig.pipeline.remove_request_fence(FenceHandle(7), 0));
        assert!(!rig.pipeline.remove_request_fence(FenceHandle(7), 0));
        rig.submit(8).unwrap();
    }

    #[test]
    fn test_open_request_skips_initial_config() {
        let rig = Rig::new(chain(true, &["a"]), SimNodeFactory::new());
        rig.pipeline.open_request(0, 10, SyncMode::NoSync, 50).unwrap();
        rig.pipeline.open_request(1, 11, SyncMode::Sync, 50).unwrap();

        let opened: Vec<_> = rig
            .device
            .calls()
            .into_iter()
            .filter(|c| matches!(c, DeviceCall::OpenRequest { .. }))
            .collect();
        assert_eq!(
            opened,
            vec![DeviceCall::OpenRequest {
                sync_id: 11,
                mode: SyncMode::Sync,
                timeout_ms: 50
            }]
        );

        rig.pipeline.set_flush_status(true);
        assert!(rig
            .pipeline
            .open_request(2, 12, SyncMode::NoSync, 50)
            .unwrap_err()
            .is_cancelled());
    }

    #[test]
    fn test_offline_pipeline_never_opens_requests() {
        let rig = Rig::new(chain(false, &["a"]), SimNodeFactory::new());
        rig.pipeline.open_request(0, 0, SyncMode::NoSync, 50).unwrap();
        rig.pipeline.open_request(1, 1, SyncMode::NoSync, 50).unwrap();
        assert!(rig.device.calls().is_empty());
    }

    #[test]
    fn test_request_reacquires_released_resources() {
        let rig = Rig::new(chain(false, &["a"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        rig.run_all();
        rig.pipeline
            .release_resources(crate::types::DeactivateMode::DEFAULT)
            .unwrap();
        assert_eq!(rig.pipeline.status(), PipelineStatus::ResourcesReleased);

        rig.submit(1).unwrap();
        assert_eq!(rig.pipeline.status(), PipelineStatus::ResourcesAcquired);
    }
}
