//! Per-node completion callbacks and request retirement.
//!
//! Completions for different nodes of the same request race on the slot's
//! atomic counters; the caller whose increment reaches the node count is the
//! one that retires the request. Retirement advances the in-order cursor:
//! directly when running normally, by forward scan while flushing.

use super::{now_ns, Pipeline};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::NodeId;
use crate::pipeline::metadata::{MetaTag, MetaValue};
use crate::pipeline::sync::lock;
use crate::session::{ErrorCode, ResultPayload};
use crate::types::{BufferInfo, RequestId, SequenceId};
use std::sync::atomic::Ordering;
use std::time::Duration;

impl Pipeline {
    /// A node finished every piece of work for `request_id`.
    pub fn notify_node_request_done(&self, request_id: RequestId, node: NodeId) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) || slot.is_retired() {
            tracing::warn!(
                "{}: late request-done from {:?} for request {}",
                self.ident,
                node,
                request_id
            );
            return;
        }

        let done = slot.node_request_done();
        tracing::trace!(
            "{}: {:?} done with request {} ({}/{})",
            self.ident,
            node,
            request_id,
            done,
            self.node_count
        );
        if done == self.node_count {
            self.request_retired(request_id);
        }
    }

    /// A node published all of its metadata for `request_id`.
    pub fn notify_node_metadata_done(&self, request_id: RequestId) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            return;
        }
        if slot.node_metadata_done() != self.node_count {
            return;
        }

        // Whichever of shutter and metadata-done comes second emits the metadata.
        if slot.try_mark_metadata_ready() {
            tracing::trace!(
                "{}: metadata for request {} ready before its shutter",
                self.ident,
                request_id
            );
        } else {
            self.process_metadata_request_done(request_id);
        }
    }

    /// A node published its early subset of metadata for `request_id`.
    pub fn notify_node_partial_metadata_done(&self, request_id: RequestId) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            return;
        }
        if slot.node_partial_metadata_done() != self.node_count {
            return;
        }
        if !self.ctx.config.partial_metadata_enabled || slot.is_in_error() {
            return;
        }

        let priv_data = slot.priv_data();
        for sequence_id in slot.sequence_ids() {
            self.notify(
                priv_data.clone(),
                ResultPayload::PartialMetadata {
                    request_id,
                    sequence_id,
                },
            );
        }
    }

    /// A config-done node applied the request's configuration to hardware.
    pub fn notify_node_config_done(&self, request_id: RequestId) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            return;
        }
        if slot.node_config_done() == self.config_done_nodes {
            self.config_done_reached(request_id);
        }
    }

    pub(super) fn config_done_reached(&self, request_id: RequestId) {
        let count = self.config_done.update(|state| {
            state.count += 1;
            state.count
        });
        tracing::trace!(
            "{}: config done for request {} ({} total)",
            self.ident,
            request_id,
            count
        );
    }

    /// Emit metadata results, or metadata errors for a request in error.
    pub(super) fn process_metadata_request_done(&self, request_id: RequestId) {
        let slot = self.slots.slot(request_id);
        let priv_data = slot.priv_data();
        let sequence_ids = slot.sequence_ids();

        if slot.is_in_error() {
            for sequence_id in sequence_ids {
                self.notify(
                    priv_data.clone(),
                    ResultPayload::Error {
                        code: ErrorCode::Result,
                        request_id: Some(request_id),
                        sequence_id: Some(sequence_id),
                        stream_id: None,
                    },
                );
            }
            return;
        }

        let main = self.ctx.metadata.main.slot(request_id);
        let published = main.is_published(MetaTag::SensorTimestamp);
        let capture = if published {
            main.get(MetaTag::SensorTimestamp)
                .and_then(|v| v.as_u64())
                .unwrap_or_else(now_ns)
        } else {
            now_ns()
        };
        if !published {
            if let Err(e) = main
                .set(MetaTag::SensorTimestamp, MetaValue::U64(capture))
                .and_then(|_| main.publish(MetaTag::SensorTimestamp))
            {
                tracing::warn!(
                    "{}: could not publish sensor timestamp for request {}: {}",
                    self.ident,
                    request_id,
                    e
                );
            }
        }

        let interval = slot.batch_frame_interval_ns();
        for (index, sequence_id) in sequence_ids.into_iter().enumerate() {
            self.notify(
                priv_data.clone(),
                ResultPayload::Metadata {
                    request_id,
                    sequence_id,
                    timestamp: capture + interval * index as u64,
                },
            );
        }
    }

    /// An output buffer on a sink port is ready.
    pub fn sink_port_fence_signaled(
        &self,
        stream_id: u32,
        sequence_id: SequenceId,
        request_id: RequestId,
        buffer: BufferInfo,
    ) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            tracing::warn!(
                "{}: buffer for stream {} of unknown request {}",
                self.ident,
                stream_id,
                request_id
            );
            return;
        }
        slot.buffer_done();
        self.notify(
            slot.priv_data(),
            ResultPayload::Buffer {
                request_id,
                stream_id,
                sequence_id,
                buffer,
            },
        );
    }

    /// An output buffer on a sink port failed.
    pub fn sink_port_fence_error_signaled(
        &self,
        stream_id: u32,
        sequence_id: SequenceId,
        request_id: RequestId,
        buffer: BufferInfo,
    ) {
        if self.is_flushing() {
            tracing::info!(
                "{}: buffer {:?} on stream {} of request {} dropped by flush",
                self.ident,
                buffer.handle,
                stream_id,
                request_id
            );
        } else {
            tracing::error!(
                "{}: buffer {:?} on stream {} of request {} failed",
                self.ident,
                buffer.handle,
                stream_id,
                request_id
            );
        }

        let slot = self.slots.slot(request_id);
        let priv_data = if slot.holds(request_id) {
            slot.buffer_done();
            slot.priv_data()
        } else {
            None
        };
        self.notify(
            priv_data,
            ResultPayload::Error {
                code: ErrorCode::Buffer,
                request_id: Some(request_id),
                sequence_id: Some(sequence_id),
                stream_id: Some(stream_id),
            },
        );
    }

    /// Every node is done with `request_id`.
    pub(super) fn request_retired(&self, request_id: RequestId) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            return;
        }
        slot.retire();
        // Saturates at zero.
        self.live_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok();
        self.last_completed.fetch_max(request_id);
        tracing::debug!("{}: request {} retired", self.ident, request_id);

        self.advance_in_order();

        if self.live_pending.load(Ordering::Acquire) == 0 {
            self.all_done.notify_all();
        }
    }

    fn advance_in_order(&self) {
        let _guard = lock(&self.completion_lock);
        let Some(last_completed) = self.last_completed.get() else {
            return;
        };

        if !self.is_flushing() {
            let previous = self.last_in_order.fetch_max(last_completed);
            if previous.map_or(true, |p| p < last_completed) {
                self.ctx
                    .session
                    .notify_processing_done(self.ctx.pipeline_index, last_completed);
            }
            return;
        }

        // Under flush completions race; only advance across a contiguous retired run.
        let start = match self.last_in_order.get() {
            Some(id) => id + 1,
            None => match self.first_submitted.get() {
                Some(first) => first,
                None => return,
            },
        };
        let Some(end) = self.last_submitted.get() else {
            return;
        };

        let mut advanced = None;
        let mut id = start;
        while id <= end {
            let slot = self.slots.slot(id);
            if slot.holds(id) && !slot.is_retired() {
                break;
            }
            advanced = Some(id);
            id += 1;
        }

        if let Some(id) = advanced {
            self.last_in_order.set(id);
            tracing::debug!("{}: in-order completion advanced to {} under flush", self.ident, id);
            self.ctx
                .session
                .notify_processing_done(self.ctx.pipeline_index, id);
        }
    }

    /// Block until every submitted request has retired.
    pub fn wait_for_all_nodes_request(&self) -> PipelineResult<()> {
        let timeout = Duration::from_millis(self.ctx.config.nodes_request_done_timeout_ms);
        let (guard, outcome) = self
            .all_done
            .wait_while(timeout, |_| self.live_pending.load(Ordering::Acquire) != 0);
        drop(guard);

        match outcome {
            Ok(_) => Ok(()),
            Err(timed_out) => {
                tracing::warn!(
                    "{}: {} requests still pending after {:?}",
                    self.ident,
                    self.pending_requests(),
                    timed_out.waited
                );
                self.dump_state();
                Err(PipelineError::TimedOut("all node requests"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{build_with, chain, processing_done, request, test_config, Rig, Seams};
    use super::*;
    use crate::pipeline::device::DeviceGroup;
    use crate::pipeline::scheduler::QueueScheduler;
    use crate::session::{MockSessionNotifier, SessionEvent};
    use crate::sim::{run_work, SimBehavior, SimDeviceGroup, SimNodeFactory};
    use mockall::predicate::eq;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_metadata_waits_for_shutter() {
        let rig = Rig::new(chain(true, &["a", "b"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        rig.submit(1).unwrap();

        rig.run_request(0);
        let before = rig.results();
        assert!(before
            .iter()
            .all(|p| !matches!(p, ResultPayload::Metadata { .. } | ResultPayload::Shutter { .. })));
        assert!(before
            .iter()
            .any(|p| matches!(p, ResultPayload::Buffer { request_id: 0, .. })));

        assert!(rig.frame(Some(0), 1, 1_000));
        let after = rig.results();
        assert_eq!(
            after,
            vec![
                ResultPayload::Sof {
                    frame_num: 1,
                    timestamp: 1_000,
                    sequence_id: Some(0)
                },
                ResultPayload::Shutter {
                    request_id: 0,
                    sequence_id: 0,
                    timestamp: 1_000
                },
                ResultPayload::Metadata {
                    request_id: 0,
                    sequence_id: 0,
                    timestamp: 1_000
                },
            ]
        );
        // Metadata beat the shutter, so the frame is marked as running slow.
        assert!(rig.pipeline.slots.slot(0).has_slowdown());
    }

    #[test]
    fn test_shutter_first_then_metadata() {
        let rig = Rig::new(chain(true, &["a"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        assert!(rig.frame(Some(0), 1, 5_000));
        assert!(!rig
            .results()
            .iter()
            .any(|p| matches!(p, ResultPayload::Metadata { .. })));

        rig.run_all();
        let metadata: Vec<_> = rig
            .results()
            .into_iter()
            .filter(|p| matches!(p, ResultPayload::Metadata { .. }))
            .collect();
        assert_eq!(
            metadata,
            vec![ResultPayload::Metadata {
                request_id: 0,
                sequence_id: 0,
                timestamp: 5_000
            }]
        );
        assert!(!rig.pipeline.slots.slot(0).has_slowdown());
    }

    #[test]
    fn test_errored_request_reports_result_error() {
        let rig = Rig::new(chain(false, &["a"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        rig.pipeline.trigger_request_error(0);
        rig.run_all();

        let results = rig.results();
        assert!(!results
            .iter()
            .any(|p| matches!(p, ResultPayload::Metadata { .. })));
        assert!(results.iter().any(|p| matches!(
            p,
            ResultPayload::Error {
                code: ErrorCode::Result,
                request_id: Some(0),
                ..
            }
        )));
    }

    #[test]
    fn test_in_order_tracks_highest_completed() {
        let rig = Rig::new(chain(true, &["a"]), SimNodeFactory::new());
        for id in 0..3 {
            rig.submit(id).unwrap();
        }
        rig.run_request(1);
        rig.run_request(0);
        rig.run_request(2);
        assert_eq!(processing_done(&rig.events()), vec![1, 2]);
        assert_eq!(rig.pipeline.last_in_order_completed(), Some(2));
    }

    #[test]
    fn test_in_order_under_flush_waits_for_gaps() {
        let rig = Rig::new(chain(true, &["a"]), SimNodeFactory::new());
        for id in 0..3 {
            rig.submit(id).unwrap();
        }
        rig.pipeline.set_flush_status(true);

        rig.run_request(2);
        rig.run_request(1);
        assert!(processing_done(&rig.events()).is_empty());
        assert_eq!(rig.pipeline.last_in_order_completed(), None);

        rig.run_request(0);
        assert_eq!(processing_done(&rig.events()), vec![2]);
        assert_eq!(rig.pipeline.last_in_order_completed(), Some(2));
    }

    #[test]
    fn test_processing_done_reported_once_per_advance() {
        let mut session = MockSessionNotifier::new();
        session.expect_notify_result().return_const(());
        session
            .expect_notify_processing_done()
            .with(eq(0), eq(0))
            .times(1)
            .return_const(());
        session
            .expect_notify_processing_done()
            .with(eq(0), eq(1))
            .times(1)
            .return_const(());

        let (scheduler, work) = QueueScheduler::new();
        let pipeline = build_with(
            chain(false, &["a", "b"]),
            &SimNodeFactory::new(),
            test_config(),
            Seams {
                device: Arc::new(SimDeviceGroup::new()) as Arc<dyn DeviceGroup>,
                scheduler: Arc::new(scheduler),
                session: Arc::new(session),
            },
            None,
        );

        for id in 0..2 {
            pipeline.process_request(&request(id)).unwrap();
        }
        for event in work.try_iter() {
            run_work(&pipeline, event);
        }
        // Duplicate completions change nothing.
        pipeline.notify_node_request_done(1, NodeId(0));
        assert_eq!(pipeline.pending_requests(), 0);
    }

    #[test]
    fn test_late_request_done_is_ignored() {
        let rig = Rig::new(chain(false, &["a"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        rig.run_all();
        assert_eq!(processing_done(&rig.events()), vec![0]);

        rig.pipeline.notify_node_request_done(0, NodeId(0));
        rig.pipeline.notify_node_request_done(9, NodeId(0));
        assert_eq!(rig.pipeline.pending_requests(), 0);
        assert!(processing_done(&rig.events()).is_empty());
    }

    #[test]
    fn test_wait_for_all_nodes_request() {
        let rig = Rig::new(chain(false, &["a"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        assert!(matches!(
            rig.pipeline.wait_for_all_nodes_request(),
            Err(PipelineError::TimedOut(_))
        ));

        rig.run_all();
        rig.pipeline.wait_for_all_nodes_request().unwrap();
    }

    #[test]
    fn test_wait_released_by_worker_thread() {
        let rig = Rig::new(chain(false, &["a", "b"]), SimNodeFactory::new());
        rig.submit(0).unwrap();

        let pipeline = Arc::clone(&rig.pipeline);
        let work = rig.work.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            for event in work.try_iter() {
                run_work(&pipeline, event);
            }
        });

        rig.pipeline.wait_for_all_nodes_request().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn test_partial_metadata() {
        let config = crate::config::PipelineConfig {
            partial_metadata_enabled: true,
            ..test_config()
        };
        let rig = Rig::with_config(chain(false, &["a", "b"]), SimNodeFactory::new(), config);
        rig.submit(0).unwrap();
        rig.submit(1).unwrap();
        rig.pipeline.trigger_request_error(1);
        rig.run_all();

        let partial: Vec<_> = rig
            .results()
            .into_iter()
            .filter(|p| matches!(p, ResultPayload::PartialMetadata { .. }))
            .collect();
        assert_eq!(
            partial,
            vec![ResultPayload::PartialMetadata {
                request_id: 0,
                sequence_id: 0
            }]
        );
    }

    #[test]
    fn test_partial_metadata_disabled_by_default() {
        let rig = Rig::new(chain(false, &["a"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        rig.run_all();
        assert!(!rig
            .results()
            .iter()
            .any(|p| matches!(p, ResultPayload::PartialMetadata { .. })));
    }

    #[test]
    fn test_config_done_counted_per_request() {
        let factory = SimNodeFactory::new().with_behavior(
            "a",
            SimBehavior {
                notifies_config_done: true,
                ..Default::default()
            },
        );
        let rig = Rig::new(chain(true, &["a", "b"]), factory);
        rig.submit(0).unwrap();
        rig.submit(1).unwrap();
        rig.run_request(0);
        assert_eq!(rig.pipeline.config_done.lock().count, 1);
        rig.run_all();
        assert_eq!(rig.pipeline.config_done.lock().count, 2);
        assert_eq!(rig.pipeline.config_done.lock().expected, 2);
    }

    #[test]
    fn test_buffer_error_for_unknown_request() {
        let rig = Rig::new(chain(false, &["a"]), SimNodeFactory::new());
        rig.pipeline
            .sink_port_fence_error_signaled(3, 40, 12, BufferInfo::default());
        let events = rig.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::Result(result) => {
                assert!(result.priv_data.is_none());
                assert_eq!(
                    result.payload,
                    ResultPayload::Error {
                        code: ErrorCode::Buffer,
                        request_id: Some(12),
                        sequence_id: Some(40),
                        stream_id: Some(3),
                    }
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_flush_turns_buffers_into_errors() {
        let rig = Rig::new(chain(true, &["a"]), SimNodeFactory::new());
        rig.submit(0).unwrap();
        rig.pipeline.set_flush_status(true);
        rig.run_all();

        let results = rig.results();
        assert!(!results
            .iter()
            .any(|p| matches!(p, ResultPayload::Buffer { .. })));
        assert!(results.iter().any(|p| matches!(
            p,
            ResultPayload::Error {
                code: ErrorCode::Buffer,
                stream_id: Some(0),
                ..
            }
        )));
    }

    proptest! {
        #[test]
        fn prop_flush_completions_advance_over_contiguous_prefix(
            order in Just((0u64..8).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let rig = Rig::new(chain(true, &["a", "b"]), SimNodeFactory::new());
            for id in 0..8 {
                rig.submit(id).unwrap();
            }
            rig.pipeline.set_flush_status(true);

            let mut done = [false; 8];
            let mut reported = Vec::new();
            for id in order {
                rig.run_request(id);
                done[id as usize] = true;
                let prefix = done.iter().take_while(|d| **d).count() as u64;
                let expected = prefix.checked_sub(1);
                prop_assert_eq!(rig.pipeline.last_in_order_completed(), expected);
                reported.extend(processing_done(&rig.events()));
            }
            prop_assert!(reported.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(reported.last(), Some(&7));
        }
    }
}
