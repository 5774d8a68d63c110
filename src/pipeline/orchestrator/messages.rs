//! Hardware messages: frame boundaries, shutter and SOF results, the SOF
//! watchdog and hardware error translation.

use super::{now_ns, Pipeline};
use crate::pipeline::device::{ErrorMessage, FrameMessage, HwErrorType, HwMessage, TimestampType};
use crate::pipeline::error::InvariantViolation;
use crate::pipeline::metadata::{MetaTag, MetaValue, MetadataPoolSet};
use crate::pipeline::status::PipelineStatus;
use crate::session::{ErrorCode, ResultPayload};
use crate::types::RequestId;
use std::sync::atomic::Ordering;

const NS_PER_SECOND: u64 = 1_000_000_000;

impl Pipeline {
    /// Entry point for the device group's message thread.
    pub fn handle_hw_message(&self, message: HwMessage) {
        match message {
            HwMessage::Frame(frame) => self.handle_frame_message(&frame),
            HwMessage::Error(error) => self.handle_error_message(&error),
        }
    }

    fn can_process_hw_messages(&self) -> bool {
        !self.slots.is_empty()
            && self.status.get() != PipelineStatus::ResourcesReleased
            && self.pending_requests() > 0
            && !self.is_flushing()
    }

    fn handle_frame_message(&self, message: &FrameMessage) {
        if !self.can_process_hw_messages() {
            tracing::trace!(
                "{}: dropping frame {} ({:?})",
                self.ident,
                message.frame_count,
                self.status.get()
            );
            return;
        }

        let request_id = message
            .sync_id
            .and_then(|sync_id| self.slots.lookup_sync_id(sync_id));

        if let Some(id) = request_id {
            let main = self.ctx.metadata.main.slot(id);
            if main.is_published(MetaTag::SensorExposureTime) {
                if let Some(exposure) = main.get(MetaTag::SensorExposureTime).and_then(|v| v.as_u64()) {
                    self.ctx.session.update_current_exposure_time(exposure);
                }
            }

            if message.timestamp_type == TimestampType::QTimer {
                let internal = self.ctx.metadata.internal.slot(id);
                let value = MetaValue::Timestamp {
                    timestamp: message.timestamp,
                    frame_id: message.frame_count,
                };
                if let Err(e) = internal
                    .set(MetaTag::QTimerTimestamp, value)
                    .and_then(|_| internal.publish(MetaTag::QTimerTimestamp))
                {
                    tracing::warn!("{}: could not publish QTimer timestamp: {}", self.ident, e);
                }
            }
        }

        if !message.notify {
            self.check_for_recovery(request_id.is_some());
            return;
        }

        self.send_sof_notification(request_id, message);
        for node in self.graph.iter() {
            node.notify_hw_message(request_id, message);
        }

        let Some(id) = request_id else {
            tracing::debug!(
                "{}: frame {} has no matching request",
                self.ident,
                message.frame_count
            );
            return;
        };

        let main = self.ctx.metadata.main.slot(id);
        let capture = if main.is_published(MetaTag::SensorExposureStartTime) {
            main.get(MetaTag::SensorExposureStartTime).and_then(|v| v.as_u64())
        } else {
            None
        };
        let capture = match capture {
            Some(ts) => ts,
            None => {
                let av_timer = MetadataPoolSet::read_u64(
                    self.ctx.metadata.input.as_ref(),
                    id,
                    MetaTag::UseAvTimer,
                ) == Some(1);
                if self.ctx.config.use_hardware_timestamps || av_timer {
                    message.timestamp
                } else {
                    now_ns()
                }
            }
        };
        let capture = if capture == 0 { now_ns() } else { capture };

        self.dispatch_shutter(id, capture);
    }

    /// Emit the shutter for `request_id` and publish its capture timestamp.
    pub(super) fn dispatch_shutter(&self, request_id: RequestId, capture: u64) {
        let slot = self.slots.slot(request_id);
        if !slot.holds(request_id) {
            tracing::warn!("{}: shutter for unknown request {}", self.ident, request_id);
            return;
        }
        let recovering = self.is_triggering_recovery();

        let last = self.last_shutter.get();
        let past_flush_point = match (last, self.last_flush_request_id.get()) {
            (Some(last), Some(flush)) => last > flush,
            _ => true,
        };
        if let Some(last) = last {
            if request_id != last + 1 && past_flush_point {
                let violation = InvariantViolation::ShutterOutOfOrder {
                    expected: last + 1,
                    got: request_id,
                };
                if recovering {
                    tracing::warn!("{}: {} during recovery", self.ident, violation);
                } else {
                    self.report_violation(violation);
                }
            }
        }
        self.last_shutter.set(request_id);

        let batches = slot.num_batched_frames();
        if batches > 1 {
            let fps = MetadataPoolSet::read_u64(self.ctx.metadata.usecase.as_ref(), 0, MetaTag::UsecaseFps)
                .filter(|&fps| fps > 0);
            if let Some(fps) = fps {
                slot.set_batch_frame_interval_ns(NS_PER_SECOND / fps);
            }
        }

        // Frames up to the flush point may land out of time order.
        let flush_exempt = self.has_flush_occurred.load(Ordering::Acquire) && !past_flush_point;
        let previous = self.last_shutter_timestamp.swap(capture, Ordering::AcqRel);
        if previous != 0 && capture < previous && !flush_exempt {
            let violation = InvariantViolation::ShutterTimestampRegression {
                request_id,
                previous,
                current: capture,
            };
            if recovering {
                tracing::warn!("{}: {} during recovery", self.ident, violation);
            } else {
                self.report_violation(violation);
            }
        }

        let main = self.ctx.metadata.main.slot(request_id);
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

        if !recovering {
            let interval = slot.batch_frame_interval_ns();
            let priv_data = slot.priv_data();
            for (index, sequence_id) in slot.sequence_ids().into_iter().enumerate() {
                self.notify(
                    priv_data.clone(),
                    ResultPayload::Shutter {
                        request_id,
                        sequence_id,
                        timestamp: capture + interval * index as u64,
                    },
                );
            }
        }

        // Metadata finished first: this frame ran slower than the nodes.
        if slot.is_metadata_ready() {
            slot.set_slowdown();
        }
        slot.set_sof_dispatched();

        if !slot.try_mark_metadata_ready() {
            self.process_metadata_request_done(request_id);
        }
    }

    fn send_sof_notification(&self, request_id: Option<RequestId>, message: &FrameMessage) {
        if self.is_triggering_recovery() {
            return;
        }
        let (priv_data, sequence_id) = match request_id {
            Some(id) => {
                let slot = self.slots.slot(id);
                (slot.priv_data(), slot.first_sequence_id())
            }
            None => (None, None),
        };
        self.notify(
            priv_data,
            ResultPayload::Sof {
                frame_num: message.frame_count,
                timestamp: message.timestamp,
                sequence_id,
            },
        );
    }

    /// SOF watchdog: counts boundaries with no matching request while
    /// requests are outstanding.
    fn check_for_recovery(&self, valid: bool) {
        if valid || self.is_flushing() || self.ctx.session.is_result_holder_empty() {
            self.invalid_sof_counter.store(0, Ordering::Release);
            return;
        }

        let count = self.invalid_sof_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let threshold = (2 * self.ctx.session.current_request_queue_depth()).max(1);
        if count < threshold {
            return;
        }
        self.invalid_sof_counter.store(0, Ordering::Release);

        if self.slots.take_any_slowdown() {
            tracing::info!(
                "{}: {} unmatched frames, requests are running slow; not recovering",
                self.ident,
                count
            );
            return;
        }

        tracing::warn!(
            "{}: {} consecutive frames without a matching request",
            self.ident,
            count
        );
        if self.ctx.config.enable_watchdog_recovery && !self.is_triggering_recovery() {
            self.send_error_notification(HwErrorType::Recovery, None);
        }
    }

    fn handle_error_message(&self, message: &ErrorMessage) {
        if self.is_triggering_recovery() {
            tracing::debug!("{}: recovery in progress, ignoring {:?}", self.ident, message);
            return;
        }

        let request_id = message
            .sync_id
            .and_then(|sync_id| self.slots.lookup_sync_id(sync_id));
        tracing::error!(
            "{}: hardware error {:?} on device {} (sync {:?}, request {:?})",
            self.ident,
            message.error_type,
            message.device_handle,
            message.sync_id,
            request_id
        );
        self.dump_state();
        self.send_error_notification(message.error_type, request_id);
    }

    /// Translate a hardware error into session error results.
    pub(super) fn send_error_notification(&self, error_type: HwErrorType, request_id: Option<RequestId>) {
        let code = match error_type {
            HwErrorType::Device => ErrorCode::Device,
            HwErrorType::Request => ErrorCode::Request,
            HwErrorType::Buffer => ErrorCode::Buffer,
            HwErrorType::SofFreeze | HwErrorType::Recovery => {
                if self.is_flushing() {
                    tracing::info!("{}: flushing, recovery not requested", self.ident);
                    return;
                }
                ErrorCode::Recovery { full: false }
            }
            HwErrorType::FullRecovery => ErrorCode::Recovery { full: true },
            HwErrorType::Unknown(raw) => {
                tracing::warn!("{}: unknown hardware error type {}", self.ident, raw);
                return;
            }
        };

        let Some(id) = request_id else {
            if !error_type.allows_missing_request() {
                tracing::warn!(
                    "{}: {:?} without a request, not reported",
                    self.ident,
                    error_type
                );
                return;
            }
            self.notify(
                None,
                ResultPayload::Error {
                    code,
                    request_id: None,
                    sequence_id: None,
                    stream_id: None,
                },
            );
            return;
        };

        let slot = self.slots.slot(id);
        if !slot.holds(id) {
            tracing::warn!("{}: error for unknown request {}", self.ident, id);
            return;
        }
        let priv_data = slot.priv_data();
        for sequence_id in slot.sequence_ids() {
            self.notify(
                priv_data.clone(),
                ResultPayload::Error {
                    code,
                    request_id: Some(id),
                    sequence_id: Some(sequence_id),
                    stream_id: None,
                },
            );
        }
    }
}
