//! Resource acquire/release and the stream on/off state machine.
//!
//! Every transition here runs under the pipeline's resource lock. The
//! `*_locked` variants assume the caller already holds it.

use super::Pipeline;
use crate::pipeline::device::HwErrorType;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node::ResourceOwning;
use crate::pipeline::status::PipelineStatus;
use crate::pipeline::sync::{lock, WaitOutcome};
use crate::types::DeactivateMode;
use std::sync::atomic::Ordering;
use std::time::Duration;

impl Pipeline {
    /// Acquire every node's resources. A no-op if they are already held.
    pub fn acquire_resources(&self) -> PipelineResult<()> {
        let _guard = lock(&self.resource_lock);
        self.acquire_locked()
    }

    pub(super) fn acquire_locked(&self) -> PipelineResult<()> {
        let status = self.status.get();
        if status.holds_resources() && status != PipelineStatus::PartialStreamOn {
            return Ok(());
        }
        if !status.can_acquire() {
            return Err(PipelineError::InvalidState {
                operation: "acquire_resources",
                status,
            });
        }

        let mut acquired: Vec<&dyn ResourceOwning> = Vec::new();
        for node in self.graph.iter() {
            let Some(resources) = node.resources() else {
                continue;
            };
            if let Err(e) = resources.acquire_resources() {
                tracing::error!(
                    "{}: {} failed to acquire resources: {}",
                    self.ident,
                    node.identity(),
                    e
                );
                // Unwind in reverse so nothing stays half acquired.
                for owner in acquired.iter().rev() {
                    if let Err(release_err) = owner.release_resources(DeactivateMode::DEFAULT) {
                        tracing::warn!(
                            "{}: release during acquire unwind failed: {}",
                            self.ident,
                            release_err
                        );
                    }
                }
                return Err(e);
            }
            acquired.push(resources);
        }

        if status != PipelineStatus::PartialStreamOn {
            self.status.set(PipelineStatus::ResourcesAcquired);
        }
        tracing::debug!(
            "{}: resources acquired on {} nodes",
            self.ident,
            acquired.len()
        );
        Ok(())
    }

    /// Release every node's resources, keeping the first error.
    pub fn release_resources(&self, mode: DeactivateMode) -> PipelineResult<()> {
        let _guard = lock(&self.resource_lock);
        self.release_locked(mode)
    }

    fn release_locked(&self, mode: DeactivateMode) -> PipelineResult<()> {
        let status = self.status.get();
        if !status.can_release() {
            return Err(PipelineError::InvalidState {
                operation: "release_resources",
                status,
            });
        }

        let mut first_error = None;
        for node in self.graph.iter() {
            let Some(resources) = node.resources() else {
                continue;
            };
            if let Err(e) = resources.release_resources(mode) {
                tracing::error!(
                    "{}: {} failed to release resources: {}",
                    self.ident,
                    node.identity(),
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        if !mode.contains(DeactivateMode::SENSOR_STANDBY) {
            self.status.set(PipelineStatus::ResourcesReleased);
        }
        tracing::debug!("{}: resources released ({:?})", self.ident, mode);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start streaming.
    ///
    /// Realtime pipelines wait until every submitted request has applied its
    /// configuration before the device group streams on. Any failure other
    /// than an abort unlinks and releases what this call set up.
    pub fn stream_on(&self) -> PipelineResult<()> {
        let _guard = lock(&self.resource_lock);

        if self.realtime {
            self.link_device_group()?;
        }

        if let Err(e) = self.acquire_locked() {
            self.unlink_device_group();
            return Err(e);
        }

        if self.status.get() == PipelineStatus::StreamOn {
            return Ok(());
        }
        self.last_shutter_timestamp.store(0, Ordering::Release);

        match self.stream_on_locked() {
            Ok(()) => {
                tracing::info!("{}: streaming", self.ident);
                Ok(())
            }
            Err(PipelineError::Cancelled) => {
                tracing::info!("{}: stream on aborted", self.ident);
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                tracing::error!("{}: stream on failed: {}", self.ident, e);
                self.initial_config_pending.store(true, Ordering::Release);
                self.unlink_device_group();
                if self.status.get().can_release() {
                    if let Err(release_err) = self.release_locked(DeactivateMode::DEFAULT) {
                        tracing::warn!(
                            "{}: release after failed stream on: {}",
                            self.ident,
                            release_err
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn stream_on_locked(&self) -> PipelineResult<()> {
        if self.realtime {
            self.wait_for_config_done()?;
        }

        self.controller.stream_on()?;
        self.status.set(PipelineStatus::StreamOn);
        self.stream_on_done.update(|state| state.done = true);

        for node in self.graph.iter() {
            let Some(streaming) = node.streaming() else {
                continue;
            };
            if let Err(e) = streaming.stream_on() {
                tracing::error!(
                    "{}: {} failed to stream on: {}",
                    self.ident,
                    node.identity(),
                    e
                );
                if let Err(off_err) = self.stream_off_locked(DeactivateMode::DEFAULT) {
                    tracing::warn!("{}: stream off after node failure: {}", self.ident, off_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn wait_for_config_done(&self) -> PipelineResult<()> {
        if self.config_done_nodes == 0 {
            return Ok(());
        }

        let timeout = Duration::from_millis(self.ctx.config.stream_on_timeout_ms);
        let (mut state, outcome) = self.config_done.wait_while(timeout, |state| {
            let blocked = !state.aborted && state.count < state.expected;
            state.waiting = blocked;
            blocked
        });
        state.waiting = false;

        if state.aborted {
            state.aborted = false;
            return Err(PipelineError::Cancelled);
        }

        if let Err(timed_out) = outcome {
            let (count, expected) = (state.count, state.expected);
            drop(state);
            tracing::error!(
                "{}: only {} of {} requests config done after {:?}",
                self.ident,
                count,
                expected,
                timed_out.waited
            );
            self.dump_state();
            if self.ctx.config.enable_watchdog_recovery {
                self.send_error_notification(HwErrorType::Recovery, None);
            }
            return Err(PipelineError::TimedOut("config done before stream on"));
        }
        Ok(())
    }

    /// Stop streaming. A no-op unless the pipeline is (partially) streaming.
    pub fn stream_off(&self, mode: DeactivateMode) -> PipelineResult<()> {
        let _guard = lock(&self.resource_lock);
        self.stream_off_locked(mode)
    }

    fn stream_off_locked(&self, mut mode: DeactivateMode) -> PipelineResult<()> {
        if !self.status.get().is_streaming() {
            return Ok(());
        }

        for node in self.graph.iter() {
            if let Some(streaming) = node.streaming() {
                if let Err(e) = streaming.stream_off(mode) {
                    tracing::error!(
                        "{}: {} failed to stream off: {}",
                        self.ident,
                        node.identity(),
                        e
                    );
                }
            }
        }

        if mode.0 == 0 {
            return Ok(());
        }

        let result = self.controller.stream_off(mode);
        if let Err(e) = &result {
            tracing::error!("{}: device stream off failed, forcing full deactivation: {}", self.ident, e);
            mode = DeactivateMode::DEFAULT;
        }

        self.config_done.update(|state| {
            state.count = 0;
            state.expected = 0;
        });
        self.initial_config_pending.store(true, Ordering::Release);
        match self.last_submitted.get() {
            Some(id) => self.last_flush_request_id.set(id),
            None => self.last_flush_request_id.clear(),
        }
        self.has_flush_occurred.store(false, Ordering::Release);

        let next = if mode.is_partial() {
            PipelineStatus::PartialStreamOn
        } else {
            PipelineStatus::StreamOff
        };
        self.status.set(next);
        self.stream_on_done.update(|state| state.done = false);

        if let Err(e) = self.release_locked(mode) {
            tracing::warn!("{}: release during stream off failed: {}", self.ident, e);
        }
        if mode.contains(DeactivateMode::UNLINK_PIPELINE) {
            self.unlink_device_group();
        }

        tracing::info!("{}: stream off ({:?}) -> {:?}", self.ident, mode, self.status.get());
        result
    }

    /// Abort a stream-on blocked on config done. No effect if nothing waits.
    pub fn abort_config_done(&self) {
        self.config_done.update(|state| {
            if state.waiting {
                state.aborted = true;
            }
        });
    }

    /// Block until stream-on completes, or until the next explicit wakeup.
    pub fn wait_until_stream_on_done(&self) -> WaitOutcome {
        let timeout = Duration::from_millis(self.ctx.config.stream_on_done_timeout_ms);
        let start = self.stream_on_done.lock().wakeups;
        let (_state, outcome) = self
            .stream_on_done
            .wait_while(timeout, |state| !state.done && state.wakeups == start);
        outcome
    }

    /// Wake every thread in [`Pipeline::wait_until_stream_on_done`].
    pub fn notify_stream_on_wait(&self) {
        self.stream_on_done.update(|state| state.wakeups += 1);
    }
}
