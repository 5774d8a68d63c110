//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod harness;

use capture_pipeline::session::{ResultPayload, SessionEvent};
use capture_pipeline::RequestId;
use std::time::Duration;

/// Upper bound for anything the worker threads should finish quickly
pub fn test_timeout() -> Duration {
    Duration::from_millis(500)
}

/// Result payloads out of a list of session events
pub fn payloads(events: &[SessionEvent]) -> Vec<ResultPayload> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Result(result) => Some(result.payload.clone()),
            _ => None,
        })
        .collect()
}

/// In-order completion reports out of a list of session events
pub fn processing_done(events: &[SessionEvent]) -> Vec<RequestId> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::ProcessingDone { last_in_order, .. } => Some(*last_in_order),
            _ => None,
        })
        .collect()
}

/// Count payloads matching a predicate
pub fn count(payloads: &[ResultPayload], pred: impl Fn(&ResultPayload) -> bool) -> usize {
    payloads.iter().filter(|p| pred(p)).count()
}
