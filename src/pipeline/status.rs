//! Pipeline lifecycle status and the legality rules that gate each operation.
//!
//! ```text
//! Uninitialized ─► Initialized ─► Finalized ─► ResourcesAcquired ◄──► ResourcesReleased
//!                                                     │
//!                                                     ▼
//!                                StreamOn ◄──► StreamOff / PartialStreamOn
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle status of a pipeline. Declaration order matches the progression
/// used by ordering comparisons (`>= Finalized` means "constructed").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum PipelineStatus {
    Uninitialized = 0,
    Initialized = 1,
    Finalized = 2,
    ResourcesReleased = 3,
    StreamOff = 4,
    ResourcesAcquired = 5,
    PartialStreamOn = 6,
    StreamOn = 7,
}

impl PipelineStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineStatus::Initialized,
            2 => PipelineStatus::Finalized,
            3 => PipelineStatus::ResourcesReleased,
            4 => PipelineStatus::StreamOff,
            5 => PipelineStatus::ResourcesAcquired,
            6 => PipelineStatus::PartialStreamOn,
            7 => PipelineStatus::StreamOn,
            _ => PipelineStatus::Uninitialized,
        }
    }

    /// Statuses from which node resources may be acquired.
    pub fn can_acquire(self) -> bool {
        matches!(
            self,
            PipelineStatus::Finalized
                | PipelineStatus::ResourcesReleased
                | PipelineStatus::PartialStreamOn
        )
    }

    /// Statuses from which node resources may be released.
    pub fn can_release(self) -> bool {
        matches!(
            self,
            PipelineStatus::ResourcesAcquired
                | PipelineStatus::Initialized
                | PipelineStatus::StreamOff
                | PipelineStatus::PartialStreamOn
        )
    }

    /// Whether any part of the device group is streaming.
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            PipelineStatus::StreamOn | PipelineStatus::PartialStreamOn
        )
    }

    /// Whether node resources are currently held.
    pub fn holds_resources(self) -> bool {
        matches!(
            self,
            PipelineStatus::ResourcesAcquired
                | PipelineStatus::PartialStreamOn
                | PipelineStatus::StreamOn
        )
    }

    /// Whether requests may be submitted.
    pub fn accepts_requests(self) -> bool {
        self >= PipelineStatus::Finalized
    }
}

/// Lock-free cell holding the current status.
///
/// Transitions that must not interleave (acquire/release, stream on/off) are
/// serialized by the orchestrator's resource lock; this cell only guarantees
/// that readers on other threads see a consistent value.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: PipelineStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    #[inline]
    pub fn get(&self) -> PipelineStatus {
        PipelineStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, status: PipelineStatus) -> PipelineStatus {
        PipelineStatus::from_u8(self.0.swap(status as u8, Ordering::AcqRel))
    }
}
