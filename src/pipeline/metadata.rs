//! Metadata pool seam.
//!
//! A pool is a keyed, versioned property store with one slot per in-flight
//! request. The pipeline reads and publishes a handful of well-known tags; it
//! never interprets anything else a node writes.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::sync::lock;
use crate::types::RequestId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Tags the pipeline itself reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaTag {
    /// Capture timestamp of the first batched frame, nanoseconds.
    SensorTimestamp,
    /// Higher-resolution exposure start time, preferred for the shutter.
    SensorExposureStartTime,
    /// Exposure duration in nanoseconds.
    SensorExposureTime,
    /// Usecase frame rate.
    UsecaseFps,
    /// `1` selects hardware timestamps for this request.
    UseAvTimer,
    /// Raw hardware timer value of the frame boundary.
    QTimerTimestamp,
    Vendor(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaValue {
    U8(u8),
    U32(u32),
    U64(u64),
    Timestamp { timestamp: u64, frame_id: u64 },
    Bytes(Vec<u8>),
}

impl MetaValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            MetaValue::U8(v) => Some(*v as u64),
            MetaValue::U32(v) => Some(*v as u64),
            MetaValue::U64(v) => Some(*v),
            MetaValue::Timestamp { timestamp, .. } => Some(*timestamp),
            MetaValue::Bytes(_) => None,
        }
    }
}

/// One request's view of a pool.
pub trait MetadataSlot: Send + Sync {
    fn get(&self, tag: MetaTag) -> Option<MetaValue>;
    fn set(&self, tag: MetaTag, value: MetaValue) -> PipelineResult<()>;
    fn publish(&self, tag: MetaTag) -> PipelineResult<()>;
    fn is_published(&self, tag: MetaTag) -> bool;
}

/// A per-request (or usecase-lifetime) property store.
pub trait MetadataPool: Send + Sync {
    fn slot(&self, request_id: RequestId) -> Arc<dyn MetadataSlot>;

    /// Drop whatever is held for requests in `from..=to`.
    fn flush(&self, from: RequestId, to: RequestId);
}

#[derive(Debug, Default)]
struct SlotState {
    request_id: Option<RequestId>,
    values: HashMap<MetaTag, MetaValue>,
    published: HashSet<MetaTag>,
}

/// In-memory slot. Re-keying it to a new request wipes the previous contents.
#[derive(Debug, Default)]
pub struct MemorySlot {
    state: Mutex<SlotState>,
}

impl MemorySlot {
    fn bind(&self, request_id: RequestId) {
        let mut state = lock(&self.state);
        if state.request_id != Some(request_id) {
            state.values.clear();
            state.published.clear();
            state.request_id = Some(request_id);
        }
    }

    fn clear_if_within(&self, from: RequestId, to: RequestId) {
        let mut state = lock(&self.state);
        if let Some(id) = state.request_id {
            if (from..=to).contains(&id) {
                state.values.clear();
                state.published.clear();
            }
        }
    }
}

impl MetadataSlot for MemorySlot {
    fn get(&self, tag: MetaTag) -> Option<MetaValue> {
        lock(&self.state).values.get(&tag).cloned()
    }

    fn set(&self, tag: MetaTag, value: MetaValue) -> PipelineResult<()> {
        lock(&self.state).values.insert(tag, value);
        Ok(())
    }

    fn publish(&self, tag: MetaTag) -> PipelineResult<()> {
        lock(&self.state).published.insert(tag);
        Ok(())
    }

    fn is_published(&self, tag: MetaTag) -> bool {
        lock(&self.state).published.contains(&tag)
    }
}

/// Fixed ring of in-memory slots, indexed by `request_id % slots`.
#[derive(Debug)]
pub struct MemoryPool {
    name: &'static str,
    slots: Vec<Arc<MemorySlot>>,
}

impl MemoryPool {
    pub fn new(name: &'static str, slots: usize) -> Self {
        Self {
            name,
            slots: (0..slots.max(1)).map(|_| Arc::new(MemorySlot::default())).collect(),
        }
    }
}

impl MetadataPool for MemoryPool {
    fn slot(&self, request_id: RequestId) -> Arc<dyn MetadataSlot> {
        let slot = &self.slots[(request_id % self.slots.len() as u64) as usize];
        slot.bind(request_id);
        Arc::clone(slot) as Arc<dyn MetadataSlot>
    }

    fn flush(&self, from: RequestId, to: RequestId) {
        tracing::debug!("{} pool: flushing requests {}..={}", self.name, from, to);
        for slot in &self.slots {
            slot.clear_if_within(from, to);
        }
    }
}

/// The four pools a pipeline works with.
#[derive(Clone)]
pub struct MetadataPoolSet {
    /// Usecase-lifetime properties, always read through slot 0.
    pub usecase: Arc<dyn MetadataPool>,
    /// Per-frame input settings.
    pub input: Arc<dyn MetadataPool>,
    /// Per-frame properties private to the pipeline.
    pub internal: Arc<dyn MetadataPool>,
    /// Per-frame results.
    pub main: Arc<dyn MetadataPool>,
}

impl MetadataPoolSet {
    /// Four in-memory pools with `slots` slots each.
    pub fn in_memory(slots: usize) -> Self {
        Self {
            usecase: Arc::new(MemoryPool::new("usecase", 1)),
            input: Arc::new(MemoryPool::new("input", slots)),
            internal: Arc::new(MemoryPool::new("internal", slots)),
            main: Arc::new(MemoryPool::new("main", slots)),
        }
    }

    /// Flush every per-frame pool.
    pub fn flush(&self, from: RequestId, to: RequestId) {
        self.input.flush(from, to);
        self.internal.flush(from, to);
        self.main.flush(from, to);
    }

    /// Read a numeric tag from a per-request slot.
    pub fn read_u64(pool: &dyn MetadataPool, request_id: RequestId, tag: MetaTag) -> Option<u64> {
        pool.slot(request_id).get(tag).and_then(|v| v.as_u64())
    }
}
