//! Fixed-size circular table of per-request bookkeeping.
//!
//! Request `id` lives in slot `id % N`. The table never allocates per request:
//! every slot owns preallocated storage for its batch sequence ids and its
//! fence list, and counters are plain atomics so that completion callbacks for
//! different nodes of the same request can race without locking.
//!
//! Slot reuse is safe only because the pipeline never has more than `N`
//! requests in flight; [`RequestSlotTable::begin_request`] checks that bound
//! instead of trusting it.

use crate::pipeline::error::{InvariantViolation, PipelineError, PipelineResult};
use crate::pipeline::sync::lock;
use crate::types::{
    BatchFrameInfo, CaptureRequest, FenceHandle, PrivData, RequestId, SequenceId, StreamBuffer,
    SyncId,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Atomic `Option<RequestId>`. Stores `id + 1` so that request id 0 is representable.
#[derive(Debug, Default)]
pub struct RequestCursor(AtomicU64);

impl RequestCursor {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn get(&self) -> Option<RequestId> {
        self.0.load(Ordering::Acquire).checked_sub(1)
    }

    #[inline]
    pub fn set(&self, id: RequestId) {
        self.0.store(id.saturating_add(1), Ordering::Release);
    }

    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    /// Raise to `id` if greater; returns the previous value.
    #[inline]
    pub fn fetch_max(&self, id: RequestId) -> Option<RequestId> {
        self.0
            .fetch_max(id.saturating_add(1), Ordering::AcqRel)
            .checked_sub(1)
    }

    /// Set only if currently empty.
    #[inline]
    pub fn set_if_empty(&self, id: RequestId) {
        let _ = self.0.compare_exchange(
            0,
            id.saturating_add(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Copy of the request kept for the lifetime of the slot.
#[derive(Debug, Default)]
pub struct SlotRequest {
    pub sync_id: SyncId,
    pub sequence_ids: Vec<SequenceId>,
    pub buffers: Vec<StreamBuffer>,
    pub priv_data: PrivData,
}

/// Bookkeeping for one in-flight request.
#[derive(Debug)]
pub struct RequestSlot {
    request_id: RequestCursor,
    retired: AtomicBool,
    nodes_request_done: AtomicU32,
    nodes_metadata_done: AtomicU32,
    nodes_partial_metadata_done: AtomicU32,
    nodes_config_done: AtomicU32,
    buffers_done: AtomicU32,
    /// 0 until the first of {shutter, all-metadata-done} happens, then 1.
    metadata_ready: AtomicU32,
    slowdown: AtomicBool,
    sof_dispatched: AtomicBool,
    in_error: AtomicBool,
    batch_frame_interval_ns: AtomicU64,
    request: Mutex<SlotRequest>,
    fences: Mutex<Vec<FenceHandle>>,
    fence_capacity: usize,
}

impl RequestSlot {
    fn new(max_batched_frames: usize, fence_capacity: usize) -> Self {
        Self {
            request_id: RequestCursor::new(),
            retired: AtomicBool::new(true),
            nodes_request_done: AtomicU32::new(0),
            nodes_metadata_done: AtomicU32::new(0),
            nodes_partial_metadata_done: AtomicU32::new(0),
            nodes_config_done: AtomicU32::new(0),
            buffers_done: AtomicU32::new(0),
            metadata_ready: AtomicU32::new(0),
            slowdown: AtomicBool::new(false),
            sof_dispatched: AtomicBool::new(false),
            in_error: AtomicBool::new(false),
            batch_frame_interval_ns: AtomicU64::new(0),
            request: Mutex::new(SlotRequest {
                sequence_ids: Vec::with_capacity(max_batched_frames),
                ..Default::default()
            }),
            fences: Mutex::new(Vec::with_capacity(fence_capacity)),
            fence_capacity,
        }
    }

    /// Request currently occupying this slot.
    #[inline]
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id.get()
    }

    #[inline]
    pub fn holds(&self, id: RequestId) -> bool {
        self.request_id() == Some(id)
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Count one node done; returns the new total.
    #[inline]
    pub fn node_request_done(&self) -> u32 {
        self.nodes_request_done.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn node_metadata_done(&self) -> u32 {
        self.nodes_metadata_done.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn node_partial_metadata_done(&self) -> u32 {
        self.nodes_partial_metadata_done.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn node_config_done(&self) -> u32 {
        self.nodes_config_done.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn buffer_done(&self) -> u32 {
        self.buffers_done.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn nodes_request_done(&self) -> u32 {
        self.nodes_request_done.load(Ordering::Acquire)
    }

    pub fn nodes_metadata_done(&self) -> u32 {
        self.nodes_metadata_done.load(Ordering::Acquire)
    }

    pub fn nodes_config_done(&self) -> u32 {
        self.nodes_config_done.load(Ordering::Acquire)
    }

    /// Credit nodes that will never report for this request.
    /// Returns the request-done total after crediting.
    pub fn credit_nodes(&self, nodes: u32) -> u32 {
        self.nodes_metadata_done.fetch_add(nodes, Ordering::AcqRel);
        self.nodes_partial_metadata_done
            .fetch_add(nodes, Ordering::AcqRel);
        self.nodes_request_done.fetch_add(nodes, Ordering::AcqRel) + nodes
    }

    /// Credit config-done for nodes that will never report it; returns the new total.
    pub fn credit_config_done(&self, nodes: u32) -> u32 {
        self.nodes_config_done.fetch_add(nodes, Ordering::AcqRel) + nodes
    }

    /// First caller wins (`true`); the second learns the other side already happened.
    #[inline]
    pub fn try_mark_metadata_ready(&self) -> bool {
        self.metadata_ready
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_metadata_ready(&self) -> bool {
        self.metadata_ready.load(Ordering::Acquire) == 1
    }

    pub fn set_slowdown(&self) {
        self.slowdown.store(true, Ordering::Release);
    }

    /// Clear the slowdown flag, returning whether it was set.
    pub fn take_slowdown(&self) -> bool {
        self.slowdown.swap(false, Ordering::AcqRel)
    }

    pub fn has_slowdown(&self) -> bool {
        self.slowdown.load(Ordering::Acquire)
    }

    pub fn set_sof_dispatched(&self) {
        self.sof_dispatched.store(true, Ordering::Release);
    }

    pub fn is_sof_dispatched(&self) -> bool {
        self.sof_dispatched.load(Ordering::Acquire)
    }

    pub fn set_in_error(&self) {
        self.in_error.store(true, Ordering::Release);
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::Acquire)
    }

    pub fn set_batch_frame_interval_ns(&self, interval: u64) {
        self.batch_frame_interval_ns
            .store(interval, Ordering::Release);
    }

    pub fn batch_frame_interval_ns(&self) -> u64 {
        self.batch_frame_interval_ns.load(Ordering::Acquire)
    }

    /// Sequence ids of every batched frame, in batch order.
    pub fn sequence_ids(&self) -> Vec<SequenceId> {
        lock(&self.request).sequence_ids.clone()
    }

    pub fn first_sequence_id(&self) -> Option<SequenceId> {
        lock(&self.request).sequence_ids.first().copied()
    }

    pub fn priv_data(&self) -> PrivData {
        lock(&self.request).priv_data.clone()
    }

    pub fn sync_id(&self) -> SyncId {
        lock(&self.request).sync_id
    }

    pub fn buffers(&self) -> Vec<StreamBuffer> {
        lock(&self.request).buffers.clone()
    }

    pub fn num_batched_frames(&self) -> usize {
        lock(&self.request).sequence_ids.len()
    }

    pub fn pending_fences(&self) -> usize {
        lock(&self.fences).len()
    }

    fn register_fence(&self, fence: FenceHandle) -> PipelineResult<()> {
        let mut fences = lock(&self.fences);
        if fences.len() >= self.fence_capacity {
            return Err(PipelineError::NoMemory);
        }
        fences.push(fence);
        Ok(())
    }

    fn remove_fence(&self, fence: FenceHandle) -> bool {
        let mut fences = lock(&self.fences);
        match fences.iter().position(|f| *f == fence) {
            Some(pos) => {
                fences.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Reset every counter and copy the new request in.
    fn populate(&self, request: &CaptureRequest, batches: &[BatchFrameInfo]) {
        self.nodes_request_done.store(0, Ordering::Release);
        self.nodes_metadata_done.store(0, Ordering::Release);
        self.nodes_partial_metadata_done.store(0, Ordering::Release);
        self.nodes_config_done.store(0, Ordering::Release);
        self.buffers_done.store(0, Ordering::Release);
        self.metadata_ready.store(0, Ordering::Release);
        self.slowdown.store(false, Ordering::Release);
        self.sof_dispatched.store(false, Ordering::Release);
        self.in_error.store(false, Ordering::Release);
        self.batch_frame_interval_ns.store(0, Ordering::Release);
        lock(&self.fences).clear();

        {
            let mut copy = lock(&self.request);
            copy.sync_id = request.sync_id;
            copy.sequence_ids.clear();
            copy.sequence_ids
                .extend(batches.iter().map(|b| b.sequence_id));
            copy.buffers.clear();
            copy.buffers.extend_from_slice(&request.buffers);
            copy.priv_data = request.priv_data.clone();
        }

        self.retired.store(false, Ordering::Release);
        self.request_id.set(request.request_id);
    }
}

/// The circular table plus the hardware sync-id map.
pub struct RequestSlotTable {
    slots: Vec<RequestSlot>,
    sync_map: Vec<AtomicU64>,
    max_batched_frames: usize,
}

impl RequestSlotTable {
    pub fn new(slot_count: usize, max_batched_frames: usize, fence_capacity: usize) -> Self {
        let slot_count = slot_count.max(1);
        let max_batched_frames = max_batched_frames.max(1);
        Self {
            slots: (0..slot_count)
                .map(|_| RequestSlot::new(max_batched_frames, fence_capacity))
                .collect(),
            sync_map: (0..slot_count * max_batched_frames)
                .map(|_| AtomicU64::new(0))
                .collect(),
            max_batched_frames,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn index_of(&self, id: RequestId) -> usize {
        (id % self.slots.len() as u64) as usize
    }

    #[inline]
    pub fn slot(&self, id: RequestId) -> &RequestSlot {
        &self.slots[self.index_of(id)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestSlot> {
        self.slots.iter()
    }

    /// Claim the slot for `request`.
    ///
    /// Fails with an invariant violation if the previous occupant has not
    /// retired or still has fences registered.
    pub fn begin_request(&self, request: &CaptureRequest) -> PipelineResult<&RequestSlot> {
        if request.batches.is_empty() || request.batches.len() > self.max_batched_frames {
            return Err(PipelineError::Failed(format!(
                "request {} carries {} batched frames (max {})",
                request.request_id,
                request.batches.len(),
                self.max_batched_frames
            )));
        }

        let index = self.index_of(request.request_id);
        let slot = &self.slots[index];
        let previous = slot.request_id();
        let pending_fences = slot.pending_fences();

        if pending_fences != 0 || !slot.is_retired() {
            return Err(InvariantViolation::SlotReuse {
                request_id: request.request_id,
                slot: index,
                previous,
                pending_fences,
            }
            .into());
        }

        slot.populate(request, &request.batches);
        self.map_sync_id(request.sync_id, request.request_id);
        Ok(slot)
    }

    fn sync_index(&self, sync_id: SyncId) -> usize {
        (sync_id % self.sync_map.len() as u64) as usize
    }

    pub fn map_sync_id(&self, sync_id: SyncId, id: RequestId) {
        self.sync_map[self.sync_index(sync_id)].store(id.saturating_add(1), Ordering::Release);
    }

    /// Translate a hardware sync id to the request it was mapped to.
    pub fn lookup_sync_id(&self, sync_id: SyncId) -> Option<RequestId> {
        self.sync_map[self.sync_index(sync_id)]
            .load(Ordering::Acquire)
            .checked_sub(1)
    }

    pub fn register_fence(&self, fence: FenceHandle, id: RequestId) -> PipelineResult<()> {
        self.slot(id).register_fence(fence)
    }

    pub fn remove_fence(&self, fence: FenceHandle, id: RequestId) -> bool {
        self.slot(id).remove_fence(fence)
    }

    /// Clear every slowdown flag; returns whether any was set.
    pub fn take_any_slowdown(&self) -> bool {
        let mut any = false;
        for slot in &self.slots {
            if slot.take_slowdown() {
                tracing::debug!(
                    "slowdown recorded for request {:?}, holding off recovery",
                    slot.request_id()
                );
                any = true;
            }
        }
        any
    }
}
