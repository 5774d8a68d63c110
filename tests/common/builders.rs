//! Test data builders for descriptors and requests

use capture_pipeline::pipeline::{
    InputPortDescriptor, NodeDescriptor, NodeKind, OutputPortDescriptor, PipelineDescriptor,
    SinkKind,
};
use capture_pipeline::types::{BatchFrameInfo, BufferInfo, CaptureRequest, ImageFormat, StreamBuffer};
use capture_pipeline::RequestId;
use std::sync::Arc;

/// Sensor -> IFE -> stats, with the IFE's first output feeding stream 0
pub fn preview_descriptor() -> PipelineDescriptor {
    PipelineDescriptor::new("preview", true)
        .node(
            NodeDescriptor::new("sensor", NodeKind::Sensor)
                .output(OutputPortDescriptor::new(0, ImageFormat::Raw10)),
        )
        .node(
            NodeDescriptor::new("ife", NodeKind::Ife)
                .input(InputPortDescriptor::link(0, "sensor", 0))
                .output(OutputPortDescriptor::new(0, ImageFormat::Nv12).sink(SinkKind::Buffer))
                .output(OutputPortDescriptor::new(1, ImageFormat::Blob)),
        )
        .node(
            NodeDescriptor::new("stats", NodeKind::StatsProcessing)
                .input(InputPortDescriptor::link(0, "ife", 1))
                .output(OutputPortDescriptor::new(0, ImageFormat::Blob).sink(SinkKind::NoBuffer)),
        )
}

/// Offline reprocessing: BPS -> IPE -> JPEG
pub fn snapshot_descriptor() -> PipelineDescriptor {
    PipelineDescriptor::new("snapshot", false)
        .node(
            NodeDescriptor::new("bps", NodeKind::Bps)
                .input(InputPortDescriptor::source_buffer(0))
                .output(OutputPortDescriptor::new(0, ImageFormat::Nv12)),
        )
        .node(
            NodeDescriptor::new("ipe", NodeKind::Ipe)
                .input(InputPortDescriptor::link(0, "bps", 0))
                .output(OutputPortDescriptor::new(0, ImageFormat::Nv12)),
        )
        .node(
            NodeDescriptor::new("jpeg", NodeKind::Jpeg)
                .input(InputPortDescriptor::link(0, "ipe", 0))
                .output(OutputPortDescriptor::new(0, ImageFormat::Jpeg).sink(SinkKind::Buffer)),
        )
}

/// Builder for capture requests
pub struct RequestBuilder {
    request: CaptureRequest,
}

impl RequestBuilder {
    pub fn new(id: RequestId) -> Self {
        Self {
            request: CaptureRequest::new(id, id as u32),
        }
    }

    pub fn sync_id(mut self, sync_id: u64) -> Self {
        self.request = self.request.with_sync_id(sync_id);
        self
    }

    /// Replace the single frame with `count` batched frames starting at `first_sequence`
    pub fn batched(mut self, first_sequence: u32, count: u32) -> Self {
        let batches = (0..count)
            .map(|i| BatchFrameInfo {
                sequence_id: first_sequence + i,
                active_stream_mask: 1,
            })
            .collect();
        self.request = self.request.with_batches(batches);
        self
    }

    pub fn buffer(mut self, stream_id: u32, batch_index: u8) -> Self {
        let handle = 0x1000 + self.request.request_id * 16 + stream_id as u64;
        self.request = self.request.with_buffer(StreamBuffer {
            stream_id,
            batch_index,
            buffer: BufferInfo { handle, size: 4096 },
        });
        self
    }

    pub fn tag(mut self, tag: &'static str) -> Self {
        self.request = self.request.with_priv_data(Arc::new(tag));
        self
    }

    pub fn build(self) -> CaptureRequest {
        self.request
    }
}

/// Single-frame request with one buffer on stream 0
pub fn simple_request(id: RequestId) -> CaptureRequest {
    RequestBuilder::new(id).buffer(0, 0).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = RequestBuilder::new(4).sync_id(40).batched(8, 2).buffer(1, 1).build();
        assert_eq!(request.request_id, 4);
        assert_eq!(request.sync_id, 40);
        assert_eq!(request.num_batched_frames(), 2);
        assert_eq!(request.buffers[0].stream_id, 1);
    }
}
