//! Port and link descriptors for the node graph.
//!
//! Every node declares its input and output ports in its `NodeDescriptor`.
//! After `NodeGraph::link_ports`, each linked input knows its producer and
//! each output knows its fan-out and every device that will touch its buffers.

use crate::pipeline::id::PortId;
use crate::types::ImageFormat;
use serde::{Deserialize, Serialize};

/// Where an input port gets its buffers from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSource {
    /// Fed by an external buffer (no internal producer).
    SourceBuffer,
    /// Fed by another node's output port, named by node name and output port id.
    Link {
        parent_node: String,
        parent_port: u32,
    },
}

/// Whether an output port terminates the internal graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Consumed by another node.
    #[default]
    None,
    /// Feeds an external stream buffer.
    Buffer,
    /// Terminal port producing no buffer (stats, metadata-only outputs).
    NoBuffer,
}

impl SinkKind {
    #[inline]
    pub fn is_sink(self) -> bool {
        !matches!(self, SinkKind::None)
    }
}

/// Declared input port of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPortDescriptor {
    pub port_id: u32,
    pub source: InputSource,
}

impl InputPortDescriptor {
    pub fn source_buffer(port_id: u32) -> Self {
        Self {
            port_id,
            source: InputSource::SourceBuffer,
        }
    }

    pub fn link(port_id: u32, parent_node: impl Into<String>, parent_port: u32) -> Self {
        Self {
            port_id,
            source: InputSource::Link {
                parent_node: parent_node.into(),
                parent_port,
            },
        }
    }

    #[inline]
    pub fn is_source(&self) -> bool {
        matches!(self.source, InputSource::SourceBuffer)
    }
}

/// Declared output port of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPortDescriptor {
    pub port_id: u32,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub sink: SinkKind,
}

impl OutputPortDescriptor {
    pub fn new(port_id: u32, format: ImageFormat) -> Self {
        Self {
            port_id,
            format,
            width: 0,
            height: 0,
            sink: SinkKind::None,
        }
    }

    pub fn sink(mut self, sink: SinkKind) -> Self {
        self.sink = sink;
        self
    }

    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// A producer-output to consumer-input binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub producer: PortId,
    pub consumer: PortId,
}

/// Runtime state of an input port after linking.
#[derive(Debug, Clone)]
pub struct InputPort {
    pub port_id: u32,
    /// Producer output, `None` for source-buffer ports.
    pub parent: Option<PortId>,
}

/// Runtime state of an output port after linking and negotiation.
#[derive(Debug, Clone)]
pub struct OutputPort {
    pub port_id: u32,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub sink: SinkKind,
    /// Consumer input ports fed by this output.
    pub consumers: Vec<PortId>,
    /// Every hardware device index that will access this output's buffers.
    pub device_indices: Vec<i32>,
}

impl OutputPort {
    pub fn from_descriptor(desc: &OutputPortDescriptor) -> Self {
        Self {
            port_id: desc.port_id,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            sink: desc.sink,
            consumers: Vec::new(),
            device_indices: Vec::new(),
        }
    }

    /// Merge device indices, keeping each once.
    pub fn add_device_indices(&mut self, indices: &[i32]) {
        for &index in indices {
            if !self.device_indices.contains(&index) {
                self.device_indices.push(index);
            }
        }
    }

    #[inline]
    pub fn is_sink(&self) -> bool {
        self.sink.is_sink()
    }
}

/// Negotiated buffer requirement for one output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequirement {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}
