//! Serializable pipeline descriptors.
//!
//! A descriptor is the static recipe for a pipeline: which nodes exist, in
//! which order they are created, and how their ports connect. It is usually
//! loaded from JSON.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node::NodeKind;
use crate::pipeline::port::{InputPortDescriptor, OutputPortDescriptor};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Description of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub instance_id: u32,
    #[serde(default)]
    pub inputs: Vec<InputPortDescriptor>,
    #[serde(default)]
    pub outputs: Vec<OutputPortDescriptor>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            instance_id: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn instance(mut self, instance_id: u32) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn input(mut self, port: InputPortDescriptor) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: OutputPortDescriptor) -> Self {
        self.outputs.push(port);
        self
    }
}

/// Description of a whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    pub name: String,
    /// Sensor-driven pipeline with a linked device group.
    #[serde(default)]
    pub realtime: bool,
    pub nodes: Vec<NodeDescriptor>,
}

impl PipelineDescriptor {
    pub fn new(name: impl Into<String>, realtime: bool) -> Self {
        Self {
            name: name.into(),
            realtime,
            nodes: Vec::new(),
        }
    }

    pub fn node(mut self, node: NodeDescriptor) -> Self {
        self.nodes.push(node);
        self
    }

    /// Parse a descriptor from JSON text.
    pub fn from_json(text: &str) -> PipelineResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| PipelineError::Config(format!("Invalid pipeline descriptor: {}", e)))
    }

    /// Load a descriptor from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Position of a node by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }
}
