//! Node graph: creation, port linking, buffer negotiation and ordering.
//!
//! # Construction
//!
//! ```text
//! create_nodes ─► link_ports ─► finalize
//!                                  ├─ finalize_initialization (creation order)
//!                                  ├─ negotiate (backward walk from sinks, one fallback retry)
//!                                  ├─ order repair + count check
//!                                  ├─ finalize_buffer_properties (execution order)
//!                                  └─ create_buffer_managers / notify_pipeline_created
//! ```
//!
//! The graph owns every node in an arena indexed by [`NodeId`]. The execution
//! order is a separate array of ids into that arena. Both are written only
//! during construction and are read-only once the pipeline is finalized.

use crate::pipeline::descriptor::PipelineDescriptor;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{NodeId, PortId};
use crate::pipeline::node::{NodeFactory, NodeKind, ProcessingNode};
use crate::pipeline::port::{InputPort, InputSource, OutputPort, SinkKind};
use crate::types::ImageFormat;
use std::collections::VecDeque;

/// A node plus its runtime port state.
pub struct GraphNode {
    pub node: Box<dyn ProcessingNode>,
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<OutputPort>,
}

impl GraphNode {
    fn has_sink_output(&self) -> bool {
        self.outputs.iter().any(OutputPort::is_sink)
    }

    fn is_source(&self) -> bool {
        self.inputs.is_empty() || self.inputs.iter().any(|p| p.parent.is_none())
    }
}

/// "Has feature X node" flags, computed from the finalized node set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    pub has_sensor_node: bool,
    pub has_ife_node: bool,
    pub has_jpeg_node: bool,
    pub has_stats_node: bool,
}

impl CapabilityFlags {
    fn observe(&mut self, kind: NodeKind) {
        match kind {
            NodeKind::Sensor => self.has_sensor_node = true,
            NodeKind::Ife => self.has_ife_node = true,
            NodeKind::Jpeg | NodeKind::JpegAggregator => self.has_jpeg_node = true,
            NodeKind::StatsProcessing | NodeKind::AutoFocus => self.has_stats_node = true,
            _ => {}
        }
    }
}

/// Owns the node arena and both orderings.
pub struct NodeGraph {
    name: String,
    nodes: Vec<GraphNode>,
    execution_order: Vec<NodeId>,
    sink_nodes: Vec<NodeId>,
    source_nodes: Vec<NodeId>,
    flags: CapabilityFlags,
    config_done_nodes: usize,
    fallback_format: ImageFormat,
    negotiation_passes: u32,
}

impl NodeGraph {
    /// Instantiate every node in descriptor order.
    ///
    /// If any node fails to construct, the nodes created so far are destroyed
    /// in reverse order and the error is returned.
    pub fn create_nodes(
        desc: &PipelineDescriptor,
        factory: &dyn NodeFactory,
        fallback_format: ImageFormat,
    ) -> PipelineResult<Self> {
        let mut graph = NodeGraph {
            name: desc.name.clone(),
            nodes: Vec::with_capacity(desc.nodes.len()),
            execution_order: Vec::with_capacity(desc.nodes.len()),
            sink_nodes: Vec::new(),
            source_nodes: Vec::new(),
            flags: CapabilityFlags::default(),
            config_done_nodes: 0,
            fallback_format,
            negotiation_passes: 0,
        };

        for (index, node_desc) in desc.nodes.iter().enumerate() {
            let id = NodeId(index as u32);
            let node = match factory.create(id, node_desc) {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!(
                        "{}: failed to create node '{}' ({:?}): {}",
                        graph.name,
                        node_desc.name,
                        node_desc.kind,
                        e
                    );
                    graph.destroy_nodes();
                    return Err(e);
                }
            };

            let inputs = node_desc
                .inputs
                .iter()
                .map(|p| InputPort {
                    port_id: p.port_id,
                    parent: None,
                })
                .collect();
            let outputs = node_desc
                .outputs
                .iter()
                .map(OutputPort::from_descriptor)
                .collect();

            tracing::debug!("{}: created node {}", graph.name, node.identity());
            graph.nodes.push(GraphNode {
                node,
                inputs,
                outputs,
            });
        }

        for (index, entry) in graph.nodes.iter().enumerate() {
            let id = NodeId(index as u32);
            if entry.has_sink_output() {
                graph.sink_nodes.push(id);
            }
            if entry.node.notifies_config_done() {
                graph.config_done_nodes += 1;
            }
        }

        Ok(graph)
    }

    /// Resolve every non-source input to its producer, register the consumer
    /// with the producer's fan-out, and propagate device indices onto the
    /// producer's output port.
    pub fn link_ports(&mut self, desc: &PipelineDescriptor) -> PipelineResult<()> {
        for (consumer_index, node_desc) in desc.nodes.iter().enumerate() {
            for (input_slot, input_desc) in node_desc.inputs.iter().enumerate() {
                let InputSource::Link {
                    parent_node,
                    parent_port,
                } = &input_desc.source
                else {
                    continue;
                };

                let unknown = || PipelineError::UnknownParent {
                    node: node_desc.name.clone(),
                    port: input_desc.port_id,
                    parent: parent_node.clone(),
                };

                let parent_index = desc.position(parent_node).ok_or_else(unknown)?;
                if parent_index == consumer_index {
                    return Err(PipelineError::CycleDetected);
                }
                let output_slot = self.nodes[parent_index]
                    .outputs
                    .iter()
                    .position(|p| p.port_id == *parent_port)
                    .ok_or_else(unknown)?;

                let producer = PortId::new(NodeId(parent_index as u32), output_slot as u16);
                let consumer = PortId::new(NodeId(consumer_index as u32), input_slot as u16);
                self.nodes[consumer_index].inputs[input_slot].parent = Some(producer);

                let consumer_devices = self.nodes[consumer_index].node.device_indices().to_vec();
                let producer_entry = &mut self.nodes[parent_index];
                let producer_devices = producer_entry.node.device_indices().to_vec();
                let output = &mut producer_entry.outputs[output_slot];
                output.consumers.push(consumer);
                output.add_device_indices(&producer_devices);
                output.add_device_indices(&consumer_devices);

                tracing::trace!(
                    "{}: linked {:?} -> {:?}",
                    self.name,
                    producer,
                    consumer
                );
            }
        }

        self.source_nodes = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_source())
            .map(|(index, _)| NodeId(index as u32))
            .collect();

        self.check_acyclic()
    }

    /// Kahn's algorithm over the linked graph; any leftover node sits on a cycle.
    fn check_acyclic(&self) -> PipelineResult<()> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut fwd_adj = vec![Vec::new(); n];
        for (index, entry) in self.nodes.iter().enumerate() {
            for input in &entry.inputs {
                if let Some(parent) = input.parent {
                    fwd_adj[parent.node().index()].push(index);
                    in_degree[index] += 1;
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut seen = 0;
        while let Some(index) = queue.pop_front() {
            seen += 1;
            for &next in &fwd_adj[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if seen == n {
            Ok(())
        } else {
            Err(PipelineError::CycleDetected)
        }
    }

    /// Run the construction passes that follow linking.
    pub fn finalize(&mut self) -> PipelineResult<()> {
        for entry in self.nodes.iter_mut() {
            entry.node.finalize_initialization()?;
        }

        self.negotiate()?;
        self.repair_ordering()?;

        for &id in &self.execution_order {
            let entry = &mut self.nodes[id.index()];
            entry.node.finalize_buffer_properties(&entry.outputs);
        }

        for &id in &self.execution_order {
            let entry = &mut self.nodes[id.index()];
            entry.node.create_buffer_managers(&entry.outputs)?;
        }

        for entry in self.nodes.iter_mut() {
            entry.node.notify_pipeline_created()?;
        }

        let mut flags = CapabilityFlags::default();
        for &id in &self.execution_order {
            flags.observe(self.nodes[id.index()].node.identity().kind);
        }
        self.flags = flags;

        tracing::info!(
            "{}: finalized {} nodes, order {:?}, flags {:?}",
            self.name,
            self.nodes.len(),
            self.execution_order,
            self.flags
        );
        Ok(())
    }

    /// Negotiate every sink. On failure, reset all nodes, force sink buffers
    /// to the fallback format and retry exactly once.
    fn negotiate(&mut self) -> PipelineResult<()> {
        match self.negotiation_pass() {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(
                    "{}: buffer negotiation failed ({}), retrying with {}",
                    self.name,
                    first,
                    self.fallback_format
                );
                self.renegotiate_with_fallback()
            }
        }
    }

    fn renegotiate_with_fallback(&mut self) -> PipelineResult<()> {
        let fallback = self.fallback_format;
        for entry in self.nodes.iter_mut() {
            entry.node.reset_buffer_negotiation();
            for output in entry.outputs.iter_mut() {
                if output.sink == SinkKind::Buffer {
                    output.format = fallback;
                }
            }
        }
        self.execution_order.clear();

        self.negotiation_pass().map_err(|e| {
            tracing::error!("{}: buffer negotiation failed after fallback: {}", self.name, e);
            e
        })
    }

    /// One backward walk from every sink node.
    ///
    /// A node is negotiated only after all of its consumers have been, so the
    /// recorded order is a reverse topological order. It is reversed at the end.
    fn negotiation_pass(&mut self) -> PipelineResult<()> {
        self.negotiation_passes += 1;
        let n = self.nodes.len();
        let mut pending_consumers: Vec<usize> = self
            .nodes
            .iter()
            .map(|entry| entry.outputs.iter().map(|o| o.consumers.len()).sum())
            .collect();
        let mut visited = vec![false; n];
        let mut order = Vec::with_capacity(n);

        for sink_index in 0..self.sink_nodes.len() {
            let mut stack = vec![self.sink_nodes[sink_index].index()];

            while let Some(index) = stack.pop() {
                if visited[index] || pending_consumers[index] > 0 {
                    continue;
                }

                let entry = &mut self.nodes[index];
                entry
                    .node
                    .finalize_buffer_requirement(&entry.outputs)
                    .map_err(|e| {
                        tracing::debug!(
                            "{}: node {} rejected its output requirements: {}",
                            self.name,
                            entry.node.identity(),
                            e
                        );
                        e
                    })?;

                visited[index] = true;
                Self::add_to_ordered(&mut order, NodeId(index as u32), n);

                for input in &self.nodes[index].inputs {
                    if let Some(parent) = input.parent {
                        let parent_index = parent.node().index();
                        pending_consumers[parent_index] -= 1;
                        if pending_consumers[parent_index] == 0 {
                            stack.push(parent_index);
                        }
                    }
                }
            }
        }

        order.reverse();
        self.execution_order = order;
        Ok(())
    }

    /// Append without duplicates, never past the node count.
    fn add_to_ordered(order: &mut Vec<NodeId>, id: NodeId, bound: usize) {
        if order.len() < bound && !order.contains(&id) {
            order.push(id);
        }
    }

    /// Append nodes the backward walk never reached, then check the counts.
    fn repair_ordering(&mut self) -> PipelineResult<()> {
        let n = self.nodes.len();
        for index in 0..n {
            let id = NodeId(index as u32);
            if !self.execution_order.contains(&id) {
                tracing::warn!(
                    "{}: node {} not reached from any sink, appending to execution order",
                    self.name,
                    self.nodes[index].node.identity()
                );
                Self::add_to_ordered(&mut self.execution_order, id, n);
            }
        }

        Self::check_ordering(n, &self.execution_order)
    }

    /// The execution order must name every created node exactly once.
    pub fn check_ordering(created: usize, order: &[NodeId]) -> PipelineResult<()> {
        let mut seen = vec![false; created];
        let mut distinct = 0;
        for id in order {
            if id.index() < created && !seen[id.index()] {
                seen[id.index()] = true;
                distinct += 1;
            }
        }

        if distinct != created || order.len() != created {
            return Err(PipelineError::OrderingMismatch {
                created,
                ordered: order.len(),
            });
        }
        Ok(())
    }

    /// Destroy every node in reverse creation order.
    pub fn destroy_nodes(&mut self) {
        while let Some(mut entry) = self.nodes.pop() {
            tracing::trace!("{}: destroying node {}", self.name, entry.node.identity());
            entry.node.destroy();
        }
        self.execution_order.clear();
        self.sink_nodes.clear();
        self.source_nodes.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &dyn ProcessingNode {
        self.nodes[id.index()].node.as_ref()
    }

    pub fn outputs(&self, id: NodeId) -> &[OutputPort] {
        &self.nodes[id.index()].outputs
    }

    pub fn inputs(&self, id: NodeId) -> &[InputPort] {
        &self.nodes[id.index()].inputs
    }

    /// Nodes in creation order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &dyn ProcessingNode> + '_ {
        self.nodes.iter().map(|entry| entry.node.as_ref())
    }

    /// Nodes in execution order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &dyn ProcessingNode> + '_ {
        self.execution_order
            .iter()
            .map(|id| self.nodes[id.index()].node.as_ref())
    }

    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    pub fn sink_nodes(&self) -> &[NodeId] {
        &self.sink_nodes
    }

    pub fn source_nodes(&self) -> &[NodeId] {
        &self.source_nodes
    }

    pub fn flags(&self) -> CapabilityFlags {
        self.flags
    }

    /// Number of nodes that report config-done per request.
    pub fn config_done_nodes(&self) -> usize {
        self.config_done_nodes
    }

    /// Number of negotiation passes run so far (1, or 2 after a fallback).
    pub fn negotiation_passes(&self) -> u32 {
        self.negotiation_passes
    }

    /// Every device index driven by any node, deduplicated.
    pub fn device_indices(&self) -> Vec<i32> {
        let mut devices = Vec::new();
        for entry in &self.nodes {
            for &index in entry.node.device_indices() {
                if !devices.contains(&index) {
                    devices.push(index);
                }
            }
        }
        devices
    }
}

impl Drop for NodeGraph {
    fn drop(&mut self) {
        self.destroy_nodes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::descriptor::NodeDescriptor;
    use crate::pipeline::port::{InputPortDescriptor, OutputPortDescriptor};
    use crate::sim::{SimBehavior, SimEvent, SimNodeFactory};
    use proptest::prelude::*;

    fn chain(names: &[&str]) -> PipelineDescriptor {
        let mut desc = PipelineDescriptor::new("chain", true);
        for (i, name) in names.iter().enumerate() {
            let mut node = NodeDescriptor::new(*name, NodeKind::Custom(i as u32));
            if i == 0 {
                node = node.input(InputPortDescriptor::source_buffer(0));
            } else {
                node = node.input(InputPortDescriptor::link(0, names[i - 1], 0));
            }
            let mut out = OutputPortDescriptor::new(0, ImageFormat::Nv12);
            if i == names.len() - 1 {
                out = out.sink(SinkKind::Buffer);
            }
            desc.nodes.push(node.output(out));
        }
        desc
    }

    fn build(desc: &PipelineDescriptor, factory: &SimNodeFactory) -> PipelineResult<NodeGraph> {
        let mut graph = NodeGraph::create_nodes(desc, factory, ImageFormat::Nv12)?;
        graph.link_ports(desc)?;
        graph.finalize()?;
        Ok(graph)
    }

    #[test]
    fn test_chain_orders_source_to_sink() {
        // Declared sink-first so creation order differs from execution order.
        let mut desc = chain(&["a", "b", "c"]);
        desc.nodes.reverse();
        let factory = SimNodeFactory::new();
        let graph = build(&desc, &factory).unwrap();

        let names: Vec<_> = graph.iter_ordered().map(|n| n.identity().name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(graph.sink_nodes().len(), 1);
        assert_eq!(graph.source_nodes().len(), 1);
        assert_eq!(graph.negotiation_passes(), 1);
    }

    #[test]
    fn test_diamond_order_is_topological() {
        // src feeds left and right; right also consumes left; join consumes both.
        let desc = PipelineDescriptor::new("diamond", false)
            .node(
                NodeDescriptor::new("join", NodeKind::Ipe)
                    .input(InputPortDescriptor::link(0, "left", 0))
                    .input(InputPortDescriptor::link(1, "right", 0))
                    .output(OutputPortDescriptor::new(0, ImageFormat::Nv12).sink(SinkKind::Buffer)),
            )
            .node(
                NodeDescriptor::new("src", NodeKind::Sensor)
                    .output(OutputPortDescriptor::new(0, ImageFormat::Raw10)),
            )
            .node(
                NodeDescriptor::new("right", NodeKind::Bps)
                    .input(InputPortDescriptor::link(0, "src", 0))
                    .input(InputPortDescriptor::link(1, "left", 0))
                    .output(OutputPortDescriptor::new(0, ImageFormat::Nv12)),
            )
            .node(
                NodeDescriptor::new("left", NodeKind::Ife)
                    .input(InputPortDescriptor::link(0, "src", 0))
                    .output(OutputPortDescriptor::new(0, ImageFormat::Nv12)),
            );

        let factory = SimNodeFactory::new();
        let graph = build(&desc, &factory).unwrap();
        let position = |name: &str| {
            graph
                .iter_ordered()
                .position(|n| n.identity().name == name)
                .unwrap()
        };
        assert!(position("src") < position("left"));
        assert!(position("left") < position("right"));
        assert!(position("right") < position("join"));
        assert!(graph.flags().has_ife_node);
        assert!(graph.flags().has_sensor_node);
        assert!(!graph.flags().has_jpeg_node);
    }

    #[test]
    fn test_create_failure_rolls_back() {
        let desc = chain(&["a", "b", "c"]);
        let factory = SimNodeFactory::new().with_behavior(
            "c",
            SimBehavior {
                fail_create: true,
                ..Default::default()
            },
        );
        let result = NodeGraph::create_nodes(&desc, &factory, ImageFormat::Nv12);
        assert!(result.is_err());
        let destroyed: Vec<_> = factory
            .log()
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Destroy(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(destroyed, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let desc = PipelineDescriptor::new("bad", false).node(
            NodeDescriptor::new("a", NodeKind::Ipe)
                .input(InputPortDescriptor::link(0, "ghost", 0))
                .output(OutputPortDescriptor::new(0, ImageFormat::Nv12).sink(SinkKind::Buffer)),
        );
        let factory = SimNodeFactory::new();
        let mut graph = NodeGraph::create_nodes(&desc, &factory, ImageFormat::Nv12).unwrap();
        let err = graph.link_ports(&desc).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownParent { .. }));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let desc = PipelineDescriptor::new("cycle", false)
            .node(
                NodeDescriptor::new("a", NodeKind::Ipe)
                    .input(InputPortDescriptor::link(0, "b", 0))
                    .output(OutputPortDescriptor::new(0, ImageFormat::Nv12)),
            )
            .node(
                NodeDescriptor::new("b", NodeKind::Ipe)
                    .input(InputPortDescriptor::link(0, "a", 0))
                    .output(OutputPortDescriptor::new(0, ImageFormat::Nv12)),
            );
        let factory = SimNodeFactory::new();
        let mut graph = NodeGraph::create_nodes(&desc, &factory, ImageFormat::Nv12).unwrap();
        assert!(matches!(
            graph.link_ports(&desc),
            Err(PipelineError::CycleDetected)
        ));
    }

    #[test]
    fn test_device_indices_propagate_to_producer() {
        let desc = chain(&["sensor", "ife"]);
        let factory = SimNodeFactory::new()
            .with_behavior(
                "sensor",
                SimBehavior {
                    device_indices: vec![1],
                    ..Default::default()
                },
            )
            .with_behavior(
                "ife",
                SimBehavior {
                    device_indices: vec![4, 5],
                    ..Default::default()
                },
            );
        let graph = build(&desc, &factory).unwrap();
        let producer_port = &graph.outputs(NodeId(0))[0];
        assert_eq!(producer_port.device_indices, vec![1, 4, 5]);
        assert_eq!(producer_port.consumers.len(), 1);
        assert_eq!(graph.device_indices(), vec![1, 4, 5]);
    }

    #[test]
    fn test_negotiation_fallback_succeeds_on_retry() {
        let mut desc = chain(&["sensor", "ipe", "jpeg"]);
        desc.nodes[2].kind = NodeKind::Jpeg;
        desc.nodes[2].outputs[0].format = ImageFormat::Ubwc;
        let factory = SimNodeFactory::new().with_behavior(
            "jpeg",
            SimBehavior {
                rejected_formats: vec![ImageFormat::Ubwc],
                ..Default::default()
            },
        );
        let graph = build(&desc, &factory).unwrap();
        assert_eq!(graph.negotiation_passes(), 2);
        assert_eq!(graph.outputs(NodeId(2))[0].format, ImageFormat::Nv12);
        assert!(graph.flags().has_jpeg_node);
        assert_eq!(graph.execution_order().len(), 3);
    }

    #[test]
    fn test_negotiation_fails_after_one_retry() {
        let desc = chain(&["sensor", "ipe"]);
        let factory = SimNodeFactory::new().with_behavior(
            "ipe",
            SimBehavior {
                rejected_formats: vec![ImageFormat::Nv12],
                ..Default::default()
            },
        );
        let result = build(&desc, &factory);
        assert!(matches!(result, Err(PipelineError::Negotiation { .. })));
    }

    #[test]
    fn test_unreached_branch_is_appended() {
        // "aux" produces into nothing and has no sink port: never reached by the walk.
        let desc = chain(&["a", "b"]).node(
            NodeDescriptor::new("aux", NodeKind::StatsProcessing)
                .input(InputPortDescriptor::source_buffer(0))
                .output(OutputPortDescriptor::new(0, ImageFormat::Blob)),
        );
        let factory = SimNodeFactory::new();
        let graph = build(&desc, &factory).unwrap();
        assert_eq!(graph.execution_order().last(), Some(&NodeId(2)));
        assert!(graph.flags().has_stats_node);
    }

    #[test]
    fn test_check_ordering_mismatch() {
        let err = NodeGraph::check_ordering(3, &[NodeId(0), NodeId(1)]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OrderingMismatch {
                created: 3,
                ordered: 2
            }
        ));
        assert!(NodeGraph::check_ordering(2, &[NodeId(1), NodeId(1)]).is_err());
        assert!(NodeGraph::check_ordering(2, &[NodeId(1), NodeId(0)]).is_ok());
    }

    proptest! {
        #[test]
        fn prop_chain_finalizes_with_full_order(len in 1usize..12) {
            let names: Vec<String> = (0..len).map(|i| format!("n{}", i)).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let desc = chain(&refs);
            let factory = SimNodeFactory::new();
            let graph = build(&desc, &factory).unwrap();
            prop_assert_eq!(graph.execution_order().len(), graph.len());
            for (i, id) in graph.execution_order().iter().enumerate() {
                prop_assert_eq!(id.index(), i);
            }
        }
    }
}
