//! Node and port handles.
//!
//! A [`NodeId`] is a node's position in creation order and indexes the graph's
//! node arena directly. A [`PortId`] packs a node index and the port's slot in
//! that node's port list into one word, so links stay `Copy`.

use std::fmt;

/// Position of a node in `NodeGraph::nodes` (creation order).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Node index in the high 20 bits, port slot in the low 12.
///
/// The slot is the port's position in its node's input or output list, not
/// the descriptor's port id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u32);

impl PortId {
    const SLOT_BITS: u32 = 12;
    const SLOT_MASK: u32 = (1 << Self::SLOT_BITS) - 1;

    pub fn new(node: NodeId, slot: u16) -> Self {
        debug_assert!(u32::from(slot) <= Self::SLOT_MASK);
        Self((node.0 << Self::SLOT_BITS) | (u32::from(slot) & Self::SLOT_MASK))
    }

    #[inline]
    pub fn node(self) -> NodeId {
        NodeId(self.0 >> Self::SLOT_BITS)
    }

    #[inline]
    pub fn slot(self) -> usize {
        (self.0 & Self::SLOT_MASK) as usize
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.node(), self.slot())
    }
}
