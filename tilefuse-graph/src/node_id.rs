use std::num::NonZero;

/// ID of a node in a [`Graph`](crate::Graph).
///
/// IDs are arena indices. They stay valid for the lifetime of the node and
/// are never reused once the node has been removed.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(NonZero<u32>);

impl NodeId {
    /// Return the arena index of this node.
    pub fn as_usize(self) -> usize {
        (self.0.get() - 1) as usize
    }

    /// Construct a node ID from an arena index.
    ///
    /// Panics if the index does not fit in a `u32`.
    pub fn from_usize(index: usize) -> NodeId {
        let value = u32::try_from(index)
            .ok()
            .and_then(|v| v.checked_add(1))
            .expect("node index out of range");

        // Index 0 is stored as 1, so that `Option<NodeId>` can use zero as
        // its niche.
        NodeId(NonZero::new(value).expect("value is non-zero"))
    }

    /// Return an anchor for the `port`th output of this node.
    pub fn output(self, port: usize) -> OutputAnchor {
        OutputAnchor { node: self, port }
    }

    /// Return an anchor for the `port`th input of this node.
    pub fn input(self, port: usize) -> InputAnchor {
        InputAnchor { node: self, port }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_usize().fmt(f)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.as_usize())
    }
}

/// Producer end of a data edge: an output port of a node.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutputAnchor {
    pub node: NodeId,
    pub port: usize,
}

/// Consumer end of a data edge: an input port of a node.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InputAnchor {
    pub node: NodeId,
    pub port: usize,
}

/// Either end of a data edge.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Anchor {
    Input(InputAnchor),
    Output(OutputAnchor),
}

impl From<InputAnchor> for Anchor {
    fn from(anchor: InputAnchor) -> Anchor {
        Anchor::Input(anchor)
    }
}

impl From<OutputAnchor> for Anchor {
    fn from(anchor: OutputAnchor) -> Anchor {
        Anchor::Output(anchor)
    }
}
