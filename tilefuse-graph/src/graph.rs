use std::error::Error;
use std::fmt;

// Keys are node names and IDs we allocate ourselves, so DOS-resistant hashing
// is not needed.
use rustc_hash::FxHashMap;

use crate::desc::TensorDesc;
use crate::node::{Node, NodeSpec};
use crate::node_id::{Anchor, InputAnchor, NodeId, OutputAnchor};

/// Direction of a port, used in error reports.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PortKind {
    Input,
    Output,
}

/// Errors that occur when mutating a [`Graph`].
#[derive(Clone, Debug, PartialEq)]
pub enum GraphError {
    /// A node ID does not refer to a live node.
    NodeNotFound(NodeId),

    /// A port index is out of range for the node.
    InvalidPort {
        node: NodeId,
        port: usize,
        kind: PortKind,
    },

    /// An edge targets an input which already has a producer.
    InputAlreadyConnected(InputAnchor),

    /// A node with this name already exists.
    DuplicateName(String),

    /// Nodes must have non-empty names.
    EmptyName,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound(id) => write!(f, "node {} not found", id),
            Self::InvalidPort { node, port, kind } => {
                let kind = match kind {
                    PortKind::Input => "input",
                    PortKind::Output => "output",
                };
                write!(f, "node {} has no {} port {}", node, kind, port)
            }
            Self::InputAlreadyConnected(anchor) => write!(
                f,
                "input {} of node {} is already connected",
                anchor.port, anchor.node
            ),
            Self::DuplicateName(name) => write!(f, "duplicate node name \"{}\"", name),
            Self::EmptyName => write!(f, "node name is empty"),
        }
    }
}

impl Error for GraphError {}

/// A computation graph whose nodes live in an arena addressed by [`NodeId`].
///
/// Data edges connect an [`OutputAnchor`] to an [`InputAnchor`]. Each input
/// has at most one producer, while an output may fan out to any number of
/// consumers. Removing a node removes every edge attached to it.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    names: FxHashMap<String, NodeId>,
    live_nodes: usize,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Materialize a node from a spec.
    ///
    /// The node starts with no edges attached.
    pub fn add_node(&mut self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        if spec.name().is_empty() {
            return Err(GraphError::EmptyName);
        }
        if self.names.contains_key(spec.name()) {
            return Err(GraphError::DuplicateName(spec.name().to_string()));
        }
        let id = NodeId::from_usize(self.nodes.len());
        self.names.insert(spec.name().to_string(), id);
        self.nodes.push(Some(Node::from_spec(spec)));
        self.live_nodes += 1;
        Ok(id)
    }

    /// Return the node with a given ID, if it is still in the graph.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.as_usize()).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.nodes
            .get_mut(id.as_usize())
            .and_then(|n| n.as_mut())
            .ok_or(GraphError::NodeNotFound(id))
    }

    fn try_node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.node(id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Find a node by name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Iterate over live nodes in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId::from_usize(i), n)))
    }

    /// Return the number of live nodes.
    pub fn node_count(&self) -> usize {
        self.live_nodes
    }

    /// Return the number of data edges.
    pub fn edge_count(&self) -> usize {
        self.iter()
            .map(|(_, n)| n.inputs.iter().filter(|p| p.peer.is_some()).count())
            .sum()
    }

    /// Return the number of control edges.
    pub fn control_edge_count(&self) -> usize {
        self.iter().map(|(_, n)| n.control_inputs.len()).sum()
    }

    /// Return a counter which changes whenever the node's ports, descriptors
    /// or edges are modified.
    pub fn revision(&self, id: NodeId) -> Option<u64> {
        self.node(id).map(|n| n.revision)
    }

    fn check_output(&self, anchor: OutputAnchor) -> Result<(), GraphError> {
        let node = self.try_node(anchor.node)?;
        if anchor.port >= node.outputs.len() {
            return Err(GraphError::InvalidPort {
                node: anchor.node,
                port: anchor.port,
                kind: PortKind::Output,
            });
        }
        Ok(())
    }

    fn check_input(&self, anchor: InputAnchor) -> Result<(), GraphError> {
        let node = self.try_node(anchor.node)?;
        if anchor.port >= node.inputs.len() {
            return Err(GraphError::InvalidPort {
                node: anchor.node,
                port: anchor.port,
                kind: PortKind::Input,
            });
        }
        Ok(())
    }

    /// Return the descriptor of the tensor produced at an output.
    pub fn output_desc(&self, anchor: OutputAnchor) -> Result<&TensorDesc, GraphError> {
        self.check_output(anchor)?;
        Ok(&self.try_node(anchor.node)?.outputs[anchor.port].desc)
    }

    /// Return the descriptor an input expects.
    pub fn input_desc(&self, anchor: InputAnchor) -> Result<&TensorDesc, GraphError> {
        self.check_input(anchor)?;
        Ok(&self.try_node(anchor.node)?.inputs[anchor.port].desc)
    }

    /// Replace the descriptor of an input.
    pub fn set_input_desc(
        &mut self,
        anchor: InputAnchor,
        desc: TensorDesc,
    ) -> Result<(), GraphError> {
        self.check_input(anchor)?;
        let node = self.node_mut(anchor.node)?;
        node.inputs[anchor.port].desc = desc;
        node.revision += 1;
        Ok(())
    }

    /// Connect a producer to a consumer.
    pub fn add_edge(&mut self, from: OutputAnchor, to: InputAnchor) -> Result<(), GraphError> {
        self.check_output(from)?;
        self.check_input(to)?;
        if self.try_node(to.node)?.inputs[to.port].peer.is_some() {
            return Err(GraphError::InputAlreadyConnected(to));
        }

        let consumer = self.node_mut(to.node)?;
        consumer.inputs[to.port].peer = Some(from);
        consumer.revision += 1;

        let producer = self.node_mut(from.node)?;
        producer.outputs[from.port].peers.push(to);
        producer.revision += 1;

        Ok(())
    }

    /// Add a control edge which orders `from` before `to`.
    ///
    /// Adding an edge that already exists has no effect.
    pub fn add_control_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.try_node(from)?;
        if self.try_node(to)?.control_inputs.contains(&from) {
            return Ok(());
        }
        let consumer = self.node_mut(to)?;
        consumer.control_inputs.push(from);
        consumer.revision += 1;

        let producer = self.node_mut(from)?;
        producer.control_outputs.push(to);
        producer.revision += 1;
        Ok(())
    }

    /// Return the consumers of an output.
    pub fn peer_input_anchors(&self, from: OutputAnchor) -> Result<&[InputAnchor], GraphError> {
        self.check_output(from)?;
        Ok(&self.try_node(from.node)?.outputs[from.port].peers)
    }

    /// Return the producer feeding an input, if connected.
    pub fn peer_output_anchor(&self, to: InputAnchor) -> Result<Option<OutputAnchor>, GraphError> {
        self.check_input(to)?;
        Ok(self.try_node(to.node)?.inputs[to.port].peer)
    }

    /// Remove every data edge attached to an anchor.
    ///
    /// Returns the number of edges removed.
    pub fn unlink_all(&mut self, anchor: impl Into<Anchor>) -> Result<usize, GraphError> {
        match anchor.into() {
            Anchor::Input(to) => {
                self.check_input(to)?;
                let consumer = self.node_mut(to.node)?;
                let Some(from) = consumer.inputs[to.port].peer.take() else {
                    return Ok(0);
                };
                consumer.revision += 1;

                let producer = self.node_mut(from.node)?;
                producer.outputs[from.port].peers.retain(|p| *p != to);
                producer.revision += 1;
                Ok(1)
            }
            Anchor::Output(from) => {
                self.check_output(from)?;
                let producer = self.node_mut(from.node)?;
                let peers = std::mem::take(&mut producer.outputs[from.port].peers);
                if peers.is_empty() {
                    return Ok(0);
                }
                producer.revision += 1;

                for to in &peers {
                    let consumer = self.node_mut(to.node)?;
                    consumer.inputs[to.port].peer = None;
                    consumer.revision += 1;
                }
                Ok(peers.len())
            }
        }
    }

    /// Remove all control edges into and out of a node.
    ///
    /// Returns the number of edges removed.
    pub fn unlink_control(&mut self, id: NodeId) -> Result<usize, GraphError> {
        let node = self.node_mut(id)?;
        let inputs = std::mem::take(&mut node.control_inputs);
        let outputs = std::mem::take(&mut node.control_outputs);
        if !inputs.is_empty() || !outputs.is_empty() {
            node.revision += 1;
        }

        for &src in &inputs {
            let src_node = self.node_mut(src)?;
            src_node.control_outputs.retain(|n| *n != id);
            src_node.revision += 1;
        }
        for &dst in &outputs {
            let dst_node = self.node_mut(dst)?;
            dst_node.control_inputs.retain(|n| *n != id);
            dst_node.revision += 1;
        }
        Ok(inputs.len() + outputs.len())
    }

    /// Remove a node and every data and control edge attached to it.
    ///
    /// Returns the removed node, with its edges cleared.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        let (n_inputs, n_outputs) = {
            let node = self.try_node(id)?;
            (node.inputs.len(), node.outputs.len())
        };
        for port in 0..n_inputs {
            self.unlink_all(id.input(port))?;
        }
        for port in 0..n_outputs {
            self.unlink_all(id.output(port))?;
        }
        self.unlink_control(id)?;

        let node = self.nodes[id.as_usize()]
            .take()
            .ok_or(GraphError::NodeNotFound(id))?;
        self.names.remove(&node.name);
        self.live_nodes -= 1;
        Ok(node)
    }
}
