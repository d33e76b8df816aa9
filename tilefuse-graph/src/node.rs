use smallvec::SmallVec;

use crate::attr::{AttrValue, Attrs};
use crate::desc::TensorDesc;
use crate::node_id::{InputAnchor, NodeId, OutputAnchor};

/// A named tensor descriptor attached to an input or output of a node.
#[derive(Clone, Debug, PartialEq)]
pub struct PortDesc {
    pub name: String,
    pub desc: TensorDesc,
}

/// Description of a node that has not yet been added to a graph.
///
/// Specs are built up with the `with_*` methods and then passed to
/// [`Graph::add_node`](crate::Graph::add_node).
#[derive(Clone, Debug, PartialEq)]
pub struct NodeSpec {
    name: String,
    op_type: String,
    inputs: Vec<PortDesc>,
    outputs: Vec<PortDesc>,
    attrs: Attrs,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, op_type: &str) -> NodeSpec {
        NodeSpec {
            name: name.into(),
            op_type: op_type.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Attrs::new(),
        }
    }

    /// Append an input port.
    pub fn with_input(mut self, name: &str, desc: TensorDesc) -> Self {
        self.inputs.push(PortDesc {
            name: name.to_string(),
            desc,
        });
        self
    }

    /// Append an output port.
    pub fn with_output(mut self, name: &str, desc: TensorDesc) -> Self {
        self.outputs.push(PortDesc {
            name: name.to_string(),
            desc,
        });
        self
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.set(name, value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn inputs(&self) -> &[PortDesc] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortDesc] {
        &self.outputs
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }
}

/// Input port of a node in a graph.
#[derive(Clone, Debug)]
pub struct InputPort {
    pub(crate) name: String,
    pub(crate) desc: TensorDesc,

    /// Producer feeding this input. Data edges have exactly one producer.
    pub(crate) peer: Option<OutputAnchor>,
}

impl InputPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn peer(&self) -> Option<OutputAnchor> {
        self.peer
    }
}

/// Output port of a node in a graph.
#[derive(Clone, Debug)]
pub struct OutputPort {
    pub(crate) name: String,
    pub(crate) desc: TensorDesc,

    /// Consumers of this output, in the order they were connected.
    pub(crate) peers: SmallVec<[InputAnchor; 2]>,
}

impl OutputPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn peers(&self) -> &[InputAnchor] {
        &self.peers
    }
}

/// A node in a [`Graph`](crate::Graph).
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) op_type: String,
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    pub(crate) attrs: Attrs,

    // Control edges carry ordering constraints but no data.
    pub(crate) control_inputs: SmallVec<[NodeId; 1]>,
    pub(crate) control_outputs: SmallVec<[NodeId; 1]>,

    /// Incremented whenever the node's ports, descriptors or edges change.
    pub(crate) revision: u64,
}

impl Node {
    pub(crate) fn from_spec(spec: NodeSpec) -> Node {
        Node {
            name: spec.name,
            op_type: spec.op_type,
            inputs: spec
                .inputs
                .into_iter()
                .map(|p| InputPort {
                    name: p.name,
                    desc: p.desc,
                    peer: None,
                })
                .collect(),
            outputs: spec
                .outputs
                .into_iter()
                .map(|p| OutputPort {
                    name: p.name,
                    desc: p.desc,
                    peers: SmallVec::new(),
                })
                .collect(),
            attrs: spec.attrs,
            control_inputs: SmallVec::new(),
            control_outputs: SmallVec::new(),
            revision: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn input(&self, port: usize) -> Option<&InputPort> {
        self.inputs.get(port)
    }

    pub fn output(&self, port: usize) -> Option<&OutputPort> {
        self.outputs.get(port)
    }

    /// Return the index of the input port with a given name.
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    /// Return the index of the output port with a given name.
    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn control_inputs(&self) -> &[NodeId] {
        &self.control_inputs
    }

    pub fn control_outputs(&self) -> &[NodeId] {
        &self.control_outputs
    }

    /// Return true if any data or control edge is attached to this node.
    pub fn is_connected(&self) -> bool {
        self.inputs.iter().any(|p| p.peer.is_some())
            || self.outputs.iter().any(|p| !p.peers.is_empty())
            || !self.control_inputs.is_empty()
            || !self.control_outputs.is_empty()
    }
}
