use tilefuse_graph::{AttrValue, DataType, Graph, NodeId, NodeSpec, TensorDesc};

use crate::passes::dynamic_rnn_grad::{input, output, INPUT_NAMES, OP_TYPE, OUTPUT_NAMES};

/// A `DynamicRNNGrad` node added to a graph by [`RnnGradBuilder`].
pub struct RnnGradNode {
    pub node: NodeId,

    /// `Data` node feeding each input, or `None` if the input is not
    /// connected.
    pub producers: Vec<Option<NodeId>>,

    /// `Identity` node consuming each output.
    pub consumers: Vec<NodeId>,

    /// Additional `(output port, consumer)` pairs.
    pub extra_consumers: Vec<(usize, NodeId)>,

    /// `NoOp` nodes linked to the node by control edges. The first is a
    /// control predecessor and the second a control successor.
    pub control_nodes: Vec<NodeId>,
}

/// Builds a graph containing a `DynamicRNNGrad` node whose inputs are fed by
/// `Data` nodes and whose outputs each have one consumer.
#[derive(Clone, Debug)]
pub struct RnnGradBuilder {
    name: String,
    seq_len: usize,
    batch: usize,
    input_size: usize,
    hidden_size: usize,
    dtype: DataType,

    /// Use `[1, B, H]` rather than `[B, H]` for the recurrent state.
    state_3d: bool,

    connect_seq_length: bool,
    unconnected: Vec<usize>,
    desc_overrides: Vec<(usize, TensorDesc)>,
    output_overrides: Vec<(usize, TensorDesc)>,
    extra_consumers: Vec<usize>,
    control_edges: bool,
    attrs: Vec<(String, AttrValue)>,
}

impl RnnGradBuilder {
    pub fn new(seq_len: usize, batch: usize, input_size: usize, hidden_size: usize) -> Self {
        RnnGradBuilder {
            name: "rnn".to_string(),
            seq_len,
            batch,
            input_size,
            hidden_size,
            dtype: DataType::Float16,
            state_3d: false,
            connect_seq_length: false,
            unconnected: Vec::new(),
            desc_overrides: Vec::new(),
            output_overrides: Vec::new(),
            extra_consumers: Vec::new(),
            control_edges: false,
            attrs: vec![
                ("cell_type".to_string(), "LSTM".into()),
                ("direction".to_string(), "UNIDIRECTIONAL".into()),
                ("time_major".to_string(), true.into()),
                ("use_peephole".to_string(), false.into()),
                ("forget_bias".to_string(), 1.0f32.into()),
            ],
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn state_3d(mut self, state_3d: bool) -> Self {
        self.state_3d = state_3d;
        self
    }

    pub fn connect_seq_length(mut self) -> Self {
        self.connect_seq_length = true;
        self
    }

    /// Leave an input without a producer.
    pub fn unconnected(mut self, port: usize) -> Self {
        self.unconnected.push(port);
        self
    }

    /// Replace the descriptor of an input.
    pub fn input_desc(mut self, port: usize, desc: TensorDesc) -> Self {
        self.desc_overrides.push((port, desc));
        self
    }

    /// Replace the descriptor of an output.
    pub fn output_desc(mut self, port: usize, desc: TensorDesc) -> Self {
        self.output_overrides.push((port, desc));
        self
    }

    /// Add another consumer of an output.
    pub fn extra_consumer(mut self, port: usize) -> Self {
        self.extra_consumers.push(port);
        self
    }

    /// Link the node to a control predecessor and a control successor.
    pub fn control_edges(mut self) -> Self {
        self.control_edges = true;
        self
    }

    /// Set or replace an attribute.
    pub fn attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.retain(|(n, _)| n != name);
        self.attrs.push((name.to_string(), value.into()));
        self
    }

    fn nd(&self, shape: &[usize]) -> TensorDesc {
        TensorDesc::nd(shape, self.dtype)
    }

    fn state_desc(&self) -> TensorDesc {
        if self.state_3d {
            self.nd(&[1, self.batch, self.hidden_size])
        } else {
            self.nd(&[self.batch, self.hidden_size])
        }
    }

    fn default_input_desc(&self, port: usize) -> TensorDesc {
        let (t, b, i, h) = (self.seq_len, self.batch, self.input_size, self.hidden_size);
        match port {
            input::X => self.nd(&[t, b, i]),
            input::W => self.nd(&[i + h, 4 * h]),
            input::B => self.nd(&[4 * h]),
            input::INIT_H | input::INIT_C | input::DH | input::DC => self.state_desc(),
            input::SEQ_LENGTH => TensorDesc::nd(&[b], DataType::Int32),
            _ => self.nd(&[t, b, h]),
        }
    }

    pub fn input_descs(&self) -> Vec<TensorDesc> {
        (0..INPUT_NAMES.len())
            .map(|port| {
                self.desc_overrides
                    .iter()
                    .rev()
                    .find(|(p, _)| *p == port)
                    .map(|(_, desc)| desc.clone())
                    .unwrap_or_else(|| self.default_input_desc(port))
            })
            .collect()
    }

    fn default_output_desc(&self, port: usize) -> TensorDesc {
        let (t, b, i, h) = (self.seq_len, self.batch, self.input_size, self.hidden_size);
        match port {
            output::DW => self.nd(&[i + h, 4 * h]),
            output::DB => self.nd(&[4 * h]),
            output::DX => self.nd(&[t, b, i]),
            _ => self.state_desc(),
        }
    }

    pub fn output_descs(&self) -> Vec<TensorDesc> {
        (0..OUTPUT_NAMES.len())
            .map(|port| {
                self.output_overrides
                    .iter()
                    .rev()
                    .find(|(p, _)| *p == port)
                    .map(|(_, desc)| desc.clone())
                    .unwrap_or_else(|| self.default_output_desc(port))
            })
            .collect()
    }

    fn add_consumer(&self, graph: &mut Graph, node: NodeId, port: usize, name: String) -> NodeId {
        let desc = graph.output_desc(node.output(port)).unwrap().clone();
        let consumer = graph
            .add_node(
                NodeSpec::new(name, "Identity")
                    .with_input("x", desc.clone())
                    .with_output("y", desc),
            )
            .unwrap();
        graph.add_edge(node.output(port), consumer.input(0)).unwrap();
        consumer
    }

    /// Add the node, its producers and its consumers to an existing graph.
    pub fn add_to(&self, graph: &mut Graph) -> RnnGradNode {
        let input_descs = self.input_descs();
        let output_descs = self.output_descs();

        let mut spec = NodeSpec::new(self.name.clone(), OP_TYPE);
        for (name, desc) in INPUT_NAMES.iter().zip(&input_descs) {
            spec = spec.with_input(name, desc.clone());
        }
        for (name, desc) in OUTPUT_NAMES.iter().zip(&output_descs) {
            spec = spec.with_output(name, desc.clone());
        }
        for (name, value) in &self.attrs {
            spec = spec.with_attr(name, value.clone());
        }
        let node = graph.add_node(spec).unwrap();

        let mut producers = Vec::with_capacity(input_descs.len());
        for (port, desc) in input_descs.into_iter().enumerate() {
            let skip = self.unconnected.contains(&port)
                || (port == input::SEQ_LENGTH && !self.connect_seq_length);
            if skip {
                producers.push(None);
                continue;
            }
            let data = graph
                .add_node(
                    NodeSpec::new(format!("{}_{}", self.name, INPUT_NAMES[port]), "Data")
                        .with_output("y", desc),
                )
                .unwrap();
            graph.add_edge(data.output(0), node.input(port)).unwrap();
            producers.push(Some(data));
        }

        let consumers = (0..output_descs.len())
            .map(|port| {
                let name = format!("{}_{}_consumer", self.name, OUTPUT_NAMES[port]);
                self.add_consumer(graph, node, port, name)
            })
            .collect();

        let extra_consumers = self
            .extra_consumers
            .iter()
            .enumerate()
            .map(|(k, &port)| {
                let name = format!("{}_{}_consumer_{}", self.name, OUTPUT_NAMES[port], k);
                (port, self.add_consumer(graph, node, port, name))
            })
            .collect();

        let mut control_nodes = Vec::new();
        if self.control_edges {
            for role in ["before", "after"] {
                let id = graph
                    .add_node(NodeSpec::new(format!("{}_{}", self.name, role), "NoOp"))
                    .unwrap();
                control_nodes.push(id);
            }
            graph.add_control_edge(control_nodes[0], node).unwrap();
            graph.add_control_edge(node, control_nodes[1]).unwrap();
        }

        RnnGradNode {
            node,
            producers,
            consumers,
            extra_consumers,
            control_nodes,
        }
    }

    /// Create a new graph containing the node.
    pub fn build(&self) -> (Graph, RnnGradNode) {
        let mut graph = Graph::new();
        let node = self.add_to(&mut graph);
        (graph, node)
    }
}

/// Check that the producer and consumer of every edge agree on the tensor's
/// data type and storage shape, and that every connected input has the
/// expected producer.
pub fn check_edges(graph: &Graph) -> Result<(), String> {
    for (id, node) in graph.iter() {
        for (port, in_port) in node.inputs().iter().enumerate() {
            let Some(from) = in_port.peer() else {
                continue;
            };
            let produced = graph.output_desc(from).map_err(|err| err.to_string())?;
            if produced.dtype() != in_port.desc().dtype() {
                return Err(format!(
                    "edge into {}:{} ({}) has type {} but input expects {}",
                    node.name(),
                    port,
                    id,
                    produced.dtype(),
                    in_port.desc().dtype()
                ));
            }
            if produced.storage_shape() != in_port.desc().storage_shape() {
                return Err(format!(
                    "edge into {}:{} ({}) has storage shape {:?} but input expects {:?}",
                    node.name(),
                    port,
                    id,
                    produced.storage_shape(),
                    in_port.desc().storage_shape()
                ));
            }
            let peers = graph.peer_input_anchors(from).map_err(|err| err.to_string())?;
            if !peers.contains(&id.input(port)) {
                return Err(format!(
                    "input {}:{} is not listed as a consumer of its producer",
                    node.name(),
                    port
                ));
            }
        }
    }
    Ok(())
}
