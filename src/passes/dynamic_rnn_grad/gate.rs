use tilefuse_graph::{align_to_tile, is_tile_aligned, DataType, Format, Graph, Node, NodeId, TensorDesc};

use super::{
    input, output, INPUT_NAMES, NUM_INPUTS, NUM_OUTPUTS, OP_TYPE, OUTPUT_NAMES, REQUIRED_INPUTS,
};
use crate::fusion::SkipReason;

/// Parameters of a rewrite, computed once from the matched node.
#[derive(Clone, Debug, PartialEq)]
pub struct RewriteContext {
    /// The matched `DynamicRNNGrad` node.
    pub node: NodeId,

    /// Name of the matched node, used as a prefix for new node names.
    pub name: String,

    /// Sequence length `T`.
    pub seq_len: usize,
    /// Batch size `B`.
    pub batch: usize,
    /// Input feature width `I`.
    pub input_size: usize,
    /// Hidden width `H`.
    pub hidden_size: usize,

    pub batch_aligned: usize,
    pub input_aligned: usize,
    pub hidden_aligned: usize,

    /// Element type of the weights, used for new intermediate tensors.
    pub dtype: DataType,

    pub forget_bias: f32,

    /// Index of the batch dimension in `init_h`. This is 0 if the initial
    /// state has shape `[B, H]` and 1 if it has shape `[1, B, H]`.
    pub state_offset: usize,
}

impl RewriteContext {
    /// Return true if the sequence has a single timestep.
    pub fn single_step(&self) -> bool {
        self.seq_len == 1
    }

    /// Width of the gate gradients for the four LSTM gates.
    pub fn gate_width(&self) -> usize {
        4 * self.hidden_aligned
    }

    /// Width of the concatenated input and hidden state.
    pub fn xh_width(&self) -> usize {
        self.input_aligned + self.hidden_aligned
    }
}

fn not_applicable(reason: impl Into<String>) -> SkipReason {
    SkipReason::NotApplicable(reason.into())
}

/// Return the dimensions of a tensor with a fixed shape of rank `N`.
///
/// `name` identifies the tensor in messages, eg. "input x".
fn fixed_dims<const N: usize>(desc: &TensorDesc, name: &str) -> Result<[usize; N], SkipReason> {
    if desc.ndim() != N {
        return Err(not_applicable(format!(
            "{} has rank {}, expected {}",
            name,
            desc.ndim(),
            N
        )));
    }
    let mut dims = [0; N];
    for (i, dim) in dims.iter_mut().enumerate() {
        *dim = desc
            .dim(i)
            .ok_or_else(|| not_applicable(format!("{} has a dynamic shape", name)))?;
    }
    Ok(dims)
}

/// Return the `(batch, hidden)` dimensions of a recurrent state with shape
/// `[B, H]` or `[1, B, H]`, and the offset of the batch dimension.
fn state_dims(desc: &TensorDesc, name: &str) -> Result<(usize, usize, usize), SkipReason> {
    match desc.ndim() {
        2 => {
            let [b, h] = fixed_dims::<2>(desc, name)?;
            Ok((b, h, 0))
        }
        3 => {
            let [n, b, h] = fixed_dims::<3>(desc, name)?;
            if n != 1 {
                return Err(not_applicable(format!(
                    "{} has leading dimension {}, expected 1",
                    name, n
                )));
            }
            Ok((b, h, 1))
        }
        ndim => Err(not_applicable(format!(
            "{} has rank {}, expected 2 or 3",
            name, ndim
        ))),
    }
}

fn check_attrs(node: &Node) -> Result<f32, SkipReason> {
    let attrs = node.attrs();

    let cell_type = attrs.get_str("cell_type").unwrap_or("LSTM");
    if cell_type != "LSTM" {
        return Err(not_applicable(format!("unsupported cell type {}", cell_type)));
    }
    if attrs.get_bool("use_peephole").unwrap_or(false) {
        return Err(not_applicable("peephole connections are not supported"));
    }
    if !attrs.get_bool("time_major").unwrap_or(true) {
        return Err(not_applicable("batch-major inputs are not supported"));
    }
    let direction = attrs.get_str("direction").unwrap_or("UNIDIRECTIONAL");
    if direction != "UNIDIRECTIONAL" {
        return Err(not_applicable(format!("unsupported direction {}", direction)));
    }

    Ok(attrs.get_float("forget_bias").unwrap_or(0.0))
}

/// Check that the outputs are row-major tensors of type `dtype` with the
/// shapes implied by `[T, B, I, H]`.
fn check_outputs(node: &Node, dtype: DataType, dims: [usize; 4]) -> Result<(), SkipReason> {
    let [seq_len, batch, input_size, hidden_size] = dims;
    for (port, out_port) in node.outputs().iter().enumerate() {
        let name = format!("output {}", OUTPUT_NAMES[port]);
        let desc = out_port.desc();
        if desc.format() != Format::Nd {
            return Err(not_applicable(format!("{} has format {}", name, desc.format())));
        }
        if desc.dtype() != dtype {
            return Err(not_applicable(format!(
                "{} has type {}, expected {}",
                name,
                desc.dtype(),
                dtype
            )));
        }

        let expected = match port {
            output::DW => vec![input_size + hidden_size, 4 * hidden_size],
            output::DB => vec![4 * hidden_size],
            output::DX => vec![seq_len, batch, input_size],
            _ => {
                let (b, h, _) = state_dims(desc, &name)?;
                if (b, h) != (batch, hidden_size) {
                    return Err(not_applicable(format!(
                        "{} has batch {} and hidden size {}, expected {} and {}",
                        name, b, h, batch, hidden_size
                    )));
                }
                continue;
            }
        };
        let shape = desc
            .fixed_shape()
            .ok_or_else(|| not_applicable(format!("{} has a dynamic shape", name)))?;
        if shape.as_slice() != expected.as_slice() {
            return Err(not_applicable(format!(
                "{} has shape {:?}, expected {:?}",
                name,
                shape.as_slice(),
                expected
            )));
        }
    }
    Ok(())
}

/// Decide whether a `DynamicRNNGrad` node should be rewritten.
///
/// Returns [`SkipReason::NotApplicable`] if the node's shapes are not fully
/// known or are inconsistent, and [`SkipReason::NoRewriteNeeded`] if the
/// input and hidden widths are already tile-aligned.
pub fn check(graph: &Graph, node_id: NodeId) -> Result<RewriteContext, SkipReason> {
    let node = graph
        .node(node_id)
        .ok_or_else(|| not_applicable("node is not in the graph"))?;
    if node.op_type() != OP_TYPE {
        return Err(not_applicable(format!(
            "expected a {} node, found {}",
            OP_TYPE,
            node.op_type()
        )));
    }
    if node.inputs().len() < NUM_INPUTS - 1 || node.inputs().len() > NUM_INPUTS {
        return Err(not_applicable(format!(
            "node has {} inputs",
            node.inputs().len()
        )));
    }
    if node.outputs().len() != NUM_OUTPUTS {
        return Err(not_applicable(format!(
            "node has {} outputs",
            node.outputs().len()
        )));
    }

    let forget_bias = check_attrs(node)?;

    if node
        .input(input::SEQ_LENGTH)
        .is_some_and(|port| port.peer().is_some())
    {
        return Err(not_applicable("sequence lengths vary at runtime"));
    }

    for &port in REQUIRED_INPUTS {
        let in_port = &node.inputs()[port];
        if in_port.peer().is_none() {
            return Err(not_applicable(format!(
                "input {} is not connected",
                INPUT_NAMES[port]
            )));
        }
        if in_port.desc().format() != Format::Nd {
            return Err(not_applicable(format!(
                "input {} has format {}",
                INPUT_NAMES[port],
                in_port.desc().format()
            )));
        }
    }

    let desc = |port: usize| node.inputs()[port].desc();

    let [seq_len, batch, input_size] = fixed_dims::<3>(desc(input::X), "input x")?;
    let [dy_seq, dy_batch, hidden_size] = fixed_dims::<3>(desc(input::DY), "input dy")?;
    if (dy_seq, dy_batch) != (seq_len, batch) {
        return Err(not_applicable(format!(
            "dy has shape [{}, {}, {}] but x has shape [{}, {}, {}]",
            dy_seq, dy_batch, hidden_size, seq_len, batch, input_size
        )));
    }
    if seq_len == 0 || batch == 0 || input_size == 0 || hidden_size == 0 {
        return Err(not_applicable("input has zero-sized dimensions"));
    }

    for port in [
        input::H,
        input::C,
        input::I,
        input::J,
        input::F,
        input::O,
        input::TANHCT,
    ] {
        let dims = fixed_dims::<3>(desc(port), &format!("input {}", INPUT_NAMES[port]))?;
        if dims != [seq_len, batch, hidden_size] {
            return Err(not_applicable(format!(
                "input {} has shape {:?}, expected {:?}",
                INPUT_NAMES[port],
                dims,
                [seq_len, batch, hidden_size]
            )));
        }
    }

    let w_dims = fixed_dims::<2>(desc(input::W), "input w")?;
    if w_dims != [input_size + hidden_size, 4 * hidden_size] {
        return Err(not_applicable(format!(
            "weight has shape {:?}, expected {:?}",
            w_dims,
            [input_size + hidden_size, 4 * hidden_size]
        )));
    }
    let dtype = desc(input::W).dtype();
    if !dtype.is_float() {
        return Err(not_applicable(format!("unsupported weight type {}", dtype)));
    }
    for &port in REQUIRED_INPUTS {
        let port_dtype = desc(port).dtype();
        if port_dtype != dtype {
            return Err(not_applicable(format!(
                "input {} has type {}, expected {}",
                INPUT_NAMES[port], port_dtype, dtype
            )));
        }
    }

    let mut state_offset = 0;
    for port in [input::INIT_H, input::INIT_C, input::DH, input::DC] {
        let (b, h, offset) = state_dims(desc(port), &format!("input {}", INPUT_NAMES[port]))?;
        if (b, h) != (batch, hidden_size) {
            return Err(not_applicable(format!(
                "input {} has batch {} and hidden size {}, expected {} and {}",
                INPUT_NAMES[port], b, h, batch, hidden_size
            )));
        }
        if port == input::INIT_H {
            state_offset = offset;
        }
    }

    check_outputs(node, dtype, [seq_len, batch, input_size, hidden_size])?;

    if is_tile_aligned(input_size) && is_tile_aligned(hidden_size) {
        return Err(SkipReason::NoRewriteNeeded);
    }

    Ok(RewriteContext {
        node: node_id,
        name: node.name().to_string(),
        seq_len,
        batch,
        input_size,
        hidden_size,
        batch_aligned: align_to_tile(batch),
        input_aligned: align_to_tile(input_size),
        hidden_aligned: align_to_tile(hidden_size),
        dtype,
        forget_bias,
        state_offset,
    })
}
