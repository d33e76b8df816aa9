//! Node specs for the primitives used by the rewrite, and a helper which adds
//! them to the graph.

use smallvec::SmallVec;
use tilefuse_graph::{
    align_to_tile, ConstTensor, DescError, Format, Graph, GraphError, InputAnchor, NodeId,
    NodeSpec, OutputAnchor, TensorDesc,
};

use super::gate::RewriteContext;
use crate::fusion::{FusionError, FusionStage};

pub const RESHAPE: &str = "Reshape";
pub const SPLIT: &str = "SplitVD";
pub const CONCAT: &str = "ConcatD";
pub const PAD: &str = "PadD";
pub const SLICE: &str = "SliceD";
pub const TRANS_DATA: &str = "TransData";
pub const TRANSPOSE: &str = "TransposeD";
pub const REDUCE_SUM: &str = "ReduceSumD";
pub const MATMUL: &str = "MatMulV2";
pub const BATCH_MATMUL: &str = "BatchMatMul";
pub const LSTM_GRAD_CELL: &str = "DynamicLSTMGradCell";
pub const CONST: &str = "Const";

/// Adds the nodes of a rewrite to the graph and tracks them.
///
/// Errors are tagged with the last stage that was completed.
pub struct Rewriter<'a> {
    graph: &'a mut Graph,
    ctx: &'a RewriteContext,
    stage: FusionStage,
    new_nodes: Vec<NodeId>,
}

impl<'a> Rewriter<'a> {
    pub fn new(graph: &'a mut Graph, ctx: &'a RewriteContext) -> Rewriter<'a> {
        Rewriter {
            graph,
            ctx,
            stage: FusionStage::GateChecked,
            new_nodes: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &'a RewriteContext {
        self.ctx
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Record that a stage has completed.
    pub fn advance(&mut self, stage: FusionStage) {
        log::debug!("{}: {} -> {}", self.ctx.name, self.stage, stage);
        self.stage = stage;
    }

    pub fn into_new_nodes(self) -> Vec<NodeId> {
        self.new_nodes
    }

    /// Return the name for a new node with a given role.
    pub fn node_name(&self, role: &str) -> String {
        format!("{}/{}", self.ctx.name, role)
    }

    pub fn graph_error(&self, error: GraphError) -> FusionError {
        FusionError::Graph {
            stage: self.stage,
            error,
        }
    }

    pub fn desc_error(&self, error: DescError) -> FusionError {
        FusionError::Desc {
            stage: self.stage,
            error,
        }
    }

    pub fn precondition(&self, message: impl Into<String>) -> FusionError {
        FusionError::precondition(self.stage, message)
    }

    /// Run a graph operation, converting its error.
    pub fn with_graph<T>(
        &mut self,
        op: impl FnOnce(&mut Graph) -> Result<T, GraphError>,
    ) -> Result<T, FusionError> {
        op(self.graph).map_err(|err| self.graph_error(err))
    }

    /// Return the descriptor of a tensor produced by a node.
    pub fn desc_of(&self, anchor: OutputAnchor) -> Result<TensorDesc, FusionError> {
        self.graph
            .output_desc(anchor)
            .cloned()
            .map_err(|err| self.graph_error(err))
    }

    /// Return the producer of one of the matched node's inputs.
    pub fn source(&self, port: usize) -> Result<OutputAnchor, FusionError> {
        self.graph
            .peer_output_anchor(self.ctx.node.input(port))
            .map_err(|err| self.graph_error(err))?
            .ok_or_else(|| self.precondition(format!("input {} is not connected", port)))
    }

    /// Create a descriptor for a new intermediate tensor. Its origin format
    /// is always ND.
    pub fn tensor(&self, shape: &[usize], format: Format) -> Result<TensorDesc, FusionError> {
        TensorDesc::fixed(shape, self.ctx.dtype, format)
            .map(|desc| desc.with_origin_format(Format::Nd))
            .map_err(|err| self.desc_error(err))
    }

    /// Connect a producer to a consumer.
    ///
    /// The data types and storage shapes at both ends must match.
    pub fn connect(&mut self, from: OutputAnchor, to: InputAnchor) -> Result<(), FusionError> {
        let produced = self.desc_of(from)?;
        let expected = self
            .graph
            .input_desc(to)
            .map_err(|err| self.graph_error(err))?;
        if produced.dtype() != expected.dtype() {
            return Err(self.precondition(format!(
                "data type {} of output {} of node {} does not match {} expected by input {} of node {}",
                produced.dtype(),
                from.port,
                from.node,
                expected.dtype(),
                to.port,
                to.node,
            )));
        }
        if produced.storage_shape() != expected.storage_shape() {
            return Err(self.precondition(format!(
                "storage shape {:?} of output {} of node {} does not match {:?} expected by input {} of node {}",
                produced.storage_shape(),
                from.port,
                from.node,
                expected.storage_shape(),
                to.port,
                to.node,
            )));
        }
        self.with_graph(|g| g.add_edge(from, to))
    }

    /// Add a node and connect `inputs[i]` to its `i`th input.
    pub fn build(
        &mut self,
        spec: NodeSpec,
        inputs: &[OutputAnchor],
    ) -> Result<NodeId, FusionError> {
        if spec.inputs().len() != inputs.len() {
            return Err(self.precondition(format!(
                "node {} has {} inputs but {} sources were given",
                spec.name(),
                spec.inputs().len(),
                inputs.len()
            )));
        }
        let name = spec.name().to_string();
        let op_type = spec.op_type().to_string();
        let id = self.with_graph(|g| g.add_node(spec))?;
        self.new_nodes.push(id);
        log::trace!("added {} node {} ({})", op_type, name, id);

        for (port, &source) in inputs.iter().enumerate() {
            self.connect(source, id.input(port))?;
        }
        Ok(id)
    }

    /// Add a node whose input descriptors are those of its sources.
    ///
    /// `make` is called with the node's name and the descriptors of
    /// `inputs`, and returns the spec.
    pub fn add(
        &mut self,
        role: &str,
        inputs: &[OutputAnchor],
        make: impl FnOnce(String, Vec<TensorDesc>) -> Result<NodeSpec, DescError>,
    ) -> Result<NodeId, FusionError> {
        let descs = inputs
            .iter()
            .map(|&source| self.desc_of(source))
            .collect::<Result<Vec<_>, _>>()?;
        let spec = make(self.node_name(role), descs).map_err(|err| self.desc_error(err))?;
        self.build(spec, inputs)
    }

    /// Single-input version of [`add`](Self::add).
    pub fn add_unary(
        &mut self,
        role: &str,
        input: OutputAnchor,
        make: impl FnOnce(String, TensorDesc) -> Result<NodeSpec, DescError>,
    ) -> Result<NodeId, FusionError> {
        let desc = self.desc_of(input)?;
        let spec = make(self.node_name(role), desc).map_err(|err| self.desc_error(err))?;
        self.build(spec, &[input])
    }
}

/// Nodes implementing one part of a rewrite, and the output the rest of the
/// rewrite consumes.
#[derive(Clone, Debug)]
pub struct NodeGroup {
    pub nodes: Vec<NodeId>,
    pub output: OutputAnchor,
}

fn ints(values: impl IntoIterator<Item = usize>) -> Vec<i64> {
    values.into_iter().map(|v| v as i64).collect()
}

fn fixed_shape(desc: &TensorDesc) -> Result<SmallVec<[usize; 5]>, DescError> {
    desc.fixed_shape().ok_or(DescError::UnknownDims)
}

fn check_axis(axis: usize, ndim: usize) -> Result<(), DescError> {
    if axis >= ndim {
        return Err(DescError::AxisOutOfRange { axis, ndim });
    }
    Ok(())
}

/// Reinterpret a tensor with a new row-major shape.
pub fn reshape(name: String, input: TensorDesc, shape: &[usize]) -> NodeSpec {
    let output = TensorDesc::nd(shape, input.dtype());
    NodeSpec::new(name, RESHAPE)
        .with_input("x", input)
        .with_output("y", output)
        .with_attr("shape", ints(shape.iter().copied()))
}

/// Split a tensor along `axis` into parts with the given sizes.
pub fn split(
    name: String,
    input: TensorDesc,
    axis: usize,
    sizes: &[usize],
) -> Result<NodeSpec, DescError> {
    let shape = fixed_shape(&input)?;
    check_axis(axis, shape.len())?;
    let mut spec = NodeSpec::new(name, SPLIT)
        .with_attr("split_dim", axis as i64)
        .with_attr("size_splits", ints(sizes.iter().copied()))
        .with_attr("num_split", sizes.len() as i64);
    for (i, &size) in sizes.iter().enumerate() {
        let mut part = shape.clone();
        part[axis] = size;
        let desc = TensorDesc::fixed(&part, input.dtype(), input.format())?
            .with_origin_format(input.origin_format());
        spec = spec.with_output(&format!("y{}", i), desc);
    }
    Ok(spec.with_input("x", input))
}

/// Concatenate tensors along `axis`.
///
/// For fractal formats, concatenating along one of the two matrix dimensions
/// joins whole tiles, so each part contributes its tile-aligned size and the
/// other matrix dimension is also tile-aligned.
pub fn concat(name: String, inputs: Vec<TensorDesc>, axis: usize) -> Result<NodeSpec, DescError> {
    let first = inputs
        .first()
        .ok_or(DescError::AxisOutOfRange { axis, ndim: 0 })?;
    let mut shape = fixed_shape(first)?;
    let ndim = shape.len();
    check_axis(axis, ndim)?;
    let tiled = first.format().is_fractal() && axis + 2 >= ndim;

    let mut total = 0;
    for desc in &inputs {
        let part = fixed_shape(desc)?;
        check_axis(axis, part.len())?;
        total += if tiled {
            align_to_tile(part[axis])
        } else {
            part[axis]
        };
    }
    shape[axis] = total;
    if tiled {
        let other = if axis == ndim - 1 { ndim - 2 } else { ndim - 1 };
        shape[other] = align_to_tile(shape[other]);
    }
    let output = TensorDesc::fixed(&shape, first.dtype(), first.format())?
        .with_origin_format(first.origin_format());

    let mut spec = NodeSpec::new(name, CONCAT)
        .with_attr("concat_dim", axis as i64)
        .with_attr("N", inputs.len() as i64);
    for (i, desc) in inputs.into_iter().enumerate() {
        spec = spec.with_input(&format!("x{}", i), desc);
    }
    Ok(spec.with_output("y", output))
}

/// Pad the end of each dimension of a row-major tensor with zeros.
pub fn pad(name: String, input: TensorDesc, pad_end: &[usize]) -> Result<NodeSpec, DescError> {
    let shape: SmallVec<[usize; 5]> = fixed_shape(&input)?
        .iter()
        .zip(pad_end)
        .map(|(size, pad)| size + pad)
        .collect();
    let output = TensorDesc::nd(&shape, input.dtype());
    let paddings: Vec<Vec<i64>> = pad_end.iter().map(|&p| vec![0, p as i64]).collect();
    Ok(NodeSpec::new(name, PAD)
        .with_input("x", input)
        .with_output("y", output)
        .with_attr("paddings", paddings))
}

/// Extract the block of a row-major tensor starting at `offsets` with shape
/// `size`.
pub fn slice(
    name: String,
    input: TensorDesc,
    offsets: &[usize],
    size: &[usize],
) -> Result<NodeSpec, DescError> {
    let shape = fixed_shape(&input)?;
    let ndim = shape.len();
    for len in [offsets.len(), size.len()] {
        if len != ndim {
            return Err(DescError::RankMismatch { len, ndim });
        }
    }
    for (axis, ((&offset, &len), &dim)) in offsets.iter().zip(size).zip(&shape).enumerate() {
        if offset + len > dim {
            return Err(DescError::SliceOutOfRange {
                axis,
                end: offset + len,
                size: dim,
            });
        }
    }
    let output = TensorDesc::fixed(size, input.dtype(), input.format())?
        .with_origin_format(input.origin_format());
    Ok(NodeSpec::new(name, SLICE)
        .with_attr("offsets", ints(offsets.iter().copied()))
        .with_attr("size", ints(size.iter().copied()))
        .with_input("x", input)
        .with_output("y", output))
}

/// Convert a tensor to a different memory format.
pub fn trans_data(name: String, input: TensorDesc, format: Format) -> Result<NodeSpec, DescError> {
    let shape = fixed_shape(&input)?;
    let output =
        TensorDesc::fixed(&shape, input.dtype(), format)?.with_origin_format(input.origin_format());
    Ok(NodeSpec::new(name, TRANS_DATA)
        .with_attr("src_format", input.format().as_str())
        .with_attr("dst_format", format.as_str())
        .with_input("src", input)
        .with_output("dst", output))
}

/// Permute the dimensions of a tensor.
pub fn transpose(name: String, input: TensorDesc, perm: &[usize]) -> Result<NodeSpec, DescError> {
    let shape = fixed_shape(&input)?;
    let ndim = shape.len();
    let permuted = perm
        .iter()
        .map(|&axis| {
            check_axis(axis, ndim)?;
            Ok(shape[axis])
        })
        .collect::<Result<SmallVec<[usize; 5]>, DescError>>()?;
    let output = TensorDesc::fixed(&permuted, input.dtype(), input.format())?
        .with_origin_format(input.origin_format());
    Ok(NodeSpec::new(name, TRANSPOSE)
        .with_attr("perm", ints(perm.iter().copied()))
        .with_input("x", input)
        .with_output("y", output))
}

/// Sum a tensor over `axes`.
pub fn reduce_sum(
    name: String,
    input: TensorDesc,
    axes: &[usize],
    keep_dims: bool,
) -> Result<NodeSpec, DescError> {
    let shape = fixed_shape(&input)?;
    let reduced: SmallVec<[usize; 5]> = shape
        .iter()
        .enumerate()
        .filter_map(|(axis, &size)| match (axes.contains(&axis), keep_dims) {
            (false, _) => Some(size),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    let output = TensorDesc::fixed(&reduced, input.dtype(), input.format())?
        .with_origin_format(input.origin_format());
    Ok(NodeSpec::new(name, REDUCE_SUM)
        .with_attr("axes", ints(axes.iter().copied()))
        .with_attr("keep_dims", keep_dims)
        .with_input("x", input)
        .with_output("y", output))
}

/// Multiply two tiled matrices.
pub fn matmul(
    name: String,
    x1: TensorDesc,
    x2: TensorDesc,
    output: TensorDesc,
    transpose_x1: bool,
    transpose_x2: bool,
) -> NodeSpec {
    NodeSpec::new(name, MATMUL)
        .with_attr("transpose_x1", transpose_x1)
        .with_attr("transpose_x2", transpose_x2)
        .with_input("x1", x1)
        .with_input("x2", x2)
        .with_output("y", output)
}

/// Multiply two batches of tiled matrices.
pub fn batch_matmul(
    name: String,
    x1: TensorDesc,
    x2: TensorDesc,
    output: TensorDesc,
    adj_x1: bool,
    adj_x2: bool,
) -> NodeSpec {
    NodeSpec::new(name, BATCH_MATMUL)
        .with_attr("adj_x1", adj_x1)
        .with_attr("adj_x2", adj_x2)
        .with_input("x1", x1)
        .with_input("x2", x2)
        .with_output("y", output)
}

/// A node which produces a constant tensor.
pub fn constant(name: String, value: ConstTensor) -> NodeSpec {
    let desc = value.desc().clone();
    NodeSpec::new(name, CONST)
        .with_attr("value", value)
        .with_output("y", desc)
}

/// Names of the inputs of the gradient cell, in port order.
pub const CELL_INPUTS: [&str; 10] = [
    "init_c", "c", "dy", "dh", "dc", "i", "j", "f", "o", "tanhct",
];

/// Gradient of one LSTM timestep.
///
/// `inputs` are in the order of [`CELL_INPUTS`]. The outputs are the gate
/// gradients `dgate` and the gradient of the previous cell state `dct_1`.
pub fn lstm_grad_cell(
    name: String,
    inputs: Vec<TensorDesc>,
    dgate: TensorDesc,
    dct_1: TensorDesc,
    forget_bias: f32,
    t_state: usize,
) -> NodeSpec {
    let mut spec = NodeSpec::new(name, LSTM_GRAD_CELL)
        .with_attr("forget_bias", forget_bias)
        .with_attr("t_state", t_state as i64)
        .with_attr("gate_order", "ijfo");
    for (input_name, desc) in CELL_INPUTS.iter().zip(inputs) {
        spec = spec.with_input(input_name, desc);
    }
    spec.with_output("dgate", dgate).with_output("dct_1", dct_1)
}
