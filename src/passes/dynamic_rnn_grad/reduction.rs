use tilefuse_graph::{ConstTensor, Format, OutputAnchor};

use super::builder::{self, NodeGroup, Rewriter};
use super::input;
use crate::fusion::FusionError;

/// Build the hidden state entering each timestep, `[T, B, H]`.
///
/// This is `init_h` followed by the hidden states `h` of every timestep
/// except the last.
pub fn build_hidden_history(rw: &mut Rewriter) -> Result<NodeGroup, FusionError> {
    let ctx = rw.ctx();
    let mut nodes = Vec::new();

    let mut init_h = rw.source(input::INIT_H)?;
    if ctx.state_offset == 0 {
        let reshape = rw.add_unary("init_h_reshape", init_h, |name, desc| {
            Ok(builder::reshape(name, desc, &[1, ctx.batch, ctx.hidden_size]))
        })?;
        nodes.push(reshape);
        init_h = reshape.output(0);
    }
    if ctx.single_step() {
        return Ok(NodeGroup {
            nodes,
            output: init_h,
        });
    }

    let h = rw.source(input::H)?;
    let split = rw.add_unary("h_split", h, |name, desc| {
        builder::split(name, desc, 0, &[ctx.seq_len - 1, 1])
    })?;
    let concat = rw.add("h_concat", &[init_h, split.output(0)], |name, descs| {
        builder::concat(name, descs, 0)
    })?;
    nodes.extend([split, concat]);

    Ok(NodeGroup {
        nodes,
        output: concat.output(0),
    })
}

/// Build the weight gradient `sum_t [x_t, h_{t-1}]^T . dgate_t`, with shape
/// `[I_a + H_a, 4H_a]`.
///
/// `gates` are the gate gradients of every timestep and `hidden` is the
/// output of [`build_hidden_history`].
pub fn build_weight_grad(
    rw: &mut Rewriter,
    gates: OutputAnchor,
    hidden: OutputAnchor,
) -> Result<NodeGroup, FusionError> {
    let ctx = rw.ctx();
    let (seq_len, ba) = (ctx.seq_len, ctx.batch_aligned);
    let (gate_width, xh_width) = (ctx.gate_width(), ctx.xh_width());

    let x = rw.source(input::X)?;
    let x_nz = rw.add_unary("x_trans_data", x, |name, desc| {
        builder::trans_data(name, desc, Format::FractalNz)
    })?;
    let h_nz = rw.add_unary("h_trans_data", hidden, |name, desc| {
        builder::trans_data(name, desc, Format::FractalNz)
    })?;
    let xh = rw.add(
        "xh_concat",
        &[x_nz.output(0), h_nz.output(0)],
        |name, descs| builder::concat(name, descs, 2),
    )?;

    let spec = builder::batch_matmul(
        rw.node_name("dw_batch_matmul"),
        rw.tensor(&[seq_len, ba, gate_width], Format::FractalNz)?,
        rw.desc_of(xh.output(0))?,
        rw.tensor(&[seq_len, gate_width, xh_width], Format::FractalNz)?,
        true,
        false,
    );
    let matmul = rw.build(spec, &[gates, xh.output(0)])?;

    let sum = rw.add_unary("dw_reduce_sum", matmul.output(0), |name, desc| {
        builder::reduce_sum(name, desc, &[0], false)
    })?;
    let transpose = rw.add_unary("dw_transpose", sum.output(0), |name, desc| {
        builder::transpose(name, desc, &[1, 0])
    })?;
    let dw = rw.add_unary("dw_trans_data", transpose.output(0), |name, desc| {
        builder::trans_data(name, desc, Format::Nd)
    })?;

    Ok(NodeGroup {
        nodes: vec![x_nz, h_nz, xh, matmul, sum, transpose, dw],
        output: dw.output(0),
    })
}

/// Build the bias gradient, the sum of the gate gradients over the batch and
/// all timesteps, with shape `[1, 1, 4H_a]`.
pub fn build_bias_grad(rw: &mut Rewriter, gates: OutputAnchor) -> Result<NodeGroup, FusionError> {
    let ctx = rw.ctx();
    let (seq_len, ba, gate_width) = (ctx.seq_len, ctx.batch_aligned, ctx.gate_width());

    // Summing over the batch is a matmul with a row of ones.
    let ones_desc = rw.tensor(&[1, ba], Format::FractalNz)?;
    let value = ConstTensor::full(ones_desc, 1.0)
        .ok_or_else(|| rw.precondition("bias reduction constant has unknown shape"))?;
    let ones = rw.build(builder::constant(rw.node_name("ones"), value), &[])?;

    let spec = builder::batch_matmul(
        rw.node_name("db_batch_matmul"),
        rw.desc_of(ones.output(0))?,
        rw.tensor(&[seq_len, ba, gate_width], Format::FractalNz)?,
        rw.tensor(&[seq_len, 1, gate_width], Format::FractalNz)?,
        false,
        false,
    );
    let matmul = rw.build(spec, &[ones.output(0), gates])?;

    let sum = rw.add_unary("db_reduce_sum", matmul.output(0), |name, desc| {
        builder::reduce_sum(name, desc, &[0, 1], true)
    })?;
    let db = rw.add_unary("db_trans_data", sum.output(0), |name, desc| {
        builder::trans_data(name, desc, Format::Nd)
    })?;

    Ok(NodeGroup {
        nodes: vec![ones, matmul, sum, db],
        output: db.output(0),
    })
}
