use tilefuse_graph::{Format, NodeId, OutputAnchor};

use super::builder::{self, Rewriter};
use super::{output, OUTPUT_NAMES};
use crate::fusion::FusionError;

/// Producers of the matched node's outputs, with padding removed.
pub struct UnpaddedOutputs {
    pub nodes: Vec<NodeId>,

    /// `(output port, producer)` pairs, in the order they were given.
    pub outputs: Vec<(usize, OutputAnchor)>,
}

/// Strip the tile padding from the gradients computed by the rewrite.
///
/// `padded` maps output ports of the matched node to the anchors computing
/// them at aligned sizes. Each result has the shape, type and format of the
/// matched node's output, so consumers can be moved without changing their
/// descriptors.
pub fn unpad_outputs(
    rw: &mut Rewriter,
    padded: &[(usize, OutputAnchor)],
) -> Result<UnpaddedOutputs, FusionError> {
    let mut nodes = Vec::new();
    let mut outputs = Vec::with_capacity(padded.len());

    for &(port, source) in padded {
        let unpadded = match port {
            output::DW => unpad_weight_grad(rw, source, &mut nodes)?,
            output::DB => unpad_bias_grad(rw, source, &mut nodes)?,
            output::DX | output::DH_PREV => unpad_tiled(rw, port, source, &mut nodes)?,
            _ => source,
        };
        let result = reshape_to_output(rw, port, unpadded, &mut nodes)?;

        let produced = rw.desc_of(result)?;
        let expected = rw.desc_of(rw.ctx().node.output(port))?;
        if produced.shape() != expected.shape()
            || produced.dtype() != expected.dtype()
            || produced.format() != expected.format()
        {
            return Err(rw.precondition(format!(
                "unpadded {} is {:?} but the original output is {:?}",
                OUTPUT_NAMES[port], produced, expected
            )));
        }
        outputs.push((port, result));
    }

    Ok(UnpaddedOutputs { nodes, outputs })
}

/// Take the leading block of `source` with shape `size`. Adds no node if
/// `source` already has that shape.
fn crop(
    rw: &mut Rewriter,
    role: &str,
    source: OutputAnchor,
    size: &[usize],
    nodes: &mut Vec<NodeId>,
) -> Result<OutputAnchor, FusionError> {
    let desc = rw.desc_of(source)?;
    if desc.fixed_shape().is_some_and(|shape| shape.as_slice() == size) {
        return Ok(source);
    }
    let offsets = vec![0; size.len()];
    let slice = rw.add_unary(role, source, |name, desc| {
        builder::slice(name, desc, &offsets, size)
    })?;
    nodes.push(slice);
    Ok(slice.output(0))
}

/// Reduce `[I_a + H_a, 4H_a]` to `[I + H, 4, H]` by dropping the padded rows
/// and the padded columns of each gate.
fn unpad_weight_grad(
    rw: &mut Rewriter,
    source: OutputAnchor,
    nodes: &mut Vec<NodeId>,
) -> Result<OutputAnchor, FusionError> {
    let ctx = rw.ctx();
    let (i, h) = (ctx.input_size, ctx.hidden_size);
    let (ia, ha) = (ctx.input_aligned, ctx.hidden_aligned);

    let gates = rw.add_unary("dw_gates_reshape", source, |name, desc| {
        Ok(builder::reshape(name, desc, &[ia + ha, 4, ha]))
    })?;
    let dw_x = rw.add_unary("dw_x_slice", gates.output(0), |name, desc| {
        builder::slice(name, desc, &[0, 0, 0], &[i, 4, h])
    })?;
    let dw_h = rw.add_unary("dw_h_slice", gates.output(0), |name, desc| {
        builder::slice(name, desc, &[ia, 0, 0], &[h, 4, h])
    })?;
    let concat = rw.add(
        "dw_concat",
        &[dw_x.output(0), dw_h.output(0)],
        |name, descs| builder::concat(name, descs, 0),
    )?;
    nodes.extend([gates, dw_x, dw_h, concat]);
    Ok(concat.output(0))
}

/// Reduce `[1, 1, 4H_a]` to `[4, H]`.
fn unpad_bias_grad(
    rw: &mut Rewriter,
    source: OutputAnchor,
    nodes: &mut Vec<NodeId>,
) -> Result<OutputAnchor, FusionError> {
    let ctx = rw.ctx();
    let gates = rw.add_unary("db_gates_reshape", source, |name, desc| {
        Ok(builder::reshape(name, desc, &[4, ctx.hidden_aligned]))
    })?;
    nodes.push(gates);
    crop(rw, "db_slice", gates.output(0), &[4, ctx.hidden_size], nodes)
}

/// Convert a `FRACTAL_NZ` tensor `[.., B_a, N_a]` to row-major and drop the
/// padded batch rows and columns.
fn unpad_tiled(
    rw: &mut Rewriter,
    port: usize,
    source: OutputAnchor,
    nodes: &mut Vec<NodeId>,
) -> Result<OutputAnchor, FusionError> {
    let ctx = rw.ctx();
    let label = OUTPUT_NAMES[port];
    let nd = rw.add_unary(&format!("{}_trans_data", label), source, |name, desc| {
        builder::trans_data(name, desc, Format::Nd)
    })?;
    nodes.push(nd);

    let size = if port == output::DX {
        [ctx.seq_len, ctx.batch, ctx.input_size]
    } else {
        [1, ctx.batch, ctx.hidden_size]
    };
    crop(rw, &format!("{}_slice", label), nd.output(0), &size, nodes)
}

/// Reshape `source` to the shape of an output of the matched node, if it
/// differs.
fn reshape_to_output(
    rw: &mut Rewriter,
    port: usize,
    source: OutputAnchor,
    nodes: &mut Vec<NodeId>,
) -> Result<OutputAnchor, FusionError> {
    let target = rw.desc_of(rw.ctx().node.output(port))?;
    let shape = target.fixed_shape().ok_or_else(|| {
        rw.precondition(format!("output {} has a dynamic shape", OUTPUT_NAMES[port]))
    })?;
    if rw.desc_of(source)?.shape() == target.shape() {
        return Ok(source);
    }
    let reshape = rw.add_unary(
        &format!("{}_reshape", OUTPUT_NAMES[port]),
        source,
        |name, desc| Ok(builder::reshape(name, desc, &shape)),
    )?;
    nodes.push(reshape);
    Ok(reshape.output(0))
}
