use tilefuse_graph::{Format, NodeId, OutputAnchor, TILE_SIZE};

use super::builder::{self, NodeGroup, Rewriter};
use super::{input, INPUT_NAMES};
use crate::fusion::FusionError;

/// Inputs with one `[1, B, H]` slice consumed by each step.
const SEQUENCE_INPUTS: [usize; 7] = [
    input::C,
    input::DY,
    input::I,
    input::J,
    input::F,
    input::O,
    input::TANHCT,
];

/// Build a copy of the weights `[I + H, 4H]` with the input and hidden blocks
/// of each gate zero-padded to tile-aligned sizes, in `FRACTAL_Z` layout.
pub fn build_weight_alignment(rw: &mut Rewriter) -> Result<NodeGroup, FusionError> {
    let ctx = rw.ctx();
    let (i, h) = (ctx.input_size, ctx.hidden_size);
    let (ia, ha) = (ctx.input_aligned, ctx.hidden_aligned);

    let w = rw.source(input::W)?;
    let gates = rw.add_unary("weight_reshape", w, |name, desc| {
        Ok(builder::reshape(name, desc, &[i + h, 4, h]))
    })?;
    let split = rw.add_unary("weight_split", gates.output(0), |name, desc| {
        builder::split(name, desc, 0, &[i, h])
    })?;
    let pad_x = rw.add_unary("weight_pad_x", split.output(0), |name, desc| {
        builder::pad(name, desc, &[ia - i, 0, ha - h])
    })?;
    let pad_h = rw.add_unary("weight_pad_h", split.output(1), |name, desc| {
        builder::pad(name, desc, &[ha - h, 0, ha - h])
    })?;
    let concat = rw.add(
        "weight_concat",
        &[pad_x.output(0), pad_h.output(0)],
        |name, descs| builder::concat(name, descs, 0),
    )?;
    let flat = rw.add_unary("weight_reshape_2d", concat.output(0), |name, desc| {
        Ok(builder::reshape(name, desc, &[ia + ha, 4 * ha]))
    })?;
    let fractal = rw.add_unary("weight_trans_data", flat.output(0), |name, desc| {
        builder::trans_data(name, desc, Format::FractalZ)
    })?;

    Ok(NodeGroup {
        nodes: vec![gates, split, pad_x, pad_h, concat, flat, fractal],
        output: fractal.output(0),
    })
}

/// Per-timestep slices of the sequence inputs.
pub struct TimeSlices {
    /// Split nodes. Empty for a single timestep.
    pub nodes: Vec<NodeId>,

    /// Slices of each of `SEQUENCE_INPUTS`, indexed by timestep.
    slices: Vec<Vec<OutputAnchor>>,
}

impl TimeSlices {
    /// Return the slice of input `port` for timestep `t`.
    fn get(&self, rw: &Rewriter, port: usize, t: usize) -> Result<OutputAnchor, FusionError> {
        SEQUENCE_INPUTS
            .iter()
            .position(|&p| p == port)
            .and_then(|index| self.slices.get(index)?.get(t).copied())
            .ok_or_else(|| {
                rw.precondition(format!(
                    "no slice of input {} for timestep {}",
                    INPUT_NAMES[port], t
                ))
            })
    }
}

/// Split each sequence input into `T` slices of shape `[1, B, H]`.
///
/// When `T == 1` the inputs are used directly.
pub fn build_time_slices(rw: &mut Rewriter) -> Result<TimeSlices, FusionError> {
    let seq_len = rw.ctx().seq_len;
    let mut nodes = Vec::new();
    let mut slices = Vec::with_capacity(SEQUENCE_INPUTS.len());

    for port in SEQUENCE_INPUTS {
        let source = rw.source(port)?;
        if seq_len == 1 {
            slices.push(vec![source]);
            continue;
        }
        let sizes = vec![1; seq_len];
        let split = rw.add_unary(&format!("{}_split", INPUT_NAMES[port]), source, |name, desc| {
            builder::split(name, desc, 0, &sizes)
        })?;
        nodes.push(split);
        slices.push((0..seq_len).map(|t| split.output(t)).collect());
    }

    Ok(TimeSlices { nodes, slices })
}

/// Nodes of each step, in the order the steps are processed.
#[derive(Default)]
pub struct Steps {
    pub cells: Vec<NodeId>,
    pub reshapes: Vec<NodeId>,
    pub matmuls: Vec<NodeId>,
    pub splits: Vec<NodeId>,
}

impl Steps {
    pub fn len(&self) -> usize {
        self.cells.len()
    }
}

/// Build the gradient cell, reshape, matmul and split of each step.
///
/// Step `s` handles timestep `t = T - 1 - s`. The first step reads the
/// incoming state gradients `dh` and `dc` from the original node's inputs.
/// Later steps read them from the split and cell of the previous step.
pub fn build_steps(
    rw: &mut Rewriter,
    weights: OutputAnchor,
    slices: &TimeSlices,
) -> Result<Steps, FusionError> {
    let ctx = rw.ctx();
    let seq_len = ctx.seq_len;
    let (ba, ia, ha) = (ctx.batch_aligned, ctx.input_aligned, ctx.hidden_aligned);
    let gate_width = ctx.gate_width();

    let init_c = rw.source(input::INIT_C)?;
    let dh = rw.source(input::DH)?;
    let dc = rw.source(input::DC)?;
    let weights_desc = rw.desc_of(weights)?;

    let mut steps = Steps::default();
    for s in 0..seq_len {
        let t = seq_len - 1 - s;

        let prev_c = if t == 0 {
            init_c
        } else {
            slices.get(rw, input::C, t - 1)?
        };
        let (dh_in, dc_in) = match (steps.splits.last(), steps.cells.last()) {
            (Some(split), Some(cell)) => (split.output(1), cell.output(1)),
            _ => (dh, dc),
        };
        let cell_inputs = [
            prev_c,
            slices.get(rw, input::C, t)?,
            slices.get(rw, input::DY, t)?,
            dh_in,
            dc_in,
            slices.get(rw, input::I, t)?,
            slices.get(rw, input::J, t)?,
            slices.get(rw, input::F, t)?,
            slices.get(rw, input::O, t)?,
            slices.get(rw, input::TANHCT, t)?,
        ];
        let dgate = rw.tensor(&[ba, gate_width], Format::Nd)?;
        let dct_1 = rw.tensor(&[1, ctx.batch, ctx.hidden_size], Format::Nd)?;
        let cell = rw.add(&format!("cell_{}", s), &cell_inputs, |name, descs| {
            Ok(builder::lstm_grad_cell(
                name,
                descs,
                dgate,
                dct_1,
                ctx.forget_bias,
                t,
            ))
        })?;

        // The cell writes gate gradients in tiled order, so the reshape
        // exposes the tile structure without moving data.
        let tiled = [1, gate_width / TILE_SIZE, ba / TILE_SIZE, TILE_SIZE, TILE_SIZE];
        let reshape = rw.add_unary(&format!("gate_reshape_{}", s), cell.output(0), |name, desc| {
            Ok(builder::reshape(name, desc, &tiled))
        })?;

        let spec = builder::matmul(
            rw.node_name(&format!("matmul_{}", s)),
            rw.tensor(&[1, ba, gate_width], Format::FractalNz)?,
            weights_desc.clone(),
            rw.tensor(&[1, ba, ia + ha], Format::FractalNz)?,
            false,
            true,
        );
        let matmul = rw.build(spec, &[reshape.output(0), weights])?;

        let split = rw.add_unary(&format!("split_{}", s), matmul.output(0), |name, desc| {
            builder::split(name, desc, 2, &[ia, ha])
        })?;

        steps.cells.push(cell);
        steps.reshapes.push(reshape);
        steps.matmuls.push(matmul);
        steps.splits.push(split);
    }

    let lens = [
        steps.cells.len(),
        steps.reshapes.len(),
        steps.matmuls.len(),
        steps.splits.len(),
    ];
    if seq_len == 0 || lens.iter().any(|&len| len != seq_len) {
        return Err(rw.precondition(format!(
            "built {:?} step nodes for {} timesteps",
            lens, seq_len
        )));
    }

    Ok(steps)
}

/// Sequence-wide outputs of the step loop.
pub struct TimeAggregation {
    /// Concatenation nodes. Empty for a single timestep.
    pub nodes: Vec<NodeId>,

    /// Input gradient for the whole sequence, `[T, B_a, I_a]`.
    pub dx: OutputAnchor,

    /// Gate gradients for the whole sequence, in tiled layout.
    pub gates: OutputAnchor,
}

/// Concatenate the `dx` slices and gate gradients of all steps in time
/// order.
pub fn build_time_aggregation(
    rw: &mut Rewriter,
    steps: &Steps,
) -> Result<TimeAggregation, FusionError> {
    let (Some(first_split), Some(first_reshape)) = (steps.splits.first(), steps.reshapes.first())
    else {
        return Err(rw.precondition("no steps to aggregate"));
    };
    if steps.len() == 1 {
        return Ok(TimeAggregation {
            nodes: Vec::new(),
            dx: first_split.output(0),
            gates: first_reshape.output(0),
        });
    }

    // Steps run backwards in time.
    let dx_slices: Vec<_> = steps.splits.iter().rev().map(|s| s.output(0)).collect();
    let dx = rw.add("dx_concat", &dx_slices, |name, descs| {
        builder::concat(name, descs, 0)
    })?;
    let gate_slices: Vec<_> = steps.reshapes.iter().rev().map(|r| r.output(0)).collect();
    let gates = rw.add("dgate_concat", &gate_slices, |name, descs| {
        builder::concat(name, descs, 0)
    })?;

    Ok(TimeAggregation {
        nodes: vec![dx, gates],
        dx: dx.output(0),
        gates: gates.output(0),
    })
}
