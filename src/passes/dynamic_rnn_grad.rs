//! Rewrites `DynamicRNNGrad` (LSTM backward over a whole sequence) into
//! per-timestep gradient cells and tile-aligned matmuls.
//!
//! The fused operator only supports input and hidden widths that are
//! multiples of the tile size. For other widths the node is unrolled over
//! time. Each step `s` handles timestep `t = T - 1 - s` using four nodes:
//!
//! ```text
//!   DynamicLSTMGradCell -> Reshape -> MatMulV2 -> SplitVD
//!          | dct_1                                  | dh
//!          v                                        v
//!     (cell of step s + 1)                  (cell of step s + 1)
//! ```
//!
//! The matmul multiplies the gate gradients by a copy of the weights whose
//! input and hidden blocks have been padded to tile-aligned sizes. Weight and
//! bias gradients are computed by separate reductions over the gate
//! gradients of all timesteps.

use tilefuse_graph::{Graph, NodeId};

use crate::fusion::{FusionError, FusionPass, FusionStage, NewNodes, SkipReason};
use crate::pattern::{FusionPattern, Match, Pattern};

mod builder;
mod cell_loop;
mod gate;
mod redirect;
mod reduction;
mod unpad;

pub use gate::RewriteContext;

use builder::Rewriter;

/// Operator type which triggers the pass.
pub const OP_TYPE: &str = "DynamicRNNGrad";

/// Key of the matched node in the pass's pattern.
const PATTERN_KEY: &str = "rnn_grad";

/// Input ports of `DynamicRNNGrad`.
pub mod input {
    pub const X: usize = 0;
    pub const W: usize = 1;
    pub const B: usize = 2;
    pub const Y: usize = 3;
    pub const INIT_H: usize = 4;
    pub const INIT_C: usize = 5;
    pub const H: usize = 6;
    pub const C: usize = 7;
    pub const DY: usize = 8;
    pub const DH: usize = 9;
    pub const DC: usize = 10;
    pub const I: usize = 11;
    pub const J: usize = 12;
    pub const F: usize = 13;
    pub const O: usize = 14;
    pub const TANHCT: usize = 15;
    pub const SEQ_LENGTH: usize = 16;
}

/// Output ports of `DynamicRNNGrad`.
pub mod output {
    pub const DW: usize = 0;
    pub const DB: usize = 1;
    pub const DX: usize = 2;
    pub const DH_PREV: usize = 3;
    pub const DC_PREV: usize = 4;
}

pub const INPUT_NAMES: [&str; NUM_INPUTS] = [
    "x",
    "w",
    "b",
    "y",
    "init_h",
    "init_c",
    "h",
    "c",
    "dy",
    "dh",
    "dc",
    "i",
    "j",
    "f",
    "o",
    "tanhct",
    "seq_length",
];

pub const OUTPUT_NAMES: [&str; NUM_OUTPUTS] = ["dw", "db", "dx", "dh_prev", "dc_prev"];

/// Number of inputs, including the optional `seq_length`.
pub const NUM_INPUTS: usize = 17;
pub const NUM_OUTPUTS: usize = 5;

/// Inputs which the rewrite reads. `b` and `y` are not needed to compute the
/// gradients.
const REQUIRED_INPUTS: &[usize] = &[
    input::X,
    input::W,
    input::INIT_H,
    input::INIT_C,
    input::H,
    input::C,
    input::DY,
    input::DH,
    input::DC,
    input::I,
    input::J,
    input::F,
    input::O,
    input::TANHCT,
];

/// Nodes created by a rewrite, grouped by role.
///
/// The per-step sequences (`cells`, `reshapes`, `matmuls`, `splits`) have
/// one entry per timestep, in the order the steps are processed, ie. from
/// the last timestep to the first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FusionResult {
    /// `DynamicLSTMGradCell` node of each step.
    pub cells: Vec<NodeId>,

    /// Reshape of each step's gate gradients into tiled layout.
    pub reshapes: Vec<NodeId>,

    /// Matmul of each step's gate gradients with the aligned weights.
    pub matmuls: Vec<NodeId>,

    /// Split of each step's matmul output into `dx` and `dh` parts.
    pub splits: Vec<NodeId>,

    /// Nodes which pad the weights to tile-aligned sizes.
    pub weight_alignment: Vec<NodeId>,

    /// Splits of the sequence inputs into timesteps. Empty for a single
    /// timestep.
    pub time_splits: Vec<NodeId>,

    /// Concatenations of `dx` and of the gate gradients across timesteps.
    /// Empty for a single timestep.
    pub time_concats: Vec<NodeId>,

    /// Nodes which build the hidden state entering each timestep.
    pub hidden_history: Vec<NodeId>,

    /// Weight-gradient reduction.
    pub weight_grad: Vec<NodeId>,

    /// Bias-gradient reduction.
    pub bias_grad: Vec<NodeId>,

    /// Nodes which remove the tile padding from the gradients so that they
    /// match the original outputs.
    pub output_unpad: Vec<NodeId>,

    /// Every node added by the rewrite, in creation order.
    pub new_nodes: Vec<NodeId>,
}

impl FusionResult {
    /// Return the number of timesteps the node was unrolled into.
    pub fn steps(&self) -> usize {
        self.cells.len()
    }
}

impl NewNodes for FusionResult {
    fn new_nodes(&self) -> &[NodeId] {
        &self.new_nodes
    }
}

/// Unrolls `DynamicRNNGrad` nodes whose input or hidden width is not
/// tile-aligned.
#[derive(Clone, Debug, Default)]
pub struct DynamicRNNGradAlignFusionPass {}

impl DynamicRNNGradAlignFusionPass {
    pub const NAME: &'static str = "DynamicRNNGradAlignFusionPass";

    pub fn new() -> Self {
        DynamicRNNGradAlignFusionPass {}
    }
}

impl FusionPass for DynamicRNNGradAlignFusionPass {
    type Plan = RewriteContext;
    type Output = FusionResult;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn patterns(&self) -> Vec<FusionPattern> {
        vec![FusionPattern::new(
            Self::NAME,
            Pattern::op_type(OP_TYPE).with_key(PATTERN_KEY),
        )]
    }

    fn plan(&self, graph: &Graph, pat_match: &Match) -> Result<RewriteContext, SkipReason> {
        let node = pat_match
            .node_id(PATTERN_KEY)
            .unwrap_or_else(|| pat_match.output());
        gate::check(graph, node)
    }

    fn rewrite(
        &self,
        graph: &mut Graph,
        ctx: RewriteContext,
    ) -> Result<FusionResult, FusionError> {
        rewrite(graph, &ctx)
    }
}

/// Replace the node described by `ctx` with its unrolled form.
fn rewrite(graph: &mut Graph, ctx: &RewriteContext) -> Result<FusionResult, FusionError> {
    if graph.node(ctx.node).map(|n| n.name()) != Some(ctx.name.as_str()) {
        return Err(FusionError::precondition(
            FusionStage::Matched,
            format!("node {} is no longer in the graph", ctx.name),
        ));
    }
    log::debug!(
        "{}: unrolling T={} B={} I={} H={} (aligned B={} I={} H={})",
        ctx.name,
        ctx.seq_len,
        ctx.batch,
        ctx.input_size,
        ctx.hidden_size,
        ctx.batch_aligned,
        ctx.input_aligned,
        ctx.hidden_aligned
    );

    let mut rw = Rewriter::new(graph, ctx);

    let weight_alignment = cell_loop::build_weight_alignment(&mut rw)?;
    let weights = weight_alignment.output;
    let slices = cell_loop::build_time_slices(&mut rw)?;
    let steps = cell_loop::build_steps(&mut rw, weights, &slices)?;
    let aggregation = cell_loop::build_time_aggregation(&mut rw, &steps)?;
    rw.advance(FusionStage::CellLoopBuilt);

    let hidden = reduction::build_hidden_history(&mut rw)?;
    let weight_grad = reduction::build_weight_grad(&mut rw, aggregation.gates, hidden.output)?;
    rw.advance(FusionStage::WeightReductionBuilt);

    let bias_grad = reduction::build_bias_grad(&mut rw, aggregation.gates)?;
    rw.advance(FusionStage::BiasReductionBuilt);

    let last = steps.len() - 1;
    let padded = [
        (output::DW, weight_grad.output),
        (output::DB, bias_grad.output),
        (output::DX, aggregation.dx),
        (output::DH_PREV, steps.splits[last].output(1)),
        (output::DC_PREV, steps.cells[last].output(1)),
    ];
    let unpadded = unpad::unpad_outputs(&mut rw, &padded)?;
    let redirected = redirect::redirect_outputs(&mut rw, &unpadded.outputs)?;
    log::debug!("{}: redirected {} consumers", ctx.name, redirected);
    rw.advance(FusionStage::OutputsRedirected);

    redirect::excise_original(&mut rw)?;
    rw.advance(FusionStage::OriginalNodeExcised);

    rw.advance(FusionStage::Done);
    Ok(FusionResult {
        cells: steps.cells,
        reshapes: steps.reshapes,
        matmuls: steps.matmuls,
        splits: steps.splits,
        weight_alignment: weight_alignment.nodes,
        time_splits: slices.nodes,
        time_concats: aggregation.nodes,
        hidden_history: hidden.nodes,
        weight_grad: weight_grad.nodes,
        bias_grad: bias_grad.nodes,
        output_unpad: unpadded.nodes,
        new_nodes: rw.into_new_nodes(),
    })
}

#[cfg(test)]
mod tests;
