//! Traits for defining fusion passes.

use std::any::Any;
use std::error::Error;
use std::fmt;

use tilefuse_graph::{DescError, Graph, GraphError, NodeId};

use crate::pattern::{FusionPattern, Match};

/// Stage of a rewrite, in the order they are reached.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FusionStage {
    /// A node matched the pass's pattern.
    Matched,
    /// The applicability gate accepted the node.
    GateChecked,
    /// The per-timestep subgraph has been built.
    CellLoopBuilt,
    /// The weight-gradient reduction has been built.
    WeightReductionBuilt,
    /// The bias-gradient reduction has been built.
    BiasReductionBuilt,
    /// Consumers of the original node now read from the new nodes.
    OutputsRedirected,
    /// The original node has been removed from the graph.
    OriginalNodeExcised,
    Done,
}

impl fmt::Display for FusionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Matched => "matched",
            Self::GateChecked => "gate checked",
            Self::CellLoopBuilt => "cell loop built",
            Self::WeightReductionBuilt => "weight reduction built",
            Self::BiasReductionBuilt => "bias reduction built",
            Self::OutputsRedirected => "outputs redirected",
            Self::OriginalNodeExcised => "original node excised",
            Self::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Hard failure of a fusion pass.
///
/// Each variant records the last stage that completed before the failure.
/// Nodes added before the failure are left in the graph.
#[derive(Clone, Debug, PartialEq)]
pub enum FusionError {
    /// A graph mutation failed.
    Graph {
        stage: FusionStage,
        error: GraphError,
    },

    /// A tensor descriptor could not be constructed.
    Desc { stage: FusionStage, error: DescError },

    /// A structural requirement of an intermediate result did not hold.
    Precondition {
        stage: FusionStage,
        message: String,
    },
}

impl FusionError {
    /// Return the last stage that completed before the failure.
    pub fn stage(&self) -> FusionStage {
        match self {
            Self::Graph { stage, .. } | Self::Desc { stage, .. } | Self::Precondition { stage, .. } => {
                *stage
            }
        }
    }

    pub(crate) fn precondition(stage: FusionStage, message: impl Into<String>) -> FusionError {
        FusionError::Precondition {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for FusionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graph { stage, error } => {
                write!(f, "graph update failed after stage \"{}\": {}", stage, error)
            }
            Self::Desc { stage, error } => {
                write!(f, "invalid descriptor after stage \"{}\": {}", stage, error)
            }
            Self::Precondition { stage, message } => {
                write!(f, "precondition failed after stage \"{}\": {}", stage, message)
            }
        }
    }
}

impl Error for FusionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Graph { error, .. } => Some(error),
            Self::Desc { error, .. } => Some(error),
            Self::Precondition { .. } => None,
        }
    }
}

/// Reasons why a matched node was left unchanged.
///
/// These are not errors. The graph is untouched and compilation continues
/// with the original node.
#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    /// The node cannot be rewritten, eg. because some dimensions are only
    /// known at runtime.
    NotApplicable(String),

    /// The node is already in the form the rewrite would produce.
    NoRewriteNeeded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotApplicable(reason) => write!(f, "not applicable: {}", reason),
            Self::NoRewriteNeeded => write!(f, "no rewrite needed"),
        }
    }
}

/// Result of applying a pass to one matched node.
#[derive(Debug, PartialEq)]
pub enum FusionOutcome<T> {
    /// The node was replaced.
    Fused(T),

    /// The graph was left unchanged.
    NotChanged(SkipReason),
}

impl<T> FusionOutcome<T> {
    pub fn is_fused(&self) -> bool {
        matches!(self, FusionOutcome::Fused(_))
    }

    /// Return the rewrite output, if the node was replaced.
    pub fn fused(self) -> Option<T> {
        match self {
            FusionOutcome::Fused(output) => Some(output),
            FusionOutcome::NotChanged(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            FusionOutcome::Fused(_) => None,
            FusionOutcome::NotChanged(reason) => Some(reason),
        }
    }
}

/// Output of a rewrite which reports the nodes it created.
pub trait NewNodes {
    /// Return every node added to the graph by the rewrite.
    fn new_nodes(&self) -> &[NodeId];
}

/// A graph rewrite triggered by nodes matching a set of patterns.
///
/// Passes are split into a read-only planning step, which decides whether a
/// matched node should be rewritten and computes the parameters for doing so,
/// and a rewrite step which mutates the graph. Planning for different nodes
/// can run concurrently.
pub trait FusionPass {
    /// Parameters computed by [`plan`](FusionPass::plan).
    type Plan: Send + 'static;

    /// Description of the nodes created by [`rewrite`](FusionPass::rewrite).
    type Output: NewNodes;

    /// Name under which the pass is registered.
    fn name(&self) -> &str;

    /// Return the patterns which trigger this pass.
    fn patterns(&self) -> Vec<FusionPattern>;

    /// Decide whether a matched node should be rewritten.
    fn plan(&self, graph: &Graph, pat_match: &Match) -> Result<Self::Plan, SkipReason>;

    /// Replace the planned node.
    fn rewrite(&self, graph: &mut Graph, plan: Self::Plan) -> Result<Self::Output, FusionError>;

    /// Plan and, if applicable, rewrite a matched node.
    fn fuse(
        &self,
        graph: &mut Graph,
        pat_match: &Match,
    ) -> Result<FusionOutcome<Self::Output>, FusionError> {
        match self.plan(graph, pat_match) {
            Ok(plan) => self.rewrite(graph, plan).map(FusionOutcome::Fused),
            Err(reason) => Ok(FusionOutcome::NotChanged(reason)),
        }
    }
}

/// Object-safe form of [`FusionPass`], used to store passes of different
/// types in a [`FusionRegistry`](crate::FusionRegistry).
///
/// This is implemented for every [`FusionPass`] which can be shared across
/// threads.
pub trait DynFusionPass: Send + Sync {
    fn name(&self) -> &str;

    fn patterns(&self) -> Vec<FusionPattern>;

    /// Type-erased version of [`FusionPass::plan`].
    fn plan_dyn(&self, graph: &Graph, pat_match: &Match)
        -> Result<Box<dyn Any + Send>, SkipReason>;

    /// Type-erased version of [`FusionPass::rewrite`]. Returns the IDs of the
    /// new nodes.
    fn rewrite_dyn(
        &self,
        graph: &mut Graph,
        plan: Box<dyn Any + Send>,
    ) -> Result<Vec<NodeId>, FusionError>;
}

impl<P: FusionPass + Send + Sync> DynFusionPass for P {
    fn name(&self) -> &str {
        FusionPass::name(self)
    }

    fn patterns(&self) -> Vec<FusionPattern> {
        FusionPass::patterns(self)
    }

    fn plan_dyn(
        &self,
        graph: &Graph,
        pat_match: &Match,
    ) -> Result<Box<dyn Any + Send>, SkipReason> {
        self.plan(graph, pat_match)
            .map(|plan| Box::new(plan) as Box<dyn Any + Send>)
    }

    fn rewrite_dyn(
        &self,
        graph: &mut Graph,
        plan: Box<dyn Any + Send>,
    ) -> Result<Vec<NodeId>, FusionError> {
        let plan = plan.downcast::<P::Plan>().map_err(|_| {
            FusionError::precondition(
                FusionStage::Matched,
                format!("plan passed to \"{}\" has the wrong type", FusionPass::name(self)),
            )
        })?;
        let output = self.rewrite(graph, *plan)?;
        Ok(output.new_nodes().to_vec())
    }
}
