use std::any::Any;

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tilefuse_graph::{Graph, NodeId};

use crate::diagnostics::{DiagnosticLevel, Diagnostics};
use crate::env::{env_flag, env_list};
use crate::fusion::{DynFusionPass, FusionError, SkipReason};
use crate::passes::DynamicRNNGradAlignFusionPass;
use crate::pattern::{FusionPattern, Match};

/// Options which control how a [`FusionDriver`] applies passes.
#[derive(Clone, Debug, PartialEq)]
pub struct FusionOptions {
    /// Level of per-node reporting.
    pub diagnostics: DiagnosticLevel,

    /// Names of passes which should not be run.
    pub disabled_passes: Vec<String>,

    /// Evaluate the applicability of all matches of a pass in parallel
    /// before rewriting.
    pub parallel_planning: bool,
}

impl Default for FusionOptions {
    fn default() -> Self {
        FusionOptions {
            diagnostics: DiagnosticLevel::Off,
            disabled_passes: Vec::new(),
            parallel_planning: true,
        }
    }
}

impl FusionOptions {
    /// Read options from environment variables, falling back to defaults.
    ///
    /// - `TILEFUSE_DIAGNOSTICS`: `off`, `warn` or `info`
    /// - `TILEFUSE_DISABLED_PASSES`: comma-separated pass names
    /// - `TILEFUSE_PARALLEL_PLANNING`: boolean
    pub fn from_env() -> FusionOptions {
        let defaults = FusionOptions::default();
        let diagnostics = match std::env::var("TILEFUSE_DIAGNOSTICS") {
            Ok(level) => level.parse().unwrap_or_else(|err| {
                log::warn!("ignoring TILEFUSE_DIAGNOSTICS: {}", err);
                defaults.diagnostics
            }),
            Err(_) => defaults.diagnostics,
        };
        FusionOptions {
            diagnostics,
            disabled_passes: env_list("TILEFUSE_DISABLED_PASSES"),
            parallel_planning: env_flag("TILEFUSE_PARALLEL_PLANNING", defaults.parallel_planning),
        }
    }

    pub fn is_enabled(&self, pass_name: &str) -> bool {
        !self.disabled_passes.iter().any(|name| name == pass_name)
    }
}

/// Table of fusion passes, keyed by the operator types that trigger them.
///
/// Passes run in the order they were registered.
#[derive(Default)]
pub struct FusionRegistry {
    passes: Vec<Box<dyn DynFusionPass>>,

    /// Map of operator type to indices in `passes`.
    by_op_type: FxHashMap<&'static str, Vec<usize>>,

    /// Indices of passes with a pattern that can match any operator type.
    wildcard: Vec<usize>,
}

impl FusionRegistry {
    pub fn new() -> FusionRegistry {
        FusionRegistry::default()
    }

    /// Create a registry containing all the passes in this crate.
    pub fn with_default_passes() -> FusionRegistry {
        let mut registry = FusionRegistry::new();
        registry.register(DynamicRNNGradAlignFusionPass::new());
        registry
    }

    /// Add a pass to the registry.
    ///
    /// Returns false if a pass with the same name is already registered, in
    /// which case the registry is unchanged.
    pub fn register<P: DynFusionPass + 'static>(&mut self, pass: P) -> bool {
        if self.get(pass.name()).is_some() {
            return false;
        }
        let index = self.passes.len();
        for pattern in pass.patterns() {
            let op_types = pattern.output().trigger_op_types();
            if op_types.is_empty() && !self.wildcard.contains(&index) {
                self.wildcard.push(index);
            }
            for op_type in op_types {
                let indices = self.by_op_type.entry(op_type).or_default();
                if !indices.contains(&index) {
                    indices.push(index);
                }
            }
        }
        self.passes.push(Box::new(pass));
        true
    }

    /// Find a pass by name.
    pub fn get(&self, name: &str) -> Option<&dyn DynFusionPass> {
        self.passes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    /// Return the passes triggered by an operator type, in registration
    /// order. This includes passes with patterns that match any operator.
    pub fn passes_for(&self, op_type: &str) -> impl Iterator<Item = &dyn DynFusionPass> {
        let mut indices: Vec<usize> = self
            .by_op_type
            .get(op_type)
            .into_iter()
            .flatten()
            .chain(&self.wildcard)
            .copied()
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices.into_iter().map(|i| self.passes[i].as_ref())
    }

    /// Return true if nodes of type `op_type` can match the pass at `index`.
    pub fn triggers(&self, index: usize, op_type: &str) -> bool {
        self.wildcard.contains(&index)
            || self
                .by_op_type
                .get(op_type)
                .is_some_and(|indices| indices.contains(&index))
    }

    /// Iterate over all passes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn DynFusionPass> {
        self.passes.iter().map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

/// A matched node which was left unchanged.
#[derive(Clone, Debug, PartialEq)]
pub struct SkippedNode {
    pub node: NodeId,
    pub name: String,
    pub reason: SkipReason,
}

/// Outcome of running one pass over a graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassReport {
    pub pass: String,

    /// Number of nodes which were rewritten.
    pub fused: usize,

    /// Matched nodes which were left unchanged.
    pub skipped: Vec<SkippedNode>,

    /// Nodes added by the pass's rewrites.
    pub new_nodes: Vec<NodeId>,
}

/// Outcome of running a [`FusionDriver`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FusionSummary {
    /// One report per pass that ran, in the order they ran.
    pub reports: Vec<PassReport>,
}

impl FusionSummary {
    pub fn report(&self, pass: &str) -> Option<&PassReport> {
        self.reports.iter().find(|r| r.pass == pass)
    }

    /// Return the total number of rewritten nodes.
    pub fn fused_count(&self) -> usize {
        self.reports.iter().map(|r| r.fused).sum()
    }
}

/// A match with the result of planning it.
struct Candidate {
    node: NodeId,

    /// Revision of the matched node when it was planned.
    revision: u64,

    pat_match: Match,
    plan: Result<Box<dyn Any + Send>, SkipReason>,
}

/// Applies the passes in a [`FusionRegistry`] to a graph.
pub struct FusionDriver {
    registry: FusionRegistry,
    options: FusionOptions,
}

impl FusionDriver {
    pub fn new(registry: FusionRegistry, options: FusionOptions) -> FusionDriver {
        FusionDriver { registry, options }
    }

    pub fn registry(&self) -> &FusionRegistry {
        &self.registry
    }

    pub fn options(&self) -> &FusionOptions {
        &self.options
    }

    /// Run every enabled pass over the graph, in registration order.
    ///
    /// Each pass visits the nodes which existed when it started. Nodes added
    /// by a pass are not revisited by that pass, but later passes see them.
    ///
    /// A hard failure stops the run and returns the error. Nodes already
    /// added by the failing rewrite stay in the graph.
    pub fn run(&self, graph: &mut Graph) -> Result<FusionSummary, FusionError> {
        let diagnostics = Diagnostics::new(self.options.diagnostics);
        let mut summary = FusionSummary::default();

        for (index, pass) in self.registry.iter().enumerate() {
            if !self.options.is_enabled(pass.name()) {
                log::debug!("skipping disabled pass {}", pass.name());
                continue;
            }
            let report = self.run_pass(index, pass, graph, &diagnostics).map_err(|err| {
                log::error!("pass {} failed: {}", pass.name(), err);
                err
            })?;
            summary.reports.push(report);
        }

        Ok(summary)
    }

    /// Run the pass at `index` in the registry.
    fn run_pass(
        &self,
        index: usize,
        pass: &dyn DynFusionPass,
        graph: &mut Graph,
        diagnostics: &Diagnostics,
    ) -> Result<PassReport, FusionError> {
        let mut report = PassReport {
            pass: pass.name().to_string(),
            ..Default::default()
        };

        let patterns = pass.patterns();
        let candidates = self.plan_candidates(index, pass, &patterns, graph);
        log::debug!(
            "pass {}: {} candidate nodes",
            pass.name(),
            candidates.len()
        );

        for candidate in candidates {
            let Candidate {
                node,
                revision,
                mut pat_match,
                mut plan,
            } = candidate;

            // An earlier rewrite in this pass may have removed or modified the
            // node. Re-match and re-plan against the current graph.
            match graph.revision(node) {
                None => continue,
                Some(current) if current != revision => {
                    log::trace!("re-planning stale match for node {}", node);
                    let Some(fresh) = find_match(&patterns, node, graph) else {
                        continue;
                    };
                    plan = pass.plan_dyn(graph, &fresh);
                    pat_match = fresh;
                }
                Some(_) => {}
            }

            let name = graph
                .node(pat_match.output())
                .map(|n| n.name().to_string())
                .unwrap_or_default();

            match plan {
                Ok(plan) => {
                    let new_nodes = pass.rewrite_dyn(graph, plan)?;
                    log::debug!(
                        "pass {} replaced {} with {} nodes",
                        pass.name(),
                        name,
                        new_nodes.len()
                    );
                    // The original node has been removed, so report against
                    // the first new node.
                    if let Some(&first) = new_nodes.first() {
                        diagnostics.info(
                            graph,
                            first,
                            format_args!("replaced {} using {}", name, pass.name()),
                        );
                    }
                    report.fused += 1;
                    report.new_nodes.extend(new_nodes);
                }
                Err(reason) => {
                    match &reason {
                        SkipReason::NotApplicable(_) => diagnostics.warn(
                            graph,
                            node,
                            format_args!("{} not applied: {}", pass.name(), reason),
                        ),
                        SkipReason::NoRewriteNeeded => diagnostics.info(
                            graph,
                            node,
                            format_args!("{} not applied: {}", pass.name(), reason),
                        ),
                    }
                    report.skipped.push(SkippedNode { node, name, reason });
                }
            }
        }

        Ok(report)
    }

    /// Find the nodes matching a pass's patterns and plan each of them.
    ///
    /// Only nodes whose operator type triggers the pass are tested.
    fn plan_candidates(
        &self,
        index: usize,
        pass: &dyn DynFusionPass,
        patterns: &[FusionPattern],
        graph: &Graph,
    ) -> Vec<Candidate> {
        let matches: Vec<(NodeId, u64, Match)> = graph
            .iter()
            .filter(|(_, node)| self.registry.triggers(index, node.op_type()))
            .filter_map(|(id, _)| {
                let revision = graph.revision(id)?;
                find_match(patterns, id, graph).map(|m| (id, revision, m))
            })
            .collect();

        let plan_one = |(node, revision, pat_match): (NodeId, u64, Match)| {
            let plan = pass.plan_dyn(graph, &pat_match);
            Candidate {
                node,
                revision,
                pat_match,
                plan,
            }
        };

        if self.options.parallel_planning {
            matches.into_par_iter().map(plan_one).collect()
        } else {
            matches.into_iter().map(plan_one).collect()
        }
    }
}

/// Test a pass's patterns against a node, returning the first match.
fn find_match(patterns: &[FusionPattern], node: NodeId, graph: &Graph) -> Option<Match> {
    patterns.iter().find_map(|pattern| pattern.test(node, graph))
}
