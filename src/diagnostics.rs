use std::cell::RefCell;
use std::str::FromStr;

use rustc_hash::FxHashSet;
use tilefuse_graph::{Graph, NodeId};

/// Log target used for fusion reports.
const LOG_TARGET: &str = "tilefuse::fusion";

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiagnosticLevel {
    /// Don't report anything.
    Off,
    /// Report only nodes which matched a pass but were not rewritten.
    Warn,
    /// Report all rewrites and skipped matches.
    Info,
}

impl FromStr for DiagnosticLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(DiagnosticLevel::Off),
            "warn" => Ok(DiagnosticLevel::Warn),
            "info" | "1" => Ok(DiagnosticLevel::Info),
            other => Err(format!("unknown diagnostic level \"{}\"", other)),
        }
    }
}

/// Per-node reporter for fusion passes.
///
/// Messages are written through the `log` facade under the
/// `tilefuse::fusion` target, so they additionally need to be enabled in the
/// logger.
pub struct Diagnostics {
    /// Nodes against which a warning has already been reported.
    warned_nodes: RefCell<FxHashSet<NodeId>>,
    level: DiagnosticLevel,
}

impl Diagnostics {
    pub fn new(level: DiagnosticLevel) -> Self {
        Self {
            warned_nodes: RefCell::new(FxHashSet::default()),
            level,
        }
    }

    pub fn level(&self) -> DiagnosticLevel {
        self.level
    }

    /// Return true if messages at `level` are reported.
    pub fn enabled(&self, level: DiagnosticLevel) -> bool {
        level != DiagnosticLevel::Off && self.level >= level
    }

    /// Report a message about a node at the [`Info`](DiagnosticLevel::Info)
    /// level.
    pub fn info(&self, graph: &Graph, node: NodeId, message: std::fmt::Arguments<'_>) {
        if !self.enabled(DiagnosticLevel::Info) {
            return;
        }
        log::info!(target: LOG_TARGET, "{}: {}", node_name(graph, node), message);
    }

    /// Report a message about a node at the [`Warn`](DiagnosticLevel::Warn)
    /// level.
    ///
    /// Only the first warning for each node is reported.
    pub fn warn(&self, graph: &Graph, node: NodeId, message: std::fmt::Arguments<'_>) {
        if !self.enabled(DiagnosticLevel::Warn) || !self.warned_nodes.borrow_mut().insert(node) {
            return;
        }
        log::warn!(target: LOG_TARGET, "{}: {}", node_name(graph, node), message);
    }

    /// Return the number of distinct nodes that have been warned about.
    pub fn warned_count(&self) -> usize {
        self.warned_nodes.borrow().len()
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DiagnosticLevel::Off)
    }
}

fn node_name(graph: &Graph, id: NodeId) -> String {
    graph
        .node(id)
        .map(|n| n.name().to_string())
        .unwrap_or_else(|| format!("<removed node {}>", id))
}
