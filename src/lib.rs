//! tilefuse rewrites operators in a computation graph into subgraphs of
//! primitives that work on tile-aligned data.
//!
//! Accelerators targeted by these passes operate on 16x16 tiles. Operators
//! whose dimensions are not multiples of the tile size are decomposed into
//! primitives (matmul, split, concat, reduce, layout transforms) operating on
//! padded "fractal" layouts.
//!
//! # Running passes
//!
//! Passes are collected in a [`FusionRegistry`] and applied to a
//! [`Graph`](tilefuse_graph::Graph) by a [`FusionDriver`]:
//!
//! ```no_run
//! use tilefuse::{FusionDriver, FusionOptions, FusionRegistry};
//! # fn load_graph() -> tilefuse_graph::Graph { unimplemented!() }
//!
//! let mut graph = load_graph();
//! let driver = FusionDriver::new(
//!     FusionRegistry::with_default_passes(),
//!     FusionOptions::from_env(),
//! );
//! let summary = driver.run(&mut graph).unwrap();
//! println!("rewrote {} nodes", summary.fused_count());
//! ```
//!
//! A pass which matches a node but cannot or need not rewrite it leaves the
//! graph unchanged and records a [`SkipReason`]. Only failures while
//! constructing the replacement are returned as errors.
//!
//! # Defining passes
//!
//! Passes implement [`FusionPass`]. A pass declares the patterns that
//! trigger it, a read-only [`plan`](FusionPass::plan) step that decides
//! whether a match should be rewritten, and a [`rewrite`](FusionPass::rewrite)
//! step that mutates the graph.
//!
//! # Logging
//!
//! Stage transitions and constructed nodes are logged via the `log` crate at
//! debug and trace levels. Per-node reports about matches which were not
//! rewritten are controlled by [`FusionOptions::diagnostics`].

mod diagnostics;
mod driver;
mod env;
mod fusion;
pub mod passes;
mod pattern;

#[cfg(test)]
mod test_util;

pub use diagnostics::{DiagnosticLevel, Diagnostics};
pub use driver::{FusionDriver, FusionOptions, FusionRegistry, FusionSummary, PassReport, SkippedNode};
pub use env::{env_flag, str_as_bool};
pub use fusion::{
    DynFusionPass, FusionError, FusionOutcome, FusionPass, FusionStage, NewNodes, SkipReason,
};
pub use pattern::{FusionPattern, Match, Pattern};
