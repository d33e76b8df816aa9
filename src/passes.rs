//! Fusion passes provided by this crate.

pub mod dynamic_rnn_grad;

pub use dynamic_rnn_grad::{DynamicRNNGradAlignFusionPass, FusionResult, RewriteContext};
