use std::error::Error;

use tilefuse_graph::{
    DataType, Dimension, Format, Graph, GraphError, NodeId, NodeSpec, OutputAnchor, TensorDesc,
};
use tilefuse_testing::TestCases;

use super::builder::{
    BATCH_MATMUL, CONCAT, CONST, LSTM_GRAD_CELL, MATMUL, PAD, REDUCE_SUM, RESHAPE, SLICE, SPLIT,
    TRANSPOSE, TRANS_DATA,
};
use super::{gate, input, output, DynamicRNNGradAlignFusionPass, FusionResult, OP_TYPE};
use crate::fusion::{FusionError, FusionOutcome, FusionPass, FusionStage, SkipReason};
use crate::test_util::{check_edges, RnnGradBuilder};

fn fuse(graph: &mut Graph, node: NodeId) -> Result<FusionOutcome<FusionResult>, FusionError> {
    let pass = DynamicRNNGradAlignFusionPass::new();
    let pat_match = pass.patterns()[0]
        .test(node, graph)
        .expect("pattern should match");
    pass.fuse(graph, &pat_match)
}

fn rewrite(graph: &mut Graph, node: NodeId) -> FusionResult {
    fuse(graph, node)
        .unwrap()
        .fused()
        .expect("node should be rewritten")
}

fn producer(graph: &Graph, node: NodeId, port: usize) -> Option<OutputAnchor> {
    graph.peer_output_anchor(node.input(port)).unwrap()
}

fn op_type(graph: &Graph, node: NodeId) -> &str {
    graph.node(node).unwrap().op_type()
}

fn nz(shape: &[usize]) -> TensorDesc {
    TensorDesc::fixed(shape, DataType::Float16, Format::FractalNz)
        .unwrap()
        .with_origin_format(Format::Nd)
}

fn nd(shape: &[usize]) -> TensorDesc {
    TensorDesc::nd(shape, DataType::Float16)
}

#[test]
fn test_gate_rejects_unsupported_nodes() {
    #[derive(Debug)]
    struct Case {
        builder: RnnGradBuilder,
        reason: &'static str,
    }

    let base = RnnGradBuilder::new(3, 8, 10, 20);
    let cases = [
        Case {
            builder: base.clone().attr("cell_type", "GRU"),
            reason: "unsupported cell type GRU",
        },
        Case {
            builder: base.clone().attr("use_peephole", true),
            reason: "peephole",
        },
        Case {
            builder: base.clone().attr("time_major", false),
            reason: "batch-major",
        },
        Case {
            builder: base.clone().attr("direction", "BIDIRECTIONAL"),
            reason: "unsupported direction BIDIRECTIONAL",
        },
        Case {
            builder: base.clone().connect_seq_length(),
            reason: "sequence lengths vary at runtime",
        },
        Case {
            builder: base.clone().unconnected(input::DY),
            reason: "input dy is not connected",
        },
        Case {
            builder: base.clone().input_desc(
                input::X,
                TensorDesc::new(
                    &[Dimension::Unknown, Dimension::Fixed(8), Dimension::Fixed(10)],
                    DataType::Float16,
                    Format::Nd,
                )
                .unwrap(),
            ),
            reason: "input x has a dynamic shape",
        },
        Case {
            builder: base.clone().input_desc(input::W, nd(&[30, 79])),
            reason: "weight has shape [30, 79]",
        },
        Case {
            builder: base
                .clone()
                .input_desc(input::W, TensorDesc::nd(&[30, 80], DataType::Int32)),
            reason: "unsupported weight type int32",
        },
        Case {
            builder: base.clone().input_desc(input::C, nd(&[3, 8, 21])),
            reason: "input c has shape [3, 8, 21]",
        },
        Case {
            builder: base.clone().input_desc(input::DY, nd(&[2, 8, 20])),
            reason: "dy has shape [2, 8, 20] but x has shape [3, 8, 10]",
        },
        Case {
            builder: base.clone().input_desc(
                input::INIT_H,
                TensorDesc::fixed(&[8, 20], DataType::Float16, Format::FractalNz).unwrap(),
            ),
            reason: "input init_h has format FRACTAL_NZ",
        },
        Case {
            builder: base.clone().input_desc(input::DH, nd(&[2, 8, 20])),
            reason: "input dh has leading dimension 2",
        },
        Case {
            builder: base.clone().input_desc(input::DC, nd(&[8, 21])),
            reason: "input dc has batch 8 and hidden size 21",
        },
        Case {
            builder: RnnGradBuilder::new(3, 0, 10, 20),
            reason: "zero-sized",
        },
        Case {
            builder: base
                .clone()
                .input_desc(input::X, TensorDesc::nd(&[3, 8, 10], DataType::Int32)),
            reason: "input x has type int32, expected float16",
        },
        Case {
            builder: base
                .clone()
                .dtype(DataType::Float32)
                .input_desc(input::DC, nd(&[8, 20])),
            reason: "input dc has type float16, expected float32",
        },
        Case {
            builder: base
                .clone()
                .output_desc(output::DX, TensorDesc::nd(&[3, 8, 10], DataType::Float32)),
            reason: "output dx has type float32, expected float16",
        },
        Case {
            builder: base.clone().output_desc(output::DB, nd(&[1, 1, 80])),
            reason: "output db has shape [1, 1, 80], expected [80]",
        },
        Case {
            builder: base.clone().output_desc(output::DW, nz(&[30, 80])),
            reason: "output dw has format FRACTAL_NZ",
        },
        Case {
            builder: base.clone().output_desc(output::DH_PREV, nd(&[2, 8, 20])),
            reason: "output dh_prev has leading dimension 2",
        },
    ];

    cases.test_each(|case| {
        let (graph, rnn) = case.builder.build();
        let edges = graph.edge_count();
        match gate::check(&graph, rnn.node) {
            Err(SkipReason::NotApplicable(reason)) => {
                assert!(
                    reason.contains(case.reason),
                    "reason \"{}\" does not contain \"{}\"",
                    reason,
                    case.reason
                );
            }
            other => panic!("expected NotApplicable, got {:?}", other),
        }
        assert_eq!(graph.edge_count(), edges);
    })
}

#[test]
fn test_gate_rejects_other_op_types() {
    let (graph, rnn) = RnnGradBuilder::new(3, 8, 10, 20).build();
    let consumer = rnn.consumers[output::DW];
    let reason = gate::check(&graph, consumer).unwrap_err();
    assert_eq!(
        reason,
        SkipReason::NotApplicable(format!("expected a {} node, found Identity", OP_TYPE))
    );
}

#[test]
fn test_gate_computes_aligned_sizes() {
    #[derive(Debug)]
    struct Case {
        state_3d: bool,
        state_offset: usize,
    }

    let cases = [
        Case {
            state_3d: false,
            state_offset: 0,
        },
        Case {
            state_3d: true,
            state_offset: 1,
        },
    ];

    cases.test_each(|case| {
        let (graph, rnn) = RnnGradBuilder::new(3, 8, 10, 20)
            .state_3d(case.state_3d)
            .build();
        let ctx = gate::check(&graph, rnn.node).unwrap();

        assert_eq!(ctx.node, rnn.node);
        assert_eq!(ctx.name, "rnn");
        assert_eq!(
            (ctx.seq_len, ctx.batch, ctx.input_size, ctx.hidden_size),
            (3, 8, 10, 20)
        );
        assert_eq!(
            (ctx.batch_aligned, ctx.input_aligned, ctx.hidden_aligned),
            (16, 16, 32)
        );
        assert_eq!(ctx.gate_width(), 128);
        assert_eq!(ctx.xh_width(), 48);
        assert_eq!(ctx.forget_bias, 1.0);
        assert_eq!(ctx.dtype, DataType::Float16);
        assert_eq!(ctx.state_offset, case.state_offset);
        assert!(!ctx.single_step());
    })
}

#[test]
fn test_aligned_widths_are_left_unchanged() {
    let (mut graph, rnn) = RnnGradBuilder::new(3, 8, 16, 32).build();
    let nodes = graph.node_count();
    let edges = graph.edge_count();
    let consumer_desc = graph
        .input_desc(rnn.consumers[output::DX].input(0))
        .unwrap()
        .clone();

    let outcome = fuse(&mut graph, rnn.node).unwrap();
    assert_eq!(outcome.skip_reason(), Some(&SkipReason::NoRewriteNeeded));

    assert_eq!(graph.node_count(), nodes);
    assert_eq!(graph.edge_count(), edges);
    assert_eq!(graph.node(rnn.node).map(|n| n.name()), Some("rnn"));
    assert_eq!(
        producer(&graph, rnn.consumers[output::DX], 0),
        Some(rnn.node.output(output::DX))
    );
    assert_eq!(
        graph
            .input_desc(rnn.consumers[output::DX].input(0))
            .unwrap(),
        &consumer_desc
    );
}

#[test]
fn test_rewrite_unrolls_sequence() -> Result<(), Box<dyn Error>> {
    let (mut graph, rnn) = RnnGradBuilder::new(3, 8, 10, 20).build();
    let result = rewrite(&mut graph, rnn.node);

    // Original node is gone and nothing still refers to it.
    assert!(graph.node(rnn.node).is_none());
    assert_eq!(graph.node_id("rnn"), None);
    check_edges(&graph)?;

    assert_eq!(result.steps(), 3);
    for group in [&result.cells, &result.reshapes, &result.matmuls, &result.splits] {
        assert_eq!(group.len(), 3);
    }
    assert_eq!(result.weight_alignment.len(), 7);
    assert_eq!(result.time_splits.len(), 7);
    assert_eq!(result.time_concats.len(), 2);
    assert_eq!(result.hidden_history.len(), 3);
    assert_eq!(result.weight_grad.len(), 7);
    assert_eq!(result.bias_grad.len(), 4);
    assert_eq!(result.output_unpad.len(), 14);

    let grouped = [
        &result.cells,
        &result.reshapes,
        &result.matmuls,
        &result.splits,
        &result.weight_alignment,
        &result.time_splits,
        &result.time_concats,
        &result.hidden_history,
        &result.weight_grad,
        &result.bias_grad,
        &result.output_unpad,
    ];
    assert_eq!(
        result.new_nodes.len(),
        grouped.iter().map(|g| g.len()).sum::<usize>()
    );
    assert!(result.new_nodes.iter().all(|&id| graph.node(id).is_some()));

    for s in 0..3 {
        assert_eq!(op_type(&graph, result.cells[s]), LSTM_GRAD_CELL);
        assert_eq!(op_type(&graph, result.reshapes[s]), RESHAPE);
        assert_eq!(op_type(&graph, result.matmuls[s]), MATMUL);
        assert_eq!(op_type(&graph, result.splits[s]), SPLIT);

        let cell = graph.node(result.cells[s]).unwrap();
        assert_eq!(cell.name(), format!("rnn/cell_{}", s));
        assert_eq!(cell.attrs().get_int("t_state"), Some(2 - s as i64));
        assert_eq!(cell.attrs().get_float("forget_bias"), Some(1.0));

        // Each step's matmul reads the aligned weights.
        assert_eq!(
            producer(&graph, result.matmuls[s], 1),
            Some(result.weight_alignment[6].output(0))
        );
    }

    let weight_ops: Vec<_> = result
        .weight_alignment
        .iter()
        .map(|&id| op_type(&graph, id))
        .collect();
    assert_eq!(
        weight_ops,
        [RESHAPE, SPLIT, PAD, PAD, CONCAT, RESHAPE, TRANS_DATA]
    );
    let dw_ops: Vec<_> = result
        .weight_grad
        .iter()
        .map(|&id| op_type(&graph, id))
        .collect();
    assert_eq!(
        dw_ops,
        [TRANS_DATA, TRANS_DATA, CONCAT, BATCH_MATMUL, REDUCE_SUM, TRANSPOSE, TRANS_DATA]
    );
    let db_ops: Vec<_> = result
        .bias_grad
        .iter()
        .map(|&id| op_type(&graph, id))
        .collect();
    assert_eq!(db_ops, [CONST, BATCH_MATMUL, REDUCE_SUM, TRANS_DATA]);
    let unpad_ops: Vec<_> = result
        .output_unpad
        .iter()
        .map(|&id| op_type(&graph, id))
        .collect();
    assert_eq!(
        unpad_ops,
        [
            // dw
            RESHAPE, SLICE, SLICE, CONCAT, RESHAPE,
            // db
            RESHAPE, SLICE, RESHAPE,
            // dx
            TRANS_DATA, SLICE,
            // dh_prev
            TRANS_DATA, SLICE, RESHAPE,
            // dc_prev
            RESHAPE,
        ]
    );

    Ok(())
}

#[test]
fn test_rewrite_chains_state_gradients() {
    let (mut graph, rnn) = RnnGradBuilder::new(3, 8, 10, 20).build();
    let result = rewrite(&mut graph, rnn.node);
    let data = |port: usize| rnn.producers[port].map(|id| id.output(0));
    let (dh_port, dc_port) = (3, 4);

    // The first step handles the last timestep and reads the incoming state
    // gradients.
    assert_eq!(producer(&graph, result.cells[0], dh_port), data(input::DH));
    assert_eq!(producer(&graph, result.cells[0], dc_port), data(input::DC));

    for s in 1..3 {
        assert_eq!(
            producer(&graph, result.cells[s], dh_port),
            Some(result.splits[s - 1].output(1))
        );
        assert_eq!(
            producer(&graph, result.cells[s], dc_port),
            Some(result.cells[s - 1].output(1))
        );
    }

    // The previous cell state is the slice of `c` from the timestep before,
    // or `init_c` for the first timestep.
    let c_split = graph.node_id("rnn/c_split").unwrap();
    assert_eq!(producer(&graph, result.cells[0], 0), Some(c_split.output(1)));
    assert_eq!(producer(&graph, result.cells[0], 1), Some(c_split.output(2)));
    assert_eq!(producer(&graph, result.cells[2], 0), data(input::INIT_C));

    // Timestep slices of dx are concatenated in time order.
    let dx_concat = result.time_concats[0];
    for t in 0..3 {
        assert_eq!(
            producer(&graph, dx_concat, t),
            Some(result.splits[2 - t].output(0))
        );
    }
}

#[test]
fn test_rewrite_redirects_outputs() {
    #[derive(Debug)]
    struct Case {
        state_3d: bool,
        unpad_nodes: usize,
    }

    let cases = [
        Case {
            state_3d: false,
            unpad_nodes: 14,
        },
        Case {
            state_3d: true,
            unpad_nodes: 12,
        },
    ];

    cases.test_each(|case| {
        let builder = RnnGradBuilder::new(3, 8, 10, 20).state_3d(case.state_3d);
        let (mut graph, rnn) = builder.build();
        let output_descs = builder.output_descs();
        let result = rewrite(&mut graph, rnn.node);
        assert_eq!(result.output_unpad.len(), case.unpad_nodes);

        for (port, desc) in output_descs.iter().enumerate() {
            let consumer = rnn.consumers[port];

            // Consumers keep their descriptors, and are fed by a tensor with
            // the original output's shape.
            assert_eq!(graph.input_desc(consumer.input(0)).unwrap(), desc);
            let source = producer(&graph, consumer, 0).unwrap();
            assert_eq!(graph.output_desc(source).unwrap(), desc, "port {}", port);
            assert!(
                result.output_unpad.contains(&source.node),
                "port {} is fed by {}",
                port,
                graph.node(source.node).unwrap().name()
            );
        }

        // The input and hidden blocks of dw are cut from the padded rows.
        let dw_x = graph.node_id("rnn/dw_x_slice").unwrap();
        let dw_h = graph.node_id("rnn/dw_h_slice").unwrap();
        let offsets = |id: NodeId| {
            graph
                .node(id)
                .unwrap()
                .attrs()
                .get_ints("offsets")
                .map(|o| o.to_vec())
        };
        assert_eq!(offsets(dw_x), Some(vec![0, 0, 0]));
        assert_eq!(offsets(dw_h), Some(vec![16, 0, 0]));
        assert_eq!(
            graph.output_desc(dw_h.output(0)).unwrap(),
            &nd(&[20, 4, 20])
        );
        let dw_gates = graph.node_id("rnn/dw_gates_reshape").unwrap();
        assert_eq!(
            producer(&graph, dw_gates, 0),
            Some(result.weight_grad[6].output(0))
        );
        assert_eq!(
            graph.output_desc(dw_gates.output(0)).unwrap(),
            &nd(&[48, 4, 32])
        );

        // dx is converted from the tiled concatenation of all steps.
        let dx_nd = graph.node_id("rnn/dx_trans_data").unwrap();
        assert_eq!(
            producer(&graph, dx_nd, 0),
            Some(result.time_concats[0].output(0))
        );
        assert_eq!(graph.input_desc(dx_nd.input(0)).unwrap(), &nz(&[3, 16, 16]));
    })
}

#[test]
fn test_rewrite_single_step() -> Result<(), Box<dyn Error>> {
    let (mut graph, rnn) = RnnGradBuilder::new(1, 8, 10, 20).build();
    let result = rewrite(&mut graph, rnn.node);
    check_edges(&graph)?;

    assert_eq!(result.steps(), 1);
    assert!(result.time_splits.is_empty());
    assert!(result.time_concats.is_empty());
    assert_eq!(result.hidden_history.len(), 1);
    assert_eq!(result.new_nodes.len(), 7 + 4 + 1 + 7 + 4 + 14);

    let data = |port: usize| rnn.producers[port].map(|id| id.output(0));
    assert_eq!(producer(&graph, result.cells[0], 0), data(input::INIT_C));
    assert_eq!(producer(&graph, result.cells[0], 1), data(input::C));
    assert_eq!(
        graph
            .node(result.cells[0])
            .unwrap()
            .attrs()
            .get_int("t_state"),
        Some(0)
    );

    // dx and dh_prev are unpadded from the two halves of the same split.
    let dx_nd = graph.node_id("rnn/dx_trans_data").unwrap();
    let dh_nd = graph.node_id("rnn/dh_prev_trans_data").unwrap();
    assert_eq!(producer(&graph, dx_nd, 0), Some(result.splits[0].output(0)));
    assert_eq!(producer(&graph, dh_nd, 0), Some(result.splits[0].output(1)));
    let dx_slice = producer(&graph, rnn.consumers[output::DX], 0).unwrap();
    assert_eq!(producer(&graph, dx_slice.node, 0), Some(dx_nd.output(0)));

    Ok(())
}

#[test]
fn test_hidden_history_depends_on_state_rank() {
    #[derive(Debug)]
    struct Case {
        seq_len: usize,
        state_3d: bool,
        expected_ops: &'static [&'static str],
    }

    let cases = [
        Case {
            seq_len: 1,
            state_3d: true,
            expected_ops: &[],
        },
        Case {
            seq_len: 1,
            state_3d: false,
            expected_ops: &[RESHAPE],
        },
        Case {
            seq_len: 4,
            state_3d: true,
            expected_ops: &[SPLIT, CONCAT],
        },
        Case {
            seq_len: 4,
            state_3d: false,
            expected_ops: &[RESHAPE, SPLIT, CONCAT],
        },
    ];

    cases.test_each(|case| {
        let (mut graph, rnn) = RnnGradBuilder::new(case.seq_len, 8, 10, 20)
            .state_3d(case.state_3d)
            .build();
        let result = rewrite(&mut graph, rnn.node);
        let ops: Vec<_> = result
            .hidden_history
            .iter()
            .map(|&id| op_type(&graph, id))
            .collect();
        assert_eq!(ops, case.expected_ops);
        check_edges(&graph).unwrap();
    })
}

#[test]
fn test_rewrite_random_sizes() {
    let mut rng = fastrand::Rng::with_seed(4321);
    for _ in 0..30 {
        let seq_len = rng.usize(1..6);
        let batch = rng.usize(1..40);
        let input_size = rng.usize(1..50);
        let hidden_size = rng.usize(1..50);
        let builder =
            RnnGradBuilder::new(seq_len, batch, input_size, hidden_size).state_3d(rng.bool());
        let (mut graph, rnn) = builder.build();

        let outcome = fuse(&mut graph, rnn.node).unwrap();
        if input_size % 16 == 0 && hidden_size % 16 == 0 {
            assert_eq!(outcome.skip_reason(), Some(&SkipReason::NoRewriteNeeded));
            continue;
        }
        let result = outcome.fused().unwrap();
        let sizes = (seq_len, batch, input_size, hidden_size);

        assert_eq!(result.steps(), seq_len, "{:?}", sizes);
        assert_eq!(result.weight_alignment.len(), 7, "{:?}", sizes);
        assert_eq!(result.weight_grad.len(), 7, "{:?}", sizes);
        assert_eq!(result.bias_grad.len(), 4, "{:?}", sizes);
        let expected_time_nodes = if seq_len == 1 { (0, 0) } else { (7, 2) };
        assert_eq!(
            (result.time_splits.len(), result.time_concats.len()),
            expected_time_nodes,
            "{:?}",
            sizes
        );
        if let Err(err) = check_edges(&graph) {
            panic!("{:?}: {}", sizes, err);
        }
        assert!(graph.node(rnn.node).is_none());
        for (consumer, desc) in rnn.consumers.iter().zip(builder.output_descs()) {
            let source = producer(&graph, *consumer, 0);
            let source_desc = source.and_then(|s| graph.output_desc(s).ok());
            assert_eq!(source_desc, Some(&desc), "{:?}", sizes);
        }
    }
}

#[test]
fn test_rewrite_errors_report_last_stage() {
    #[derive(Debug)]
    struct Case {
        existing: &'static str,
        stage: FusionStage,

        /// Number of nodes added before the failure.
        added: usize,
    }

    let cases = [
        Case {
            existing: "rnn/weight_reshape",
            stage: FusionStage::GateChecked,
            added: 0,
        },
        Case {
            existing: "rnn/cell_2",
            stage: FusionStage::GateChecked,
            added: 7 + 7 + 2 * 4,
        },
        Case {
            existing: "rnn/init_h_reshape",
            stage: FusionStage::CellLoopBuilt,
            added: 7 + 7 + 3 * 4 + 2,
        },
        Case {
            existing: "rnn/dw_reduce_sum",
            stage: FusionStage::CellLoopBuilt,
            added: 7 + 7 + 3 * 4 + 2 + 3 + 4,
        },
        Case {
            existing: "rnn/ones",
            stage: FusionStage::WeightReductionBuilt,
            added: 7 + 7 + 3 * 4 + 2 + 3 + 7,
        },
        Case {
            existing: "rnn/dw_gates_reshape",
            stage: FusionStage::BiasReductionBuilt,
            added: 7 + 7 + 3 * 4 + 2 + 3 + 7 + 4,
        },
        Case {
            existing: "rnn/dc_prev_reshape",
            stage: FusionStage::BiasReductionBuilt,
            added: 7 + 7 + 3 * 4 + 2 + 3 + 7 + 4 + 13,
        },
    ];

    cases.test_each(|case| {
        let (mut graph, rnn) = RnnGradBuilder::new(3, 8, 10, 20).build();
        graph
            .add_node(NodeSpec::new(case.existing, "Data"))
            .unwrap();
        let nodes = graph.node_count();

        let err = fuse(&mut graph, rnn.node).unwrap_err();
        assert_eq!(
            err,
            FusionError::Graph {
                stage: case.stage,
                error: GraphError::DuplicateName(case.existing.to_string()),
            }
        );

        // Nodes built before the failure are kept, and the original node is
        // still connected to its consumers.
        assert_eq!(graph.node_count(), nodes + case.added);
        assert_eq!(
            producer(&graph, rnn.consumers[output::DW], 0),
            Some(rnn.node.output(output::DW))
        );
    })
}

#[test]
fn test_rewrite_rejects_stale_plan() {
    let (mut graph, rnn) = RnnGradBuilder::new(3, 8, 10, 20).build();
    let pass = DynamicRNNGradAlignFusionPass::new();
    let pat_match = pass.patterns()[0].test(rnn.node, &graph).unwrap();
    let ctx = pass.plan(&graph, &pat_match).unwrap();

    graph.remove_node(rnn.node).unwrap();
    let nodes = graph.node_count();

    let err = pass.rewrite(&mut graph, ctx).unwrap_err();
    assert_eq!(err.stage(), FusionStage::Matched);
    assert!(err.to_string().contains("no longer in the graph"));
    assert_eq!(graph.node_count(), nodes);
}

#[test]
fn test_rewrite_moves_every_consumer() -> Result<(), Box<dyn Error>> {
    let (mut graph, rnn) = RnnGradBuilder::new(3, 8, 10, 20)
        .extra_consumer(output::DX)
        .extra_consumer(output::DX)
        .extra_consumer(output::DC_PREV)
        .control_edges()
        .build();
    assert_eq!(graph.control_edge_count(), 2);

    let result = rewrite(&mut graph, rnn.node);
    check_edges(&graph)?;

    // Control edges of the original node are dropped with it.
    assert_eq!(graph.control_edge_count(), 0);
    for &id in &rnn.control_nodes {
        let node = graph.node(id).unwrap();
        assert!(node.control_inputs().is_empty() && node.control_outputs().is_empty());
    }

    let consumers = rnn
        .consumers
        .iter()
        .copied()
        .enumerate()
        .chain(rnn.extra_consumers.iter().copied());
    for (port, consumer) in consumers {
        let source = producer(&graph, consumer, 0).unwrap();
        assert!(result.new_nodes.contains(&source.node));
        let primary = producer(&graph, rnn.consumers[port], 0);
        assert_eq!(Some(source), primary, "port {}", port);
    }
    let dx_source = producer(&graph, rnn.consumers[output::DX], 0).unwrap();
    assert_eq!(graph.peer_input_anchors(dx_source)?.len(), 3);

    Ok(())
}
