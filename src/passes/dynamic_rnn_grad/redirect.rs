use tilefuse_graph::OutputAnchor;

use super::builder::Rewriter;
use super::OUTPUT_NAMES;
use crate::fusion::FusionError;

/// Move the consumers of the matched node's outputs to new producers.
///
/// `redirects` maps output ports of the matched node to the anchors that
/// replace them. Consumer descriptors are left unchanged, so each new
/// producer must match the output it replaces. Returns the number of
/// consumers moved.
pub fn redirect_outputs(
    rw: &mut Rewriter,
    redirects: &[(usize, OutputAnchor)],
) -> Result<usize, FusionError> {
    let node = rw.ctx().node;
    let mut moved = 0;

    for &(port, source) in redirects {
        let consumers = rw.with_graph(|g| Ok(g.peer_input_anchors(node.output(port))?.to_vec()))?;
        if consumers.is_empty() {
            continue;
        }
        for consumer in consumers {
            rw.with_graph(|g| g.unlink_all(consumer))?;
            rw.connect(source, consumer)?;
            moved += 1;
        }
    }

    for (port, name) in OUTPUT_NAMES.iter().enumerate() {
        let remaining = rw
            .graph()
            .peer_input_anchors(node.output(port))
            .map_err(|err| rw.graph_error(err))?
            .len();
        if remaining > 0 {
            return Err(rw.precondition(format!(
                "output {} still has {} consumers after redirection",
                name, remaining
            )));
        }
    }

    Ok(moved)
}

/// Remove the matched node, which must have no remaining consumers.
pub fn excise_original(rw: &mut Rewriter) -> Result<(), FusionError> {
    let node = rw.ctx().node;
    let removed = rw.with_graph(|g| g.remove_node(node))?;
    if removed.is_connected() {
        return Err(rw.precondition(format!(
            "node {} still has edges after removal",
            removed.name()
        )));
    }
    log::trace!("removed {} node {}", removed.op_type(), removed.name());
    Ok(())
}
