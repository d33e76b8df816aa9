//! Computation graph used by the tilefuse fusion passes.
//!
//! Nodes live in an arena and are addressed by stable [`NodeId`]s. Each node
//! has ordered input and output ports, each described by a [`TensorDesc`].
//! Data edges connect an output port ([`OutputAnchor`]) to an input port
//! ([`InputAnchor`]).
//!
//! Nodes are created from a [`NodeSpec`], which declares the node's name,
//! operator type, port descriptors and attributes:
//!
//! ```
//! use tilefuse_graph::{DataType, Graph, NodeSpec, TensorDesc};
//!
//! let desc = TensorDesc::nd(&[8, 20], DataType::Float16);
//! let mut graph = Graph::new();
//! let data = graph
//!     .add_node(NodeSpec::new("x", "Data").with_output("y", desc.clone()))
//!     .unwrap();
//! let relu = graph
//!     .add_node(
//!         NodeSpec::new("relu", "Relu")
//!             .with_input("x", desc.clone())
//!             .with_output("y", desc),
//!     )
//!     .unwrap();
//! graph.add_edge(data.output(0), relu.input(0)).unwrap();
//! assert_eq!(graph.edge_count(), 1);
//! ```

mod attr;
mod desc;
mod graph;
mod node;
mod node_id;

pub use attr::{AttrValue, Attrs, ConstTensor};
pub use desc::{
    align_to_tile, is_tile_aligned, DataType, DescError, Dimension, Format, Shape, TensorDesc,
    TILE_SIZE,
};
pub use graph::{Graph, GraphError, PortKind};
pub use node::{InputPort, Node, NodeSpec, OutputPort, PortDesc};
pub use node_id::{Anchor, InputAnchor, NodeId, OutputAnchor};
