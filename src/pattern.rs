use tilefuse_graph::{Graph, NodeId};

/// Bindings from pattern symbols and operator keys to graph nodes, with
/// support for undoing bindings made by a failed alternative.
#[derive(Clone, Debug, Default)]
struct SymbolMap {
    /// Bound `(name, node)` pairs, in binding order.
    bindings: Vec<(&'static str, NodeId)>,

    /// Values of `bindings.len()` saved by `checkpoint`.
    saved_lens: Vec<usize>,
}

impl SymbolMap {
    fn checkpoint(&mut self) {
        self.saved_lens.push(self.bindings.len());
    }

    /// Undo bindings made since the matching `checkpoint`.
    fn revert(&mut self) {
        if let Some(len) = self.saved_lens.pop() {
            self.bindings.truncate(len);
        }
    }

    /// Keep bindings made since the matching `checkpoint`.
    fn commit(&mut self) {
        self.saved_lens.pop();
    }

    fn bind(&mut self, name: &'static str, node: NodeId) {
        self.bindings.push((name, node));
    }

    fn lookup(&self, name: &str) -> Option<NodeId> {
        self.bindings
            .iter()
            .find(|(bound, _)| *bound == name)
            .map(|&(_, node)| node)
    }
}

/// Nodes bound by a successful [`Pattern`] test.
#[derive(Clone, Debug)]
pub struct Match {
    output: NodeId,
    symbols: SymbolMap,
}

impl Match {
    /// Return the node that a symbol or keyed operator was resolved to.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.symbols.lookup(name)
    }

    /// Return the node the pattern's output was matched against.
    pub fn output(&self) -> NodeId {
        self.output
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpPattern {
    /// Operator type of the node (eg. "DynamicRNNGrad").
    op_type: &'static str,

    /// Patterns that the producers of the node's inputs must match, or
    /// `None` to accept any inputs.
    inputs: Option<Vec<Pattern>>,

    /// Identifier used to look up the operator node after a successful
    /// match.
    key: Option<&'static str>,
}

impl OpPattern {
    fn matches(&self, node_id: NodeId, graph: &Graph, symbols: &mut SymbolMap) -> bool {
        let Some(node) = graph.node(node_id) else {
            return false;
        };
        if node.op_type() != self.op_type {
            return false;
        }
        let Some(inputs) = &self.inputs else {
            return true;
        };
        if inputs.len() != node.inputs().len() {
            return false;
        }
        inputs.iter().zip(node.inputs()).all(|(input_pat, port)| {
            port.peer()
                .is_some_and(|producer| input_pat.test_impl(producer.node, graph, symbols))
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SymbolPattern {
    name: &'static str,
}

/// Structural description of a subgraph, tested against its output node.
///
/// A pattern is matched against a node, which must be the output of a
/// subgraph with the described structure. Operator patterns match a node by
/// type, and optionally the producers of each of its inputs. Symbols match
/// any node, but all occurrences of a symbol must resolve to the same node.
#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    /// Matches an operator.
    Operator(OpPattern),
    /// Matches any node.
    Symbol(SymbolPattern),
    /// Matches if any of the alternatives match. Alternatives are tried in
    /// order.
    Either(Vec<Pattern>),
}

impl Pattern {
    /// Create a pattern that matches an operator whose inputs are produced by
    /// nodes matching `inputs`.
    pub fn operator<I: Into<Vec<Pattern>>>(op_type: &'static str, inputs: I) -> Pattern {
        Pattern::Operator(OpPattern {
            op_type,
            inputs: Some(inputs.into()),
            key: None,
        })
    }

    /// Create a pattern that matches an operator of a given type, regardless
    /// of its inputs.
    pub fn op_type(op_type: &'static str) -> Pattern {
        Pattern::Operator(OpPattern {
            op_type,
            inputs: None,
            key: None,
        })
    }

    /// Create a pattern that matches any node.
    pub fn symbol(name: &'static str) -> Pattern {
        Pattern::Symbol(SymbolPattern { name })
    }

    /// Create a pattern that matches any of `alternatives`.
    pub fn either<I: Into<Vec<Pattern>>>(alternatives: I) -> Pattern {
        Pattern::Either(alternatives.into())
    }

    /// Set the identifier for an operator pattern, used to look up the node
    /// ID in a match using [`Match::node_id`].
    pub fn with_key(self, key: &'static str) -> Pattern {
        match self {
            Pattern::Operator(mut op) => {
                op.key = Some(key);
                Pattern::Operator(op)
            }
            Pattern::Symbol(_) => Pattern::Symbol(SymbolPattern { name: key }),
            Pattern::Either(alts) => {
                Pattern::Either(alts.into_iter().map(|p| p.with_key(key)).collect())
            }
        }
    }

    /// Return the operator types which a node must have to match this
    /// pattern, or an empty list if any node may match.
    pub fn trigger_op_types(&self) -> Vec<&'static str> {
        match self {
            Pattern::Operator(op) => vec![op.op_type],
            Pattern::Symbol(_) => Vec::new(),
            Pattern::Either(alts) => {
                let mut types = Vec::new();
                for alt in alts {
                    let alt_types = alt.trigger_op_types();
                    if alt_types.is_empty() {
                        return Vec::new();
                    }
                    for ty in alt_types {
                        if !types.contains(&ty) {
                            types.push(ty);
                        }
                    }
                }
                types
            }
        }
    }

    /// Return true if a symbol or operator key with a given name appears in
    /// the pattern.
    pub fn contains_key(&self, name: &str) -> bool {
        match self {
            Pattern::Operator(op) => {
                op.key == Some(name)
                    || op
                        .inputs
                        .iter()
                        .flatten()
                        .any(|input| input.contains_key(name))
            }
            Pattern::Symbol(sym) => sym.name == name,
            Pattern::Either(alts) => alts.iter().any(|alt| alt.contains_key(name)),
        }
    }

    /// Test whether this pattern matches a subgraph with output `node_id`.
    ///
    /// On success the returned [`Match`] maps keys and symbols to the nodes
    /// they were bound to.
    pub fn test(&self, node_id: NodeId, graph: &Graph) -> Option<Match> {
        let mut symbols = SymbolMap::default();
        if self.test_impl(node_id, graph, &mut symbols) {
            Some(Match {
                output: node_id,
                symbols,
            })
        } else {
            None
        }
    }

    fn test_impl(&self, node_id: NodeId, graph: &Graph, symbols: &mut SymbolMap) -> bool {
        match self {
            Pattern::Operator(op_pat) => {
                symbols.checkpoint();
                if !op_pat.matches(node_id, graph, symbols) {
                    symbols.revert();
                    return false;
                }
                symbols.commit();
                if let Some(key) = op_pat.key {
                    symbols.bind(key, node_id);
                }
                true
            }
            Pattern::Symbol(sym_pat) => {
                if graph.node(node_id).is_none() {
                    return false;
                }
                // Repeated symbols must bind the same node.
                match symbols.lookup(sym_pat.name) {
                    Some(bound) => bound == node_id,
                    None => {
                        symbols.bind(sym_pat.name, node_id);
                        true
                    }
                }
            }
            Pattern::Either(alts) => {
                for alt in alts {
                    symbols.checkpoint();
                    if alt.test_impl(node_id, graph, symbols) {
                        symbols.commit();
                        return true;
                    }
                    symbols.revert();
                }
                false
            }
        }
    }
}

/// A pattern declared by a fusion pass.
///
/// The pattern's output is the node that triggers the pass.
#[derive(Clone, Debug, PartialEq)]
pub struct FusionPattern {
    name: &'static str,
    output: Pattern,
}

impl FusionPattern {
    pub fn new(name: &'static str, output: Pattern) -> FusionPattern {
        FusionPattern { name, output }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn output(&self) -> &Pattern {
        &self.output
    }

    /// Test the pattern against a candidate output node.
    pub fn test(&self, node_id: NodeId, graph: &Graph) -> Option<Match> {
        self.output.test(node_id, graph)
    }
}
