//! Computation graph as an arena of nodes.
//!
//! Node ids are indices into the arena. Operands always refer to nodes that
//! already exist, so the insertion order is a valid dataflow order and the
//! graph is acyclic by construction.

use crate::primitive::{Operand, Primitive};
use gamma_core::{GammaError, Result};
use ndarray::{ArrayD, IxDyn};

/// Stable node identifier (index into [`Graph::nodes`]).
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Network input with the given per-sample shape.
    Input { shape: Vec<usize> },
    /// Constant tensor shared by every sample.
    Constant(ArrayD<f32>),
    /// Primitive applied to earlier nodes.
    Op {
        primitive: Primitive,
        args: Vec<NodeId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub kind: NodeKind,
    /// Per-sample output shape (constants: full shape).
    pub shape: Vec<usize>,
}

impl Node {
    /// Label for logs: the node name, or the primitive/kind.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            NodeKind::Input { .. } => "input".to_string(),
            NodeKind::Constant(_) => "constant".to_string(),
            NodeKind::Op { primitive, .. } => primitive.name().to_string(),
        }
    }
}

/// Feed-forward computation graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: Vec<NodeId>,
}

impl Graph {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Input nodes, in the order their bounds must be supplied.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Last node in dataflow order.
    pub fn output(&self) -> Option<NodeId> {
        self.nodes.len().checked_sub(1)
    }
}

/// Incremental graph construction with shape checking.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: Option<String>, kind: NodeKind, shape: Vec<usize>) -> NodeId {
        let id = self.graph.nodes.len();
        self.graph.nodes.push(Node {
            id,
            name,
            kind,
            shape,
        });
        id
    }

    /// Add a network input with the given per-sample shape.
    pub fn input(&mut self, shape: &[usize]) -> NodeId {
        let id = self.push(
            None,
            NodeKind::Input {
                shape: shape.to_vec(),
            },
            shape.to_vec(),
        );
        self.graph.inputs.push(id);
        id
    }

    pub fn constant(&mut self, value: ArrayD<f32>) -> NodeId {
        let shape = value.shape().to_vec();
        self.push(None, NodeKind::Constant(value), shape)
    }

    /// Add a primitive applied to existing nodes.
    pub fn op(&mut self, primitive: Primitive, args: &[NodeId]) -> Result<NodeId> {
        let mut operands = Vec::with_capacity(args.len());
        for &arg in args {
            let node = self.graph.nodes.get(arg).ok_or_else(|| {
                GammaError::InvalidGraph(format!(
                    "{} refers to node {arg}, which does not exist yet",
                    primitive.name()
                ))
            })?;
            operands.push(match &node.kind {
                NodeKind::Constant(c) => Operand::Const(c),
                _ => Operand::Var { shape: &node.shape },
            });
        }
        if !operands.iter().any(Operand::is_var) {
            return Err(GammaError::InvalidGraph(format!(
                "{} applied to constants only; fold it before building the graph",
                primitive.name()
            )));
        }
        let shape = primitive.output_shape(&operands)?;
        Ok(self.push(
            None,
            NodeKind::Op {
                primitive,
                args: args.to_vec(),
            },
            shape,
        ))
    }

    /// `max(x, 0)`.
    pub fn relu(&mut self, x: NodeId) -> Result<NodeId> {
        let zero = self.constant(ArrayD::zeros(IxDyn(&[])));
        self.op(Primitive::Max, &[x, zero])
    }

    /// `x @ weight + bias` for a variable `x[..., K]`, `weight[K, N]`, `bias[N]`.
    pub fn linear(
        &mut self,
        x: NodeId,
        weight: ArrayD<f32>,
        bias: Option<ArrayD<f32>>,
    ) -> Result<NodeId> {
        let w = self.constant(weight);
        let mut out = self.op(Primitive::DotGeneral, &[x, w])?;
        if let Some(bias) = bias {
            let b = self.constant(bias);
            out = self.op(Primitive::Add, &[out, b])?;
        }
        Ok(out)
    }

    /// Attach a name to a node.
    pub fn name(&mut self, id: NodeId, name: impl Into<String>) -> &mut Self {
        if let Some(node) = self.graph.nodes.get_mut(id) {
            node.name = Some(name.into());
        }
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_builder_shapes() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2]);
        let h = b
            .linear(
                x,
                arr2(&[[1.0_f32, -1.0, 0.5], [2.0, 0.0, 1.0]]).into_dyn(),
                Some(arr1(&[0.1_f32, 0.2, 0.3]).into_dyn()),
            )
            .unwrap();
        let y = b.relu(h).unwrap();
        let g = b.build();

        assert_eq!(g.inputs(), &[x]);
        assert_eq!(g.node(h).unwrap().shape, vec![3]);
        assert_eq!(g.node(y).unwrap().shape, vec![3]);
        assert_eq!(g.output(), Some(y));
        assert_eq!(g.node(y).unwrap().label(), "max");
    }

    #[test]
    fn test_forward_reference_rejected() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[1]);
        let err = b.op(Primitive::Add, &[x, 7]).unwrap_err();
        assert!(matches!(err, GammaError::InvalidGraph(_)));
    }

    #[test]
    fn test_constant_only_op_rejected() {
        let mut b = GraphBuilder::new();
        let c = b.constant(arr1(&[1.0_f32]).into_dyn());
        let err = b.op(Primitive::Add, &[c, c]).unwrap_err();
        assert!(matches!(err, GammaError::InvalidGraph(_)));
    }

    #[test]
    fn test_shape_error_surfaces() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2]);
        let y = b.input(&[3]);
        assert!(b.op(Primitive::Add, &[x, y]).is_err());
    }

    #[test]
    fn test_named_node_label() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[1]);
        b.name(x, "pixels");
        let g = b.build();
        assert_eq!(g.node(x).unwrap().label(), "pixels");
    }
}
