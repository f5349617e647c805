//! Graph traversal driven by per-node callbacks.
//!
//! [`propagate`] walks a [`Graph`] once in dataflow order and asks a
//! [`GraphTransform`] for the value of every input and primitive node. The
//! resulting [`Environment`] maps node ids to either transform values or the
//! graph's constants.

use crate::graph::{Graph, NodeId, NodeKind};
use crate::primitive::Primitive;
use gamma_core::{GammaError, Result};
use gamma_tensor::BoundedTensor;
use ndarray::ArrayD;
use tracing::{debug, trace};

/// Resolved argument of a primitive node.
#[derive(Debug)]
pub enum Arg<'a, V> {
    /// Value produced by the transform for an upstream node.
    Var(&'a V),
    /// Constant tensor, shared by every sample.
    Const(&'a ArrayD<f32>),
}

impl<V> Clone for Arg<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Arg<'_, V> {}

impl<'a, V> Arg<'a, V> {
    pub fn as_var(&self) -> Option<&'a V> {
        match self {
            Arg::Var(v) => Some(*v),
            Arg::Const(_) => None,
        }
    }

    /// Map the variable payload, keeping constants as they are.
    pub fn map<W>(self, f: impl FnOnce(&'a V) -> &'a W) -> Arg<'a, W> {
        match self {
            Arg::Var(v) => Arg::Var(f(v)),
            Arg::Const(c) => Arg::Const(c),
        }
    }
}

/// Callbacks invoked by [`propagate`] for each node.
pub trait GraphTransform {
    type Value;

    /// Value of a network input given its concrete bounds (batch axis first).
    fn input_transform(
        &mut self,
        id: NodeId,
        lower: &ArrayD<f32>,
        upper: &ArrayD<f32>,
    ) -> Result<Self::Value>;

    /// Value of a primitive node given its resolved arguments.
    fn primitive_transform(
        &mut self,
        id: NodeId,
        primitive: &Primitive,
        args: &[Arg<'_, Self::Value>],
    ) -> Result<Self::Value>;
}

/// Value stored for one node.
#[derive(Debug, Clone)]
pub enum Value<V> {
    Var(V),
    Const(ArrayD<f32>),
}

impl<V> Value<V> {
    fn as_arg(&self) -> Arg<'_, V> {
        match self {
            Value::Var(v) => Arg::Var(v),
            Value::Const(c) => Arg::Const(c),
        }
    }
}

/// Per-node values, indexed by node id.
#[derive(Debug, Clone)]
pub struct Environment<V> {
    values: Vec<Value<V>>,
}

impl<V> Default for Environment<V> {
    fn default() -> Self {
        Self { values: Vec::new() }
    }
}

impl<V> Environment<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value of the next node. Returns its id.
    pub fn push(&mut self, value: Value<V>) -> NodeId {
        self.values.push(value);
        self.values.len() - 1
    }

    pub fn get(&self, id: NodeId) -> Option<&Value<V>> {
        self.values.get(id)
    }

    /// Transform value of node `id`, if it is not a constant.
    pub fn var(&self, id: NodeId) -> Option<&V> {
        match self.values.get(id)? {
            Value::Var(v) => Some(v),
            Value::Const(_) => None,
        }
    }

    /// All entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Value<V>)> {
        self.values.iter().enumerate()
    }

    /// Transform values in id order, skipping constants.
    pub fn vars(&self) -> impl Iterator<Item = (NodeId, &V)> {
        self.iter().filter_map(|(id, v)| match v {
            Value::Var(v) => Some((id, v)),
            Value::Const(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Run `transform` over every node of `graph` in dataflow order.
///
/// `inputs` supplies one bounded tensor per graph input, in
/// [`Graph::inputs`] order, each with a leading batch axis. Any failure
/// aborts the traversal; errors from primitive nodes are wrapped in
/// [`GammaError::NodeError`].
pub fn propagate<T: GraphTransform>(
    graph: &Graph,
    transform: &mut T,
    inputs: &[BoundedTensor],
) -> Result<Environment<T::Value>> {
    if inputs.len() != graph.inputs().len() {
        return Err(GammaError::InvalidGraph(format!(
            "graph has {} input(s), got bounds for {}",
            graph.inputs().len(),
            inputs.len()
        )));
    }
    debug!(
        "Propagating through {} nodes with {} input(s)",
        graph.len(),
        inputs.len()
    );

    let mut env = Environment::new();
    let mut next_input = inputs.iter();
    for node in graph.nodes() {
        let value = match &node.kind {
            NodeKind::Input { shape } => {
                let bounds = next_input.next().ok_or_else(|| {
                    GammaError::InvalidGraph(format!("no bounds for input node {}", node.id))
                })?;
                if bounds.sample_shape() != shape.as_slice() {
                    let mut expected = vec![bounds.batch_size()];
                    expected.extend_from_slice(shape);
                    return Err(GammaError::shape_mismatch(expected, bounds.shape().to_vec()));
                }
                trace!("node {} input {:?}", node.id, bounds.shape());
                Value::Var(transform.input_transform(node.id, &bounds.lower, &bounds.upper)?)
            }
            NodeKind::Constant(c) => Value::Const(c.clone()),
            NodeKind::Op { primitive, args } => {
                let resolved = args
                    .iter()
                    .map(|&a| {
                        env.get(a).map(Value::as_arg).ok_or_else(|| {
                            GammaError::InvalidGraph(format!(
                                "node {} uses node {a} before it is computed",
                                node.id
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                trace!("node {} {} ({} args)", node.id, primitive.name(), args.len());
                let out = transform
                    .primitive_transform(node.id, primitive, &resolved)
                    .map_err(|e| GammaError::NodeError {
                        node: node.id,
                        op: node.label(),
                        source: Box::new(e),
                    })?;
                Value::Var(out)
            }
        };
        env.push(value);
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use ndarray::arr2;

    /// Records the order in which nodes are visited.
    #[derive(Default)]
    struct Recorder {
        visited: Vec<(NodeId, String, usize)>,
    }

    impl GraphTransform for Recorder {
        type Value = NodeId;

        fn input_transform(
            &mut self,
            id: NodeId,
            _lower: &ArrayD<f32>,
            _upper: &ArrayD<f32>,
        ) -> Result<NodeId> {
            self.visited.push((id, "input".to_string(), 0));
            Ok(id)
        }

        fn primitive_transform(
            &mut self,
            id: NodeId,
            primitive: &Primitive,
            args: &[Arg<'_, NodeId>],
        ) -> Result<NodeId> {
            let vars = args.iter().filter(|a| a.as_var().is_some()).count();
            self.visited.push((id, primitive.name().to_string(), vars));
            if matches!(primitive, Primitive::Tanh) {
                return Err(GammaError::UnsupportedOp("tanh".to_string()));
            }
            Ok(id)
        }
    }

    fn input_bounds(batch: usize, n: usize) -> BoundedTensor {
        BoundedTensor::concrete(ndarray::Array2::<f32>::zeros((batch, n)).into_dyn())
    }

    #[test]
    fn test_visits_in_dataflow_order() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2]);
        let h = b
            .linear(x, arr2(&[[1.0_f32], [1.0]]).into_dyn(), None)
            .unwrap();
        let y = b.relu(h).unwrap();
        let g = b.build();

        let mut rec = Recorder::default();
        let env = propagate(&g, &mut rec, &[input_bounds(1, 2)]).unwrap();

        let ids: Vec<_> = rec.visited.iter().map(|v| v.0).collect();
        assert_eq!(ids, vec![x, h, y]);
        assert_eq!(rec.visited[1].2, 1);
        assert_eq!(env.len(), g.len());
        assert_eq!(env.var(y), Some(&y));
        assert!(env.var(1).is_none(), "weight is a constant");
        assert_eq!(env.vars().count(), 3);
    }

    #[test]
    fn test_input_count_mismatch() {
        let mut b = GraphBuilder::new();
        b.input(&[2]);
        let g = b.build();
        let err = propagate(&g, &mut Recorder::default(), &[]).unwrap_err();
        assert!(matches!(err, GammaError::InvalidGraph(_)));
    }

    #[test]
    fn test_input_shape_mismatch() {
        let mut b = GraphBuilder::new();
        b.input(&[3]);
        let g = b.build();
        let err = propagate(&g, &mut Recorder::default(), &[input_bounds(1, 2)]).unwrap_err();
        assert!(matches!(err, GammaError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_errors_carry_node_context() {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2]);
        let t = b.op(Primitive::Tanh, &[x]).unwrap();
        let g = b.build();
        let err = propagate(&g, &mut Recorder::default(), &[input_bounds(1, 2)]).unwrap_err();
        match &err {
            GammaError::NodeError { node, op, .. } => {
                assert_eq!(*node, t);
                assert_eq!(op, "tanh");
            }
            other => panic!("expected NodeError, got {other:?}"),
        }
        assert!(err.is_unsupported());
    }
}
