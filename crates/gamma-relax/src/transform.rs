//! Relaxation as a graph transform.

use crate::rules::{relax_input, relax_primitive};
use crate::variable::RelaxVariable;
use gamma_core::Result;
use gamma_propagate::{
    propagate, Arg, Environment, Graph, GraphTransform, IntervalBoundTransform, NodeId, Primitive,
};
use gamma_tensor::BoundedTensor;
use ndarray::ArrayD;

/// Builds one [`RelaxVariable`] per node.
///
/// Concrete bounds come from the wrapped bound transform `B`, run on the
/// arguments' bounds; constraints come from the relaxation rules, run on
/// the arguments themselves.
#[derive(Debug, Clone)]
pub struct RelaxationTransform<B = IntervalBoundTransform> {
    bounds: B,
}

impl<B> RelaxationTransform<B> {
    pub fn new(bounds: B) -> Self {
        Self { bounds }
    }
}

impl Default for RelaxationTransform {
    fn default() -> Self {
        Self::new(IntervalBoundTransform)
    }
}

impl<B> GraphTransform for RelaxationTransform<B>
where
    B: GraphTransform<Value = BoundedTensor>,
{
    type Value = RelaxVariable;

    fn input_transform(
        &mut self,
        id: NodeId,
        lower: &ArrayD<f32>,
        upper: &ArrayD<f32>,
    ) -> Result<RelaxVariable> {
        let bound = self.bounds.input_transform(id, lower, upper)?;
        Ok(relax_input(id, bound))
    }

    fn primitive_transform(
        &mut self,
        id: NodeId,
        primitive: &Primitive,
        args: &[Arg<'_, RelaxVariable>],
    ) -> Result<RelaxVariable> {
        let bound_args: Vec<Arg<'_, BoundedTensor>> =
            args.iter().map(|a| a.map(RelaxVariable::bound)).collect();
        let out_bound = self.bounds.primitive_transform(id, primitive, &bound_args)?;
        relax_primitive(id, out_bound, primitive, args)
    }
}

/// Relax every node of `graph` using interval bounds.
pub fn relax_graph(graph: &Graph, inputs: &[BoundedTensor]) -> Result<Environment<RelaxVariable>> {
    propagate(graph, &mut RelaxationTransform::new(IntervalBoundTransform), inputs)
}
