//! LP relaxation of neural network computation graphs.
//!
//! Walking a graph with [`RelaxationTransform`] gives every node a
//! [`RelaxVariable`]: its concrete interval bound plus linear constraints
//! tying it to earlier nodes. Affine nodes are encoded exactly, ReLU
//! (`max(x, 0)`) with the triangle relaxation. Any LP backend implementing
//! [`RelaxationSolver`] can then answer bound queries on the result
//! ([`solve_relaxation`]).
//!
//! [`OptimizedRelaxationTransform`] additionally keeps one solver per batch
//! sample during traversal and tightens the inputs of every ReLU by LP before
//! relaxing it.
//!
//! [`LpSolver`] is the bundled backend (good_lp with minilp).

pub mod config;
pub mod constraint;
pub mod lp;
pub mod optimized;
pub mod rules;
pub mod solver;
pub mod transform;
pub mod variable;

pub use config::RelaxationConfig;
pub use constraint::{
    ActivationConstraint, Bias, Coefficients, Constraint, LinearConstraint, LinearTerm, Sense,
};
pub use lp::LpSolver;
pub use optimized::OptimizedRelaxationTransform;
pub use rules::{relax_input, relax_primitive, relu_chord, relu_chord_arrays, RELU_DENOMINATOR_FLOOR};
pub use solver::{encode_variable, solve_relaxation, RelaxationSolver, Solution};
pub use transform::{relax_graph, RelaxationTransform};
pub use variable::RelaxVariable;

pub use gamma_core::{Bound, GammaError, Result, SolveStatus};
pub use gamma_propagate::{Environment, Graph, GraphBuilder, NodeId, Primitive};
pub use gamma_tensor::BoundedTensor;

#[cfg(test)]
mod tests;
