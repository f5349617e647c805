//! LP solver contract and single-query solving.

use crate::constraint::{ActivationConstraint, LinearConstraint};
use crate::variable::RelaxVariable;
use gamma_core::{GammaError, Result, SolveStatus};
use gamma_propagate::{Environment, NodeId};
use std::time::Duration;
use tracing::debug;

/// Result of one objective minimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    /// Achieved objective value, bias included.
    pub value: f64,
    pub status: SolveStatus,
}

impl Solution {
    pub fn optimal(value: f64) -> Self {
        Self {
            value,
            status: SolveStatus::Optimal,
        }
    }

    /// Whether `value` is a certified optimum.
    pub fn is_optimal(&self) -> bool {
        self.status.is_optimal()
    }
}

/// What an LP backend must provide to solve the relaxation.
///
/// One instance holds the encoding of a single batch sample. Variables must
/// be declared before any constraint that mentions them, and each node is
/// declared at most once per instance.
pub trait RelaxationSolver {
    /// Declare one bounded decision variable per element of `sample` of
    /// `variable`, bounded by its concrete interval.
    fn create_solver_variable(&mut self, variable: &RelaxVariable, sample: usize) -> Result<()>;

    /// Declare `constraint` specialized to `sample`.
    fn create_linear_solver_constraint(
        &mut self,
        constraint: &LinearConstraint,
        sample: usize,
    ) -> Result<()>;

    /// Declare `out[element] (sense) slope * in[element] + bias` for the
    /// variables of `constraint`.
    fn create_activation_solver_constraint(
        &mut self,
        constraint: &ActivationConstraint,
        element: usize,
        slope: f64,
        bias: f64,
    ) -> Result<()>;

    /// Minimize `objective · var + objective_bias` over the declared
    /// constraints. `objective` has one coefficient per element of a sample
    /// of `var`. `None` for `time_limit` means unbounded.
    fn minimize_objective(
        &mut self,
        var: NodeId,
        objective: &[f64],
        objective_bias: f64,
        time_limit: Option<Duration>,
    ) -> Result<Solution>;
}

/// Declare `variable` and all of its constraints for `sample`.
pub fn encode_variable<S: RelaxationSolver + ?Sized>(
    solver: &mut S,
    variable: &RelaxVariable,
    sample: usize,
) -> Result<()> {
    solver.create_solver_variable(variable, sample)?;
    for constraint in variable.constraints() {
        constraint.encode_into_solver(solver, sample)?;
    }
    Ok(())
}

/// Build the full encoding of `sample` in a fresh solver and minimize
/// `objective · variable + objective_bias`.
///
/// Every relaxation variable of `env` is declared in id order, constants are
/// skipped. The solver is dropped afterwards.
pub fn solve_relaxation<S, F>(
    solver_ctor: F,
    objective: &[f64],
    objective_bias: f64,
    variable: &RelaxVariable,
    env: &Environment<RelaxVariable>,
    sample: usize,
    time_limit: Option<Duration>,
) -> Result<Solution>
where
    S: RelaxationSolver,
    F: FnOnce() -> S,
{
    if objective.len() != variable.sample_len() {
        return Err(GammaError::shape_mismatch(
            vec![variable.sample_len()],
            vec![objective.len()],
        ));
    }
    if sample >= variable.batch_size() {
        return Err(GammaError::InvalidBounds(format!(
            "sample {sample} outside batch of {}",
            variable.batch_size()
        )));
    }
    let mut solver = solver_ctor();
    let mut declared = 0usize;
    for (_, var) in env.vars() {
        encode_variable(&mut solver, var, sample)?;
        declared += 1;
    }
    debug!(
        "Solving relaxation for node {} (sample {sample}) over {declared} variable(s)",
        variable.id()
    );
    solver.minimize_objective(variable.id(), objective, objective_bias, time_limit)
}
