//! Scenario and property tests for the relaxation.


use crate::constraint::{ActivationConstraint, LinearConstraint, Sense};
use crate::solver::{RelaxationSolver, Solution};
use crate::variable::RelaxVariable;
use gamma_core::{Result, SolveStatus};
use gamma_propagate::NodeId;
use gamma_tensor::BoundedTensor;
use ndarray::{Array2, ArrayD};
use std::time::Duration;

/// Absolute tolerance for LP values and constraint checks.
pub(crate) const TOL: f64 = 1e-4;

/// Bounds of shape `[1, n]`.
pub(crate) fn row_bounds(lower: &[f32], upper: &[f32]) -> BoundedTensor {
    batch_bounds(&[lower], &[upper])
}

/// Bounds of shape `[batch, n]`, one row per sample.
pub(crate) fn batch_bounds(lower: &[&[f32]], upper: &[&[f32]]) -> BoundedTensor {
    let to_array = |rows: &[&[f32]]| -> ArrayD<f32> {
        let n = rows.first().map_or(0, |r| r.len());
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Array2::from_shape_vec((rows.len(), n), flat)
            .unwrap()
            .into_dyn()
    };
    BoundedTensor::new(to_array(lower), to_array(upper)).unwrap()
}

/// Solver that records calls and answers every query with a fixed status.
#[derive(Debug)]
pub(crate) struct RecordingSolver {
    pub declared: Vec<(NodeId, usize)>,
    /// `(sample, bias)` of each linear constraint.
    pub linear: Vec<(usize, f32)>,
    /// `(outvar, invar, element, slope, bias, sense)`.
    pub activation: Vec<(NodeId, NodeId, usize, f64, f64, Sense)>,
    pub queries: Vec<(NodeId, Vec<f64>, Option<Duration>)>,
    pub status: SolveStatus,
    /// Added to the objective bias of every answer.
    pub value: f64,
}

impl RecordingSolver {
    pub fn new(status: SolveStatus) -> Self {
        Self {
            declared: Vec::new(),
            linear: Vec::new(),
            activation: Vec::new(),
            queries: Vec::new(),
            status,
            value: 0.0,
        }
    }

    pub fn answering(value: f64) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }
}

impl Default for RecordingSolver {
    fn default() -> Self {
        Self::new(SolveStatus::Optimal)
    }
}

impl RelaxationSolver for RecordingSolver {
    fn create_solver_variable(&mut self, variable: &RelaxVariable, sample: usize) -> Result<()> {
        self.declared.push((variable.id(), sample));
        Ok(())
    }

    fn create_linear_solver_constraint(
        &mut self,
        constraint: &LinearConstraint,
        sample: usize,
    ) -> Result<()> {
        self.linear.push((sample, constraint.bias(sample)));
        Ok(())
    }

    fn create_activation_solver_constraint(
        &mut self,
        constraint: &ActivationConstraint,
        element: usize,
        slope: f64,
        bias: f64,
    ) -> Result<()> {
        self.activation.push((
            constraint.outvar,
            constraint.invar,
            element,
            slope,
            bias,
            constraint.sense,
        ));
        Ok(())
    }

    fn minimize_objective(
        &mut self,
        var: NodeId,
        objective: &[f64],
        objective_bias: f64,
        time_limit: Option<Duration>,
    ) -> Result<Solution> {
        self.queries.push((var, objective.to_vec(), time_limit));
        Ok(Solution {
            value: objective_bias + self.value,
            status: self.status,
        })
    }
}
