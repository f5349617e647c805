//! [`RelaxationSolver`] backed by good_lp's pure-Rust minilp solver.
//!
//! Declarations are recorded as plain columns and rows; a good_lp model is
//! built from them on every [`minimize_objective`](RelaxationSolver::minimize_objective)
//! call, so the encoding can keep growing between solves.
//!
//! minilp runs every solve to completion. Requesting a time limit is an
//! error rather than a silently ignored setting.

use crate::constraint::{ActivationConstraint, LinearConstraint, Sense};
use crate::solver::{RelaxationSolver, Solution};
use crate::variable::RelaxVariable;
use gamma_core::{GammaError, Result, SolveStatus};
use gamma_propagate::NodeId;
use good_lp::solvers::minilp::minilp;
use good_lp::{
    constraint, variable, variables, Expression, ResolutionError, Solution as _, SolverModel,
    Variable,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{trace, warn};

/// Columns of one declared node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    offset: usize,
    len: usize,
}

impl Block {
    fn column(&self, node: NodeId, component: usize) -> Result<usize> {
        if component < self.len {
            Ok(self.offset + component)
        } else {
            Err(GammaError::Solver(format!(
                "component {component} out of range for node {node} ({} element(s))",
                self.len
            )))
        }
    }
}

/// `Σ coeff · column (sense) rhs`.
#[derive(Debug, Clone)]
struct Row {
    terms: Vec<(usize, f64)>,
    sense: Sense,
    rhs: f64,
}

/// LP encoding of one batch sample.
#[derive(Debug, Clone, Default)]
pub struct LpSolver {
    blocks: HashMap<NodeId, Block>,
    /// `(lower, upper)` of every column.
    columns: Vec<(f64, f64)>,
    rows: Vec<Row>,
}

impl LpSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_declared(&self, node: NodeId) -> bool {
        self.blocks.contains_key(&node)
    }

    fn block(&self, node: NodeId) -> Result<Block> {
        self.blocks
            .get(&node)
            .copied()
            .ok_or_else(|| GammaError::Solver(format!("node {node} has not been declared")))
    }
}

impl RelaxationSolver for LpSolver {
    fn create_solver_variable(&mut self, variable: &RelaxVariable, sample: usize) -> Result<()> {
        let node = variable.id();
        if self.blocks.contains_key(&node) {
            return Err(GammaError::Solver(format!("node {node} declared twice")));
        }
        if sample >= variable.batch_size() {
            return Err(GammaError::Solver(format!(
                "sample {sample} outside batch of {} for node {node}",
                variable.batch_size()
            )));
        }
        let lower = variable.bound().sample_lower(sample);
        let upper = variable.bound().sample_upper(sample);
        let block = Block {
            offset: self.columns.len(),
            len: lower.len(),
        };
        self.columns.extend(
            lower
                .iter()
                .zip(upper.iter())
                .map(|(&l, &u)| (f64::from(l), f64::from(u))),
        );
        self.blocks.insert(node, block);
        trace!("declared node {node}: {} column(s)", block.len);
        Ok(())
    }

    fn create_linear_solver_constraint(
        &mut self,
        constraint: &LinearConstraint,
        sample: usize,
    ) -> Result<()> {
        let mut terms = Vec::new();
        for (node, components, coeffs) in constraint.sample_terms(sample) {
            let block = self.block(node)?;
            for (&c, &w) in components.iter().zip(coeffs.iter()) {
                terms.push((block.column(node, c)?, f64::from(w)));
            }
        }
        self.rows.push(Row {
            terms,
            sense: constraint.sense(),
            rhs: -f64::from(constraint.bias(sample)),
        });
        Ok(())
    }

    fn create_activation_solver_constraint(
        &mut self,
        constraint: &ActivationConstraint,
        element: usize,
        slope: f64,
        bias: f64,
    ) -> Result<()> {
        let out = self
            .block(constraint.outvar)?
            .column(constraint.outvar, element)?;
        let input = self
            .block(constraint.invar)?
            .column(constraint.invar, element)?;
        self.rows.push(Row {
            terms: vec![(out, 1.0), (input, -slope)],
            sense: constraint.sense,
            rhs: bias,
        });
        Ok(())
    }

    fn minimize_objective(
        &mut self,
        var: NodeId,
        objective: &[f64],
        objective_bias: f64,
        time_limit: Option<Duration>,
    ) -> Result<Solution> {
        let block = self.block(var)?;
        if objective.len() != block.len {
            return Err(GammaError::shape_mismatch(vec![block.len], vec![objective.len()]));
        }
        if let Some(limit) = time_limit {
            return Err(GammaError::Solver(format!(
                "minilp cannot enforce a time limit (requested {limit:?}); \
                 leave the limit unset with this backend"
            )));
        }

        let mut vars = variables!();
        let columns: Vec<Variable> = self
            .columns
            .iter()
            .map(|&(lo, hi)| vars.add(variable().min(lo).max(hi)))
            .collect();
        let targets = &columns[block.offset..block.offset + block.len];
        let expression: Expression = targets
            .iter()
            .zip(objective)
            .map(|(v, &c)| c * *v)
            .sum();

        let mut model = vars.minimise(&expression).using(minilp);
        for row in &self.rows {
            let lhs: Expression = row.terms.iter().map(|&(col, c)| c * columns[col]).sum();
            let rhs = row.rhs;
            model = match row.sense {
                Sense::Equal => model.with(constraint!(lhs == rhs)),
                Sense::GreaterEqual => model.with(constraint!(lhs >= rhs)),
                Sense::LessEqual => model.with(constraint!(lhs <= rhs)),
            };
        }

        match model.solve() {
            Ok(solution) => {
                let value = targets
                    .iter()
                    .zip(objective)
                    .map(|(v, &c)| c * solution.value(*v))
                    .sum::<f64>();
                Ok(Solution::optimal(value + objective_bias))
            }
            Err(ResolutionError::Infeasible) => Ok(Solution {
                value: f64::NAN,
                status: SolveStatus::Infeasible,
            }),
            Err(ResolutionError::Unbounded) => Ok(Solution {
                value: f64::NEG_INFINITY,
                status: SolveStatus::Unbounded,
            }),
            Err(e) => {
                warn!("LP solve for node {var} failed: {e}");
                Ok(Solution {
                    value: f64::NAN,
                    status: SolveStatus::Error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{Bias, LinearTerm};
    use gamma_tensor::BoundedTensor;
    use ndarray::arr2;

    const TOL: f64 = 1e-5;

    fn var(id: NodeId, lower: [[f32; 2]; 1], upper: [[f32; 2]; 1]) -> RelaxVariable {
        RelaxVariable::new(
            id,
            BoundedTensor::new(arr2(&lower).into_dyn(), arr2(&upper).into_dyn()).unwrap(),
        )
    }

    #[test]
    fn test_bounds_only() {
        let mut lp = LpSolver::new();
        lp.create_solver_variable(&var(0, [[-1.0, 2.0]], [[1.0, 5.0]]), 0)
            .unwrap();
        assert_eq!(lp.num_columns(), 2);

        let min = lp.minimize_objective(0, &[1.0, 1.0], 0.5, None).unwrap();
        assert!(min.is_optimal());
        assert!((min.value - 1.5).abs() < TOL);

        let max = lp.minimize_objective(0, &[-1.0, -1.0], 0.0, None).unwrap();
        assert!((max.value + 6.0).abs() < TOL);
    }

    #[test]
    fn test_linear_row_sign_convention() {
        // x0 + x1 - 1 == 0 over the first sample of a shared-coefficient row.
        let mut lp = LpSolver::new();
        lp.create_solver_variable(&var(0, [[0.0, 0.0]], [[1.0, 1.0]]), 0)
            .unwrap();
        let c = LinearConstraint::new(
            vec![LinearTerm::shared(0, vec![0, 1], vec![1.0, 1.0])],
            Bias::Shared(-1.0),
            Sense::Equal,
        );
        lp.create_linear_solver_constraint(&c, 0).unwrap();
        assert_eq!(lp.num_rows(), 1);

        // max x0 - x1 subject to x0 + x1 == 1 -> x0 = 1, x1 = 0
        let sol = lp.minimize_objective(0, &[-1.0, 1.0], 0.0, None).unwrap();
        assert!((sol.value + 1.0).abs() < TOL);
    }

    #[test]
    fn test_activation_row() {
        // y <= 0.25 x + 0.25 with x in [-1, 1] caps y at 0.5
        let mut lp = LpSolver::new();
        let x = var(0, [[-1.0, -1.0]], [[1.0, 1.0]]);
        let y = var(1, [[0.0, 0.0]], [[1.0, 1.0]]);
        lp.create_solver_variable(&x, 0).unwrap();
        lp.create_solver_variable(&y, 0).unwrap();
        let c = ActivationConstraint::new(
            1,
            0,
            arr2(&[[0.25_f32, 0.25]]).into_dyn(),
            arr2(&[[0.25_f32, 0.25]]).into_dyn(),
            Sense::LessEqual,
        );
        c.encode_into_solver(&mut lp, 0).unwrap();
        assert_eq!(lp.num_rows(), 2);

        let sol = lp.minimize_objective(1, &[-1.0, 0.0], 0.0, None).unwrap();
        assert!((sol.value + 0.5).abs() < TOL);
    }

    #[test]
    fn test_time_limit_rejected() {
        let mut lp = LpSolver::new();
        lp.create_solver_variable(&var(0, [[0.0, 0.0]], [[1.0, 1.0]]), 0)
            .unwrap();
        let err = lp
            .minimize_objective(0, &[1.0, 0.0], 0.0, Some(Duration::from_nanos(1)))
            .unwrap_err();
        assert!(matches!(err, GammaError::Solver(ref msg) if msg.contains("time limit")));
        assert!(lp.minimize_objective(0, &[1.0, 0.0], 0.0, None).unwrap().is_optimal());
    }

    #[test]
    fn test_infeasible_reported() {
        let mut lp = LpSolver::new();
        lp.create_solver_variable(&var(0, [[0.0, 0.0]], [[1.0, 1.0]]), 0)
            .unwrap();
        let c = LinearConstraint::new(
            vec![LinearTerm::shared(0, vec![0], vec![1.0])],
            Bias::Shared(-5.0),
            Sense::GreaterEqual,
        );
        lp.create_linear_solver_constraint(&c, 0).unwrap();
        let sol = lp.minimize_objective(0, &[1.0, 0.0], 0.0, None).unwrap();
        assert_eq!(sol.status, SolveStatus::Infeasible);
        assert!(!sol.is_optimal());
    }

    #[test]
    fn test_declaration_errors() {
        let mut lp = LpSolver::new();
        let x = var(0, [[0.0, 0.0]], [[1.0, 1.0]]);
        lp.create_solver_variable(&x, 0).unwrap();
        assert!(matches!(
            lp.create_solver_variable(&x, 0),
            Err(GammaError::Solver(_))
        ));
        assert!(matches!(
            lp.minimize_objective(7, &[1.0], 0.0, None),
            Err(GammaError::Solver(_))
        ));
        assert!(matches!(
            lp.minimize_objective(0, &[1.0], 0.0, None),
            Err(GammaError::ShapeMismatch { .. })
        ));

        let c = LinearConstraint::new(
            vec![LinearTerm::shared(0, vec![2], vec![1.0])],
            Bias::Shared(0.0),
            Sense::Equal,
        );
        assert!(matches!(
            lp.create_linear_solver_constraint(&c, 0),
            Err(GammaError::Solver(_))
        ));

        let mut other = LpSolver::new();
        assert!(other.create_solver_variable(&x, 1).is_err());
        assert!(!other.is_declared(0));
    }
}
