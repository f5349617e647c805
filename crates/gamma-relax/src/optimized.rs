//! Relaxation with incremental LP encoding and bound tightening.
//!
//! [`OptimizedRelaxationTransform`] keeps one solver per batch sample alive
//! for the whole traversal. Every node is encoded into every solver as soon
//! as it is relaxed. Before a max activation is relaxed, the bounds of its
//! variable operands are tightened by minimizing and maximizing each
//! element over the LP built so far, so the ReLU envelope is computed from
//! the tighter interval.

use crate::config::RelaxationConfig;
use crate::solver::{encode_variable, RelaxationSolver, Solution};
use crate::variable::RelaxVariable;
use gamma_core::{Bound, GammaError, Result};
use gamma_propagate::{Arg, Category, GraphTransform, NodeId, Primitive};
use gamma_tensor::BoundedTensor;
use ndarray::{Array2, ArrayD};
use rayon::prelude::*;
use std::time::Duration;
use tracing::{debug, trace};

/// Wraps a relaxation transform with per-sample solvers built by `F`.
pub struct OptimizedRelaxationTransform<T, S, F> {
    inner: T,
    solver_ctor: F,
    solvers: Vec<S>,
    config: RelaxationConfig,
}

impl<T, S, F> OptimizedRelaxationTransform<T, S, F>
where
    T: GraphTransform<Value = RelaxVariable>,
    S: RelaxationSolver + Send,
    F: Fn() -> S,
{
    pub fn new(inner: T, solver_ctor: F) -> Self {
        Self::with_config(inner, solver_ctor, RelaxationConfig::default())
    }

    pub fn with_config(inner: T, solver_ctor: F, config: RelaxationConfig) -> Self {
        Self {
            inner,
            solver_ctor,
            solvers: Vec::new(),
            config,
        }
    }

    /// Live solvers, one per batch sample.
    pub fn solvers(&self) -> &[S] {
        &self.solvers
    }

    pub fn into_solvers(self) -> Vec<S> {
        self.solvers
    }

    pub fn config(&self) -> &RelaxationConfig {
        &self.config
    }

    /// Copy of `variable` whose bound is tightened by LP in every sample.
    ///
    /// `variable` must already be encoded in the solvers. The result keeps
    /// the id and constraints of `variable` and is never wider than it.
    pub fn tightened_variable_bounds(&mut self, variable: &RelaxVariable) -> Result<RelaxVariable> {
        let batch = variable.batch_size();
        if batch != self.solvers.len() {
            return Err(GammaError::Solver(format!(
                "node {} has a batch of {batch} but there are {} solver(s)",
                variable.id(),
                self.solvers.len()
            )));
        }
        let node = variable.id();
        let n = variable.sample_len();
        let time_limit = self.config.tighten_time_limit();

        let per_sample: Vec<(Vec<f32>, Vec<f32>)> = if self.config.parallel_for(batch) {
            self.solvers
                .par_iter_mut()
                .enumerate()
                .map(|(sample, solver)| tighten_sample(solver, node, sample, n, time_limit))
                .collect::<Result<_>>()?
        } else {
            self.solvers
                .iter_mut()
                .enumerate()
                .map(|(sample, solver)| tighten_sample(solver, node, sample, n, time_limit))
                .collect::<Result<_>>()?
        };

        let (old_lower, old_upper) = variable.bound().sample_rows()?;
        let mut lower = Array2::<f32>::zeros((batch, n));
        let mut upper = Array2::<f32>::zeros((batch, n));
        for (sample, (lo, hi)) in per_sample.iter().enumerate() {
            for component in 0..n {
                let old = Bound::new(old_lower[[sample, component]], old_upper[[sample, component]]);
                let refined = old.refine(lo[component], hi[component]);
                lower[[sample, component]] = refined.lower;
                upper[[sample, component]] = refined.upper;
            }
        }
        let bound = BoundedTensor::new(lower.into_dyn(), upper.into_dyn())?.reshape(variable.shape())?;
        debug!(
            "Tightened node {node}: mean width {:.6} -> {:.6}",
            variable.bound().mean_width(),
            bound.mean_width()
        );
        variable.with_bound(bound)
    }

    fn encode_all(&mut self, variable: &RelaxVariable) -> Result<()> {
        if self.config.parallel_for(self.solvers.len()) {
            self.solvers
                .par_iter_mut()
                .enumerate()
                .try_for_each(|(sample, solver)| encode_variable(solver, variable, sample))
        } else {
            self.solvers
                .iter_mut()
                .enumerate()
                .try_for_each(|(sample, solver)| encode_variable(solver, variable, sample))
        }
    }
}

/// Per-component minimum and maximum of `node` in one solver.
fn tighten_sample<S: RelaxationSolver>(
    solver: &mut S,
    node: NodeId,
    sample: usize,
    n: usize,
    time_limit: Option<Duration>,
) -> Result<(Vec<f32>, Vec<f32>)> {
    let mut objective = vec![0.0; n];
    let mut lower = Vec::with_capacity(n);
    let mut upper = Vec::with_capacity(n);
    for component in 0..n {
        let check = |solution: Solution| {
            if solution.is_optimal() {
                Ok(solution.value)
            } else {
                Err(GammaError::NonOptimalSolve {
                    node,
                    sample,
                    component,
                    status: solution.status,
                })
            }
        };
        objective[component] = 1.0;
        let min = check(solver.minimize_objective(node, &objective, 0.0, time_limit)?)?;
        objective[component] = -1.0;
        let neg_max = check(solver.minimize_objective(node, &objective, 0.0, time_limit)?)?;
        objective[component] = 0.0;
        lower.push(f32_at_most(min));
        upper.push(f32_at_least(-neg_max));
    }
    trace!("sample {sample}: tightened {n} element(s) of node {node}");
    Ok((lower, upper))
}

/// Largest `f32` not above `v`.
fn f32_at_most(v: f64) -> f32 {
    let f = v as f32;
    if f64::from(f) > v {
        next_toward_neg_infinity(f)
    } else {
        f
    }
}

/// Smallest `f32` not below `v`.
fn f32_at_least(v: f64) -> f32 {
    -f32_at_most(-v)
}

fn next_toward_neg_infinity(f: f32) -> f32 {
    if f.is_nan() || f == f32::NEG_INFINITY {
        f
    } else if f == 0.0 {
        -f32::from_bits(1)
    } else if f > 0.0 {
        f32::from_bits(f.to_bits() - 1)
    } else {
        f32::from_bits(f.to_bits() + 1)
    }
}

impl<T, S, F> GraphTransform for OptimizedRelaxationTransform<T, S, F>
where
    T: GraphTransform<Value = RelaxVariable>,
    S: RelaxationSolver + Send,
    F: Fn() -> S,
{
    type Value = RelaxVariable;

    fn input_transform(
        &mut self,
        id: NodeId,
        lower: &ArrayD<f32>,
        upper: &ArrayD<f32>,
    ) -> Result<RelaxVariable> {
        let variable = self.inner.input_transform(id, lower, upper)?;
        let batch = variable.batch_size();
        if self.solvers.is_empty() {
            self.solvers = (0..batch).map(|_| (self.solver_ctor)()).collect();
            debug!("Created {batch} solver(s)");
        } else if self.solvers.len() != batch {
            return Err(GammaError::shape_mismatch(
                vec![self.solvers.len()],
                vec![batch],
            ));
        }
        self.encode_all(&variable)?;
        Ok(variable)
    }

    fn primitive_transform(
        &mut self,
        id: NodeId,
        primitive: &Primitive,
        args: &[Arg<'_, RelaxVariable>],
    ) -> Result<RelaxVariable> {
        let tighten =
            self.config.tighten_activations && primitive.category() == Category::MaxActivation;
        let variable = if tighten {
            let mut tightened = Vec::with_capacity(args.len());
            for arg in args {
                tightened.push(match arg {
                    Arg::Var(v) => Some(self.tightened_variable_bounds(v)?),
                    Arg::Const(_) => None,
                });
            }
            let tightened_args: Vec<Arg<'_, RelaxVariable>> = args
                .iter()
                .zip(&tightened)
                .map(|(arg, t)| match t {
                    Some(v) => Arg::Var(v),
                    None => *arg,
                })
                .collect();
            self.inner.primitive_transform(id, primitive, &tightened_args)?
        } else {
            self.inner.primitive_transform(id, primitive, args)?
        };
        self.encode_all(&variable)?;
        Ok(variable)
    }
}
