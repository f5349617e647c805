//! Symbolic constraints of the relaxation.
//!
//! Two kinds of relation are produced by the relaxation rules:
//!
//! - [`LinearConstraint`]: `Σ_k coeff_k · var_k[components_k] + bias (sense) 0`,
//!   a single scalar relation per sample over any number of variables.
//! - [`ActivationConstraint`]: `out (sense) scale · in + bias`, applied
//!   independently to every element of two same-shaped variables.
//!
//! Both are batch-aware. A linear constraint's bias and each term's
//! coefficients are either shared by every sample or given per sample;
//! activation slopes and biases always carry the batch axis.

use crate::solver::RelaxationSolver;
use gamma_core::Result;
use gamma_propagate::NodeId;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Relation between the two sides of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sense {
    Equal,
    GreaterEqual,
    LessEqual,
}

impl Sense {
    /// Whether `lhs (sense) rhs` holds up to `tol`.
    pub fn holds(self, lhs: f64, rhs: f64, tol: f64) -> bool {
        match self {
            Sense::Equal => (lhs - rhs).abs() <= tol,
            Sense::GreaterEqual => lhs >= rhs - tol,
            Sense::LessEqual => lhs <= rhs + tol,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Sense::Equal => "==",
            Sense::GreaterEqual => ">=",
            Sense::LessEqual => "<=",
        }
    }
}

/// Coefficients of one term, shared across the batch or given per sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Coefficients {
    /// Same coefficients for every sample.
    Shared(Array1<f32>),
    /// `[batch, n]`: row `s` holds the coefficients of sample `s`.
    PerSample(Array2<f32>),
}

impl Coefficients {
    /// Coefficients for `sample`.
    ///
    /// # Panics
    ///
    /// Panics if per-sample coefficients do not have a row `sample`.
    pub fn for_sample(&self, sample: usize) -> ArrayView1<'_, f32> {
        match self {
            Coefficients::Shared(c) => c.view(),
            Coefficients::PerSample(c) => c.row(sample),
        }
    }

    /// Number of coefficients per sample.
    pub fn len(&self) -> usize {
        match self {
            Coefficients::Shared(c) => c.len(),
            Coefficients::PerSample(c) => c.ncols(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Constant part of a linear constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Bias {
    Shared(f32),
    /// One value per sample.
    PerSample(Array1<f32>),
}

impl Bias {
    /// # Panics
    ///
    /// Panics if a per-sample bias has no entry for `sample`.
    pub fn for_sample(&self, sample: usize) -> f32 {
        match self {
            Bias::Shared(b) => *b,
            Bias::PerSample(b) => b[sample],
        }
    }
}

/// `Σ_j coeffs[j] · var[components[j]]` over the flattened elements of one
/// sample of `var`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearTerm {
    pub var: NodeId,
    pub components: Vec<usize>,
    pub coeffs: Coefficients,
}

impl LinearTerm {
    pub fn new(var: NodeId, components: Vec<usize>, coeffs: Coefficients) -> Self {
        debug_assert_eq!(components.len(), coeffs.len());
        Self {
            var,
            components,
            coeffs,
        }
    }

    /// Term with the same coefficients for every sample.
    pub fn shared(var: NodeId, components: Vec<usize>, coeffs: Vec<f32>) -> Self {
        Self::new(var, components, Coefficients::Shared(Array1::from(coeffs)))
    }
}

/// `Σ terms + bias (sense) 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    terms: Vec<LinearTerm>,
    bias: Bias,
    sense: Sense,
}

impl LinearConstraint {
    pub fn new(terms: Vec<LinearTerm>, bias: Bias, sense: Sense) -> Self {
        Self { terms, bias, sense }
    }

    pub fn terms(&self) -> &[LinearTerm] {
        &self.terms
    }

    /// Bias for `sample`.
    pub fn bias(&self, sample: usize) -> f32 {
        self.bias.for_sample(sample)
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }

    /// Terms specialized to `sample`: `(var, components, coefficients)`.
    pub fn sample_terms(
        &self,
        sample: usize,
    ) -> impl Iterator<Item = (NodeId, &[usize], ArrayView1<'_, f32>)> {
        self.terms
            .iter()
            .map(move |t| (t.var, t.components.as_slice(), t.coeffs.for_sample(sample)))
    }

    /// Value of `Σ terms + bias` for `sample`, reading element `c` of
    /// variable `v` as `value_of(v, c)`.
    pub fn evaluate(&self, sample: usize, mut value_of: impl FnMut(NodeId, usize) -> f64) -> f64 {
        let mut total = f64::from(self.bias(sample));
        for (var, components, coeffs) in self.sample_terms(sample) {
            for (&c, &w) in components.iter().zip(coeffs.iter()) {
                total += f64::from(w) * value_of(var, c);
            }
        }
        total
    }

    pub fn is_satisfied(
        &self,
        sample: usize,
        value_of: impl FnMut(NodeId, usize) -> f64,
        tol: f64,
    ) -> bool {
        self.sense.holds(self.evaluate(sample, value_of), 0.0, tol)
    }

    /// Declare this constraint, specialized to `sample`, in `solver`.
    pub fn encode_into_solver<S: RelaxationSolver + ?Sized>(
        &self,
        solver: &mut S,
        sample: usize,
    ) -> Result<()> {
        solver.create_linear_solver_constraint(self, sample)
    }
}

/// Elementwise `outvar (sense) scale · invar + bias`.
///
/// `scale` and `bias` have the full batched shape of both variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationConstraint {
    pub outvar: NodeId,
    pub invar: NodeId,
    pub scale: ArrayD<f32>,
    pub bias: ArrayD<f32>,
    pub sense: Sense,
}

impl ActivationConstraint {
    pub fn new(
        outvar: NodeId,
        invar: NodeId,
        scale: ArrayD<f32>,
        bias: ArrayD<f32>,
        sense: Sense,
    ) -> Self {
        debug_assert_eq!(scale.shape(), bias.shape());
        Self {
            outvar,
            invar,
            scale,
            bias,
            sense,
        }
    }

    /// Slope and bias of every element of `sample`, in row-major order.
    ///
    /// # Panics
    ///
    /// Panics if `sample` is outside the batch.
    pub fn sample_coefficients(&self, sample: usize) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.scale
            .index_axis(Axis(0), sample)
            .into_iter()
            .zip(self.bias.index_axis(Axis(0), sample))
            .map(|(&s, &b)| (s, b))
    }

    /// `out - (slope · in + bias)` for one element of `sample`.
    pub fn residual(&self, sample: usize, element: usize, out: f64, input: f64) -> Option<f64> {
        let (slope, bias) = self.sample_coefficients(sample).nth(element)?;
        Some(out - (f64::from(slope) * input + f64::from(bias)))
    }

    /// Whether the relation holds for one element of `sample`.
    pub fn holds(&self, sample: usize, element: usize, out: f64, input: f64, tol: f64) -> bool {
        self.residual(sample, element, out, input)
            .is_some_and(|r| self.sense.holds(r, 0.0, tol))
    }

    /// Declare one scalar relation per element of `sample` in `solver`.
    pub fn encode_into_solver<S: RelaxationSolver + ?Sized>(
        &self,
        solver: &mut S,
        sample: usize,
    ) -> Result<()> {
        for (element, (slope, bias)) in self.sample_coefficients(sample).enumerate() {
            solver.create_activation_solver_constraint(
                self,
                element,
                f64::from(slope),
                f64::from(bias),
            )?;
        }
        Ok(())
    }
}

/// Any constraint attached to a relaxation variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Linear(LinearConstraint),
    Activation(ActivationConstraint),
}

impl Constraint {
    pub fn encode_into_solver<S: RelaxationSolver + ?Sized>(
        &self,
        solver: &mut S,
        sample: usize,
    ) -> Result<()> {
        match self {
            Constraint::Linear(c) => c.encode_into_solver(solver, sample),
            Constraint::Activation(c) => c.encode_into_solver(solver, sample),
        }
    }

    /// Ids of the variables this constraint mentions, in order of appearance.
    pub fn referenced_vars(&self) -> Vec<NodeId> {
        let mut vars = Vec::new();
        let mut push = |v: NodeId| {
            if !vars.contains(&v) {
                vars.push(v);
            }
        };
        match self {
            Constraint::Linear(c) => c.terms.iter().for_each(|t| push(t.var)),
            Constraint::Activation(c) => {
                push(c.outvar);
                push(c.invar);
            }
        }
        vars
    }

    pub fn as_linear(&self) -> Option<&LinearConstraint> {
        match self {
            Constraint::Linear(c) => Some(c),
            Constraint::Activation(_) => None,
        }
    }

    pub fn as_activation(&self) -> Option<&ActivationConstraint> {
        match self {
            Constraint::Activation(c) => Some(c),
            Constraint::Linear(_) => None,
        }
    }
}

impl From<LinearConstraint> for Constraint {
    fn from(c: LinearConstraint) -> Self {
        Constraint::Linear(c)
    }
}

impl From<ActivationConstraint> for Constraint {
    fn from(c: ActivationConstraint) -> Self {
        Constraint::Activation(c)
    }
}
