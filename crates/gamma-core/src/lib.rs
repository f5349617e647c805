//! Core types and errors for γ-CROWN relaxation-based verification.
//!
//! This crate provides the scalar interval type shared by the tensor,
//! propagation and relaxation crates, the solver status vocabulary, and the
//! workspace-wide error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bound on a scalar value: [lower, upper].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub lower: f32,
    pub upper: f32,
}

impl Bound {
    /// Create a new bound.
    #[inline]
    pub fn new(lower: f32, upper: f32) -> Self {
        debug_assert!(lower <= upper, "Invalid bound: {lower} > {upper}");
        Self { lower, upper }
    }

    /// Refine this bound with a candidate `[lower, upper]` pair.
    ///
    /// The result always lies inside `self`, even when the candidate is
    /// partially outside it or slightly inverted by floating-point error.
    #[inline]
    pub fn refine(&self, lower: f32, upper: f32) -> Bound {
        let lo = if lower.is_nan() {
            self.lower
        } else {
            lower.clamp(self.lower, self.upper)
        };
        let hi = if upper.is_nan() {
            self.upper
        } else {
            upper.clamp(self.lower, self.upper)
        };
        Bound {
            lower: lo,
            upper: hi.max(lo),
        }
    }
}

/// Outcome of a single LP solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// Solver certified an optimal solution.
    Optimal,
    /// No feasible solution exists.
    Infeasible,
    /// Objective is unbounded below.
    Unbounded,
    /// Solver stopped at its time limit before proving optimality.
    TimeLimit,
    /// Solver encountered an internal error.
    Error,
}

impl SolveStatus {
    #[inline]
    pub fn is_optimal(self) -> bool {
        self == SolveStatus::Optimal
    }
}

/// Error types for γ-CROWN operations.
#[derive(Debug, Error)]
pub enum GammaError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),

    /// The graph uses an operation the relaxation cannot express.
    #[error("Unsupported operation: {0}")]
    UnsupportedOp(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Solver error: {0}")]
    Solver(String),

    /// A bound-tightening LP did not reach a certified optimum.
    #[error(
        "Tightening solve for node {node} (sample {sample}, component {component}) \
         finished with status {status:?}"
    )]
    NonOptimalSolve {
        node: usize,
        sample: usize,
        component: usize,
        status: SolveStatus,
    },

    #[error("Node {node} ({op}) failed: {source}")]
    NodeError {
        node: usize,
        op: String,
        #[source]
        source: Box<GammaError>,
    },
}

impl GammaError {
    /// Create a ShapeMismatch error, panicking if shapes are identical (bug indicator).
    #[track_caller]
    pub fn shape_mismatch(expected: Vec<usize>, got: Vec<usize>) -> Self {
        if expected == got {
            let loc = std::panic::Location::caller();
            panic!(
                "BUG at {}:{}:{}: ShapeMismatch created with identical shapes: {:?}",
                loc.file(),
                loc.line(),
                loc.column(),
                expected
            );
        }
        GammaError::ShapeMismatch { expected, got }
    }

    /// Innermost error, looking through `NodeError` context.
    pub fn root_cause(&self) -> &GammaError {
        match self {
            GammaError::NodeError { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether this error (or its root cause) is an unsupported operation.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.root_cause(), GammaError::UnsupportedOp(_))
    }
}

pub type Result<T> = std::result::Result<T, GammaError>;
