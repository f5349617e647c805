//! Relaxation variables: one per graph node.

use crate::constraint::Constraint;
use gamma_core::{Bound, GammaError, Result};
use gamma_propagate::NodeId;
use gamma_tensor::BoundedTensor;
use ndarray::ArrayD;
use std::sync::Arc;

/// A graph node in the relaxation: its concrete interval bound plus the
/// constraints that define it in terms of earlier nodes.
///
/// Variables are immutable once built. Tightening produces a new variable
/// with the same id and constraints (shared, not copied) and a refreshed
/// bound.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaxVariable {
    id: NodeId,
    bound: BoundedTensor,
    constraints: Arc<[Constraint]>,
}

impl RelaxVariable {
    /// Unconstrained variable (a network input).
    pub fn new(id: NodeId, bound: BoundedTensor) -> Self {
        Self::with_constraints(id, bound, Vec::new())
    }

    pub fn with_constraints(id: NodeId, bound: BoundedTensor, constraints: Vec<Constraint>) -> Self {
        debug_assert!(
            constraints
                .iter()
                .flat_map(Constraint::referenced_vars)
                .all(|v| v <= id),
            "constraints of node {id} reference a later node"
        );
        Self {
            id,
            bound,
            constraints: constraints.into(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Full shape, including the leading batch axis.
    pub fn shape(&self) -> &[usize] {
        self.bound.shape()
    }

    pub fn batch_size(&self) -> usize {
        self.bound.batch_size()
    }

    /// Number of elements in one sample.
    pub fn sample_len(&self) -> usize {
        self.bound.sample_len()
    }

    pub fn bound(&self) -> &BoundedTensor {
        &self.bound
    }

    pub fn lower(&self) -> &ArrayD<f32> {
        &self.bound.lower
    }

    pub fn upper(&self) -> &ArrayD<f32> {
        &self.bound.upper
    }

    /// Scalar bound of element `component` (row-major) of `sample`.
    pub fn element_bound(&self, sample: usize, component: usize) -> Option<Bound> {
        if sample >= self.batch_size() {
            return None;
        }
        let lower = self.bound.sample_lower(sample);
        let upper = self.bound.sample_upper(sample);
        Some(Bound::new(
            *lower.iter().nth(component)?,
            *upper.iter().nth(component)?,
        ))
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Same node and constraints with a new bound of identical shape.
    pub fn with_bound(&self, bound: BoundedTensor) -> Result<Self> {
        if bound.shape() != self.shape() {
            return Err(GammaError::shape_mismatch(
                self.shape().to_vec(),
                bound.shape().to_vec(),
            ));
        }
        Ok(Self {
            id: self.id,
            bound,
            constraints: Arc::clone(&self.constraints),
        })
    }
}
