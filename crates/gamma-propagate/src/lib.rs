//! Computation graphs and bound propagation over them.
//!
//! - [`graph`]: arena-backed feed-forward graph and its builder
//! - [`primitive`]: primitive ops, shape inference and exact affine rows
//! - [`transform`]: the generic [`propagate`] driver and the
//!   [`GraphTransform`] callbacks it invokes per node
//! - [`ibp`]: Interval Bound Propagation, the fastest and loosest transform

pub mod graph;
pub mod ibp;
pub mod primitive;
pub mod transform;

pub use graph::{Graph, GraphBuilder, Node, NodeId, NodeKind};
pub use ibp::IntervalBoundTransform;
pub use primitive::{
    broadcast_shapes, ravel, unravel, AffineRow, Category, Operand, Primitive, SparseCoeffs,
};
pub use transform::{propagate, Arg, Environment, GraphTransform, Value};

// Re-export gamma_tensor and gamma_core types for downstream use
pub use gamma_core::{Bound, GammaError, Result};
pub use gamma_tensor::BoundedTensor;
