//! Interval Bound Propagation (IBP) over a computation graph.
//!
//! Fastest and loosest of the bound propagation methods: every node gets
//! elementwise `[lower, upper]` bounds computed from its arguments' bounds
//! alone. Affine primitives go through their exact coefficient rows, split
//! by sign, so the result is the tightest interval for that single op.

use crate::graph::NodeId;
use crate::primitive::{Operand, Primitive};
use crate::transform::{Arg, GraphTransform};
use gamma_core::{GammaError, Result};
use gamma_tensor::BoundedTensor;
use ndarray::{Array2, ArrayD, ArrayViewD, IxDyn, Zip};
use tracing::trace;

/// Graph transform producing interval bounds for every node.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalBoundTransform;

impl IntervalBoundTransform {
    pub fn new() -> Self {
        Self
    }
}

impl GraphTransform for IntervalBoundTransform {
    type Value = BoundedTensor;

    fn input_transform(
        &mut self,
        _id: NodeId,
        lower: &ArrayD<f32>,
        upper: &ArrayD<f32>,
    ) -> Result<BoundedTensor> {
        if lower.ndim() == 0 {
            return Err(GammaError::InvalidBounds(
                "input bounds need a leading batch axis".to_string(),
            ));
        }
        BoundedTensor::new(lower.clone(), upper.clone())
    }

    fn primitive_transform(
        &mut self,
        id: NodeId,
        primitive: &Primitive,
        args: &[Arg<'_, BoundedTensor>],
    ) -> Result<BoundedTensor> {
        let batch = batch_size(args)?;
        let operands: Vec<Operand<'_>> = args
            .iter()
            .map(|a| match a {
                Arg::Var(b) => Operand::Var {
                    shape: b.sample_shape(),
                },
                Arg::Const(c) => Operand::Const(c),
            })
            .collect();
        let out_shape = primitive.output_shape(&operands)?;
        let mut full_shape = vec![batch];
        full_shape.extend_from_slice(&out_shape);
        trace!("ibp node {id} {} -> {:?}", primitive.name(), full_shape);

        match primitive {
            Primitive::Reshape { .. } => {
                let input = var_arg(args, 0)?;
                input.reshape(&full_shape)
            }
            Primitive::BroadcastInDim { .. }
            | Primitive::Add
            | Primitive::Sub
            | Primitive::Mul
            | Primitive::DotGeneral
            | Primitive::Conv2d { .. } => affine_bounds(primitive, args, &operands, &full_shape),
            Primitive::Max => max_bounds(args, &full_shape),
            Primitive::Tanh => Ok(var_arg(args, 0)?.map_monotone(f32::tanh)),
            Primitive::Sigmoid => {
                Ok(var_arg(args, 0)?.map_monotone(|v| 1.0 / (1.0 + (-v).exp())))
            }
        }
    }
}

fn var_arg<'a>(args: &[Arg<'a, BoundedTensor>], i: usize) -> Result<&'a BoundedTensor> {
    args.get(i)
        .and_then(Arg::as_var)
        .ok_or_else(|| GammaError::InvalidGraph(format!("operand {i} must be a variable")))
}

/// Common batch size of the variable arguments.
fn batch_size(args: &[Arg<'_, BoundedTensor>]) -> Result<usize> {
    let mut batch = None;
    for b in args.iter().filter_map(Arg::as_var) {
        match batch {
            None => batch = Some(b.batch_size()),
            Some(n) if n != b.batch_size() => {
                return Err(GammaError::shape_mismatch(vec![n], vec![b.batch_size()]))
            }
            Some(_) => {}
        }
    }
    batch.ok_or_else(|| GammaError::InvalidGraph("primitive without variable operands".to_string()))
}

/// Sign-split interval evaluation of each coefficient row, per sample.
fn affine_bounds(
    primitive: &Primitive,
    args: &[Arg<'_, BoundedTensor>],
    operands: &[Operand<'_>],
    full_shape: &[usize],
) -> Result<BoundedTensor> {
    let batch = full_shape[0];
    let out_len: usize = full_shape[1..].iter().product();
    let rows: Vec<Option<(Array2<f32>, Array2<f32>)>> = args
        .iter()
        .map(|a| a.as_var().map(BoundedTensor::sample_rows).transpose())
        .collect::<Result<_>>()?;

    let mut lower = Array2::<f32>::zeros((batch, out_len));
    let mut upper = Array2::<f32>::zeros((batch, out_len));
    for i in 0..out_len {
        let row = primitive.affine_row(i, operands)?;
        for b in 0..batch {
            let (mut lo, mut hi) = (row.bias, row.bias);
            for (coeffs, bounds) in row.coeffs.iter().zip(&rows) {
                let (Some(coeffs), Some((l, u))) = (coeffs, bounds) else {
                    continue;
                };
                for (&c, &w) in coeffs.components.iter().zip(&coeffs.values) {
                    let (xl, xu) = (l[[b, c]], u[[b, c]]);
                    if w >= 0.0 {
                        lo += w * xl;
                        hi += w * xu;
                    } else {
                        lo += w * xu;
                        hi += w * xl;
                    }
                }
            }
            lower[[b, i]] = lo;
            upper[[b, i]] = hi;
        }
    }
    BoundedTensor::new(lower.into_dyn(), upper.into_dyn())?.reshape(full_shape)
}

/// Elementwise max of bounds; sound for any `max(a, b)`.
fn max_bounds(args: &[Arg<'_, BoundedTensor>], full_shape: &[usize]) -> Result<BoundedTensor> {
    let views = args
        .iter()
        .map(|a| match a {
            Arg::Var(b) => (b.lower.view(), b.upper.view()),
            Arg::Const(c) => (c.view(), c.view()),
        })
        .collect::<Vec<_>>();
    let (a, b) = match views.as_slice() {
        [a, b] => (a, b),
        _ => {
            return Err(GammaError::UnsupportedOp(format!(
                "max with {} operands",
                views.len()
            )))
        }
    };
    let (al, au, bl, bu) = (
        broadcast_to(&a.0, full_shape)?,
        broadcast_to(&a.1, full_shape)?,
        broadcast_to(&b.0, full_shape)?,
        broadcast_to(&b.1, full_shape)?,
    );
    let lower = Zip::from(&al).and(&bl).map_collect(|&x, &y| x.max(y));
    let upper = Zip::from(&au).and(&bu).map_collect(|&x, &y| x.max(y));
    BoundedTensor::new(lower, upper)
}

fn broadcast_to<'a>(
    v: &'a ArrayViewD<'_, f32>,
    shape: &[usize],
) -> Result<ArrayViewD<'a, f32>> {
    v.broadcast(IxDyn(shape))
        .ok_or_else(|| GammaError::shape_mismatch(shape.to_vec(), v.shape().to_vec()))
}
