//! Per-primitive relaxation rules.
//!
//! Each rule takes a node's concrete output bound and its arguments
//! (relaxation variables or constants) and returns the node's
//! [`RelaxVariable`], constraints included. Dispatch is over
//! [`Category`]:
//!
//! - passthrough: `out == in` element for element
//! - affine: one exact equality per output component
//! - max activation: triangle relaxation of `max(x, 0)`
//!
//! Everything else is rejected with `UnsupportedOp`; nothing is
//! approximated silently.

use crate::constraint::{ActivationConstraint, Bias, Constraint, LinearConstraint, LinearTerm, Sense};
use crate::variable::RelaxVariable;
use gamma_core::{GammaError, Result};
use gamma_propagate::{Arg, Category, NodeId, Operand, Primitive};
use gamma_tensor::BoundedTensor;
use ndarray::{ArrayD, Zip};
use tracing::trace;

/// Floor on `upper - lower` in the ReLU chord.
pub const RELU_DENOMINATOR_FLOOR: f32 = 1e-12;

/// Relaxation variable of a network input: its bound, no constraints.
pub fn relax_input(id: NodeId, bound: BoundedTensor) -> RelaxVariable {
    RelaxVariable::new(id, bound)
}

/// Relaxation variable of primitive node `id` with concrete bound `out_bound`.
pub fn relax_primitive(
    id: NodeId,
    out_bound: BoundedTensor,
    primitive: &Primitive,
    args: &[Arg<'_, RelaxVariable>],
) -> Result<RelaxVariable> {
    let constraints = match primitive.category() {
        Category::Passthrough => relax_passthrough(id, &out_bound, args)?,
        Category::Affine => relax_affine(id, &out_bound, primitive, args)?,
        Category::MaxActivation => relax_relu(id, &out_bound, args)?,
        Category::Unsupported => {
            return Err(GammaError::UnsupportedOp(format!(
                "{} has no relaxation",
                primitive.name()
            )))
        }
    };
    trace!(
        "relaxed node {id} ({}): {} constraint(s)",
        primitive.name(),
        constraints.len()
    );
    Ok(RelaxVariable::with_constraints(id, out_bound, constraints))
}

fn relax_passthrough(
    id: NodeId,
    out_bound: &BoundedTensor,
    args: &[Arg<'_, RelaxVariable>],
) -> Result<Vec<Constraint>> {
    let invar = match args {
        [Arg::Var(v)] => *v,
        _ => {
            return Err(GammaError::InvalidGraph(
                "passthrough expects a single variable operand".to_string(),
            ))
        }
    };
    if invar.batch_size() != out_bound.batch_size() || invar.sample_len() != out_bound.sample_len()
    {
        return Err(GammaError::shape_mismatch(
            out_bound.shape().to_vec(),
            invar.shape().to_vec(),
        ));
    }
    let shape = invar.lower().raw_dim();
    Ok(vec![ActivationConstraint::new(
        id,
        invar.id(),
        ArrayD::ones(shape.clone()),
        ArrayD::zeros(shape),
        Sense::Equal,
    )
    .into()])
}

fn relax_affine(
    id: NodeId,
    out_bound: &BoundedTensor,
    primitive: &Primitive,
    args: &[Arg<'_, RelaxVariable>],
) -> Result<Vec<Constraint>> {
    let operands: Vec<Operand<'_>> = args
        .iter()
        .map(|a| match a {
            Arg::Var(v) => Operand::Var {
                shape: v.bound().sample_shape(),
            },
            Arg::Const(c) => Operand::Const(c),
        })
        .collect();
    let out_shape = primitive.output_shape(&operands)?;
    if out_shape != out_bound.sample_shape() {
        let mut expected = vec![out_bound.batch_size()];
        expected.extend_from_slice(&out_shape);
        return Err(GammaError::shape_mismatch(expected, out_bound.shape().to_vec()));
    }

    let out_len = out_bound.sample_len();
    let mut constraints = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let row = primitive.affine_row(i, &operands)?;
        let mut terms: Vec<LinearTerm> = args
            .iter()
            .zip(row.coeffs)
            .filter_map(|(arg, coeffs)| {
                let var = arg.as_var()?;
                let coeffs = coeffs.filter(|c| !c.is_empty())?;
                Some(LinearTerm::shared(var.id(), coeffs.components, coeffs.values))
            })
            .collect();
        terms.push(LinearTerm::shared(id, vec![i], vec![-1.0]));
        constraints.push(LinearConstraint::new(terms, Bias::Shared(row.bias), Sense::Equal).into());
    }
    Ok(constraints)
}

fn relax_relu(
    id: NodeId,
    out_bound: &BoundedTensor,
    args: &[Arg<'_, RelaxVariable>],
) -> Result<Vec<Constraint>> {
    let (invar, other) = match args {
        [Arg::Var(v), Arg::Const(c)] | [Arg::Const(c), Arg::Var(v)] => (*v, *c),
        [_, _] => {
            return Err(GammaError::UnsupportedOp(
                "max needs exactly one variable operand".to_string(),
            ))
        }
        _ => {
            return Err(GammaError::UnsupportedOp(format!(
                "activation with {} operands",
                args.len()
            )))
        }
    };
    if other.iter().any(|&v| v != 0.0) {
        return Err(GammaError::UnsupportedOp(
            "Unsupported activation function: max with a non-zero constant".to_string(),
        ));
    }
    if invar.shape() != out_bound.shape() {
        return Err(GammaError::shape_mismatch(
            invar.shape().to_vec(),
            out_bound.shape().to_vec(),
        ));
    }

    let (slope, bias) = relu_chord_arrays(invar.lower(), invar.upper());
    let shape = invar.lower().raw_dim();
    let zeros = ArrayD::<f32>::zeros(shape.clone());
    Ok(vec![
        // out >= 0
        ActivationConstraint::new(
            id,
            invar.id(),
            zeros.clone(),
            zeros.clone(),
            Sense::GreaterEqual,
        )
        .into(),
        // out >= in
        ActivationConstraint::new(
            id,
            invar.id(),
            ArrayD::ones(shape),
            zeros,
            Sense::GreaterEqual,
        )
        .into(),
        ActivationConstraint::new(id, invar.id(), slope, bias, Sense::LessEqual).into(),
    ])
}

/// Slope and bias of the upper envelope of `max(x, 0)` over `[lower, upper]`.
///
/// | regime    | condition            | slope         | bias             |
/// |-----------|----------------------|---------------|------------------|
/// | inactive  | `upper <= 0`         | 0             | 0                |
/// | active    | `lower >= 0`         | 1             | 0                |
/// | ambiguous | `lower < 0 < upper`  | `u / (u - l)` | `-l * u / (u - l)` |
///
/// `lower == upper == 0` is inactive.
pub fn relu_chord(lower: f32, upper: f32) -> (f32, f32) {
    if upper <= 0.0 {
        (0.0, 0.0)
    } else if lower >= 0.0 {
        (1.0, 0.0)
    } else {
        let d = (upper - lower).max(RELU_DENOMINATOR_FLOOR);
        (upper / d, -lower * upper / d)
    }
}

/// Elementwise [`relu_chord`].
pub fn relu_chord_arrays(lower: &ArrayD<f32>, upper: &ArrayD<f32>) -> (ArrayD<f32>, ArrayD<f32>) {
    let mut slope = ArrayD::<f32>::zeros(lower.raw_dim());
    let mut bias = ArrayD::<f32>::zeros(lower.raw_dim());
    Zip::from(&mut slope)
        .and(&mut bias)
        .and(lower)
        .and(upper)
        .for_each(|s, b, &l, &u| (*s, *b) = relu_chord(l, u));
    (slope, bias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, IxDyn};

    fn var(id: NodeId, lower: &[f32], upper: &[f32]) -> RelaxVariable {
        let n = lower.len();
        RelaxVariable::new(
            id,
            BoundedTensor::new(
                ArrayD::from_shape_vec(IxDyn(&[1, n]), lower.to_vec()).unwrap(),
                ArrayD::from_shape_vec(IxDyn(&[1, n]), upper.to_vec()).unwrap(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_relu_chord_regimes() {
        assert_eq!(relu_chord(-3.0, -1.0), (0.0, 0.0));
        assert_eq!(relu_chord(2.0, 3.0), (1.0, 0.0));
        assert_eq!(relu_chord(-1.0, 1.0), (0.5, 0.5));
        assert_eq!(relu_chord(0.0, 0.0), (0.0, 0.0));
        assert_eq!(relu_chord(0.0, 2.0), (1.0, 0.0));
        assert_eq!(relu_chord(-2.0, 0.0), (0.0, 0.0));
    }

    #[test]
    fn test_relu_chord_arrays_match_scalar() {
        let lower = arr2(&[[-1.0_f32, 2.0, -3.0]]).into_dyn();
        let upper = arr2(&[[1.0_f32, 3.0, -1.0]]).into_dyn();
        let (s, b) = relu_chord_arrays(&lower, &upper);
        assert_eq!(s, arr2(&[[0.5_f32, 1.0, 0.0]]).into_dyn());
        assert_eq!(b, arr2(&[[0.5_f32, 0.0, 0.0]]).into_dyn());
    }

    #[test]
    fn test_relu_rejects_nonzero_constant() {
        let x = var(0, &[-1.0], &[1.0]);
        let one = arr1(&[1.0_f32]).into_dyn();
        let out = x.bound().clone();
        let err = relax_primitive(1, out, &Primitive::Max, &[Arg::Var(&x), Arg::Const(&one)])
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_relu_rejects_two_variables() {
        let x = var(0, &[-1.0], &[1.0]);
        let y = var(1, &[-1.0], &[1.0]);
        let err = relax_primitive(2, x.bound().clone(), &Primitive::Max, &[Arg::Var(&x), Arg::Var(&y)])
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_activation_arity_rejected() {
        let x = var(0, &[-1.0], &[1.0]);
        let err = relax_primitive(1, x.bound().clone(), &Primitive::Max, &[Arg::Var(&x)]).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_relu_zero_constant_either_side() {
        let x = var(0, &[-1.0], &[1.0]);
        let zero = ArrayD::<f32>::zeros(IxDyn(&[]));
        let out = BoundedTensor::new(
            arr2(&[[0.0_f32]]).into_dyn(),
            arr2(&[[1.0_f32]]).into_dyn(),
        )
        .unwrap();
        let a = relax_primitive(1, out.clone(), &Primitive::Max, &[Arg::Const(&zero), Arg::Var(&x)])
            .unwrap();
        let b = relax_primitive(1, out, &Primitive::Max, &[Arg::Var(&x), Arg::Const(&zero)]).unwrap();
        assert_eq!(a.constraints(), b.constraints());
        assert_eq!(a.constraints().len(), 3);
    }

    #[test]
    fn test_unsupported_category() {
        let x = var(0, &[-1.0], &[1.0]);
        let err = relax_primitive(1, x.bound().clone(), &Primitive::Tanh, &[Arg::Var(&x)]).unwrap_err();
        assert!(matches!(err, GammaError::UnsupportedOp(_)));
    }

    #[test]
    fn test_affine_out_shape_checked() {
        let x = var(0, &[0.0, 0.0], &[1.0, 1.0]);
        let y = var(1, &[0.0, 0.0], &[1.0, 1.0]);
        let wrong = var(9, &[0.0], &[2.0]).bound().clone();
        let err = relax_primitive(2, wrong, &Primitive::Add, &[Arg::Var(&x), Arg::Var(&y)])
            .unwrap_err();
        assert!(matches!(err, GammaError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_passthrough_identity() {
        let x = var(0, &[-1.0, 0.0, 1.0, 2.0], &[1.0, 1.0, 2.0, 3.0]);
        let out = x.bound().reshape(&[1, 2, 2]).unwrap();
        let r = relax_primitive(
            1,
            out,
            &Primitive::Reshape { shape: vec![2, 2] },
            &[Arg::Var(&x)],
        )
        .unwrap();
        let c = r.constraints()[0].as_activation().unwrap();
        assert_eq!(c.sense, Sense::Equal);
        assert_eq!((c.outvar, c.invar), (1, 0));
        assert!(c.sample_coefficients(0).all(|(s, b)| s == 1.0 && b == 0.0));
        assert_eq!(c.sample_coefficients(0).count(), 4);
    }
}
