//! Batched interval tensors.
//!
//! A [`BoundedTensor`] holds elementwise `[lower, upper]` bounds for a tensor
//! whose leading axis is the minibatch (sample) axis. Every node of a
//! verified computation graph carries one.

use gamma_core::{Bound, GammaError, Result};
use ndarray::{Array2, ArrayD, ArrayViewD, Axis, IxDyn, Zip};

/// Elementwise interval bounds on a batched tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedTensor {
    pub lower: ArrayD<f32>,
    pub upper: ArrayD<f32>,
}

impl BoundedTensor {
    /// Create bounds, checking shapes agree and `lower <= upper` everywhere.
    pub fn new(lower: ArrayD<f32>, upper: ArrayD<f32>) -> Result<Self> {
        if lower.shape() != upper.shape() {
            return Err(GammaError::shape_mismatch(
                lower.shape().to_vec(),
                upper.shape().to_vec(),
            ));
        }
        let inverted = Zip::from(&lower)
            .and(&upper)
            .fold(0usize, |n, &l, &u| if l <= u { n } else { n + 1 });
        if inverted > 0 {
            return Err(GammaError::InvalidBounds(format!(
                "{inverted} element(s) have lower > upper (or NaN)"
            )));
        }
        Ok(Self { lower, upper })
    }

    /// Point bounds (lower == upper == values).
    pub fn concrete(values: ArrayD<f32>) -> Self {
        Self {
            lower: values.clone(),
            upper: values,
        }
    }

    /// Full shape, including the leading batch axis.
    pub fn shape(&self) -> &[usize] {
        self.lower.shape()
    }

    /// Number of samples (size of the leading axis).
    pub fn batch_size(&self) -> usize {
        self.shape().first().copied().unwrap_or(1)
    }

    /// Shape of a single sample (batch axis removed).
    pub fn sample_shape(&self) -> &[usize] {
        let shape = self.shape();
        if shape.is_empty() {
            shape
        } else {
            &shape[1..]
        }
    }

    /// Number of elements in a single sample.
    pub fn sample_len(&self) -> usize {
        self.sample_shape().iter().product()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// Mean elementwise width (0 for empty tensors).
    pub fn mean_width(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let total = Zip::from(&self.lower)
            .and(&self.upper)
            .fold(0.0f64, |acc, &l, &u| acc + f64::from(u - l));
        (total / self.len() as f64) as f32
    }

    /// Scalar bound of one element.
    pub fn get(&self, index: &[usize]) -> Option<Bound> {
        let l = self.lower.get(IxDyn(index))?;
        let u = self.upper.get(IxDyn(index))?;
        Some(Bound {
            lower: *l,
            upper: *u,
        })
    }

    /// Lower bounds of one sample.
    pub fn sample_lower(&self, sample: usize) -> ArrayViewD<'_, f32> {
        self.lower.index_axis(Axis(0), sample)
    }

    /// Upper bounds of one sample.
    pub fn sample_upper(&self, sample: usize) -> ArrayViewD<'_, f32> {
        self.upper.index_axis(Axis(0), sample)
    }

    /// Bounds as `[batch, sample_len]` matrices (row-major element order).
    pub fn sample_rows(&self) -> Result<(Array2<f32>, Array2<f32>)> {
        let rows = (self.batch_size(), self.sample_len());
        let reshape = |a: &ArrayD<f32>| {
            a.to_shape(rows)
                .map(|v| v.into_owned())
                .map_err(|_| GammaError::shape_mismatch(vec![rows.0, rows.1], a.shape().to_vec()))
        };
        Ok((reshape(&self.lower)?, reshape(&self.upper)?))
    }

    /// Reshape both bounds, keeping row-major element order.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let reshape = |a: &ArrayD<f32>| {
            a.to_shape(shape.to_vec())
                .map(|v| v.into_owned())
                .map_err(|_| GammaError::shape_mismatch(shape.to_vec(), a.shape().to_vec()))
        };
        Ok(Self {
            lower: reshape(&self.lower)?,
            upper: reshape(&self.upper)?,
        })
    }

    /// Apply a monotonically non-decreasing function to both bounds.
    pub fn map_monotone(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            lower: self.lower.mapv(&f),
            upper: self.upper.mapv(&f),
        }
    }

    /// Check whether these bounds lie inside `other` elementwise.
    pub fn is_subset_of(&self, other: &BoundedTensor) -> bool {
        self.shape() == other.shape()
            && Zip::from(&self.lower)
                .and(&self.upper)
                .and(&other.lower)
                .and(&other.upper)
                .all(|&l, &u, &ol, &ou| ol <= l && u <= ou)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_new_validates_shape() {
        let err = BoundedTensor::new(
            arr1(&[0.0_f32, 1.0]).into_dyn(),
            arr1(&[0.0_f32, 1.0, 2.0]).into_dyn(),
        )
        .unwrap_err();
        assert!(matches!(err, GammaError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_new_rejects_inverted() {
        let err = BoundedTensor::new(
            arr1(&[0.0_f32, 2.0]).into_dyn(),
            arr1(&[1.0_f32, 1.0]).into_dyn(),
        )
        .unwrap_err();
        assert!(matches!(err, GammaError::InvalidBounds(_)));

        let err = BoundedTensor::new(
            arr1(&[f32::NAN]).into_dyn(),
            arr1(&[1.0_f32]).into_dyn(),
        )
        .unwrap_err();
        assert!(matches!(err, GammaError::InvalidBounds(_)));
    }

    #[test]
    fn test_batch_and_sample_shape() {
        let b = BoundedTensor::concrete(ArrayD::zeros(IxDyn(&[4, 2, 3])));
        assert_eq!(b.batch_size(), 4);
        assert_eq!(b.sample_shape(), &[2, 3]);
        assert_eq!(b.sample_len(), 6);
        assert_eq!(b.len(), 24);
    }

    #[test]
    fn test_mean_width() {
        let b = BoundedTensor::new(
            arr2(&[[0.5_f32, -1.5]]).into_dyn(),
            arr2(&[[1.5_f32, 0.5]]).into_dyn(),
        )
        .unwrap();
        assert_eq!(b.mean_width(), 1.5);
        let empty = BoundedTensor::concrete(ArrayD::zeros(IxDyn(&[0, 2])));
        assert_eq!(empty.mean_width(), 0.0);
    }

    #[test]
    fn test_sample_rows_row_major() {
        let lower = ArrayD::from_shape_vec(IxDyn(&[2, 2, 2]), (0..8).map(|v| v as f32).collect())
            .unwrap();
        let b = BoundedTensor::concrete(lower);
        let (l, _) = b.sample_rows().unwrap();
        assert_eq!(l.shape(), &[2, 4]);
        assert_eq!(l.row(1).to_vec(), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_reshape_keeps_order() {
        let b = BoundedTensor::concrete(arr2(&[[1.0_f32, 2.0, 3.0, 4.0]]).into_dyn());
        let r = b.reshape(&[1, 2, 2]).unwrap();
        assert_eq!(r.get(&[0, 1, 0]).unwrap(), Bound::new(3.0, 3.0));
        assert!(b.reshape(&[1, 3]).is_err());
    }

    #[test]
    fn test_subset() {
        let outer = BoundedTensor::new(
            arr1(&[-1.0_f32, 0.0]).into_dyn(),
            arr1(&[1.0_f32, 2.0]).into_dyn(),
        )
        .unwrap();
        let inner = BoundedTensor::new(
            arr1(&[-0.5_f32, 0.5]).into_dyn(),
            arr1(&[0.5_f32, 2.0]).into_dyn(),
        )
        .unwrap();
        assert!(inner.is_subset_of(&outer));
        assert!(!outer.is_subset_of(&inner));
        let reshaped = inner.reshape(&[2, 1]).unwrap();
        assert!(!reshaped.is_subset_of(&outer));
    }

    #[test]
    fn test_map_monotone() {
        let b = BoundedTensor::new(arr1(&[-1.0_f32]).into_dyn(), arr1(&[2.0_f32]).into_dyn())
            .unwrap();
        let t = b.map_monotone(|v| v.max(0.0));
        assert_eq!(t.get(&[0]).unwrap(), Bound::new(0.0, 2.0));
    }
}
