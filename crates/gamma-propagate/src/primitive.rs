//! Primitive operations of a computation graph.
//!
//! Every graph node applies one [`Primitive`] to operands that are either
//! batched variables (bounds carry a leading sample axis) or constants
//! shared by every sample. Shapes handled here are *per-sample* shapes.
//!
//! Affine primitives expose their exact linear form directly through
//! [`Primitive::affine_row`]: for one output component it returns the bias
//! and, for each variable operand, the sparse coefficients over that
//! operand's flattened elements. Rows are produced one component at a time
//! so the dense Jacobian is never materialized.

use gamma_core::{GammaError, Result};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

/// Relaxation category of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Pure layout change: output equals input element for element.
    Passthrough,
    /// Exact affine function of the variable operands.
    Affine,
    /// Elementwise `max(x, c)`; relaxable only as ReLU (`c == 0`).
    MaxActivation,
    /// Known to bound propagation but not to the relaxation.
    Unsupported,
}

/// Primitive operation applied at a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    /// Reshape each sample to `shape`.
    Reshape { shape: Vec<usize> },
    /// Broadcast the operand to `shape`; operand axis `i` maps to output
    /// axis `broadcast_dimensions[i]` and must match it or have size 1.
    BroadcastInDim {
        shape: Vec<usize>,
        broadcast_dimensions: Vec<usize>,
    },
    /// Elementwise addition with numpy broadcasting.
    Add,
    /// Elementwise subtraction with numpy broadcasting.
    Sub,
    /// Elementwise multiplication; one operand must be constant.
    Mul,
    /// Matrix product where exactly one operand is constant.
    ///
    /// `var[..., K] @ W[K, N] -> [..., N]`, `var[..., K] @ w[K] -> [...]`,
    /// `A[M, K] @ var[K(, N)] -> [M(, N)]`, `a[K] @ var[K(, N)] -> [(N)]`.
    DotGeneral,
    /// 2-D convolution, NCHW input (per sample `[C, H, W]`) and constant
    /// `[O, C, KH, KW]` kernel. No bias; add it with [`Primitive::Add`].
    Conv2d {
        stride: [usize; 2],
        padding: [usize; 2],
    },
    /// Elementwise maximum with numpy broadcasting.
    Max,
    Tanh,
    Sigmoid,
}

/// Operand description used for shape inference and coefficient extraction.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    /// A variable operand with the given per-sample shape.
    Var { shape: &'a [usize] },
    /// A constant operand, shared by all samples.
    Const(&'a ArrayD<f32>),
}

impl Operand<'_> {
    pub fn is_var(&self) -> bool {
        matches!(self, Operand::Var { .. })
    }
}

/// Sparse coefficients over the flattened elements of one operand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseCoeffs {
    pub components: Vec<usize>,
    pub values: Vec<f32>,
}

impl SparseCoeffs {
    fn push(&mut self, component: usize, value: f32) {
        if value != 0.0 {
            self.components.push(component);
            self.values.push(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }
}

/// Exact linear form of one output component of an affine primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineRow {
    /// Value of the component when every variable operand is zero.
    pub bias: f32,
    /// One entry per operand: coefficients for variables, `None` for constants.
    pub coeffs: Vec<Option<SparseCoeffs>>,
}

impl AffineRow {
    fn new(operands: &[Operand<'_>]) -> Self {
        Self {
            bias: 0.0,
            coeffs: operands
                .iter()
                .map(|op| op.is_var().then(SparseCoeffs::default))
                .collect(),
        }
    }

    fn add(&mut self, operand: usize, component: usize, value: f32) {
        if let Some(Some(c)) = self.coeffs.get_mut(operand) {
            c.push(component, value);
        }
    }
}

impl Primitive {
    /// Short lowercase name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Reshape { .. } => "reshape",
            Primitive::BroadcastInDim { .. } => "broadcast_in_dim",
            Primitive::Add => "add",
            Primitive::Sub => "sub",
            Primitive::Mul => "mul",
            Primitive::DotGeneral => "dot_general",
            Primitive::Conv2d { .. } => "conv2d",
            Primitive::Max => "max",
            Primitive::Tanh => "tanh",
            Primitive::Sigmoid => "sigmoid",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Primitive::Reshape { .. } => Category::Passthrough,
            Primitive::BroadcastInDim { .. }
            | Primitive::Add
            | Primitive::Sub
            | Primitive::Mul
            | Primitive::DotGeneral
            | Primitive::Conv2d { .. } => Category::Affine,
            Primitive::Max => Category::MaxActivation,
            Primitive::Tanh | Primitive::Sigmoid => Category::Unsupported,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Primitive::Reshape { .. }
            | Primitive::BroadcastInDim { .. }
            | Primitive::Tanh
            | Primitive::Sigmoid => 1,
            _ => 2,
        }
    }

    fn check_arity(&self, operands: &[Operand<'_>]) -> Result<()> {
        if operands.len() == self.arity() {
            return Ok(());
        }
        if matches!(self, Primitive::Max) {
            return Err(GammaError::UnsupportedOp(format!(
                "max with {} operands; only binary max(x, 0) is supported",
                operands.len()
            )));
        }
        Err(GammaError::InvalidGraph(format!(
            "{} expects {} operand(s), got {}",
            self.name(),
            self.arity(),
            operands.len()
        )))
    }

    /// Per-sample output shape for the given operands.
    pub fn output_shape(&self, operands: &[Operand<'_>]) -> Result<Vec<usize>> {
        self.check_arity(operands)?;
        match self {
            Primitive::Reshape { shape } => {
                let in_shape = var_shape(&operands[0], self)?;
                let (from, to) = (numel(in_shape), numel(shape));
                if from != to {
                    return Err(GammaError::shape_mismatch(shape.clone(), in_shape.to_vec()));
                }
                Ok(shape.clone())
            }
            Primitive::BroadcastInDim {
                shape,
                broadcast_dimensions,
            } => {
                let in_shape = var_shape(&operands[0], self)?;
                check_broadcast_in_dim(in_shape, shape, broadcast_dimensions)?;
                Ok(shape.clone())
            }
            Primitive::Add | Primitive::Sub | Primitive::Mul | Primitive::Max => {
                elementwise_shape(operands)
            }
            Primitive::DotGeneral => Ok(dot_layout(operands)?.out_shape),
            Primitive::Conv2d { stride, padding } => {
                Ok(conv_layout(operands, *stride, *padding)?.out_shape)
            }
            Primitive::Tanh | Primitive::Sigmoid => Ok(var_shape(&operands[0], self)?.to_vec()),
        }
    }

    /// Exact linear form of output component `component` (row-major flat
    /// index into the per-sample output).
    ///
    /// Fails with `UnsupportedOp` for non-affine primitives and for products
    /// of two variables.
    pub fn affine_row(&self, component: usize, operands: &[Operand<'_>]) -> Result<AffineRow> {
        self.check_arity(operands)?;
        let mut row = AffineRow::new(operands);
        match self {
            Primitive::Add | Primitive::Sub => {
                let full = elementwise_full_shape(operands)?;
                let out_index = full_index(component, &full);
                let signs = if matches!(self, Primitive::Add) {
                    [1.0, 1.0]
                } else {
                    [1.0, -1.0]
                };
                for (k, (op, sign)) in operands.iter().zip(signs).enumerate() {
                    match op {
                        Operand::Var { shape } => {
                            let src = broadcast_source(&out_index, &with_batch(shape));
                            row.add(k, src, sign);
                        }
                        Operand::Const(c) => {
                            row.bias += sign * c[IxDyn(&broadcast_index(&out_index, c.shape()))];
                        }
                    }
                }
            }
            Primitive::Mul => {
                let (var_pos, scale) = match operands {
                    [Operand::Var { .. }, Operand::Const(c)] => (0, *c),
                    [Operand::Const(c), Operand::Var { .. }] => (1, *c),
                    [Operand::Var { .. }, Operand::Var { .. }] => {
                        return Err(GammaError::UnsupportedOp(
                            "mul of two variables is not affine".to_string(),
                        ))
                    }
                    _ => return Err(no_variable(self)),
                };
                let full = elementwise_full_shape(operands)?;
                let out_index = full_index(component, &full);
                let shape = var_shape(&operands[var_pos], self)?;
                let src = broadcast_source(&out_index, &with_batch(shape));
                let value = scale[IxDyn(&broadcast_index(&out_index, scale.shape()))];
                row.add(var_pos, src, value);
            }
            Primitive::BroadcastInDim {
                shape,
                broadcast_dimensions,
            } => {
                let in_shape = var_shape(&operands[0], self)?;
                let out_index = unravel(component, shape);
                let in_index: Vec<usize> = in_shape
                    .iter()
                    .zip(broadcast_dimensions)
                    .map(|(&dim, &axis)| if dim == 1 { 0 } else { out_index[axis] })
                    .collect();
                row.add(0, ravel(&in_index, in_shape), 1.0);
            }
            Primitive::DotGeneral => {
                let layout = dot_layout(operands)?;
                let out_index = unravel(component, &layout.out_shape);
                layout.fill_row(&out_index, &mut row);
            }
            Primitive::Conv2d { stride, padding } => {
                let layout = conv_layout(operands, *stride, *padding)?;
                layout.fill_row(component, &mut row);
            }
            Primitive::Reshape { .. }
            | Primitive::Max
            | Primitive::Tanh
            | Primitive::Sigmoid => {
                return Err(GammaError::UnsupportedOp(format!(
                    "{} is not an affine primitive",
                    self.name()
                )))
            }
        }
        Ok(row)
    }
}

fn no_variable(p: &Primitive) -> GammaError {
    GammaError::InvalidGraph(format!("{} has no variable operand", p.name()))
}

fn var_shape<'a>(op: &Operand<'a>, p: &Primitive) -> Result<&'a [usize]> {
    match op {
        Operand::Var { shape } => Ok(shape),
        Operand::Const(_) => Err(no_variable(p)),
    }
}

pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major multi-index of flat position `flat` in `shape`.
pub fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for (slot, &dim) in index.iter_mut().zip(shape).rev() {
        if dim > 0 {
            *slot = flat % dim;
            flat /= dim;
        }
    }
    index
}

/// Row-major flat position of `index` in `shape`.
pub fn ravel(index: &[usize], shape: &[usize]) -> usize {
    index
        .iter()
        .zip(shape)
        .fold(0, |flat, (&i, &dim)| flat * dim + i)
}

/// Numpy broadcasting of two shapes (right-aligned).
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for (i, slot) in out.iter_mut().enumerate() {
        let da = dim_from_right(a, rank - 1 - i);
        let db = dim_from_right(b, rank - 1 - i);
        *slot = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(GammaError::shape_mismatch(a.to_vec(), b.to_vec())),
        };
    }
    Ok(out)
}

fn dim_from_right(shape: &[usize], offset: usize) -> usize {
    if offset < shape.len() {
        shape[shape.len() - 1 - offset]
    } else {
        1
    }
}

/// Index into `src_shape` that broadcasts to `out_index` (right-aligned).
fn broadcast_index(out_index: &[usize], src_shape: &[usize]) -> Vec<usize> {
    let skip = out_index.len() - src_shape.len();
    out_index[skip..]
        .iter()
        .zip(src_shape)
        .map(|(&i, &dim)| if dim == 1 { 0 } else { i })
        .collect()
}

fn broadcast_source(out_index: &[usize], src_shape: &[usize]) -> usize {
    ravel(&broadcast_index(out_index, src_shape), src_shape)
}

fn with_batch(shape: &[usize]) -> Vec<usize> {
    let mut full = Vec::with_capacity(shape.len() + 1);
    full.push(1);
    full.extend_from_slice(shape);
    full
}

/// Position `component` of the per-sample output, as an index into the
/// full (batch-of-one) shape.
fn full_index(component: usize, full: &[usize]) -> Vec<usize> {
    let mut index = unravel(component, &full[1..]);
    index.insert(0, 0);
    index
}

/// Broadcast shape of elementwise operands, with variables given a batch
/// axis of size one. Constants may not carry a non-trivial batch axis.
fn elementwise_full_shape(operands: &[Operand<'_>]) -> Result<Vec<usize>> {
    if !operands.iter().any(Operand::is_var) {
        return Err(GammaError::InvalidGraph(
            "elementwise op has no variable operand".to_string(),
        ));
    }
    let mut full: Vec<usize> = Vec::new();
    for op in operands {
        let shape = match op {
            Operand::Var { shape } => with_batch(shape),
            Operand::Const(c) => c.shape().to_vec(),
        };
        full = broadcast_shapes(&full, &shape)?;
    }
    if full[0] != 1 {
        // A constant with its own batch axis: not shared across samples.
        let got = operands
            .iter()
            .find_map(|op| match op {
                Operand::Const(c) if c.ndim() == full.len() && c.shape()[0] != 1 => {
                    Some(c.shape().to_vec())
                }
                _ => None,
            })
            .unwrap_or_else(|| full.clone());
        let mut expected = got.clone();
        expected[0] = 1;
        return Err(GammaError::ShapeMismatch { expected, got });
    }
    Ok(full)
}

fn elementwise_shape(operands: &[Operand<'_>]) -> Result<Vec<usize>> {
    Ok(elementwise_full_shape(operands)?[1..].to_vec())
}

fn check_broadcast_in_dim(
    in_shape: &[usize],
    shape: &[usize],
    broadcast_dimensions: &[usize],
) -> Result<()> {
    let valid = in_shape.len() == broadcast_dimensions.len()
        && broadcast_dimensions.windows(2).all(|w| w[0] < w[1])
        && in_shape
            .iter()
            .zip(broadcast_dimensions)
            .all(|(&dim, &axis)| axis < shape.len() && (dim == 1 || dim == shape[axis]));
    if valid {
        Ok(())
    } else {
        Err(GammaError::InvalidGraph(format!(
            "cannot broadcast {in_shape:?} to {shape:?} along {broadcast_dimensions:?}"
        )))
    }
}

/// Which side of a matrix product carries the variable.
#[derive(Debug)]
enum DotSide<'a> {
    /// `var[..., K] @ w`, `w` is `[K, N]` or `[K]`.
    Lhs { w: &'a ArrayD<f32> },
    /// `a @ var[K, ...]`, `a` is `[M, K]` or `[K]`.
    Rhs { a: &'a ArrayD<f32> },
}

#[derive(Debug)]
struct DotLayout<'a> {
    side: DotSide<'a>,
    var_shape: &'a [usize],
    k: usize,
    out_shape: Vec<usize>,
}

fn dot_layout<'a>(operands: &[Operand<'a>]) -> Result<DotLayout<'a>> {
    let (side, var_shape, k) = match operands {
        [Operand::Var { shape }, Operand::Const(w)] => {
            if shape.is_empty() || !(1..=2).contains(&w.ndim()) {
                return Err(GammaError::InvalidGraph(format!(
                    "dot_general: unsupported operand ranks {shape:?} @ {:?}",
                    w.shape()
                )));
            }
            let k = shape[shape.len() - 1];
            if w.shape()[0] != k {
                return Err(GammaError::shape_mismatch(vec![k], vec![w.shape()[0]]));
            }
            (DotSide::Lhs { w: *w }, *shape, k)
        }
        [Operand::Const(a), Operand::Var { shape }] => {
            if !(1..=2).contains(&shape.len()) || !(1..=2).contains(&a.ndim()) {
                return Err(GammaError::InvalidGraph(format!(
                    "dot_general: unsupported operand ranks {:?} @ {shape:?}",
                    a.shape()
                )));
            }
            let k = a.shape()[a.ndim() - 1];
            if shape[0] != k {
                return Err(GammaError::shape_mismatch(vec![k], vec![shape[0]]));
            }
            (DotSide::Rhs { a: *a }, *shape, k)
        }
        [Operand::Var { .. }, Operand::Var { .. }] => {
            return Err(GammaError::UnsupportedOp(
                "dot_general of two variables is not affine".to_string(),
            ))
        }
        _ => return Err(no_variable(&Primitive::DotGeneral)),
    };
    let out_shape = match &side {
        DotSide::Lhs { w } => {
            let mut s = var_shape[..var_shape.len() - 1].to_vec();
            if w.ndim() == 2 {
                s.push(w.shape()[1]);
            }
            s
        }
        DotSide::Rhs { a } => {
            let mut s = Vec::new();
            if a.ndim() == 2 {
                s.push(a.shape()[0]);
            }
            s.extend_from_slice(&var_shape[1..]);
            s
        }
    };
    Ok(DotLayout {
        side,
        var_shape,
        k,
        out_shape,
    })
}

impl DotLayout<'_> {
    fn fill_row(&self, out_index: &[usize], row: &mut AffineRow) {
        match &self.side {
            DotSide::Lhs { w } => {
                let (prefix, col) = if w.ndim() == 2 {
                    let (p, last) = out_index.split_at(out_index.len() - 1);
                    (p, Some(last[0]))
                } else {
                    (out_index, None)
                };
                let mut var_index = prefix.to_vec();
                var_index.push(0);
                for kk in 0..self.k {
                    var_index[prefix.len()] = kk;
                    let coeff = match col {
                        Some(j) => w[[kk, j].as_slice()],
                        None => w[[kk].as_slice()],
                    };
                    row.add(0, ravel(&var_index, self.var_shape), coeff);
                }
            }
            DotSide::Rhs { a } => {
                let (m, tail) = if a.ndim() == 2 {
                    (Some(out_index[0]), &out_index[1..])
                } else {
                    (None, out_index)
                };
                let mut var_index = Vec::with_capacity(self.var_shape.len());
                var_index.push(0);
                var_index.extend_from_slice(tail);
                for kk in 0..self.k {
                    var_index[0] = kk;
                    let coeff = match m {
                        Some(m) => a[[m, kk].as_slice()],
                        None => a[[kk].as_slice()],
                    };
                    row.add(1, ravel(&var_index, self.var_shape), coeff);
                }
            }
        }
    }
}

#[derive(Debug)]
struct ConvLayout<'a> {
    kernel: ArrayViewD<'a, f32>,
    in_shape: [usize; 3],
    kernel_hw: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    out_shape: Vec<usize>,
}

fn conv_layout<'a>(
    operands: &[Operand<'a>],
    stride: [usize; 2],
    padding: [usize; 2],
) -> Result<ConvLayout<'a>> {
    let (shape, kernel) = match operands {
        [Operand::Var { shape }, Operand::Const(k)] => (*shape, *k),
        [Operand::Var { .. }, Operand::Var { .. }] => {
            return Err(GammaError::UnsupportedOp(
                "conv2d with a variable kernel is not affine".to_string(),
            ))
        }
        _ => {
            return Err(GammaError::InvalidGraph(
                "conv2d expects (variable input, constant kernel)".to_string(),
            ))
        }
    };
    if shape.len() != 3 || kernel.ndim() != 4 {
        return Err(GammaError::InvalidGraph(format!(
            "conv2d expects [C, H, W] input and [O, C, KH, KW] kernel, got {shape:?} and {:?}",
            kernel.shape()
        )));
    }
    if stride.contains(&0) {
        return Err(GammaError::InvalidGraph("conv2d stride must be positive".to_string()));
    }
    let (c, h, w) = (shape[0], shape[1], shape[2]);
    let ks = kernel.shape();
    if ks[1] != c {
        return Err(GammaError::shape_mismatch(vec![c], vec![ks[1]]));
    }
    let (kh, kw) = (ks[2], ks[3]);
    let (ph, pw) = (h + 2 * padding[0], w + 2 * padding[1]);
    if kh == 0 || kw == 0 || kh > ph || kw > pw {
        return Err(GammaError::InvalidGraph(format!(
            "conv2d kernel {kh}x{kw} does not fit padded input {ph}x{pw}"
        )));
    }
    let out_shape = vec![ks[0], (ph - kh) / stride[0] + 1, (pw - kw) / stride[1] + 1];
    Ok(ConvLayout {
        kernel: kernel.view(),
        in_shape: [c, h, w],
        kernel_hw: [kh, kw],
        stride,
        padding,
        out_shape,
    })
}

impl ConvLayout<'_> {
    fn fill_row(&self, component: usize, row: &mut AffineRow) {
        let idx = unravel(component, &self.out_shape);
        let (o, y, x) = (idx[0], idx[1], idx[2]);
        let [c_in, h, w] = self.in_shape;
        let filter = self.kernel.index_axis(Axis(0), o);
        for c in 0..c_in {
            for i in 0..self.kernel_hw[0] {
                let iy = (y * self.stride[0] + i).checked_sub(self.padding[0]);
                let Some(iy) = iy.filter(|&v| v < h) else {
                    continue;
                };
                for j in 0..self.kernel_hw[1] {
                    let ix = (x * self.stride[1] + j).checked_sub(self.padding[1]);
                    let Some(ix) = ix.filter(|&v| v < w) else {
                        continue;
                    };
                    row.add(0, (c * h + iy) * w + ix, filter[[c, i, j].as_slice()]);
                }
            }
        }
    }
}
