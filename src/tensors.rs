//! Core tensor data structures and operations.
//!
//! # Dense Tensors
//!
//! This module defines the tensor type every other part of the crate is built on:
//! a dense, row-major array of `f64` values with an explicit shape.
//!
//! It supports:
//! - Construction from a shape and flat data, or from random/constant initialisers
//! - Element access by multi-dimensional index
//! - Elementwise arithmetic between same-shaped tensors and with scalars
//! - Linear algebra: matrix product, transpose and 2-D convolution
//! - Structural operations: reshape, slice, split and concatenate
//! - Descriptive statistics for debugging
//!
//! ## Design Highlights
//! - The invariant `data.len() == shape.iter().product()` holds for every tensor;
//!   fields are private so it can only be changed through checked methods
//! - Every tensor carries a [`TensorId`], unique for the lifetime of the process;
//!   optimisers key their per-parameter state on it
//! - Cloning produces a *new* tensor with a fresh id; equality compares shape and data only
//! - `reshape` copies the data, so the result never aliases the original
//! - [`WithGrad`] pairs a parameter with its gradient buffer
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting, except the explicit [`Tensor::add_row_broadcast`] used for biases
//! - Shape mismatches are programming errors and panic
//!
//! ## Example
//!
//! ```rust
//! use handgrad::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape(), &[2, 3]);
//! assert_eq!(t.get(&[1, 0]), 4.0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::debug;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a tensor.
///
/// Ids are handed out from a global counter when a tensor is created and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn fresh() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw counter value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Represents an N-dimensional tensor with a shape and flat row-major data.
///
/// - `shape` defines the structure, e.g., `[2, 3]` for a 2×3 matrix.
/// - `data` holds the flattened content in row-major order.
#[derive(Debug)]
pub struct Tensor {
    id: TensorId,
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Self {
            id: TensorId::fresh(),
            shape: self.shape.clone(),
            data: self.data.clone(),
        }
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}

impl Tensor {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f64>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            id: TensorId::fresh(),
            shape,
            data,
        }
    }

    /// A tensor holding no elements, shape `[0]`.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(vec![0], Vec::new())
    }

    /// Tensor of the given shape with every element set to `value`.
    pub fn filled(shape: impl Into<Vec<usize>>, value: f64) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self::new(shape, vec![value; len])
    }

    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn ones(shape: impl Into<Vec<usize>>) -> Self {
        Self::filled(shape, 1.0)
    }

    /// Tensor with elements drawn uniformly from `[-1, 1)`.
    pub fn random<R: Rng + ?Sized>(shape: impl Into<Vec<usize>>, rng: &mut R) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        let data = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
        Self::new(shape, data)
    }

    /// Xavier-initialised `[fan_in, fan_out]` weight matrix.
    ///
    /// Elements are `N(0, 1) * sqrt(2 / (fan_in + fan_out))`.
    pub fn xavier<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let scale = (2.0 / (fan_in + fan_out) as f64).sqrt();
        let data = (0..fan_in * fan_out)
            .map(|_| {
                let z: f64 = StandardNormal.sample(rng);
                z * scale
            })
            .collect();
        Self::new(vec![fan_in, fan_out], data)
    }

    /// Builds a tensor by evaluating `f` at every flat index.
    pub fn from_fn(shape: impl Into<Vec<usize>>, f: impl FnMut(usize) -> f64) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self::new(shape, (0..len).map(f).collect())
    }

    #[must_use]
    pub const fn id(&self) -> TensorId {
        self.id
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable view of the elements. The length cannot change through it.
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.shape == other.shape
    }

    /// Replaces the elements in place, keeping shape and identity.
    ///
    /// # Panics
    /// Panics if `data` does not have exactly [`Tensor::size`] elements.
    pub fn set_data(&mut self, data: Vec<f64>) {
        assert_eq!(
            data.len(),
            self.data.len(),
            "shape {:?} is incompatible with {} data elements",
            self.shape,
            data.len()
        );
        self.data = data;
    }

    /// Sets every element to zero.
    pub fn fill_zero(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Row-major flat offset of `indices`.
    ///
    /// # Panics
    /// Panics if the number of indices differs from the rank or any index is out of range.
    #[must_use]
    pub fn index(&self, indices: &[usize]) -> usize {
        assert_eq!(
            indices.len(),
            self.shape.len(),
            "expected {} indices for shape {:?}, got {}",
            self.shape.len(),
            self.shape,
            indices.len()
        );
        indices
            .iter()
            .zip(&self.shape)
            .fold(0, |flat, (&i, &dim)| {
                assert!(i < dim, "index {indices:?} out of range for shape {:?}", self.shape);
                flat * dim + i
            })
    }

    /// # Panics
    /// See [`Tensor::index`].
    #[must_use]
    pub fn get(&self, indices: &[usize]) -> f64 {
        self.data[self.index(indices)]
    }

    /// # Panics
    /// See [`Tensor::index`].
    pub fn set(&mut self, indices: &[usize], value: f64) {
        let at = self.index(indices);
        self.data[at] = value;
    }

    /// Applies `f` to every element, returning a new tensor of the same shape.
    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self::new(self.shape.clone(), self.data.iter().map(|&v| f(v)).collect())
    }

    /// Combines two same-shaped tensors element by element.
    ///
    /// # Panics
    /// Panics if the shapes differ.
    #[must_use]
    pub fn zip_map(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Self {
        assert_eq!(
            self.shape, other.shape,
            "elementwise shape mismatch: {:?} vs {:?}",
            self.shape, other.shape
        );
        Self::new(
            self.shape.clone(),
            self.data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        )
    }

    /// # Panics
    /// Panics if the shapes differ.
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        self.zip_map(other, |a, b| a + b)
    }

    /// # Panics
    /// Panics if the shapes differ.
    #[must_use]
    pub fn subtract(&self, other: &Self) -> Self {
        self.zip_map(other, |a, b| a - b)
    }

    /// Hadamard product.
    ///
    /// # Panics
    /// Panics if the shapes differ.
    #[must_use]
    pub fn multiply(&self, other: &Self) -> Self {
        self.zip_map(other, |a, b| a * b)
    }

    /// # Panics
    /// Panics if the shapes differ.
    #[must_use]
    pub fn divide(&self, other: &Self) -> Self {
        self.zip_map(other, |a, b| a / b)
    }

    #[must_use]
    pub fn add_scalar(&self, scalar: f64) -> Self {
        self.map(|v| v + scalar)
    }

    #[must_use]
    pub fn multiply_scalar(&self, scalar: f64) -> Self {
        self.map(|v| v * scalar)
    }

    /// In-place `self += other`, keeping identity. Used for gradient accumulation.
    ///
    /// # Panics
    /// Panics if the shapes differ.
    pub fn accumulate(&mut self, other: &Self) {
        assert_eq!(
            self.shape, other.shape,
            "elementwise shape mismatch: {:?} vs {:?}",
            self.shape, other.shape
        );
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    /// Matrix product of two rank-2 tensors: `[m, k] · [k, n] -> [m, n]`.
    ///
    /// # Panics
    /// Panics if either operand is not rank 2 or the inner dimensions differ.
    #[must_use]
    pub fn dot(&self, other: &Self) -> Self {
        assert!(
            self.rank() == 2 && other.rank() == 2,
            "dot requires rank-2 tensors, got {:?} and {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "dot inner dimensions differ: {:?} · {:?}",
            self.shape, other.shape
        );
        let (m, k, n) = (self.shape[0], self.shape[1], other.shape[1]);
        let data = crate::ops::dispatch::dot(&self.data, &other.data, m, k, n);
        Self::new(vec![m, n], data)
    }

    /// Transpose of a rank-2 tensor.
    ///
    /// # Panics
    /// Panics if the tensor is not rank 2.
    #[must_use]
    pub fn transpose(&self) -> Self {
        assert_eq!(self.rank(), 2, "transpose requires a rank-2 tensor, got {:?}", self.shape);
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let mut data = vec![0.0; self.data.len()];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data[r * cols + c];
            }
        }
        Self::new(vec![cols, rows], data)
    }

    /// 2-D convolution of a `[batch, channels, h, w]` input with an
    /// `[out_channels, channels, kh, kw]` kernel.
    ///
    /// Positions that fall into the padding are skipped, which is equivalent to zero padding.
    ///
    /// # Panics
    /// Panics if either operand is not rank 4, the channel counts differ, `stride` is zero,
    /// or the padded input is smaller than the kernel.
    #[must_use]
    pub fn conv2d(&self, kernel: &Self, stride: usize, padding: usize) -> Self {
        let geometry = crate::ops::ConvGeometry::new(&self.shape, &kernel.shape, stride, padding);
        let data = crate::ops::dispatch::conv2d(&self.data, &kernel.data, &geometry);
        Self::new(geometry.output_shape(), data)
    }

    /// Sum of all elements.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Sums over the leading (batch) axis, producing `[1, features]`.
    ///
    /// # Panics
    /// Panics if the tensor has rank below 2.
    #[must_use]
    pub fn sum_along_batch(&self) -> Self {
        assert!(
            self.rank() >= 2,
            "sum_along_batch requires rank >= 2, got {:?}",
            self.shape
        );
        let features: usize = self.shape[1..].iter().product();
        let mut out = vec![0.0; features];
        for row in self.data.chunks(features) {
            for (acc, &v) in out.iter_mut().zip(row) {
                *acc += v;
            }
        }
        Self::new(vec![1, features], out)
    }

    /// Adds a `[1, n]` row to every row of a `[batch, n]` tensor.
    ///
    /// # Panics
    /// Panics if `self` is not rank 2 or `row` does not have `n` elements.
    #[must_use]
    pub fn add_row_broadcast(&self, row: &Self) -> Self {
        assert_eq!(self.rank(), 2, "row broadcast requires a rank-2 tensor, got {:?}", self.shape);
        let n = self.shape[1];
        assert_eq!(
            row.size(),
            n,
            "cannot broadcast {:?} across rows of {:?}",
            row.shape,
            self.shape
        );
        let mut data = self.data.clone();
        for chunk in data.chunks_mut(n) {
            for (v, &b) in chunk.iter_mut().zip(&row.data) {
                *v += b;
            }
        }
        Self::new(self.shape.clone(), data)
    }

    /// Mask of the same shape whose elements are `1.0` with probability `p`, else `0.0`.
    #[must_use]
    pub fn threshold<R: Rng + ?Sized>(&self, p: f64, rng: &mut R) -> Self {
        let data = (0..self.size())
            .map(|_| if rng.random::<f64>() < p { 1.0 } else { 0.0 })
            .collect();
        Self::new(self.shape.clone(), data)
    }

    /// Borrowed row `i` of a rank-2 tensor, or `None` when not rank 2 or out of range.
    #[must_use]
    pub fn row(&self, i: usize) -> Option<&[f64]> {
        if self.rank() != 2 || i >= self.shape[0] {
            return None;
        }
        let cols = self.shape[1];
        Some(&self.data[i * cols..(i + 1) * cols])
    }

    /// Adds `values` into row `i` of a rank-2 tensor.
    ///
    /// # Panics
    /// Panics if the tensor is not rank 2, `i` is out of range, or the row length differs.
    pub fn add_row(&mut self, i: usize, values: &[f64]) {
        assert_eq!(self.rank(), 2, "add_row requires a rank-2 tensor, got {:?}", self.shape);
        assert!(i < self.shape[0], "row {i} out of range for shape {:?}", self.shape);
        let cols = self.shape[1];
        assert_eq!(values.len(), cols, "row length {} does not match {cols}", values.len());
        for (v, &x) in self.data[i * cols..(i + 1) * cols].iter_mut().zip(values) {
            *v += x;
        }
    }

    /// Selects `index` along `axis`, dropping that axis.
    ///
    /// For `axis == 0` this is the `index`-th sub-tensor; for other axes the
    /// selected elements are gathered from every leading position.
    ///
    /// # Panics
    /// Panics if `axis` is not below the rank or `index` is out of range for it.
    #[must_use]
    pub fn slice(&self, index: usize, axis: usize) -> Self {
        assert!(axis < self.rank(), "axis {axis} out of range for shape {:?}", self.shape);
        assert!(
            index < self.shape[axis],
            "index {index} out of range along axis {axis} of {:?}",
            self.shape
        );
        let inner: usize = self.shape[axis + 1..].iter().product();
        let outer: usize = self.shape[..axis].iter().product();
        let span = self.shape[axis] * inner;

        let mut data = Vec::with_capacity(outer * inner);
        for o in 0..outer {
            let start = o * span + index * inner;
            data.extend_from_slice(&self.data[start..start + inner]);
        }
        let mut shape = self.shape.clone();
        shape.remove(axis);
        Self::new(shape, data)
    }

    /// Returns a copy with a new shape. The element count must be preserved.
    ///
    /// # Panics
    /// Panics if the new shape holds a different number of elements.
    #[must_use]
    pub fn reshape(&self, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            self.size(),
            "cannot reshape {:?} into {:?}",
            self.shape,
            shape
        );
        Self::new(shape, self.data.clone())
    }

    /// Partitions the flat data into consecutive 1-D tensors of the given sizes.
    ///
    /// # Panics
    /// Panics if `sizes` does not sum to [`Tensor::size`].
    #[must_use]
    pub fn split(&self, sizes: &[usize]) -> Vec<Self> {
        assert_eq!(
            sizes.iter().sum::<usize>(),
            self.size(),
            "split sizes {sizes:?} do not cover {} elements",
            self.size()
        );
        let mut offset = 0;
        sizes
            .iter()
            .map(|&len| {
                let part = Self::new(vec![len], self.data[offset..offset + len].to_vec());
                offset += len;
                part
            })
            .collect()
    }

    /// Joins the flat data of `tensors` into a single 1-D tensor, preserving order.
    #[must_use]
    pub fn concatenate(tensors: &[&Self]) -> Self {
        let data: Vec<f64> = tensors.iter().flat_map(|t| t.data.iter().copied()).collect();
        Self::new(vec![data.len()], data)
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let n = self.data.len() as f64;
        self.sum() / n
    }

    #[must_use]
    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::MAX, f64::min)
    }

    #[must_use]
    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::MIN, f64::max)
    }

    /// Population standard deviation.
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        let mean = self.mean();
        #[allow(clippy::cast_precision_loss)]
        let n = self.data.len() as f64;
        (self.data.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt()
    }

    /// Emits shape and summary statistics at debug level.
    pub fn log_stats(&self, label: &str) {
        debug!(
            label,
            shape = ?self.shape,
            mean = self.mean(),
            min = self.min(),
            max = self.max(),
            std_dev = self.std_dev(),
            "tensor stats"
        );
    }
}

/// A parameter tensor paired with its gradient buffer of the same shape.
#[derive(Debug, Clone)]
pub struct WithGrad<T> {
    pub value: T,
    pub grad: T,
}

impl WithGrad<Tensor> {
    /// Wraps `value` with a zeroed gradient of the same shape.
    #[must_use]
    pub fn new(value: Tensor) -> Self {
        let grad = Tensor::zeros(value.shape.clone());
        Self { value, grad }
    }

    /// Replaces the value, resetting the gradient to zeros of the new shape.
    pub fn replace(&mut self, value: Tensor) {
        self.grad = Tensor::zeros(value.shape.clone());
        self.value = value;
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use handgrad::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape.as_slice()),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].size());
        for c in children { data.extend(c.into_data()); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_gets_fresh_identity() {
        let a = Tensor::zeros(vec![2, 2]);
        let b = a.clone();
        assert_ne!(a.id(), b.id());
        assert_eq!(a, b);
    }

    #[test]
    fn row_major_index() {
        let t = Tensor::zeros(vec![2, 3, 4]);
        assert_eq!(t.index(&[1, 2, 3]), (1 * 3 + 2) * 4 + 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn index_out_of_range_panics() {
        let t = Tensor::zeros(vec![2, 2]);
        let _ = t.get(&[2, 0]);
    }

    #[test]
    fn slice_inner_axis() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.slice(1, 0).data(), &[4.0, 5.0, 6.0]);
        assert_eq!(t.slice(2, 1).data(), &[3.0, 6.0]);
    }

    #[test]
    fn reshape_does_not_alias() {
        let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let mut r = t.reshape(vec![4]);
        r.set(&[0], 9.0);
        assert_eq!(t.get(&[0, 0]), 1.0);
        assert_ne!(t.id(), r.id());
    }

    #[test]
    fn macro_builds_nested_shape() {
        let t = tensor!([[[1.0], [2.0]], [[3.0], [4.0]]]);
        assert_eq!(t.shape(), &[2, 2, 1]);
    }
}
