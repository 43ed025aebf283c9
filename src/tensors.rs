//! Core tensor data structures.
//!
//! # Strided Tensors
//!
//! A [`Tensor`] is a shape, a stride vector and an offset over shared,
//! reference-counted storage, tagged with the [`Backend`] it is resident on.
//!
//! It supports:
//! - Construction of N-dimensional tensors from row-major data
//! - Zero-copy axis transposition and permutation (views share storage)
//! - Contiguity tests and contiguous materialisation
//! - `WithGrad` pairing of a value with its gradient for autograd
//! - The `tensor!` macro for literals
//!
//! ## Design Highlights
//! - Transposes only rewrite shape and strides; data is copied only by
//!   [`Tensor::contiguous`], and only when the view is not already contiguous.
//! - Contiguity ignores the stride of size-1 axes, so a transpose that only
//!   moves unit axes keeps the tensor contiguous.
//!
//! ## Example
//!
//! ```rust
//! use l1attn::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! let tt = t.transpose(0, 1);
//! assert_eq!(tt.shape(), &[3, 2]);
//! assert!(!tt.is_contiguous());
//! assert_eq!(tt.contiguous().to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
//! ```

use crate::backend::{get_backend, Backend};
use std::sync::Arc;

/// An N-dimensional strided tensor.
///
/// Cloning is cheap: storage is shared, only the layout is copied.
#[derive(Debug)]
pub struct Tensor<T> {
    storage: Arc<[T]>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    backend: Backend,
}

/// The tensor type the attention kernels operate on.
pub type Ten32 = Tensor<f32>;

impl<T> Clone for Tensor<T> {
    fn clone(&self) -> Self {
        self.to_backend(self.backend)
    }
}

/// Row-major strides for `shape`.
#[must_use]
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

impl<T> Tensor<T> {
    /// Creates a contiguous tensor with the given shape and row-major data,
    /// resident on the current default backend.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            strides: row_major_strides(&shape),
            storage: data.into(),
            shape,
            offset: 0,
            backend: get_backend(),
        }
    }

    /// Returns the same tensor tagged as resident on `backend`.
    ///
    /// Storage stays on the host; the tag decides which kernels may consume it.
    #[must_use]
    pub fn to_backend(&self, backend: Backend) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            offset: self.offset,
            backend,
        }
    }

    /// Logical shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element strides, one per axis.
    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// The backend this tensor is resident on.
    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// Number of axes.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether iterating the logical axes in row-major order walks storage
    /// with no gaps.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.numel() == 0 {
            return true;
        }
        let mut expected = 1;
        for (&dim, &stride) in self.shape.iter().zip(&self.strides).rev() {
            if dim == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }

    /// Whether both tensors are views over the same storage allocation.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Swaps two axes without copying.
    ///
    /// # Panics
    /// Panics if either axis is out of range.
    #[must_use]
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Self {
        let rank = self.rank();
        assert!(
            dim0 < rank && dim1 < rank,
            "transpose({dim0}, {dim1}) out of range for rank {rank}"
        );
        let mut out = self.clone();
        out.shape.swap(dim0, dim1);
        out.strides.swap(dim0, dim1);
        out
    }

    /// Reorders axes without copying: axis `i` of the result is axis
    /// `order[i]` of `self`.
    ///
    /// # Panics
    /// Panics if `order` is not a permutation of `0..rank`.
    #[must_use]
    pub fn permute(&self, order: &[usize]) -> Self {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        assert!(
            order.len() == rank
                && order.iter().all(|&d| d < rank && !std::mem::replace(&mut seen[d], true)),
            "{order:?} is not a permutation of {rank} axes"
        );
        let mut out = self.clone();
        out.shape = order.iter().map(|&d| self.shape[d]).collect();
        out.strides = order.iter().map(|&d| self.strides[d]).collect();
        out
    }

    fn storage_index(&self, index: &[usize]) -> usize {
        assert_eq!(index.len(), self.rank(), "index rank mismatch");
        self.offset
            + index
                .iter()
                .zip(&self.shape)
                .zip(&self.strides)
                .map(|((&i, &dim), &stride)| {
                    assert!(i < dim, "index {i} out of bounds for axis of size {dim}");
                    i * stride
                })
                .sum::<usize>()
    }

    /// Calls `f` with the storage index of every element in logical
    /// row-major order.
    fn for_each_storage_index(&self, mut f: impl FnMut(usize)) {
        if self.numel() == 0 {
            return;
        }
        let rank = self.rank();
        let mut index = vec![0usize; rank];
        let mut pos = self.offset;
        loop {
            f(pos);
            let mut axis = rank;
            loop {
                if axis == 0 {
                    return;
                }
                axis -= 1;
                index[axis] += 1;
                pos += self.strides[axis];
                if index[axis] < self.shape[axis] {
                    break;
                }
                pos -= self.strides[axis] * self.shape[axis];
                index[axis] = 0;
            }
        }
    }
}

impl<T: Copy> Tensor<T> {
    /// Reads one element by logical index.
    ///
    /// # Panics
    /// Panics if the index has the wrong rank or is out of bounds.
    #[must_use]
    pub fn get(&self, index: &[usize]) -> T {
        self.storage[self.storage_index(index)]
    }

    /// The elements as one slice, if the tensor is contiguous.
    #[must_use]
    pub fn as_slice(&self) -> Option<&[T]> {
        self.is_contiguous()
            .then(|| &self.storage[self.offset..self.offset + self.numel()])
    }

    /// Copies the elements out in logical row-major order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        if let Some(slice) = self.as_slice() {
            return slice.to_vec();
        }
        let mut out = Vec::with_capacity(self.numel());
        self.for_each_storage_index(|i| out.push(self.storage[i]));
        out
    }

    /// Returns a contiguous tensor with the same logical contents.
    ///
    /// Shares storage when `self` is already contiguous, otherwise copies
    /// into a fresh row-major buffer.
    #[must_use]
    pub fn contiguous(&self) -> Self {
        if self.is_contiguous() {
            return self.clone();
        }
        Tensor::new(self.shape.clone(), self.to_vec()).to_backend(self.backend)
    }
}

impl<T: Copy + Default> Tensor<T> {
    /// A contiguous tensor of `T::default()` on the current default backend.
    #[must_use]
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self::new(shape, vec![T::default(); len])
    }
}

/// Logical equality: same shape and same elements, regardless of layout
/// or backend tag.
impl<T: Copy + PartialEq> PartialEq for Tensor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.to_vec() == other.to_vec()
    }
}

/// A container for tracking gradients of values (used in autograd).
#[derive(Debug, Clone)]
pub struct WithGrad<T> {
    /// The value.
    pub value: T,
    /// Accumulated gradient of some loss with respect to `value`.
    pub grad: T,
}

impl WithGrad<Ten32> {
    /// Wraps `value` with a zero gradient of the same shape and backend.
    #[must_use]
    pub fn new(value: Ten32) -> Self {
        let grad = Ten32::zeros(value.shape().to_vec()).to_backend(value.backend());
        Self { value, grad }
    }

    /// Adds `g` into the stored gradient.
    ///
    /// # Panics
    /// Panics if shapes do not match.
    pub fn accumulate(&mut self, g: &Ten32) {
        assert_eq!(self.grad.shape(), g.shape(), "gradient shape mismatch");
        let data = self
            .grad
            .to_vec()
            .into_iter()
            .zip(g.to_vec())
            .map(|(a, b)| a + b)
            .collect();
        self.grad = Ten32::new(g.shape().to_vec(), data).to_backend(self.value.backend());
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use l1attn::tensor;
/// let t = tensor!([[1.0f32, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $lit:literal ),+ $(,)? ]) => {{
        let data = vec![ $( $lit ),+ ];
        $crate::tensors::Tensor::new(vec![data.len()], data)
    }};

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape.as_slice()),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].numel());
        for c in children { data.extend(c.to_vec()); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
