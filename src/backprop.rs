//! Differentiable L1 attention.
//!
//! # Autograd Pattern
//!
//! Follows the same pattern as every differentiable op in this crate:
//! 1. **Inputs** are references to `WithGrad<Ten32>`.
//! 2. **Forward Pass** computes the output tensor.
//! 3. **Backward Pass** is a returned closure that captures the (contiguous)
//!    inputs and maps `dL/d(out)` to the input gradients.
//! 4. **Gradient Application** is left to the caller, e.g. via
//!    [`WithGrad::accumulate`].
//!
//! Both passes go through [`crate::ops::dispatch`] on the default backend.

use crate::error::Result;
use crate::ops::dispatch::{self, KernelPath};
use crate::tensors::{Ten32, WithGrad};

/// Backward closure of [`l1attn`]: `d_attn -> (dq, dk)`.
pub type L1AttnBackward = dyn Fn(&Ten32) -> Result<(Ten32, Ten32)>;

/// L1 attention scores with a backward closure.
///
/// `q` and `k` are `[batch, context, heads, width]`; they are made contiguous
/// before the forward call and kept for the backward pass. The output is
/// `[batch, key, query, heads]`.
///
/// # Errors
/// Whatever the dispatcher reports for the inputs.
///
/// # Example
/// ```rust
/// use l1attn::backprop::l1attn;
/// use l1attn::tensors::{Tensor, WithGrad};
///
/// let q = WithGrad::new(Tensor::new(vec![1, 2, 1, 3], vec![0.0f32, 1.0, 2.0, 2.0, 1.0, 0.0]));
/// let k = WithGrad::new(Tensor::new(vec![1, 2, 1, 3], vec![2.0f32, 1.0, 0.0, 0.0, 1.0, 2.0]));
/// let (attn, back) = l1attn(&q, &k).unwrap();
/// assert_eq!(attn.shape(), &[1, 2, 2, 1]);
/// let (dq, dk) = back(&Tensor::new(vec![1, 2, 2, 1], vec![1.0f32; 4])).unwrap();
/// assert_eq!(dq.shape(), q.value.shape());
/// assert_eq!(dk.shape(), k.value.shape());
/// ```
pub fn l1attn(q: &WithGrad<Ten32>, k: &WithGrad<Ten32>) -> Result<(Ten32, Box<L1AttnBackward>)> {
    let q = q.value.contiguous();
    let k = k.value.contiguous();
    let attn = dispatch::forward(&q, &k)?;

    let back = move |d_attn: &Ten32| dispatch::backward(&d_attn.contiguous(), &q, &k);

    Ok((attn, Box::new(back)))
}

/// Whether a `[batch, context, heads, width]` shape would run on the tiled
/// kernels.
#[must_use]
pub fn will_use_optimized_kernel(shape: &[usize]) -> bool {
    KernelPath::for_shape(shape) == KernelPath::Tiled
}

/// Parameterless L1 attention layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct L1Attn;

impl L1Attn {
    /// Creates the layer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// See [`l1attn`].
    ///
    /// # Errors
    /// Whatever the dispatcher reports for the inputs.
    pub fn forward(
        &self,
        q: &WithGrad<Ten32>,
        k: &WithGrad<Ten32>,
    ) -> Result<(Ten32, Box<L1AttnBackward>)> {
        l1attn(q, k)
    }
}
