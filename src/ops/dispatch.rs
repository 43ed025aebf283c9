//! Operation Dispatch Layer
//!
//! Validates L1 attention inputs, selects the kernel path from the tensor
//! shape, permutes memory layout to what the chosen kernel reads, and forwards
//! the call.
//!
//! # Path Selection
//! The tiled kernels are used when the context length is a multiple of
//! [`TILE`] and the width is one of [`TILED_WIDTHS`]. Everything else goes to
//! the general kernels.
//!
//! # Validation
//! Every tensor must be resident on the kernel set's backend and contiguous.
//! Violations are reported before any kernel runs, naming the argument.
//!
//! # Example
//! ```rust
//! use l1attn::ops::dispatch::{Dispatcher, KernelPath};
//! use l1attn::ops::cpu::CpuKernels;
//! use l1attn::tensors::Tensor;
//!
//! let q = Tensor::new(vec![1, 3, 2, 5], vec![0.5f32; 30]);
//! let k = Tensor::new(vec![1, 3, 2, 5], vec![1.5f32; 30]);
//! assert_eq!(KernelPath::for_shape(q.shape()), KernelPath::General);
//!
//! let attn = Dispatcher::new(CpuKernels).forward(&q, &k).unwrap();
//! assert_eq!(attn.shape(), &[1, 3, 3, 2]);
//! ```

use super::{dims4, expect_shape, L1AttnKernels};
use crate::backend::{get_backend, Backend};
use crate::error::{L1AttnError, Result};
use crate::tensors::Ten32;

/// Context tile edge of the tiled kernels.
pub const TILE: usize = 16;

/// Widths the tiled kernels are specialised for.
pub const TILED_WIDTHS: [usize; 3] = [16, 32, 64];

/// Which kernel family handles a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelPath {
    /// Any shape.
    General,
    /// Context divisible by [`TILE`], width in [`TILED_WIDTHS`].
    Tiled,
}

impl KernelPath {
    /// Selects the path for a context length and width.
    #[must_use]
    pub fn select(n_ctx: usize, width: usize) -> Self {
        if n_ctx % TILE == 0 && TILED_WIDTHS.contains(&width) {
            Self::Tiled
        } else {
            Self::General
        }
    }

    /// Selects the path for a `(batch, context, heads, width)` shape.
    ///
    /// Shapes of any other rank take the general path.
    #[must_use]
    pub fn for_shape(shape: &[usize]) -> Self {
        match shape {
            &[_, n_ctx, _, width] => Self::select(n_ctx, width),
            _ => Self::General,
        }
    }
}

/// Stateless router from validated inputs to a kernel set.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispatcher<K> {
    kernels: K,
}

impl<K: L1AttnKernels> Dispatcher<K> {
    /// Wraps a kernel set.
    pub const fn new(kernels: K) -> Self {
        Self { kernels }
    }

    /// The wrapped kernel set.
    pub const fn kernels(&self) -> &K {
        &self.kernels
    }

    /// Computes L1 attention scores `[batch, key, query, heads]` from
    /// `q` and `k`, both `[batch, context, heads, width]`.
    ///
    /// # Errors
    /// [`L1AttnError::InvalidArgument`] if an input is on the wrong backend,
    /// not contiguous, not rank 4, or if the shapes differ; otherwise
    /// whatever the kernel returns.
    pub fn forward(&self, q: &Ten32, k: &Ten32) -> Result<Ten32> {
        self.check_input(q, "q")?;
        self.check_input(k, "k")?;
        let [_, n_ctx, _, width] = dims4(q, "q")?;
        expect_shape(k, "k", dims4(q, "q")?)?;
        check_width(width)?;

        let path = KernelPath::select(n_ctx, width);
        log::debug!("l1attn forward: {path:?} kernel for shape {:?}", q.shape());

        match path {
            KernelPath::Tiled => {
                // bthw -> bhtw, bshw -> bhsw
                let q = q.transpose(1, 2).contiguous();
                let k = k.transpose(1, 2).contiguous();
                self.kernels.forward_tiled(&q, &k)
            }
            KernelPath::General => self.kernels.forward_general(q, k),
        }
    }

    /// Computes `(dq, dk)` from the gradient of the attention scores.
    ///
    /// `d_attn` is `[batch, key, query, heads]`, as produced by
    /// [`Dispatcher::forward`].
    ///
    /// # Errors
    /// Same conditions as [`Dispatcher::forward`], plus `d_attn` not matching
    /// `[batch, context, context, heads]`.
    pub fn backward(&self, d_attn: &Ten32, q: &Ten32, k: &Ten32) -> Result<(Ten32, Ten32)> {
        self.check_input(d_attn, "d_attn")?;
        self.check_input(q, "q")?;
        self.check_input(k, "k")?;
        let [bs, n_ctx, n_heads, width] = dims4(q, "q")?;
        expect_shape(k, "k", [bs, n_ctx, n_heads, width])?;
        expect_shape(d_attn, "d_attn", [bs, n_ctx, n_ctx, n_heads])?;
        check_width(width)?;

        let path = KernelPath::select(n_ctx, width);
        log::debug!("l1attn backward: {path:?} kernel for shape {:?}", q.shape());

        match path {
            KernelPath::Tiled => {
                let d_attn = d_attn.transpose(1, 3).contiguous(); // bsth -> bhts
                let q = q.transpose(1, 2).contiguous(); // bthw -> bhtw
                let k = k.transpose(1, 2).contiguous(); // bshw -> bhsw
                self.kernels.backward_tiled(&d_attn, &q, &k)
            }
            KernelPath::General => {
                let (d_attn_q, d_attn_k) = general_gradient_layouts(d_attn);
                // strided reads over t and s become unit-stride
                let q = q.transpose(1, 3).contiguous(); // bthw -> bwht
                let k = k.transpose(1, 3).contiguous(); // bshw -> bwhs
                self.kernels.backward_general(&d_attn_q, &d_attn_k, &q, &k)
            }
        }
    }

    fn check_input(&self, t: &Ten32, name: &'static str) -> Result<()> {
        let expected = self.kernels.backend();
        if t.backend() != expected {
            return Err(L1AttnError::invalid(name, format!("a {expected} tensor")));
        }
        if !t.is_contiguous() {
            return Err(L1AttnError::invalid(name, "contiguous"));
        }
        Ok(())
    }
}

fn check_width(width: usize) -> Result<()> {
    if width == 0 {
        return Err(L1AttnError::invalid("q", "of non-zero width"));
    }
    Ok(())
}

/// The two gradient layouts the general backward kernel reads, both
/// contiguous copies of `d_attn` (`bsth`).
///
/// The first (`bths`) serves the query gradient, which reduces over `s`;
/// the second (`bsht`) serves the key gradient, which reduces over `t`.
#[must_use]
pub fn general_gradient_layouts(d_attn: &Ten32) -> (Ten32, Ten32) {
    let d_attn_q = d_attn.transpose(1, 3).transpose(1, 2).contiguous(); // bsth -> bhts -> bths
    let d_attn_k = d_attn.transpose(2, 3).contiguous(); // bsth -> bsht
    (d_attn_q, d_attn_k)
}

/// Forward on the kernel set of the default backend.
///
/// # Errors
/// [`L1AttnError::BackendUnavailable`] if the default backend is not compiled
/// in; otherwise as [`Dispatcher::forward`].
pub fn forward(q: &Ten32, k: &Ten32) -> Result<Ten32> {
    match get_backend() {
        Backend::Cpu => Dispatcher::new(super::cpu::CpuKernels).forward(q, k),
        Backend::Wgpu => {
            #[cfg(feature = "wgpu")]
            {
                Dispatcher::new(super::wgpu::WgpuKernels).forward(q, k)
            }
            #[cfg(not(feature = "wgpu"))]
            {
                Err(L1AttnError::BackendUnavailable(Backend::Wgpu))
            }
        }
    }
}

/// Backward on the kernel set of the default backend.
///
/// # Errors
/// [`L1AttnError::BackendUnavailable`] if the default backend is not compiled
/// in; otherwise as [`Dispatcher::backward`].
pub fn backward(d_attn: &Ten32, q: &Ten32, k: &Ten32) -> Result<(Ten32, Ten32)> {
    match get_backend() {
        Backend::Cpu => Dispatcher::new(super::cpu::CpuKernels).backward(d_attn, q, k),
        Backend::Wgpu => {
            #[cfg(feature = "wgpu")]
            {
                Dispatcher::new(super::wgpu::WgpuKernels).backward(d_attn, q, k)
            }
            #[cfg(not(feature = "wgpu"))]
            {
                Err(L1AttnError::BackendUnavailable(Backend::Wgpu))
            }
        }
    }
}
