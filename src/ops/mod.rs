//! # Operation Dispatch Layer
//!
//! This module routes L1 attention calls to a kernel set and defines the
//! seam every kernel set implements.
//!
//! ## Submodules
//!
//! - [`dispatch`]: validation, kernel path selection and layout permutation
//! - [`cpu`]: multi-threaded CPU kernels (default backend)
//! - [`wgpu`] *(opt-in)*: WGSL compute shader kernels using `wgpu`
//!
//! ## Kernel Layouts
//!
//! With `b` batch, `t` query position, `s` key position, `h` head, `w` width
//! and `scale = -1/sqrt(width)`:
//!
//! | kernel            | inputs                                   | outputs                 |
//! |-------------------|------------------------------------------|-------------------------|
//! | general forward   | `q: bthw`, `k: bshw`                     | `attn: bsth`            |
//! | tiled forward     | `q: bhtw`, `k: bhsw`                     | `attn: bsth`            |
//! | general backward  | `dq_in: bths`, `dk_in: bsht`, `q: bwht`, `k: bwhs` | `dq: bthw`, `dk: bshw` |
//! | tiled backward    | `d_attn: bhts`, `q: bhtw`, `k: bhsw`     | `dq: bthw`, `dk: bshw`  |
//!
//! `attn[b,s,t,h] = scale * Σ_w |q[b,t,h,w] - k[b,s,h,w]|`.
//!
//! ## Feature Flags
//!
//! - `wgpu`: Enables the `wgpu` (WebGPU) backend

use crate::backend::Backend;
use crate::error::{L1AttnError, Result};
use crate::tensors::Ten32;

pub mod dispatch;

pub mod cpu;

#[cfg(feature = "wgpu")]
pub mod wgpu;

/// The four kernels an L1 attention backend provides.
///
/// Every input is contiguous and laid out as listed in the module docs; the
/// dispatcher guarantees this before calling in.
pub trait L1AttnKernels {
    /// The backend whose tensors these kernels consume.
    fn backend(&self) -> Backend;

    /// General forward for any shape.
    fn forward_general(&self, q: &Ten32, k: &Ten32) -> Result<Ten32>;

    /// Forward for contexts divisible by 16 and widths 16, 32 or 64.
    fn forward_tiled(&self, q: &Ten32, k: &Ten32) -> Result<Ten32>;

    /// General backward, taking the gradient in two layouts.
    fn backward_general(
        &self,
        d_attn_q: &Ten32,
        d_attn_k: &Ten32,
        q: &Ten32,
        k: &Ten32,
    ) -> Result<(Ten32, Ten32)>;

    /// Backward for contexts divisible by 16 and widths 16, 32 or 64.
    fn backward_tiled(&self, d_attn: &Ten32, q: &Ten32, k: &Ten32) -> Result<(Ten32, Ten32)>;
}

/// `-1/sqrt(width)`; negative so a following softmax favours small distances.
#[must_use]
pub fn scale(width: usize) -> f32 {
    -1.0 / (width as f32).sqrt()
}

/// Sign with `sign(0) == 0`, unlike [`f32::signum`].
#[inline]
pub(crate) fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Reads the four axes of an attention operand.
pub(crate) fn dims4(t: &Ten32, name: &'static str) -> Result<[usize; 4]> {
    <[usize; 4]>::try_from(t.shape())
        .map_err(|_| L1AttnError::invalid(name, format!("rank 4, got shape {:?}", t.shape())))
}

/// The contiguous element slice of a kernel operand.
pub(crate) fn data<'a>(t: &'a Ten32, name: &'static str) -> Result<&'a [f32]> {
    t.as_slice()
        .ok_or_else(|| L1AttnError::invalid(name, "contiguous"))
}

/// Fails unless `t` has exactly `expected` as its shape.
pub(crate) fn expect_shape(t: &Ten32, name: &'static str, expected: [usize; 4]) -> Result<()> {
    if t.shape() == expected {
        Ok(())
    } else {
        Err(L1AttnError::invalid(
            name,
            format!("of shape {expected:?}, got {:?}", t.shape()),
        ))
    }
}
