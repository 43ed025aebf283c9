//! l1attn: L1-distance attention kernels with a validating dispatch layer.
//!
//! Attention scores are negative, scaled L1 distances between query and key
//! vectors rather than dot products:
//!
//! ```text
//! attn[b, s, t, h] = -1/sqrt(width) * Σ_w |q[b, t, h, w] - k[b, s, h, w]|
//! ```
//!
//! # Features
//!
//! - Strided tensors with zero-copy transposes, tagged with a device.
//! - Argument validation (device, contiguity, shape) before any kernel runs.
//! - A tiled fast path for contexts divisible by 16 and widths 16, 32 or 64,
//!   and a general path for everything else.
//! - Manual backpropagation closures, plus a sparse variant over explicit
//!   coordinate lists.
//!
//! # Modules
//!
//! - [`tensors`]: strided tensor views and gradient holders.
//! - [`ops`]: kernel dispatch and the CPU / `wgpu` kernel sets.
//! - [`backprop`]: differentiable L1 attention.
//! - [`sparse`]: sparse L1 attention with a softmax over coordinates.
//! - [`bindings`]: named entry points for host environments.
//!
//! # Example
//!
//! ```rust
//! use l1attn::tensors::Tensor;
//! use l1attn::ops::dispatch::forward;
//!
//! let q = Tensor::new(vec![1, 16, 2, 16], vec![0.5f32; 512]);
//! let k = Tensor::new(vec![1, 16, 2, 16], vec![0.0f32; 512]);
//! let attn = forward(&q, &k).unwrap();
//! assert_eq!(attn.shape(), &[1, 16, 16, 2]);
//! assert_eq!(attn.get(&[0, 3, 5, 1]), -2.0);
//! ```

pub mod approx;
pub mod backend;
pub mod backprop;
pub mod bindings;
pub mod error;
pub mod ops;
pub mod sparse;
pub mod tensors;

pub use error::{L1AttnError, Result};
