//! Parallel CPU backend kernels
//!
//! # CPU Backend
//!
//! Default kernel set for L1 attention, used when the default backend is
//! [`Backend::Cpu`].
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon); every kernel
//!   splits its output into disjoint chunks, so no locking is needed
//! - Tiled kernels monomorphised per width (16, 32, 64) over stack tiles
//!
//! ## Design Goals
//!
//! - Deterministic results: each output element is reduced by one thread in
//!   a fixed order
//! - Kernels validate their own operand shapes and contiguity, so they can be
//!   called without the dispatcher

use super::L1AttnKernels;
use crate::backend::Backend;
use crate::error::Result;
use crate::tensors::Ten32;

pub mod general;
pub mod tiled;

/// CPU implementation of the four L1 attention kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernels;

impl L1AttnKernels for CpuKernels {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn forward_general(&self, q: &Ten32, k: &Ten32) -> Result<Ten32> {
        general::forward(q, k)
    }

    fn forward_tiled(&self, q: &Ten32, k: &Ten32) -> Result<Ten32> {
        tiled::forward(q, k)
    }

    fn backward_general(
        &self,
        d_attn_q: &Ten32,
        d_attn_k: &Ten32,
        q: &Ten32,
        k: &Ten32,
    ) -> Result<(Ten32, Ten32)> {
        general::backward(d_attn_q, d_attn_k, q, k)
    }

    fn backward_tiled(&self, d_attn: &Ten32, q: &Ten32, k: &Ten32) -> Result<(Ten32, Ten32)> {
        tiled::backward(d_attn, q, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::assert_close;
    use crate::error::L1AttnError;
    use crate::ops::dispatch::{general_gradient_layouts, Dispatcher};
    use crate::ops::scale;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random(shape: [usize; 4], rng: &mut StdRng) -> Ten32 {
        let n = shape.iter().product();
        let data = (0..n).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        Ten32::new(shape.to_vec(), data).to_backend(Backend::Cpu)
    }

    /// Direct evaluation of the score definition on `bthw` inputs.
    fn reference_forward(q: &Ten32, k: &Ten32) -> Vec<f32> {
        let [b, n, h, w] = <[usize; 4]>::try_from(q.shape()).unwrap();
        let mut out = Vec::with_capacity(b * n * n * h);
        for bi in 0..b {
            for s in 0..n {
                for t in 0..n {
                    for hi in 0..h {
                        let d: f32 = (0..w)
                            .map(|wi| (q.get(&[bi, t, hi, wi]) - k.get(&[bi, s, hi, wi])).abs())
                            .sum();
                        out.push(scale(w) * d);
                    }
                }
            }
        }
        out
    }

    /// Central-difference gradient of `sum(attn * d_attn)` with respect to
    /// `q`, evaluated in `f64`. The loss is piecewise linear in `q`, so the
    /// difference is exact away from ties.
    fn numeric_dq(q: &Ten32, k: &Ten32, d_attn: &Ten32) -> Vec<f64> {
        let [b, n, h, w] = <[usize; 4]>::try_from(q.shape()).unwrap();
        let scale = f64::from(scale(w));
        let loss = |qv: &[f64]| -> f64 {
            let mut total = 0.0;
            for bi in 0..b {
                for s in 0..n {
                    for t in 0..n {
                        for hi in 0..h {
                            let dist: f64 = (0..w)
                                .map(|wi| {
                                    let qi = ((bi * n + t) * h + hi) * w + wi;
                                    (qv[qi] - f64::from(k.get(&[bi, s, hi, wi]))).abs()
                                })
                                .sum();
                            total += f64::from(d_attn.get(&[bi, s, t, hi])) * scale * dist;
                        }
                    }
                }
            }
            total
        };
        let base: Vec<f64> = q.to_vec().into_iter().map(f64::from).collect();
        let eps = 1e-6;
        (0..base.len())
            .map(|i| {
                let mut plus = base.clone();
                plus[i] += eps;
                let mut minus = base.clone();
                minus[i] -= eps;
                (loss(&plus) - loss(&minus)) / (2.0 * eps)
            })
            .collect()
    }

    #[test]
    fn general_forward_matches_definition() {
        let mut rng = StdRng::seed_from_u64(7);
        let q = random([2, 5, 3, 7], &mut rng);
        let k = random([2, 5, 3, 7], &mut rng);
        let attn = general::forward(&q, &k).unwrap();
        assert_eq!(attn.shape(), &[2, 5, 5, 3]);
        assert_close(&attn.to_vec(), &reference_forward(&q, &k));
    }

    #[test]
    fn scores_are_scaled_l1_distances() {
        let q = Ten32::new(vec![1, 1, 1, 4], vec![0.0, 1.0, 2.0, 3.0]);
        let k = Ten32::new(vec![1, 1, 1, 4], vec![1.0, 1.0, 0.0, 0.0]);
        let attn = general::forward(&q, &k).unwrap();
        // |0-1| + |1-1| + |2-0| + |3-0| = 6, scale = -1/2
        assert_eq!(attn.to_vec(), vec![-3.0]);
    }

    #[test]
    fn tiled_forward_agrees_with_general_for_every_width() {
        let mut rng = StdRng::seed_from_u64(11);
        for width in [16, 32, 64] {
            let q = random([2, 32, 3, width], &mut rng);
            let k = random([2, 32, 3, width], &mut rng);
            let general = general::forward(&q, &k).unwrap();
            let tiled = tiled::forward(
                &q.transpose(1, 2).contiguous(),
                &k.transpose(1, 2).contiguous(),
            )
            .unwrap();
            assert_eq!(tiled.shape(), general.shape());
            assert_close(&tiled.to_vec(), &general.to_vec());
        }
    }

    #[test]
    fn tiled_backward_agrees_with_general() {
        let mut rng = StdRng::seed_from_u64(13);
        for width in [16, 32, 64] {
            let (b, n, h) = (2, 16, 2);
            let q = random([b, n, h, width], &mut rng);
            let k = random([b, n, h, width], &mut rng);
            let d_attn = random([b, n, n, h], &mut rng);

            let (gq, gk) = general_gradient_layouts(&d_attn);
            let (dq_g, dk_g) = general::backward(
                &gq,
                &gk,
                &q.transpose(1, 3).contiguous(),
                &k.transpose(1, 3).contiguous(),
            )
            .unwrap();
            let (dq_t, dk_t) = tiled::backward(
                &d_attn.transpose(1, 3).contiguous(),
                &q.transpose(1, 2).contiguous(),
                &k.transpose(1, 2).contiguous(),
            )
            .unwrap();
            assert_close(&dq_t.to_vec(), &dq_g.to_vec());
            assert_close(&dk_t.to_vec(), &dk_g.to_vec());
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(17);
        let q = random([1, 3, 2, 5], &mut rng);
        let k = random([1, 3, 2, 5], &mut rng);
        let d_attn = random([1, 3, 3, 2], &mut rng);
        let (dq, _) = Dispatcher::new(CpuKernels).backward(&d_attn, &q, &k).unwrap();
        let expected = numeric_dq(&q, &k, &d_attn);
        for (&got, &want) in dq.to_vec().iter().zip(&expected) {
            assert!((f64::from(got) - want).abs() < 1e-3, "{got} vs {want}");
        }
    }

    #[test]
    fn key_gradient_mirrors_query_gradient() {
        // swapping q and k negates the sign term and transposes the score
        let mut rng = StdRng::seed_from_u64(19);
        let q = random([1, 4, 1, 3], &mut rng);
        let k = random([1, 4, 1, 3], &mut rng);
        let d_attn = random([1, 4, 4, 1], &mut rng);
        let d = Dispatcher::new(CpuKernels);
        let (_, dk) = d.backward(&d_attn, &q, &k).unwrap();
        let swapped = d_attn.transpose(1, 2).contiguous();
        let (dq_swapped, _) = d.backward(&swapped, &k, &q).unwrap();
        assert_close(&dk.to_vec(), &dq_swapped.to_vec());
    }

    #[test]
    fn tiled_kernels_reject_unsupported_operands() {
        let q = Ten32::zeros(vec![1, 1, 16, 24]);
        assert!(matches!(
            tiled::forward(&q, &q),
            Err(L1AttnError::UnsupportedWidth(24))
        ));
        let q = Ten32::zeros(vec![1, 1, 20, 16]);
        assert!(matches!(
            tiled::forward(&q, &q),
            Err(L1AttnError::InvalidArgument { arg: "q", .. })
        ));
    }

    #[test]
    fn empty_batch_produces_empty_outputs() {
        let q = Ten32::zeros(vec![0, 16, 2, 16]);
        let attn = Dispatcher::new(CpuKernels).forward(&q, &q).unwrap();
        assert_eq!(attn.shape(), &[0, 16, 16, 2]);
        assert_eq!(attn.numel(), 0);
    }
}
