//! Sparse L1 attention over an explicit coordinate list.
//!
//! Instead of scoring every query against every key, only the `(dst, src)`
//! pairs of a coordinate list are scored. Each destination takes a softmax
//! over its own pairs and mixes the values of their sources:
//!
//! ```text
//! score(dst, src) = -1/sqrt(w) * Σ_w |q[b,dst,h,w] - k[b,src,h,w]|
//! p               = softmax over the pairs of dst
//! out[b,dst,h,:]  = Σ p * v[b,src,h,:]
//! ```
//!
//! With every pair present this is dense L1 attention followed by a softmax
//! over keys. Runs on the host with `rayon` across the batch.

use crate::error::{L1AttnError, Result};
use crate::ops::{dims4, scale, sign};
use crate::tensors::Ten32;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// One coordinate after expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CooEntry {
    /// Query / output position.
    pub dst: usize,
    /// Key / value position.
    pub src: usize,
    /// Index of this entry among the entries sharing its `dst`.
    pub dst_slot: usize,
    /// Index of this entry among the entries sharing its `src`.
    pub src_slot: usize,
}

/// An expanded coordinate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coo {
    entries: Vec<CooEntry>,
    dst_slots: usize,
    src_slots: usize,
}

impl Coo {
    /// The entries, in input order.
    #[must_use]
    pub fn entries(&self) -> &[CooEntry] {
        &self.entries
    }

    /// Most entries sharing one destination (softmax width).
    #[must_use]
    pub const fn dst_slots(&self) -> usize {
        self.dst_slots
    }

    /// Most entries sharing one source.
    #[must_use]
    pub const fn src_slots(&self) -> usize {
        self.src_slots
    }

    /// Entry indices grouped by destination, for `n_tok` positions.
    fn by_dst(&self, n_tok: usize) -> Vec<Vec<usize>> {
        let mut rows = vec![Vec::new(); n_tok];
        for (i, e) in self.entries.iter().enumerate() {
            rows[e.dst].push(i);
        }
        rows
    }
}

/// Expands `[dst, src]` pairs with per-destination and per-source slot
/// counters.
///
/// Positions below the largest destination that are never written, and
/// positions below the largest source that are never read, are logged as
/// degenerate. Counters are keyed by position, so coordinates are not range
/// checked here; [`l1attn_sparse`] rejects those past the token count.
#[must_use]
pub fn expand_coo(pairs: &[[usize; 2]]) -> Coo {
    let mut dst_count: BTreeMap<usize, usize> = BTreeMap::new();
    let mut src_count: BTreeMap<usize, usize> = BTreeMap::new();

    let entries = pairs
        .iter()
        .map(|&[dst, src]| {
            let dst_slot = dst_count.entry(dst).or_insert(0);
            let src_slot = src_count.entry(src).or_insert(0);
            let e = CooEntry {
                dst,
                src,
                dst_slot: *dst_slot,
                src_slot: *src_slot,
            };
            *dst_slot += 1;
            *src_slot += 1;
            e
        })
        .collect();

    warn_gaps(&dst_count, "destination", "not written");
    warn_gaps(&src_count, "source", "not read");

    Coo {
        entries,
        dst_slots: dst_count.into_values().max().unwrap_or(0),
        src_slots: src_count.into_values().max().unwrap_or(0),
    }
}

/// Logs every run of positions below the largest key that has no entries.
fn warn_gaps(counts: &BTreeMap<usize, usize>, role: &str, what: &str) {
    let mut next = 0usize;
    for &pos in counts.keys() {
        match pos - next {
            0 => {}
            1 => log::warn!("degenerate sparse head: {role} {next} {what}"),
            _ => log::warn!("degenerate sparse head: {role}s {next}..{pos} {what}"),
        }
        next = pos.saturating_add(1);
    }
}

/// Backward closure of [`l1attn_sparse`]: `d_out -> (dv, dq, dk)`.
pub type SparseBackward = dyn Fn(&Ten32) -> Result<(Ten32, Ten32, Ten32)>;

/// Sparse L1 attention.
///
/// `v`, `q` and `k` are `[batch, n_tok, heads, width]`. Destinations with no
/// entries produce zeros.
///
/// # Errors
/// [`L1AttnError::InvalidArgument`] if shapes differ, are not rank 4, or a
/// coordinate is out of range.
pub fn l1attn_sparse(
    v: &Ten32,
    q: &Ten32,
    k: &Ten32,
    coo: &Coo,
) -> Result<(Ten32, Box<SparseBackward>)> {
    let shape = dims4(q, "q")?;
    for (t, name) in [(k, "k"), (v, "v")] {
        if t.shape() != shape {
            return Err(L1AttnError::invalid(
                name,
                format!("of shape {shape:?}, got {:?}", t.shape()),
            ));
        }
    }
    let [bs, n_tok, n_heads, width] = shape;
    if let Some(e) = coo.entries().iter().find(|e| e.dst >= n_tok || e.src >= n_tok) {
        return Err(L1AttnError::invalid(
            "coo",
            format!("within {n_tok} tokens, got ({}, {})", e.dst, e.src),
        ));
    }

    let geom = Geometry {
        n_tok,
        n_heads,
        width,
        scale: scale(width),
    };
    let (q_data, k_data, v_data) = (q.to_vec(), k.to_vec(), v.to_vec());
    let rows = coo.by_dst(n_tok);
    let entries = coo.entries().to_vec();
    let n_entries = entries.len();
    let batch = n_tok * n_heads * width;

    // probabilities per (b, h, entry)
    let mut probs = vec![0.0f32; bs * n_heads * n_entries];
    let mut out = vec![0.0f32; bs * batch];
    if batch > 0 {
        out.par_chunks_mut(batch)
            .zip(probs.par_chunks_mut((n_heads * n_entries).max(1)))
            .enumerate()
            .for_each(|(b, (out_b, probs_b))| {
                let (q_b, k_b, v_b) = (
                    &q_data[b * batch..][..batch],
                    &k_data[b * batch..][..batch],
                    &v_data[b * batch..][..batch],
                );
                for h in 0..n_heads {
                    let p = &mut probs_b[h * n_entries..][..n_entries];
                    for (dst, row) in rows.iter().enumerate() {
                        if row.is_empty() {
                            continue;
                        }
                        let mut max = f32::NEG_INFINITY;
                        for &e in row {
                            let s = geom.score(q_b, k_b, dst, entries[e].src, h);
                            p[e] = s;
                            max = max.max(s);
                        }
                        let mut sum = 0.0;
                        for &e in row {
                            p[e] = (p[e] - max).exp();
                            sum += p[e];
                        }
                        let o = geom.at(dst, h);
                        for &e in row {
                            p[e] /= sum;
                            let vs = geom.at(entries[e].src, h);
                            for w in 0..width {
                                out_b[o + w] += p[e] * v_b[vs + w];
                            }
                        }
                    }
                }
            });
    }
    let result = Ten32::new(shape.to_vec(), out).to_backend(q.backend());
    let backend = q.backend();

    let back = move |d_out: &Ten32| -> Result<(Ten32, Ten32, Ten32)> {
        if d_out.shape() != shape {
            return Err(L1AttnError::invalid(
                "d_out",
                format!("of shape {shape:?}, got {:?}", d_out.shape()),
            ));
        }
        let g = d_out.to_vec();
        let mut dv = vec![0.0f32; bs * batch];
        let mut dq = vec![0.0f32; bs * batch];
        let mut dk = vec![0.0f32; bs * batch];
        if batch > 0 {
            dv.par_chunks_mut(batch)
                .zip(dq.par_chunks_mut(batch))
                .zip(dk.par_chunks_mut(batch))
                .enumerate()
                .for_each(|(b, ((dv_b, dq_b), dk_b))| {
                    let (q_b, k_b, v_b, g_b) = (
                        &q_data[b * batch..][..batch],
                        &k_data[b * batch..][..batch],
                        &v_data[b * batch..][..batch],
                        &g[b * batch..][..batch],
                    );
                    for h in 0..n_heads {
                        let p = &probs[(b * n_heads + h) * n_entries..][..n_entries];
                        for (dst, row) in rows.iter().enumerate() {
                            let o = geom.at(dst, h);
                            let g_row = &g_b[o..o + width];
                            // dL/dp for each entry of this destination
                            let dp: Vec<f32> = row
                                .iter()
                                .map(|&e| {
                                    let vs = geom.at(entries[e].src, h);
                                    g_row.iter().zip(&v_b[vs..vs + width]).map(|(a, b)| a * b).sum()
                                })
                                .collect();
                            let dot: f32 = row.iter().zip(&dp).map(|(&e, d)| p[e] * d).sum();
                            for (&e, &dpe) in row.iter().zip(&dp) {
                                let src = geom.at(entries[e].src, h);
                                let ds = p[e] * (dpe - dot) * geom.scale;
                                for w in 0..width {
                                    dv_b[src + w] += p[e] * g_row[w];
                                    let sg = sign(q_b[o + w] - k_b[src + w]);
                                    dq_b[o + w] += ds * sg;
                                    dk_b[src + w] -= ds * sg;
                                }
                            }
                        }
                    }
                });
        }
        Ok((
            Ten32::new(shape.to_vec(), dv).to_backend(backend),
            Ten32::new(shape.to_vec(), dq).to_backend(backend),
            Ten32::new(shape.to_vec(), dk).to_backend(backend),
        ))
    };

    Ok((result, Box::new(back)))
}

/// Parameterless sparse L1 attention layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct L1AttnSparse;

impl L1AttnSparse {
    /// Creates the layer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// See [`l1attn_sparse`].
    ///
    /// # Errors
    /// Whatever [`l1attn_sparse`] reports for the inputs.
    pub fn forward(
        &self,
        v: &Ten32,
        q: &Ten32,
        k: &Ten32,
        coo: &Coo,
    ) -> Result<(Ten32, Box<SparseBackward>)> {
        l1attn_sparse(v, q, k, coo)
    }
}

/// Index arithmetic for one batch item laid out `[n_tok, heads, width]`.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    n_tok: usize,
    n_heads: usize,
    width: usize,
    scale: f32,
}

impl Geometry {
    fn at(&self, tok: usize, h: usize) -> usize {
        debug_assert!(tok < self.n_tok);
        (tok * self.n_heads + h) * self.width
    }

    fn score(&self, q: &[f32], k: &[f32], dst: usize, src: usize, h: usize) -> f32 {
        let (qo, ko) = (self.at(dst, h), self.at(src, h));
        let dist: f32 = q[qo..qo + self.width]
            .iter()
            .zip(&k[ko..ko + self.width])
            .map(|(a, b)| (a - b).abs())
            .sum();
        self.scale * dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::assert_close;
    use crate::ops::cpu::CpuKernels;
    use crate::ops::dispatch::Dispatcher;

    #[test]
    fn expansion_counts_slots_in_input_order() {
        let coo = expand_coo(&[[0, 0], [0, 1], [1, 0], [1, 1], [2, 2]]);
        let slots: Vec<_> = coo.entries().iter().map(|e| (e.dst_slot, e.src_slot)).collect();
        assert_eq!(slots, vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 0)]);
        assert_eq!(coo.dst_slots(), 2);
        assert_eq!(coo.src_slots(), 2);
    }

    #[test]
    fn empty_list_expands_to_nothing() {
        let coo = expand_coo(&[]);
        assert!(coo.entries().is_empty());
        assert_eq!(coo.dst_slots(), 0);
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let t = Ten32::zeros(vec![1, 2, 1, 1]);
        let coo = expand_coo(&[[0, 2]]);
        assert!(matches!(
            l1attn_sparse(&t, &t, &t, &coo),
            Err(L1AttnError::InvalidArgument { arg: "coo", .. })
        ));
    }

    #[test]
    fn far_coordinates_expand_without_dense_counters() {
        let coo = expand_coo(&[[0, usize::MAX], [1 << 40, 3], [0, usize::MAX]]);
        let slots: Vec<_> = coo.entries().iter().map(|e| (e.dst_slot, e.src_slot)).collect();
        assert_eq!(slots, vec![(0, 0), (0, 0), (1, 1)]);
        assert_eq!(coo.dst_slots(), 2);
        assert_eq!(coo.src_slots(), 2);

        let t = Ten32::zeros(vec![1, 2, 1, 1]);
        let err = l1attn_sparse(&t, &t, &t, &coo).err().unwrap();
        assert!(matches!(err, L1AttnError::InvalidArgument { arg: "coo", .. }));
        assert!(err.to_string().starts_with("coo must be within 2 tokens"));
    }

    fn full_pairs(n: usize) -> Vec<[usize; 2]> {
        (0..n).flat_map(|dst| (0..n).map(move |src| [dst, src])).collect()
    }

    /// Values at quarter offsets so no `q - k` difference is near zero.
    fn staggered(shape: [usize; 4], stride: usize, modulus: usize, offset: f32) -> Ten32 {
        let n: usize = shape.iter().product();
        let data = (0..n)
            .map(|i| ((i * stride) % modulus) as f32 * 0.5 + offset)
            .collect();
        Ten32::new(shape.to_vec(), data)
    }

    #[test]
    fn full_coordinate_list_matches_dense_softmax_attention() {
        let shape = [2, 4, 2, 3];
        let q = staggered(shape, 7, 5, 0.25);
        let k = staggered(shape, 3, 4, 0.0);
        let v = staggered(shape, 5, 7, -1.0);
        let [b, n, h, w] = shape;

        let attn = Dispatcher::new(CpuKernels).forward(&q, &k).unwrap();
        let mut expected = vec![0.0f32; q.numel()];
        for bi in 0..b {
            for t in 0..n {
                for hi in 0..h {
                    let logits: Vec<f32> = (0..n).map(|s| attn.get(&[bi, s, t, hi])).collect();
                    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
                    let sum: f32 = exps.iter().sum();
                    for wi in 0..w {
                        expected[((bi * n + t) * h + hi) * w + wi] = (0..n)
                            .map(|s| exps[s] / sum * v.get(&[bi, s, hi, wi]))
                            .sum();
                    }
                }
            }
        }

        let (out, _) = l1attn_sparse(&v, &q, &k, &expand_coo(&full_pairs(n))).unwrap();
        assert_close(&out.to_vec(), &expected);

        // order of the coordinate list does not matter
        let mut shuffled = full_pairs(n);
        shuffled.reverse();
        shuffled.swap(1, 9);
        let (out, _) = l1attn_sparse(&v, &q, &k, &expand_coo(&shuffled)).unwrap();
        assert_close(&out.to_vec(), &expected);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let shape = [1, 3, 1, 3];
        let q = staggered(shape, 7, 5, 0.25);
        let k = staggered(shape, 3, 4, 0.0);
        let v = staggered(shape, 5, 7, -1.0);
        let g = staggered(shape, 2, 3, 0.5);
        let coo = expand_coo(&[[0, 0], [0, 2], [1, 0], [1, 1], [1, 2], [2, 1]]);

        let loss = |v: &Ten32, q: &Ten32, k: &Ten32| -> f32 {
            let (out, _) = l1attn_sparse(v, q, k, &coo).unwrap();
            out.to_vec().iter().zip(g.to_vec()).map(|(o, g)| o * g).sum()
        };
        let nudged = |t: &Ten32, i: usize, by: f32| {
            let mut data = t.to_vec();
            data[i] += by;
            Ten32::new(shape.to_vec(), data)
        };

        let (_, back) = l1attn_sparse(&v, &q, &k, &coo).unwrap();
        let (dv, dq, dk) = back(&g).unwrap();
        let eps = 1e-2;
        for i in 0..q.numel() {
            let num_v = (loss(&nudged(&v, i, eps), &q, &k) - loss(&nudged(&v, i, -eps), &q, &k))
                / (2.0 * eps);
            let num_q = (loss(&v, &nudged(&q, i, eps), &k) - loss(&v, &nudged(&q, i, -eps), &k))
                / (2.0 * eps);
            let num_k = (loss(&v, &q, &nudged(&k, i, eps)) - loss(&v, &q, &nudged(&k, i, -eps)))
                / (2.0 * eps);
            assert!((dv.to_vec()[i] - num_v).abs() < 2e-3, "dv[{i}]");
            assert!((dq.to_vec()[i] - num_q).abs() < 2e-3, "dq[{i}]");
            assert!((dk.to_vec()[i] - num_k).abs() < 2e-3, "dk[{i}]");
        }
    }

    #[test]
    fn layer_matches_free_function() {
        let shape = [1, 3, 2, 2];
        let q = staggered(shape, 7, 5, 0.25);
        let k = staggered(shape, 3, 4, 0.0);
        let v = staggered(shape, 5, 7, -1.0);
        let coo = expand_coo(&[[0, 0], [1, 2], [2, 0], [2, 1]]);

        let (expected, back) = l1attn_sparse(&v, &q, &k, &coo).unwrap();
        let (out, layer_back) = L1AttnSparse::new().forward(&v, &q, &k, &coo).unwrap();
        assert_eq!(out.to_vec(), expected.to_vec());

        let g = staggered(shape, 2, 3, 0.5);
        let (dv, dq, dk) = back(&g).unwrap();
        let (lv, lq, lk) = layer_back(&g).unwrap();
        assert_eq!(lv.to_vec(), dv.to_vec());
        assert_eq!(lq.to_vec(), dq.to_vec());
        assert_eq!(lk.to_vec(), dk.to_vec());
    }

    #[test]
    fn single_source_copies_its_value() {
        let q = Ten32::new(vec![1, 2, 1, 2], vec![0.0, 1.0, 2.0, 3.0]);
        let v = Ten32::new(vec![1, 2, 1, 2], vec![5.0, 6.0, 7.0, 8.0]);
        // dst 0 reads only src 1; dst 1 reads nothing
        let coo = expand_coo(&[[0, 1]]);
        let (out, _) = l1attn_sparse(&v, &q, &q, &coo).unwrap();
        assert_eq!(out.to_vec(), vec![7.0, 8.0, 0.0, 0.0]);
    }
}
