use crate::error::Result;
use crate::ops::{data, dims4, expect_shape, scale, sign};
use crate::tensors::Ten32;
use rayon::prelude::*;

/// L1 attention scores for any shape.
///
/// `q: [b, t, h, w]`, `k: [b, s, h, w]` → `attn: [b, s, t, h]`.
pub fn forward(q: &Ten32, k: &Ten32) -> Result<Ten32> {
    let [bs, n_ctx, n_heads, width] = dims4(q, "q")?;
    expect_shape(k, "k", [bs, n_ctx, n_heads, width])?;
    let q_data = data(q, "q")?;
    let k_data = data(k, "k")?;
    let scale = scale(width);

    let row = n_ctx * n_heads;
    let mut out = vec![0.0; bs * n_ctx * row];
    if row > 0 {
        // one row per (b, s), holding every (t, h)
        out.par_chunks_mut(row).enumerate().for_each(|(bs_idx, attn_row)| {
            let (b, s) = (bs_idx / n_ctx, bs_idx % n_ctx);
            for t in 0..n_ctx {
                for h in 0..n_heads {
                    let qo = ((b * n_ctx + t) * n_heads + h) * width;
                    let ko = ((b * n_ctx + s) * n_heads + h) * width;
                    let dist: f32 = q_data[qo..qo + width]
                        .iter()
                        .zip(&k_data[ko..ko + width])
                        .map(|(&x, &y)| (x - y).abs())
                        .sum();
                    attn_row[t * n_heads + h] = scale * dist;
                }
            }
        });
    }

    Ok(Ten32::new(vec![bs, n_ctx, n_ctx, n_heads], out).to_backend(q.backend()))
}

/// Gradients of the scores with respect to `q` and `k`, for any shape.
///
/// Inputs: `d_attn_q: [b, t, h, s]`, `d_attn_k: [b, s, h, t]`,
/// `q: [b, w, h, t]`, `k: [b, w, h, s]`.
/// Outputs: `dq: [b, t, h, w]`, `dk: [b, s, h, w]`.
pub fn backward(
    d_attn_q: &Ten32,
    d_attn_k: &Ten32,
    q: &Ten32,
    k: &Ten32,
) -> Result<(Ten32, Ten32)> {
    let [bs, width, n_heads, n_ctx] = dims4(q, "q")?;
    expect_shape(k, "k", [bs, width, n_heads, n_ctx])?;
    expect_shape(d_attn_q, "d_attn_q", [bs, n_ctx, n_heads, n_ctx])?;
    expect_shape(d_attn_k, "d_attn_k", [bs, n_ctx, n_heads, n_ctx])?;
    let dq_in = data(d_attn_q, "d_attn_q")?;
    let dk_in = data(d_attn_k, "d_attn_k")?;
    let q_data = data(q, "q")?;
    let k_data = data(k, "k")?;
    let scale = scale(width);

    // q and k are [b, w, h, ctx]: the context index has unit stride
    let qk = |b: usize, w: usize, h: usize| ((b * width + w) * n_heads + h) * n_ctx;

    let row = n_heads * width;
    let mut dq = vec![0.0; bs * n_ctx * row];
    let mut dk = vec![0.0; bs * n_ctx * row];
    if row > 0 {
        rayon::join(
            || {
                dq.par_chunks_mut(row).enumerate().for_each(|(bt, dq_row)| {
                    let (b, t) = (bt / n_ctx, bt % n_ctx);
                    for h in 0..n_heads {
                        let g = &dq_in[((b * n_ctx + t) * n_heads + h) * n_ctx..][..n_ctx];
                        for w in 0..width {
                            let base = qk(b, w, h);
                            let qv = q_data[base + t];
                            let ks = &k_data[base..base + n_ctx];
                            let acc: f32 = g.iter().zip(ks).map(|(&d, &kv)| d * sign(qv - kv)).sum();
                            dq_row[h * width + w] = scale * acc;
                        }
                    }
                });
            },
            || {
                dk.par_chunks_mut(row).enumerate().for_each(|(bsi, dk_row)| {
                    let (b, s) = (bsi / n_ctx, bsi % n_ctx);
                    for h in 0..n_heads {
                        let g = &dk_in[((b * n_ctx + s) * n_heads + h) * n_ctx..][..n_ctx];
                        for w in 0..width {
                            let base = qk(b, w, h);
                            let kv = k_data[base + s];
                            let qs = &q_data[base..base + n_ctx];
                            let acc: f32 = g.iter().zip(qs).map(|(&d, &qv)| d * sign(qv - kv)).sum();
                            dk_row[h * width + w] = -scale * acc;
                        }
                    }
                });
            },
        );
    }

    let backend = q.backend();
    Ok((
        Ten32::new(vec![bs, n_ctx, n_heads, width], dq).to_backend(backend),
        Ten32::new(vec![bs, n_ctx, n_heads, width], dk).to_backend(backend),
    ))
}
