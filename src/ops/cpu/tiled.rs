//! Tiled kernels: 16-position context tiles, width fixed at compile time.
//!
//! Each tile of queries and keys is copied into stack arrays once and reused
//! for the full 16x16 block of pairs.

use crate::error::{L1AttnError, Result};
use crate::ops::dispatch::TILE;
use crate::ops::{data, dims4, expect_shape, scale, sign};
use crate::tensors::Ten32;
use rayon::prelude::*;

type TileRows<const W: usize> = [[f32; W]; TILE];

/// Tiled scores. `q: [b, h, t, w]`, `k: [b, h, s, w]` → `attn: [b, s, t, h]`.
pub fn forward(q: &Ten32, k: &Ten32) -> Result<Ten32> {
    match tiled_width(q)? {
        16 => forward_w::<16>(q, k),
        32 => forward_w::<32>(q, k),
        64 => forward_w::<64>(q, k),
        w => Err(L1AttnError::UnsupportedWidth(w)),
    }
}

/// Tiled gradients. `d_attn: [b, h, t, s]`, `q: [b, h, t, w]`,
/// `k: [b, h, s, w]` → `dq: [b, t, h, w]`, `dk: [b, s, h, w]`.
pub fn backward(d_attn: &Ten32, q: &Ten32, k: &Ten32) -> Result<(Ten32, Ten32)> {
    match tiled_width(q)? {
        16 => backward_w::<16>(d_attn, q, k),
        32 => backward_w::<32>(d_attn, q, k),
        64 => backward_w::<64>(d_attn, q, k),
        w => Err(L1AttnError::UnsupportedWidth(w)),
    }
}

fn tiled_width(q: &Ten32) -> Result<usize> {
    let [_, _, n_ctx, width] = dims4(q, "q")?;
    if n_ctx % TILE != 0 {
        return Err(L1AttnError::invalid(
            "q",
            format!("a context length divisible by {TILE}, got {n_ctx}"),
        ));
    }
    Ok(width)
}

/// Copies `TILE` consecutive rows of width `W` starting at row `first`.
fn load_rows<const W: usize>(src: &[f32], first: usize) -> TileRows<W> {
    let mut rows = [[0.0; W]; TILE];
    for (i, row) in rows.iter_mut().enumerate() {
        let o = (first + i) * W;
        row.copy_from_slice(&src[o..o + W]);
    }
    rows
}

fn l1<const W: usize>(a: &[f32; W], b: &[f32; W]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| (x - y).abs()).sum()
}

fn forward_w<const W: usize>(q: &Ten32, k: &Ten32) -> Result<Ten32> {
    let [bs, n_heads, n_ctx, _] = dims4(q, "q")?;
    expect_shape(k, "k", [bs, n_heads, n_ctx, W])?;
    let q_data = data(q, "q")?;
    let k_data = data(k, "k")?;
    let scale = scale(W);
    let tiles = n_ctx / TILE;

    // out is [b, s, t, h]: one chunk per (b, key tile)
    let chunk = TILE * n_ctx * n_heads;
    let mut out = vec![0.0; bs * n_ctx * n_ctx * n_heads];
    if chunk > 0 {
        out.par_chunks_mut(chunk).enumerate().for_each(|(c, block)| {
            let (b, s0) = (c / tiles, (c % tiles) * TILE);
            for h in 0..n_heads {
                let head = (b * n_heads + h) * n_ctx;
                let kt = load_rows::<W>(k_data, head + s0);
                for t0 in (0..n_ctx).step_by(TILE) {
                    let qt = load_rows::<W>(q_data, head + t0);
                    for (j, k_row) in kt.iter().enumerate() {
                        for (i, q_row) in qt.iter().enumerate() {
                            block[(j * n_ctx + t0 + i) * n_heads + h] = scale * l1(q_row, k_row);
                        }
                    }
                }
            }
        });
    }

    Ok(Ten32::new(vec![bs, n_ctx, n_ctx, n_heads], out).to_backend(q.backend()))
}

fn backward_w<const W: usize>(d_attn: &Ten32, q: &Ten32, k: &Ten32) -> Result<(Ten32, Ten32)> {
    let [bs, n_heads, n_ctx, _] = dims4(q, "q")?;
    expect_shape(k, "k", [bs, n_heads, n_ctx, W])?;
    expect_shape(d_attn, "d_attn", [bs, n_heads, n_ctx, n_ctx])?;
    let d_data = data(d_attn, "d_attn")?;
    let q_data = data(q, "q")?;
    let k_data = data(k, "k")?;
    let scale = scale(W);
    let tiles = n_ctx / TILE;

    // d_attn is [b, h, t, s]
    let grad_tile = |head: usize, t0: usize, s0: usize| {
        let mut g = [[0.0f32; TILE]; TILE];
        for (i, row) in g.iter_mut().enumerate() {
            let o = (head + t0 + i) * n_ctx + s0;
            row.copy_from_slice(&d_data[o..o + TILE]);
        }
        g
    };

    // outputs are [b, ctx, h, w]: one chunk per (b, context tile)
    let chunk = TILE * n_heads * W;
    let mut dq = vec![0.0; bs * n_ctx * n_heads * W];
    let mut dk = vec![0.0; bs * n_ctx * n_heads * W];
    if chunk > 0 {
        rayon::join(
            || {
                dq.par_chunks_mut(chunk).enumerate().for_each(|(c, block)| {
                    let (b, t0) = (c / tiles, (c % tiles) * TILE);
                    for h in 0..n_heads {
                        let head = (b * n_heads + h) * n_ctx;
                        let qt = load_rows::<W>(q_data, head + t0);
                        let mut acc = [[0.0f32; W]; TILE];
                        for s0 in (0..n_ctx).step_by(TILE) {
                            let kt = load_rows::<W>(k_data, head + s0);
                            let g = grad_tile(head, t0, s0);
                            for (i, acc_row) in acc.iter_mut().enumerate() {
                                for (j, k_row) in kt.iter().enumerate() {
                                    let gij = g[i][j];
                                    for w in 0..W {
                                        acc_row[w] += gij * sign(qt[i][w] - k_row[w]);
                                    }
                                }
                            }
                        }
                        for (i, acc_row) in acc.iter().enumerate() {
                            let o = (i * n_heads + h) * W;
                            for (dst, &a) in block[o..o + W].iter_mut().zip(acc_row) {
                                *dst = scale * a;
                            }
                        }
                    }
                });
            },
            || {
                dk.par_chunks_mut(chunk).enumerate().for_each(|(c, block)| {
                    let (b, s0) = (c / tiles, (c % tiles) * TILE);
                    for h in 0..n_heads {
                        let head = (b * n_heads + h) * n_ctx;
                        let kt = load_rows::<W>(k_data, head + s0);
                        let mut acc = [[0.0f32; W]; TILE];
                        for t0 in (0..n_ctx).step_by(TILE) {
                            let qt = load_rows::<W>(q_data, head + t0);
                            let g = grad_tile(head, t0, s0);
                            for (j, acc_row) in acc.iter_mut().enumerate() {
                                for (i, q_row) in qt.iter().enumerate() {
                                    let gij = g[i][j];
                                    for w in 0..W {
                                        acc_row[w] += gij * sign(q_row[w] - kt[j][w]);
                                    }
                                }
                            }
                        }
                        for (j, acc_row) in acc.iter().enumerate() {
                            let o = (j * n_heads + h) * W;
                            for (dst, &a) in block[o..o + W].iter_mut().zip(acc_row) {
                                *dst = -scale * a;
                            }
                        }
                    }
                });
            },
        );
    }

    let backend = q.backend();
    Ok((
        Ten32::new(vec![bs, n_ctx, n_heads, W], dq).to_backend(backend),
        Ten32::new(vec![bs, n_ctx, n_heads, W], dk).to_backend(backend),
    ))
}
