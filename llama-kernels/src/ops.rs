use crate::quant::vec_dot;
use crate::types::Tensor;
use rayon::prelude::*;

/// Epsilon for numerical stability in RMS normalisation.
const RMS_NORM_EPS: f32 = 1e-6;

/// RoPE frequency base.
const ROPE_BASE_FREQ: f32 = 10000.0;

/// Batched matrix product `out = x · Wᵀ` with a typed weight matrix.
///
/// `w` has shape `[n_in, n_out]` (row length `n_in`), `x` holds
/// `n_tokens` activation rows of `n_in` f32 values, and `out` receives
/// `n_tokens` rows of `n_out` values. Each output element is an
/// independent dot product, parallelised across the pool that the caller
/// installs.
pub fn matmul(out: &mut [f32], w: &Tensor, x: &[f32]) {
    let n_in = w.ne[0];
    let n_out = w.ne[1];
    assert!(n_in > 0 && x.len() % n_in == 0);
    let n_tokens = x.len() / n_in;
    assert_eq!(out.len(), n_tokens * n_out);

    out.par_iter_mut().enumerate().for_each(|(i, out_val)| {
        let token = i / n_out;
        let row = i % n_out;
        *out_val = vec_dot(w.dtype, w.row(row), &x[token * n_in..(token + 1) * n_in]);
    });
}

/// RMS-normalise each `weight.len()`-sized row of `x` into `out` and scale
/// by the broadcast norm weight.
pub fn rms_norm(out: &mut [f32], x: &[f32], weight: &[f32]) {
    debug_assert_eq!(out.len(), x.len());
    let n = weight.len();
    debug_assert_eq!(x.len() % n, 0);

    for (out_row, row) in out.chunks_exact_mut(n).zip(x.chunks_exact(n)) {
        let sum_of_squares = row.iter().map(|&v| v * v).sum::<f32>();
        let inv_rms = ((sum_of_squares / n as f32) + RMS_NORM_EPS).sqrt().recip();
        for ((o, &v), &w) in out_row.iter_mut().zip(row).zip(weight) {
            *o = w * (inv_rms * v);
        }
    }
}

/// Apply rotary position embeddings in place.
///
/// `x` is laid out `[n_tokens, n_heads, head_dim]`; the first `n_rot`
/// dimensions of every head are rotated pairwise, with token `i` at
/// absolute position `n_past + i`. Pairs are interleaved: `(x[2j], x[2j+1])`
/// rotate together at frequency `base^(-2j/n_rot)`.
pub fn rope_inplace(x: &mut [f32], head_dim: usize, n_rot: usize, n_past: usize, n_tokens: usize) {
    debug_assert!(n_rot <= head_dim && n_rot % 2 == 0);
    debug_assert_eq!(x.len() % (n_tokens * head_dim), 0);
    let theta_scale = ROPE_BASE_FREQ.powf(-2.0 / n_rot as f32);

    for (i, token) in x.chunks_exact_mut(x.len() / n_tokens).enumerate() {
        let pos = (n_past + i) as f32;
        for head in token.chunks_exact_mut(head_dim) {
            let mut theta = pos;
            for pair in head[..n_rot].chunks_exact_mut(2) {
                let (sin, cos) = theta.sin_cos();
                let x0 = pair[0];
                let x1 = pair[1];
                pair[0] = x0 * cos - x1 * sin;
                pair[1] = x0 * sin + x1 * cos;
                theta *= theta_scale;
            }
        }
    }
}

/// In-place softmax over `x`.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let sum = x
        .iter_mut()
        .map(|v| {
            *v = (*v - max_val).exp();
            *v
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|v| *v *= inv_sum);
}

/// In-place SILU activation: `x · sigmoid(x)`.
pub fn silu_inplace(x: &mut [f32]) {
    for v in x.iter_mut() {
        *v *= (1.0 + (-*v).exp()).recip();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TensorType;
    use std::borrow::Cow;

    fn f32_tensor(ne: [usize; 2], values: &[f32]) -> Tensor {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Tensor::new(TensorType::F32, ne, Cow::Owned(bytes))
    }

    #[test]
    fn matmul_identity() {
        // 3x3 identity: output rows equal input rows.
        let mut w = vec![0.0f32; 9];
        for i in 0..3 {
            w[i * 3 + i] = 1.0;
        }
        let w = f32_tensor([3, 3], &w);
        let x = [1.0, 2.0, 3.0, -1.0, 0.5, 4.0];
        let mut out = [0.0f32; 6];
        matmul(&mut out, &w, &x);
        assert_eq!(out, x);
    }

    #[test]
    fn rms_norm_unit_weight_normalises() {
        let weight = [1.0f32; 4];
        let x = [2.0f32, 2.0, 2.0, 2.0];
        let mut out = [0.0f32; 4];
        rms_norm(&mut out, &x, &weight);
        // RMS of the row is 2, so every element normalises to ~1.
        for v in out {
            assert!((v - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn softmax_sums_to_one() {
        let mut x = [0.5f32, 1.5, -0.5, 3.0];
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(x.windows(2).all(|w| w[0] > 0.0 && w[1] > 0.0));
    }

    #[test]
    fn rope_at_position_zero_is_identity() {
        let orig: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut x = orig.clone();
        rope_inplace(&mut x, 4, 4, 0, 1);
        for (a, b) in x.iter().zip(&orig) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn rope_preserves_pair_norms() {
        let mut x: Vec<f32> = (0..8).map(|i| (i + 1) as f32).collect();
        let orig = x.clone();
        rope_inplace(&mut x, 4, 4, 7, 2);
        for (pair, opair) in x.chunks_exact(2).zip(orig.chunks_exact(2)) {
            let n0 = pair[0].hypot(pair[1]);
            let n1 = opair[0].hypot(opair[1]);
            assert!((n0 - n1).abs() < 1e-4);
        }
    }
}
