//! The autoregressive forward pass.
//!
//! Builds one step of the decoder for `N` new tokens at offset `n_past`:
//! per layer an RMS-normed self-attention block reading and extending the
//! KV cache, then a SwiGLU feed-forward block, with the intermediates
//! claimed from the scratch arena so no per-token allocation happens after
//! context init. Internal invariant violations (cache range, scratch
//! exhaustion) are programmer errors and panic.

use crate::cache::{KvBuf, KvCache, KvElement};
use crate::model::Model;
use crate::scratch::{BufId, ScratchArena};
use crate::vocab::TokenId;
use llama_kernels::{dequantize_row, matmul, rms_norm, rope_inplace, silu_inplace, softmax};
use rayon::prelude::*;

pub(crate) struct EvalRequest<'a> {
    pub tokens: &'a [TokenId],
    pub n_past: usize,
    pub logits_all: bool,
}

pub(crate) struct EvalOutput {
    /// Arena bytes claimed by this step, for the per-token memory probe.
    pub used_bytes: usize,
}

pub(crate) fn forward(
    model: &Model,
    kv: &mut KvCache,
    arena: &mut ScratchArena,
    req: &EvalRequest<'_>,
    logits_out: &mut Vec<f32>,
    embedding_out: &mut Vec<f32>,
) -> EvalOutput {
    let hp = &model.hparams;
    let n = req.tokens.len();
    let n_past = req.n_past;

    let n_embd = hp.n_embd as usize;
    let n_head = hp.n_head as usize;
    let n_vocab = hp.n_vocab as usize;
    let n_ctx = hp.n_ctx as usize;
    let n_ff = hp.n_ff() as usize;
    let n_rot = hp.n_rot as usize;
    let head_dim = hp.head_dim();

    assert!(n > 0, "eval called with no tokens");
    assert!(
        n_past + n <= n_ctx,
        "eval overruns the context window: n_past {n_past} + N {n} > n_ctx {n_ctx}"
    );
    assert!(
        req.tokens.iter().all(|&t| (t as usize) < n_vocab),
        "token id out of vocabulary range"
    );

    let n_kv = n_past + n;
    let mut bufs = arena.begin();

    // Layer input and output live in the main compute buffer; everything
    // with a bounded lifetime comes from the scratch regions.
    let inp_l = bufs.alloc(n * n_embd);
    let logits = bufs.alloc(n * n_vocab);

    bufs.use_buf(BufId::Scratch(0));
    let cur = bufs.alloc(n * n_embd);
    let q = bufs.alloc(n * n_embd);
    // Holds roped K rows until they are stored, then the per-head
    // attention output of the same size.
    let k_cur = bufs.alloc(n * n_embd);
    // Holds V rows until they are stored, then the projected attention
    // output.
    let v_cur = bufs.alloc(n * n_embd);
    let att = bufs.alloc(n_head * n * n_kv);

    bufs.use_buf(BufId::Scratch(1));
    let inp_ff = bufs.alloc(n * n_embd);
    let h = bufs.alloc(n * n_embd);
    let gate = bufs.alloc(n * n_ff);
    let up = bufs.alloc(n * n_ff);

    bufs.use_buf(BufId::Main);

    // Token embeddings.
    for (row, &token) in inp_l.chunks_exact_mut(n_embd).zip(req.tokens) {
        dequantize_row(
            model.tok_embeddings.dtype,
            model.tok_embeddings.row(token as usize),
            row,
        );
    }

    let scale = (head_dim as f32).sqrt().recip();

    for (il, layer) in model.layers.iter().enumerate() {
        bufs.use_buf(BufId::Scratch(0));

        // Attention block.
        rms_norm(cur, inp_l, layer.attention_norm.as_f32());

        matmul(q, &layer.wq, cur);
        matmul(k_cur, &layer.wk, cur);
        matmul(v_cur, &layer.wv, cur);

        // The cache stores the roped K; this is part of its contract.
        rope_inplace(q, head_dim, n_rot, n_past, n);
        rope_inplace(k_cur, head_dim, n_rot, n_past, n);

        match (&mut kv.k, &mut kv.v) {
            (KvBuf::F32(k), KvBuf::F32(v)) => {
                store_kv(k, v, k_cur, v_cur, il, n_past, n, n_ctx, n_embd)
            }
            (KvBuf::F16(k), KvBuf::F16(v)) => {
                store_kv(k, v, k_cur, v_cur, il, n_past, n, n_ctx, n_embd)
            }
            _ => unreachable!("k and v share an element type"),
        }

        // k_cur is free again; it receives the per-head attention output.
        match (&kv.k, &kv.v) {
            (KvBuf::F32(k), KvBuf::F32(v)) => attention(
                k, v, q, att, k_cur, il, n_past, n, n_head, head_dim, n_ctx, n_embd, scale,
            ),
            (KvBuf::F16(k), KvBuf::F16(v)) => attention(
                k, v, q, att, k_cur, il, n_past, n, n_head, head_dim, n_ctx, n_embd, scale,
            ),
            _ => unreachable!("k and v share an element type"),
        }

        // Merge heads back to token-major order, reusing `cur`.
        for t in 0..n {
            for head in 0..n_head {
                let src = &k_cur[(head * n + t) * head_dim..(head * n + t + 1) * head_dim];
                cur[t * n_embd + head * head_dim..t * n_embd + (head + 1) * head_dim]
                    .copy_from_slice(src);
            }
        }

        // Output projection; v_cur is free and receives it.
        matmul(v_cur, &layer.wo, cur);

        bufs.use_buf(BufId::Scratch(1));

        // Residual.
        for ((ff, &attn), &inp) in inp_ff.iter_mut().zip(v_cur.iter()).zip(inp_l.iter()) {
            *ff = attn + inp;
        }

        // Feed-forward block. `h` holds the normed input, then (once the
        // gate and up projections have consumed it) the w2 output.
        rms_norm(h, inp_ff, layer.ffn_norm.as_f32());

        matmul(gate, &layer.w1, h);
        matmul(up, &layer.w3, h);

        silu_inplace(gate);
        for (g, &u) in gate.iter_mut().zip(up.iter()) {
            *g *= u;
        }

        matmul(h, &layer.w2, gate);

        // Residual into the next layer's input.
        for ((inp, &ff_out), &ff_in) in inp_l.iter_mut().zip(h.iter()).zip(inp_ff.iter()) {
            *inp = ff_out + ff_in;
        }
    }

    bufs.use_buf(BufId::Scratch(0));

    // Final norm; this is also where embeddings are read from.
    rms_norm(cur, inp_l, model.norm.as_f32());

    if !embedding_out.is_empty() {
        embedding_out.copy_from_slice(&cur[(n - 1) * n_embd..n * n_embd]);
    }

    bufs.use_buf(BufId::Main);

    matmul(logits, &model.output, cur);

    if req.logits_all {
        logits_out.resize(n_vocab * n, 0.0);
        logits_out.copy_from_slice(logits);
    } else {
        logits_out.resize(n_vocab, 0.0);
        logits_out.copy_from_slice(&logits[(n - 1) * n_vocab..]);
    }

    kv.n = kv.n.max(n_kv);

    EvalOutput {
        used_bytes: bufs.used_bytes(),
    }
}

/// Store the step's roped keys and transposed values into the cache at
/// layer `il`, positions `[n_past, n_past + n)`.
#[allow(clippy::too_many_arguments)]
fn store_kv<T: KvElement>(
    k_cache: &mut [T],
    v_cache: &mut [T],
    k_cur: &[f32],
    v_cur: &[f32],
    il: usize,
    n_past: usize,
    n: usize,
    n_ctx: usize,
    n_embd: usize,
) {
    // K: rows by position.
    let k_base = (il * n_ctx + n_past) * n_embd;
    for (dst, &src) in k_cache[k_base..k_base + n * n_embd].iter_mut().zip(k_cur) {
        *dst = T::from_f32(src);
    }

    // V: column-major [n_ctx, n_embd] slab per layer, stride n_ctx between
    // embedding components.
    let v_base = il * n_ctx * n_embd;
    for t in 0..n {
        for e in 0..n_embd {
            v_cache[v_base + e * n_ctx + n_past + t] = T::from_f32(v_cur[t * n_embd + e]);
        }
    }
}

/// Causal attention over cached positions `[0, n_past + n)`.
///
/// `out` receives head-major `[n_head, n, head_dim]` rows; `att` is the
/// per-head score matrix `[n_head, n, n_past + n]`. The causal mask is
/// realised by bounding each query's scan at its own absolute position.
#[allow(clippy::too_many_arguments)]
fn attention<T: KvElement>(
    k_cache: &[T],
    v_cache: &[T],
    q: &[f32],
    att: &mut [f32],
    out: &mut [f32],
    il: usize,
    n_past: usize,
    n: usize,
    n_head: usize,
    head_dim: usize,
    n_ctx: usize,
    n_embd: usize,
    scale: f32,
) {
    let n_kv = n_past + n;
    let layer_k = &k_cache[il * n_ctx * n_embd..];
    let layer_v = &v_cache[il * n_ctx * n_embd..];

    att.par_chunks_mut(n * n_kv)
        .zip(out.par_chunks_mut(n * head_dim))
        .zip((0..n_head).into_par_iter())
        .for_each(|((att_head, out_head), head)| {
            for t in 0..n {
                let q_row = &q[t * n_embd + head * head_dim..t * n_embd + (head + 1) * head_dim];
                // Positions this query may attend to.
                let visible = n_past + t + 1;
                let att_row = &mut att_head[t * n_kv..t * n_kv + visible];

                for (j, score) in att_row.iter_mut().enumerate() {
                    let k_row = &layer_k[j * n_embd + head * head_dim..];
                    *score = q_row
                        .iter()
                        .zip(&k_row[..head_dim])
                        .map(|(&qv, &kv)| qv * kv.to_f32())
                        .sum::<f32>()
                        * scale;
                }

                softmax(att_row);

                let out_row = &mut out_head[t * head_dim..(t + 1) * head_dim];
                out_row.fill(0.0);
                for (d, out_val) in out_row.iter_mut().enumerate() {
                    let v_col = &layer_v[(head * head_dim + d) * n_ctx..];
                    *out_val = att_row
                        .iter()
                        .zip(&v_col[..visible])
                        .map(|(&a, &vv)| a * vv.to_f32())
                        .sum::<f32>();
                }
            }
        });
}
