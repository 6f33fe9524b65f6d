//! CPU compute kernels for the llama-oxide inference engine.
//!
//! This crate owns everything below the model layer: tensor element types
//! and their block formats, block (de)quantisation, and the small set of
//! numeric routines the forward pass is built from (matmul, RMS norm,
//! RoPE, softmax, SILU). The engine core treats this crate as an opaque
//! kernel library and only consumes its API.

mod ops;
mod quant;
mod types;

pub use half::f16;
pub use ops::{matmul, rms_norm, rope_inplace, silu_inplace, softmax};
pub use quant::{
    dequantize_row, quantize_q4_0, quantize_q4_1, vec_dot, QuantizeOutput, HISTOGRAM_BINS,
};
pub use types::{Tensor, TensorType};

/// Whether the kernels are backed by a BLAS implementation. The pure-Rust
/// backend never is; callers use this to decide threading for large batches.
pub const fn has_blas() -> bool {
    false
}
