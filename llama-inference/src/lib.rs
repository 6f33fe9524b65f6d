//! CPU inference engine for LLaMA-family checkpoints.
//!
//! The engine loads sharded GGML-family checkpoint files into a
//! memory-efficient tensor layout (optionally memory-mapped), runs the
//! autoregressive forward pass against a persistent KV cache, tokenizes
//! with the SentencePiece greedy-merge algorithm, and samples under
//! temperature / top-k / top-p / repetition-penalty controls. A secondary
//! operation re-encodes a checkpoint to a block-quantised variant.
//!
//! ```no_run
//! use llama_inference::{ContextParams, LlamaContext};
//!
//! # fn main() -> llama_inference::Result<()> {
//! let params = ContextParams::builder().n_ctx(512).seed(42).build();
//! let mut ctx = LlamaContext::init("models/7B/ggml-model-q4_0.bin".as_ref(), params)?;
//!
//! let tokens = ctx.tokenize("The capital of France is", true);
//! ctx.eval(&tokens, 0, 4)?;
//! let next = ctx.sample_top_p_top_k(&tokens, 40, 0.95, 0.8, 1.1);
//! print!("{}", ctx.token_to_str(next));
//! # Ok(())
//! # }
//! ```

mod cache;
mod context;
mod error;
mod eval;
mod format;
mod loader;
mod model;
mod quantize;
mod sampler;
mod scratch;
mod state;
mod tokenizer;
mod vocab;

pub use cache::{KvCache, KvDtype};
pub use context::{system_info, ContextParams, ContextParamsBuilder, LlamaContext, ProgressCallback};
pub use error::{LlamaError, Result};
pub use format::{FileSaver, FileVersion, ShardFile};
pub use loader::{ModelLoader, SplitMode, TensorRecord};
pub use model::{Ftype, Hparams, Layer, Model, ModelKind};
pub use quantize::model_quantize;
pub use sampler::{sample_top_p_top_k, Rng};
pub use scratch::MAX_SCRATCH_BUFFERS;
pub use tokenizer::tokenize;
pub use vocab::{TokenId, TokenScore, Vocab, TOKEN_BOS, TOKEN_EOS, TOKEN_UNKNOWN};
