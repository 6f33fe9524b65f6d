//! The inference context: owns the model, the KV cache, the scratch
//! arena, the RNG and the output buffers, and exposes the engine's public
//! entry points. A context is single-threaded from the caller's side;
//! parallelism only exists inside a forward pass.

use crate::cache::{KvCache, KvDtype};
use crate::error::{LlamaError, Result};
use crate::eval::{forward, EvalRequest};
use crate::loader::ModelLoader;
use crate::model::{Hparams, Model};
use crate::sampler::{sample_top_p_top_k, Rng};
use crate::scratch::ScratchArena;
use crate::tokenizer;
use crate::vocab::{TokenId, Vocab, TOKEN_BOS, TOKEN_EOS};
use log::info;
use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Load-progress callback, invoked with a fraction in [0, 1].
pub type ProgressCallback = Box<dyn FnMut(f32) + Send>;

/// Context creation parameters.
pub struct ContextParams {
    /// Context window; overrides the checkpoint default.
    pub n_ctx: u32,
    /// RNG seed; zero or negative means "derive from the current time".
    pub seed: i32,
    /// Store the KV cache in F16 instead of F32.
    pub f16_kv: bool,
    /// Keep logits for every evaluated token, not just the last.
    pub logits_all: bool,
    /// Load the vocabulary only; the context can tokenize but not eval.
    pub vocab_only: bool,
    /// Map the checkpoint instead of reading it.
    pub use_mmap: bool,
    /// Lock the mapping in memory so hot weights are never paged out.
    pub use_mlock: bool,
    /// Keep the final-norm embedding of the last evaluated token.
    pub embedding: bool,
    /// Invoked during the load with a fraction in [0, 1]. Defaults to a
    /// dot-per-percent printer on stderr.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 512,
            seed: 0,
            f16_kv: false,
            logits_all: false,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ContextParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextParams")
            .field("n_ctx", &self.n_ctx)
            .field("seed", &self.seed)
            .field("f16_kv", &self.f16_kv)
            .field("logits_all", &self.logits_all)
            .field("vocab_only", &self.vocab_only)
            .field("use_mmap", &self.use_mmap)
            .field("use_mlock", &self.use_mlock)
            .field("embedding", &self.embedding)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl ContextParams {
    pub fn builder() -> ContextParamsBuilder {
        ContextParamsBuilder::default()
    }
}

#[derive(Default)]
pub struct ContextParamsBuilder {
    params: ContextParams,
}

impl ContextParamsBuilder {
    pub fn n_ctx(mut self, n_ctx: u32) -> Self {
        self.params.n_ctx = n_ctx;
        self
    }
    pub fn seed(mut self, seed: i32) -> Self {
        self.params.seed = seed;
        self
    }
    pub fn f16_kv(mut self, f16_kv: bool) -> Self {
        self.params.f16_kv = f16_kv;
        self
    }
    pub fn logits_all(mut self, logits_all: bool) -> Self {
        self.params.logits_all = logits_all;
        self
    }
    pub fn vocab_only(mut self, vocab_only: bool) -> Self {
        self.params.vocab_only = vocab_only;
        self
    }
    pub fn use_mmap(mut self, use_mmap: bool) -> Self {
        self.params.use_mmap = use_mmap;
        self
    }
    pub fn use_mlock(mut self, use_mlock: bool) -> Self {
        self.params.use_mlock = use_mlock;
        self
    }
    pub fn embedding(mut self, embedding: bool) -> Self {
        self.params.embedding = embedding;
        self
    }
    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.params.progress_callback = Some(callback);
        self
    }
    pub fn build(self) -> ContextParams {
        self.params
    }
}

#[derive(Debug, Default)]
struct Timings {
    t_load: Duration,
    t_sample: Duration,
    n_sample: u32,
    t_eval: Duration,
    n_eval: u32,
    t_p_eval: Duration,
    n_p_eval: u32,
}

pub(crate) struct EngineState {
    pub model: Model,
    pub kv: KvCache,
    pub scratch: ScratchArena,
    pub mem_per_token: usize,
}

pub struct LlamaContext {
    pub(crate) vocab: Vocab,
    pub(crate) hparams: Hparams,
    pub(crate) engine: Option<EngineState>,

    pub(crate) rng: Rng,
    pub(crate) logits: Vec<f32>,
    /// Reserved logits capacity in elements; fixed at init and part of the
    /// state blob contract.
    pub(crate) logits_capacity: usize,
    pub(crate) logits_all: bool,
    pub(crate) embedding: Vec<f32>,

    pool: Option<(usize, rayon::ThreadPool)>,
    t_start: Instant,
    has_evaluated_once: bool,
    timings: Timings,
}

impl LlamaContext {
    /// Load a checkpoint and build a ready-to-eval context.
    pub fn init(path: &Path, mut params: ContextParams) -> Result<Self> {
        let t_start = Instant::now();

        let seed = if params.seed <= 0 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(1)
        } else {
            params.seed as u64
        };

        let mut progress = params.progress_callback.take().unwrap_or_else(|| {
            let mut cur_percentage = 0u32;
            Box::new(move |fraction: f32| {
                let percentage = (100.0 * fraction) as u32;
                while percentage > cur_percentage {
                    cur_percentage += 1;
                    eprint!(".");
                    std::io::stderr().flush().ok();
                    if cur_percentage >= 100 {
                        eprintln!();
                    }
                }
            })
        });

        let mut loader = ModelLoader::open(path, params.use_mmap, params.vocab_only)?;
        let vocab = loader.take_vocab();

        if params.vocab_only {
            let mut hparams = *loader.hparams();
            hparams.n_ctx = params.n_ctx;
            return Ok(Self {
                vocab,
                hparams,
                engine: None,
                rng: Rng::new(seed),
                logits: Vec::new(),
                logits_capacity: 0,
                logits_all: params.logits_all,
                embedding: Vec::new(),
                pool: None,
                t_start,
                has_evaluated_once: false,
                timings: Timings::default(),
            });
        }

        let model = Model::load(&mut loader, params.n_ctx, params.use_mlock, &mut *progress)?;
        let hparams = model.hparams;

        let memory_type = if params.f16_kv {
            KvDtype::F16
        } else {
            KvDtype::F32
        };
        let kv = KvCache::init(&hparams, memory_type, hparams.n_ctx as usize)?;
        let scratch = ScratchArena::new(model.kind, &hparams)?;

        let n_vocab = hparams.n_vocab as usize;
        let logits_capacity = if params.logits_all {
            hparams.n_ctx as usize * n_vocab
        } else {
            n_vocab
        };
        let mut logits = Vec::new();
        logits.try_reserve_exact(logits_capacity).map_err(|_| {
            LlamaError::OutOfMemory(format!("logits buffer of {logits_capacity} elements"))
        })?;

        let embedding = if params.embedding {
            vec![0.0; hparams.n_embd as usize]
        } else {
            Vec::new()
        };

        let mut ctx = Self {
            vocab,
            hparams,
            engine: Some(EngineState {
                model,
                kv,
                scratch,
                mem_per_token: 0,
            }),
            rng: Rng::new(seed),
            logits,
            logits_capacity,
            logits_all: params.logits_all,
            embedding,
            pool: None,
            t_start,
            has_evaluated_once: false,
            timings: Timings::default(),
        };
        ctx.timings.t_load = t_start.elapsed();
        Ok(ctx)
    }

    /// Run the transformer on `tokens` at offset `n_past`.
    ///
    /// On success the logits of the last token (or of every token with
    /// `logits_all`) are available through [`LlamaContext::logits`], and
    /// the KV cache holds this step's keys and values at positions
    /// `[n_past, n_past + tokens.len())`.
    pub fn eval(&mut self, tokens: &[TokenId], n_past: usize, n_threads: usize) -> Result<()> {
        let t_start = Instant::now();
        let n = tokens.len();

        let engine = self.engine.as_mut().ok_or_else(|| {
            LlamaError::Inconsistent("context was created vocab_only; it cannot eval".into())
        })?;

        // With BLAS-backed kernels and a big batch, worker threads would
        // only spin-wait on the BLAS calls.
        let n_threads = if n >= 32 && llama_kernels::has_blas() {
            1
        } else {
            n_threads
        };

        // The pool is rebuilt only when the caller changes the thread count.
        if !matches!(&self.pool, Some((cached, _)) if *cached == n_threads) {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(n_threads)
                .build()
                .map_err(|e| LlamaError::Io(std::io::Error::other(e)))?;
            self.pool = Some((n_threads, pool));
        }
        let (_, pool) = self.pool.as_ref().expect("thread pool installed above");

        let req = EvalRequest {
            tokens,
            n_past,
            logits_all: self.logits_all,
        };
        let output = pool.install(|| {
            forward(
                &engine.model,
                &mut engine.kv,
                &mut engine.scratch,
                &req,
                &mut self.logits,
                &mut self.embedding,
            )
        });

        if engine.mem_per_token == 0 {
            engine.mem_per_token = output.used_bytes / n;
        }

        // Loading is lazy under mmap; the first eval gives the honest
        // figure including the deferred page faults.
        if !self.has_evaluated_once {
            self.timings.t_load = self.t_start.elapsed();
            self.has_evaluated_once = true;
        }

        if n == 1 {
            self.timings.t_eval += t_start.elapsed();
            self.timings.n_eval += 1;
        } else {
            self.timings.t_p_eval += t_start.elapsed();
            self.timings.n_p_eval += n as u32;
        }
        Ok(())
    }

    /// Sample the next token from the last evaluated position.
    pub fn sample_top_p_top_k(
        &mut self,
        last_n_tokens: &[TokenId],
        top_k: i32,
        top_p: f32,
        temp: f32,
        repeat_penalty: f32,
    ) -> TokenId {
        let t_start = Instant::now();
        let n_vocab = self.hparams.n_vocab as usize;
        assert!(
            self.logits.len() >= n_vocab,
            "sample called before the first eval"
        );
        let logits = &self.logits[self.logits.len() - n_vocab..];

        let id = sample_top_p_top_k(
            logits,
            last_n_tokens,
            top_k,
            top_p,
            temp,
            repeat_penalty,
            &mut self.rng,
        );

        self.timings.t_sample += t_start.elapsed();
        self.timings.n_sample += 1;
        id
    }

    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        tokenizer::tokenize(&self.vocab, text, add_bos)
    }

    /// C-style tokenize with a caller buffer: `Err` carries the capacity
    /// the call would have needed.
    pub fn tokenize_into(
        &self,
        text: &str,
        out: &mut [TokenId],
        add_bos: bool,
    ) -> std::result::Result<usize, usize> {
        let tokens = self.tokenize(text, add_bos);
        if tokens.len() > out.len() {
            return Err(tokens.len());
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        Ok(tokens.len())
    }

    pub fn n_vocab(&self) -> usize {
        self.vocab.n_vocab()
    }

    pub fn n_ctx(&self) -> usize {
        self.hparams.n_ctx as usize
    }

    pub fn n_embd(&self) -> usize {
        self.hparams.n_embd as usize
    }

    /// Logits of the last eval: `n_vocab` values, or `n_vocab` per token
    /// when the context keeps them all.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    /// Final-norm embedding of the last evaluated token; empty unless the
    /// context was created with `embedding`.
    pub fn embeddings(&self) -> &[f32] {
        &self.embedding
    }

    pub fn token_bytes(&self, id: TokenId) -> Option<&[u8]> {
        self.vocab.token_bytes(id)
    }

    pub fn token_to_str(&self, id: TokenId) -> Cow<'_, str> {
        self.vocab.token_to_str(id)
    }

    pub fn token_bos() -> TokenId {
        TOKEN_BOS
    }

    pub fn token_eos() -> TokenId {
        TOKEN_EOS
    }

    /// Tokens currently stored in the KV cache.
    pub fn kv_cache_token_count(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.kv.n)
    }

    /// Size in bytes of the KV cache buffers.
    pub fn kv_cache_size(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.kv.nbytes())
    }

    /// Snapshot of the raw KV cache (keys then values).
    pub fn kv_cache_data(&self) -> Vec<u8> {
        match &self.engine {
            Some(e) => {
                let mut out = Vec::with_capacity(e.kv.nbytes());
                out.extend_from_slice(e.kv.k.as_bytes());
                out.extend_from_slice(e.kv.v.as_bytes());
                out
            }
            None => Vec::new(),
        }
    }

    /// Replace the KV cache contents. `data` must be exactly
    /// [`LlamaContext::kv_cache_size`] bytes of a matching cache.
    pub fn set_kv_cache(&mut self, data: &[u8], n_token_count: usize) -> Result<()> {
        let engine = self.engine.as_mut().ok_or_else(|| {
            LlamaError::Inconsistent("context was created vocab_only; it has no kv cache".into())
        })?;
        if data.len() != engine.kv.nbytes() {
            return Err(LlamaError::Inconsistent(format!(
                "kv cache size mismatch: got {} bytes, cache holds {}",
                data.len(),
                engine.kv.nbytes()
            )));
        }
        let k_bytes = engine.kv.k.nbytes();
        engine.kv.k.copy_from_bytes(&data[..k_bytes]);
        engine.kv.v.copy_from_bytes(&data[k_bytes..]);
        engine.kv.n = n_token_count;
        Ok(())
    }

    pub fn print_timings(&self) {
        let t = &self.timings;
        let per = |d: Duration, n: u32| d.as_secs_f64() * 1e3 / n.max(1) as f64;
        eprintln!();
        eprintln!("        load time = {:8.2} ms", t.t_load.as_secs_f64() * 1e3);
        eprintln!(
            "      sample time = {:8.2} ms / {:5} runs   ({:8.2} ms per run)",
            t.t_sample.as_secs_f64() * 1e3,
            t.n_sample,
            per(t.t_sample, t.n_sample)
        );
        eprintln!(
            " prompt eval time = {:8.2} ms / {:5} tokens ({:8.2} ms per token)",
            t.t_p_eval.as_secs_f64() * 1e3,
            t.n_p_eval,
            per(t.t_p_eval, t.n_p_eval)
        );
        eprintln!(
            "        eval time = {:8.2} ms / {:5} runs   ({:8.2} ms per run)",
            t.t_eval.as_secs_f64() * 1e3,
            t.n_eval,
            per(t.t_eval, t.n_eval)
        );
        eprintln!(
            "       total time = {:8.2} ms",
            self.t_start.elapsed().as_secs_f64() * 1e3
        );
    }

    pub fn reset_timings(&mut self) {
        self.t_start = Instant::now();
        self.timings = Timings {
            t_load: self.timings.t_load,
            ..Timings::default()
        };
    }

    /// Arena bytes consumed per token by the first eval; zero before it.
    pub fn mem_per_token(&self) -> usize {
        self.engine.as_ref().map_or(0, |e| e.mem_per_token)
    }

    /// Log the scratch regions' high-watermarks, for sizing diagnostics.
    pub fn log_scratch_watermarks(&self) {
        if let Some(engine) = &self.engine {
            info!(
                "scratch high-watermarks: {:.3} MB / {:.3} MB",
                engine.scratch.max_used(0) as f64 / (1024.0 * 1024.0),
                engine.scratch.max_used(1) as f64 / (1024.0 * 1024.0),
            );
        }
    }
}

/// Compile-time kernel capabilities and the thread default, in the
/// traditional one-line format.
pub fn system_info() -> String {
    format!(
        "AVX = {} | AVX2 = {} | AVX512 = {} | FMA = {} | NEON = {} | F16C = {} | BLAS = {} | SSE3 = {} | threads = {}",
        cfg!(target_feature = "avx") as u8,
        cfg!(target_feature = "avx2") as u8,
        cfg!(target_feature = "avx512f") as u8,
        cfg!(target_feature = "fma") as u8,
        cfg!(target_feature = "neon") as u8,
        cfg!(target_feature = "f16c") as u8,
        llama_kernels::has_blas() as u8,
        cfg!(target_feature = "sse3") as u8,
        std::thread::available_parallelism().map_or(1, |n| n.get()),
    )
}
