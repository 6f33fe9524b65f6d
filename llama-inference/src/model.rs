//! Model hyperparameters, weight layout and load-time wiring.

use crate::error::Result;
use crate::loader::ModelLoader;
use llama_kernels::Tensor;
use log::info;
use memmap2::Mmap;

const MB: usize = 1024 * 1024;

/// Model-wide declaration of how weights are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ftype {
    AllF32 = 0,
    MostlyF16 = 1,
    MostlyQ4_0 = 2,
    MostlyQ4_1 = 3,
    MostlyQ4_1SomeF16 = 4,
}

impl Ftype {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Ftype::AllF32),
            1 => Some(Ftype::MostlyF16),
            2 => Some(Ftype::MostlyQ4_0),
            3 => Some(Ftype::MostlyQ4_1),
            4 => Some(Ftype::MostlyQ4_1SomeF16),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Ftype::AllF32 => "all F32",
            Ftype::MostlyF16 => "mostly F16",
            Ftype::MostlyQ4_0 => "mostly Q4_0",
            Ftype::MostlyQ4_1 => "mostly Q4_1",
            Ftype::MostlyQ4_1SomeF16 => "mostly Q4_1, some F16",
        }
    }
}

/// Checkpoint hyperparameters. `n_ctx` is caller-supplied at context init
/// and zero while the struct describes a file, so shard comparison ignores
/// it naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hparams {
    pub n_vocab: u32,
    pub n_ctx: u32,
    pub n_embd: u32,
    pub n_mult: u32,
    pub n_head: u32,
    pub n_layer: u32,
    pub n_rot: u32,
    pub ftype: Ftype,
}

impl Hparams {
    /// Feed-forward width, rounded up to a multiple of `n_mult`.
    pub fn n_ff(&self) -> u32 {
        ((2 * (4 * self.n_embd) / 3 + self.n_mult - 1) / self.n_mult) * self.n_mult
    }

    pub fn head_dim(&self) -> usize {
        (self.n_embd / self.n_head) as usize
    }
}

/// Size class inferred from the layer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Unknown,
    Model7B,
    Model13B,
    Model30B,
    Model65B,
}

impl ModelKind {
    pub fn from_n_layer(n_layer: u32) -> Self {
        match n_layer {
            32 => ModelKind::Model7B,
            40 => ModelKind::Model13B,
            60 => ModelKind::Model30B,
            80 => ModelKind::Model65B,
            _ => ModelKind::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Unknown => "unknown",
            ModelKind::Model7B => "7B",
            ModelKind::Model13B => "13B",
            ModelKind::Model30B => "30B",
            ModelKind::Model65B => "65B",
        }
    }
}

// Scratch and eval buffer sizes per model class, computed for n_ctx == 2048.
// Region 0 carries the attention intermediates (normed input, Q/K/V rows and
// the score matrix), region 1 the feed-forward intermediates, and the eval
// buffer the layer input, attention output and logits.

const MEM_REQ_SCRATCH0: [(ModelKind, usize); 4] = [
    (ModelKind::Model7B, 704 * MB),
    (ModelKind::Model13B, 896 * MB),
    (ModelKind::Model30B, 1152 * MB),
    (ModelKind::Model65B, 1408 * MB),
];

const MEM_REQ_SCRATCH1: [(ModelKind, usize); 4] = [
    (ModelKind::Model7B, 256 * MB),
    (ModelKind::Model13B, 320 * MB),
    (ModelKind::Model30B, 448 * MB),
    (ModelKind::Model65B, 512 * MB),
];

const MEM_REQ_EVAL: [(ModelKind, usize); 4] = [
    (ModelKind::Model7B, 384 * MB),
    (ModelKind::Model13B, 384 * MB),
    (ModelKind::Model30B, 448 * MB),
    (ModelKind::Model65B, 512 * MB),
];

fn table_lookup(table: &[(ModelKind, usize)], kind: ModelKind) -> Option<usize> {
    table.iter().find(|(k, _)| *k == kind).map(|(_, size)| *size)
}

/// The tables are computed for a 2048-token window; contexts that are
/// larger, or size classes the tables do not know, fall back to sizes
/// derived from the actual hyperparameters.
fn sized_for_tables(kind: ModelKind, hparams: &Hparams) -> bool {
    kind != ModelKind::Unknown && hparams.n_ctx <= 2048
}

pub(crate) fn scratch0_bytes(kind: ModelKind, hparams: &Hparams) -> usize {
    if sized_for_tables(kind, hparams) {
        return table_lookup(&MEM_REQ_SCRATCH0, kind).unwrap();
    }
    let s = hparams.n_ctx as usize;
    let e = hparams.n_embd as usize;
    let h = hparams.n_head as usize;
    (5 * s * e + h * s * s) * 4 + 4 * MB
}

pub(crate) fn scratch1_bytes(kind: ModelKind, hparams: &Hparams) -> usize {
    if sized_for_tables(kind, hparams) {
        return table_lookup(&MEM_REQ_SCRATCH1, kind).unwrap();
    }
    let s = hparams.n_ctx as usize;
    let e = hparams.n_embd as usize;
    let f = hparams.n_ff() as usize;
    (2 * s * e + 2 * s * f) * 4 + 4 * MB
}

pub(crate) fn eval_bytes(kind: ModelKind, hparams: &Hparams) -> usize {
    if sized_for_tables(kind, hparams) {
        return table_lookup(&MEM_REQ_EVAL, kind).unwrap();
    }
    let s = hparams.n_ctx as usize;
    let e = hparams.n_embd as usize;
    let v = hparams.n_vocab as usize;
    (2 * s * e + s * v) * 4 + 4 * MB
}

/// Per-layer weight tensors.
#[derive(Debug)]
pub struct Layer {
    pub attention_norm: Tensor,

    pub wq: Tensor,
    pub wk: Tensor,
    pub wv: Tensor,
    pub wo: Tensor,

    pub ffn_norm: Tensor,

    pub w1: Tensor,
    pub w2: Tensor,
    pub w3: Tensor,
}

/// A fully materialised weight set.
pub struct Model {
    pub kind: ModelKind,
    pub hparams: Hparams,

    pub tok_embeddings: Tensor,
    pub norm: Tensor,
    pub output: Tensor,
    pub layers: Vec<Layer>,

    // Keeps borrowed tensor payloads alive when the mmap path is used.
    _mapping: Option<Mmap>,
}

impl Model {
    /// Claim every tensor the architecture requires, verify nothing in the
    /// file goes unclaimed, and materialise the payloads.
    pub fn load(
        loader: &mut ModelLoader,
        n_ctx: u32,
        use_mlock: bool,
        progress_callback: &mut dyn FnMut(f32),
    ) -> Result<Model> {
        let mut hparams = *loader.hparams();
        hparams.n_ctx = n_ctx;
        let kind = ModelKind::from_n_layer(hparams.n_layer);

        let n_embd = hparams.n_embd as usize;
        let n_vocab = hparams.n_vocab as usize;
        let n_layer = hparams.n_layer as usize;
        let n_ff = hparams.n_ff() as usize;

        info!("format     = {}", loader.file_version().name());
        info!("n_vocab    = {}", hparams.n_vocab);
        info!("n_ctx      = {}", hparams.n_ctx);
        info!("n_embd     = {}", hparams.n_embd);
        info!("n_mult     = {}", hparams.n_mult);
        info!("n_head     = {}", hparams.n_head);
        info!("n_layer    = {}", hparams.n_layer);
        info!("n_rot      = {}", hparams.n_rot);
        info!("ftype      = {} ({})", hparams.ftype.code(), hparams.ftype.name());
        info!("n_ff       = {n_ff}");
        info!("n_parts    = {}", loader.n_parts());
        info!("model size = {}", kind.name());

        let data_size = loader.total_data_size();
        let mem_required = data_size
            + scratch0_bytes(kind, &hparams)
            + scratch1_bytes(kind, &hparams)
            + eval_bytes(kind, &hparams);
        info!(
            "mem required  = {:7.2} MB (+ KV cache per state)",
            mem_required as f64 / MB as f64
        );

        let tok_embeddings = loader.claim("tok_embeddings.weight", &[n_embd, n_vocab])?;
        let norm = loader.claim("norm.weight", &[n_embd])?;
        let output = loader.claim("output.weight", &[n_embd, n_vocab])?;

        let mut layer_claims = Vec::with_capacity(n_layer);
        for i in 0..n_layer {
            let prefix = format!("layers.{i}");
            layer_claims.push([
                loader.claim(&format!("{prefix}.attention_norm.weight"), &[n_embd])?,
                loader.claim(&format!("{prefix}.attention.wq.weight"), &[n_embd, n_embd])?,
                loader.claim(&format!("{prefix}.attention.wk.weight"), &[n_embd, n_embd])?,
                loader.claim(&format!("{prefix}.attention.wv.weight"), &[n_embd, n_embd])?,
                loader.claim(&format!("{prefix}.attention.wo.weight"), &[n_embd, n_embd])?,
                loader.claim(&format!("{prefix}.ffn_norm.weight"), &[n_embd])?,
                loader.claim(&format!("{prefix}.feed_forward.w1.weight"), &[n_embd, n_ff])?,
                loader.claim(&format!("{prefix}.feed_forward.w2.weight"), &[n_ff, n_embd])?,
                loader.claim(&format!("{prefix}.feed_forward.w3.weight"), &[n_embd, n_ff])?,
            ]);
        }

        loader.done_getting_tensors()?;

        let (mut tensors, mapping) = loader.load_all_data(use_mlock, progress_callback)?;
        let mut take = |idx: usize| tensors[idx].take().expect("tensor claimed twice");

        let mut layers = Vec::with_capacity(n_layer);
        for claims in layer_claims {
            let [attention_norm, wq, wk, wv, wo, ffn_norm, w1, w2, w3] = claims;
            layers.push(Layer {
                attention_norm: take(attention_norm),
                wq: take(wq),
                wk: take(wk),
                wv: take(wv),
                wo: take(wo),
                ffn_norm: take(ffn_norm),
                w1: take(w1),
                w2: take(w2),
                w3: take(w3),
            });
        }

        Ok(Model {
            kind,
            hparams,
            tok_embeddings: take(tok_embeddings),
            norm: take(norm),
            output: take(output),
            layers,
            _mapping: mapping,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_ff_rounds_up_to_n_mult() {
        // 7B: n_embd 4096, n_mult 256 -> 11008.
        let hp = Hparams {
            n_vocab: 32000,
            n_ctx: 512,
            n_embd: 4096,
            n_mult: 256,
            n_head: 32,
            n_layer: 32,
            n_rot: 128,
            ftype: Ftype::MostlyF16,
        };
        assert_eq!(hp.n_ff(), 11008);
        assert_eq!(hp.head_dim(), 128);
    }

    #[test]
    fn model_kind_from_layers() {
        assert_eq!(ModelKind::from_n_layer(32), ModelKind::Model7B);
        assert_eq!(ModelKind::from_n_layer(40), ModelKind::Model13B);
        assert_eq!(ModelKind::from_n_layer(60), ModelKind::Model30B);
        assert_eq!(ModelKind::from_n_layer(80), ModelKind::Model65B);
        assert_eq!(ModelKind::from_n_layer(2), ModelKind::Unknown);
    }

    #[test]
    fn unknown_class_sizes_follow_hparams() {
        let hp = Hparams {
            n_vocab: 300,
            n_ctx: 16,
            n_embd: 8,
            n_mult: 8,
            n_head: 2,
            n_layer: 1,
            n_rot: 4,
            ftype: Ftype::AllF32,
        };
        let kind = ModelKind::from_n_layer(hp.n_layer);
        // Small models need far less than the class tables provide.
        assert!(scratch0_bytes(kind, &hp) < MEM_REQ_SCRATCH0[0].1);
        assert!(scratch1_bytes(kind, &hp) < MEM_REQ_SCRATCH1[0].1);
        assert!(eval_bytes(kind, &hp) < MEM_REQ_EVAL[0].1);
    }
}
