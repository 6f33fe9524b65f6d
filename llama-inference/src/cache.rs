//! Per-layer key/value cache for the self attention.
//!
//! Two flat buffers of `n_layer * n_ctx * n_embd` elements in the memory
//! element type (F32, or F16 when the context was created with `f16_kv`).
//! Keys are stored post-RoPE, rows indexed by `(layer, position)`; values
//! are stored transposed, column-major per layer with a stride of `n_ctx`
//! between embedding components. Both layouts are part of the cache
//! contract relied on by the forward pass and the state serialiser.

use crate::error::{checked_mul, LlamaError, Result};
use crate::model::Hparams;
use half::f16;
use log::info;

/// Element type of the cache buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvDtype {
    F32,
    F16,
}

impl KvDtype {
    pub fn elem_size(self) -> usize {
        match self {
            KvDtype::F32 => 4,
            KvDtype::F16 => 2,
        }
    }
}

/// Cache element: converts losslessly enough to and from f32 for
/// attention arithmetic.
pub(crate) trait KvElement: Copy + Send + Sync + 'static {
    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
}

impl KvElement for f32 {
    fn from_f32(v: f32) -> Self {
        v
    }
    fn to_f32(self) -> f32 {
        self
    }
}

impl KvElement for f16 {
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
    fn to_f32(self) -> f32 {
        self.to_f32()
    }
}

/// One typed cache buffer.
pub(crate) enum KvBuf {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl KvBuf {
    fn new(dtype: KvDtype, n_elements: usize) -> Result<Self> {
        fn alloc<T: Clone + Default>(n: usize) -> Result<Vec<T>> {
            let mut v = Vec::new();
            v.try_reserve_exact(n).map_err(|_| {
                LlamaError::OutOfMemory(format!("kv cache buffer of {n} elements"))
            })?;
            v.resize(n, T::default());
            Ok(v)
        }
        Ok(match dtype {
            KvDtype::F32 => KvBuf::F32(alloc(n_elements)?),
            KvDtype::F16 => KvBuf::F16(alloc(n_elements)?),
        })
    }

    pub fn nbytes(&self) -> usize {
        match self {
            KvBuf::F32(v) => v.len() * 4,
            KvBuf::F16(v) => v.len() * 2,
        }
    }

    /// The buffer viewed as raw bytes, for state serialisation.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: both element types are plain-old-data with no padding;
        // reading them as bytes is always valid.
        unsafe {
            match self {
                KvBuf::F32(v) => {
                    std::slice::from_raw_parts(v.as_ptr().cast::<u8>(), v.len() * 4)
                }
                KvBuf::F16(v) => {
                    std::slice::from_raw_parts(v.as_ptr().cast::<u8>(), v.len() * 2)
                }
            }
        }
    }

    /// Bulk-replace the buffer contents from raw bytes. The buffer itself
    /// is retained, so views into it stay valid across a restore.
    pub fn copy_from_bytes(&mut self, src: &[u8]) {
        assert_eq!(src.len(), self.nbytes());
        // SAFETY: same representation argument as `as_bytes`, and the
        // length is checked above.
        unsafe {
            let dst = match self {
                KvBuf::F32(v) => {
                    std::slice::from_raw_parts_mut(v.as_mut_ptr().cast::<u8>(), v.len() * 4)
                }
                KvBuf::F16(v) => {
                    std::slice::from_raw_parts_mut(v.as_mut_ptr().cast::<u8>(), v.len() * 2)
                }
            };
            dst.copy_from_slice(src);
        }
    }
}

/// Fixed-capacity per-layer key/value store.
pub struct KvCache {
    pub(crate) k: KvBuf,
    pub(crate) v: KvBuf,
    /// Tokens currently stored: positions `0..n` of every layer are valid.
    pub n: usize,
    pub(crate) dtype: KvDtype,
}

impl KvCache {
    pub fn init(hparams: &Hparams, dtype: KvDtype, n_ctx: usize) -> Result<Self> {
        let n_elements = checked_mul(
            checked_mul(hparams.n_layer as usize, n_ctx)?,
            hparams.n_embd as usize,
        )?;

        let cache = Self {
            k: KvBuf::new(dtype, n_elements)?,
            v: KvBuf::new(dtype, n_elements)?,
            n: 0,
            dtype,
        };
        info!(
            "kv self size  = {:7.2} MB",
            cache.nbytes() as f64 / (1024.0 * 1024.0)
        );
        Ok(cache)
    }

    pub fn dtype(&self) -> KvDtype {
        self.dtype
    }

    /// Total bytes across both buffers; the unit of the state blob's
    /// `kv_size` field.
    pub fn nbytes(&self) -> usize {
        self.k.nbytes() + self.v.nbytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Ftype;

    fn hparams() -> Hparams {
        Hparams {
            n_vocab: 4,
            n_ctx: 8,
            n_embd: 4,
            n_mult: 4,
            n_head: 2,
            n_layer: 2,
            n_rot: 2,
            ftype: Ftype::AllF32,
        }
    }

    #[test]
    fn sizes_follow_element_type() {
        let f32_cache = KvCache::init(&hparams(), KvDtype::F32, 8).unwrap();
        let f16_cache = KvCache::init(&hparams(), KvDtype::F16, 8).unwrap();
        // 2 layers * 8 positions * 4 elements, two buffers.
        assert_eq!(f32_cache.nbytes(), 2 * 2 * 8 * 4 * 4);
        assert_eq!(f16_cache.nbytes(), f32_cache.nbytes() / 2);
        assert_eq!(f32_cache.n, 0);
    }

    #[test]
    fn byte_round_trip_preserves_contents() {
        let mut cache = KvCache::init(&hparams(), KvDtype::F16, 8).unwrap();
        if let KvBuf::F16(v) = &mut cache.k {
            v[3] = half::f16::from_f32(1.5);
        }
        let snapshot = cache.k.as_bytes().to_vec();

        if let KvBuf::F16(v) = &mut cache.k {
            v[3] = half::f16::from_f32(-2.0);
        }
        cache.k.copy_from_bytes(&snapshot);

        if let KvBuf::F16(v) = &cache.k {
            assert_eq!(v[3].to_f32(), 1.5);
        }
    }
}
