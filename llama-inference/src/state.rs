//! Context state snapshot and restore.
//!
//! Blob layout, sizes host-endian `usize` unless noted:
//!
//! ```text
//! rng_size, rng_bytes[64 KiB]
//! logits_capacity, logits_size, logits[logits_capacity * f32]
//! embedding_size, embedding[embedding_size * f32]
//! kv_size, kv_ntok: i32, kv_bytes[kv_size]
//! ```
//!
//! The logits field always reserves `logits_capacity` elements and fills
//! only `logits_size`; the padding contents are unspecified. The RNG is a
//! textual serialisation zero-padded to 64 KiB. The KV bytes are the key
//! buffer followed by the value buffer; restore bulk-replaces the owned
//! buffers in place, so nothing referencing them needs re-seating.

use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};
use crate::sampler::Rng;

const RNG_BUF_SIZE: usize = 64 * 1024;
const SIZE_T: usize = std::mem::size_of::<usize>();

impl LlamaContext {
    /// Exact byte size of the state blob for this context.
    pub fn state_size(&self) -> usize {
        let kv_size = self.kv_cache_size();
        SIZE_T
            + RNG_BUF_SIZE
            + SIZE_T
            + SIZE_T
            + self.logits_capacity * 4
            + SIZE_T
            + self.embedding.len() * 4
            + SIZE_T
            + std::mem::size_of::<i32>()
            + kv_size
    }

    /// Serialise RNG, logits, embeddings and KV cache into one blob.
    pub fn state_data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.state_size());

        let rng_text = self.rng.serialize();
        debug_assert!(rng_text.len() <= RNG_BUF_SIZE);
        out.extend_from_slice(&rng_text.len().to_ne_bytes());
        out.extend_from_slice(rng_text.as_bytes());
        out.resize(out.len() + RNG_BUF_SIZE - rng_text.len(), 0);

        out.extend_from_slice(&self.logits_capacity.to_ne_bytes());
        out.extend_from_slice(&self.logits.len().to_ne_bytes());
        for &v in &self.logits {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        // The reservation is part of the layout even when partially filled.
        out.resize(out.len() + (self.logits_capacity - self.logits.len()) * 4, 0);

        out.extend_from_slice(&self.embedding.len().to_ne_bytes());
        for &v in &self.embedding {
            out.extend_from_slice(&v.to_ne_bytes());
        }

        let kv_size = self.kv_cache_size();
        out.extend_from_slice(&kv_size.to_ne_bytes());
        out.extend_from_slice(&(self.kv_cache_token_count() as i32).to_ne_bytes());
        if let Some(engine) = &self.engine {
            out.extend_from_slice(engine.kv.k.as_bytes());
            out.extend_from_slice(engine.kv.v.as_bytes());
        }

        debug_assert_eq!(out.len(), self.state_size());
        out
    }

    /// Restore a snapshot taken from a context with identical shape
    /// parameters. Returns the bytes consumed.
    pub fn set_state_data(&mut self, src: &[u8]) -> Result<usize> {
        let mut reader = StateReader { src, pos: 0 };

        let rng_size = reader.read_usize()?;
        let rng_buf = reader.read_bytes(RNG_BUF_SIZE)?;
        if rng_size > RNG_BUF_SIZE {
            return Err(LlamaError::Inconsistent(format!(
                "rng serialisation of {rng_size} bytes exceeds its {RNG_BUF_SIZE}-byte field"
            )));
        }
        let rng_text = std::str::from_utf8(&rng_buf[..rng_size])
            .map_err(|_| LlamaError::Inconsistent("rng state is not valid text".into()))?;
        self.rng = Rng::deserialize(rng_text)
            .ok_or_else(|| LlamaError::Inconsistent("rng state failed to parse".into()))?;

        let logits_capacity = reader.read_usize()?;
        let logits_size = reader.read_usize()?;
        if logits_capacity != self.logits_capacity {
            return Err(LlamaError::Inconsistent(format!(
                "logits capacity mismatch: blob has {logits_capacity}, context reserves {}",
                self.logits_capacity
            )));
        }
        if logits_size > logits_capacity {
            return Err(LlamaError::Inconsistent(format!(
                "logits size {logits_size} exceeds capacity {logits_capacity}"
            )));
        }
        let logits_bytes = reader.read_bytes(logits_capacity * 4)?;
        self.logits.clear();
        self.logits.extend(
            logits_bytes[..logits_size * 4]
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        );

        let embedding_size = reader.read_usize()?;
        if embedding_size != self.embedding.len() {
            return Err(LlamaError::Inconsistent(format!(
                "embedding size mismatch: blob has {embedding_size}, context holds {}",
                self.embedding.len()
            )));
        }
        let embedding_bytes = reader.read_bytes(embedding_size * 4)?;
        for (dst, b) in self.embedding.iter_mut().zip(embedding_bytes.chunks_exact(4)) {
            *dst = f32::from_ne_bytes([b[0], b[1], b[2], b[3]]);
        }

        let kv_size = reader.read_usize()?;
        let kv_ntok = reader.read_i32()?;
        if kv_size != self.kv_cache_size() {
            return Err(LlamaError::Inconsistent(format!(
                "kv cache size mismatch: blob has {kv_size} bytes, cache holds {}",
                self.kv_cache_size()
            )));
        }
        if kv_size > 0 {
            let kv_bytes = reader.read_bytes(kv_size)?;
            self.set_kv_cache(kv_bytes, kv_ntok as usize)?;
        }

        let read = reader.pos;
        debug_assert_eq!(read, self.state_size());
        Ok(read)
    }
}

struct StateReader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.src.len() - self.pos {
            return Err(LlamaError::Inconsistent(format!(
                "state blob truncated: need {} more bytes, have {}",
                n,
                self.src.len() - self.pos
            )));
        }
        let out = &self.src[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_usize(&mut self) -> Result<usize> {
        let bytes = self.read_bytes(SIZE_T)?;
        Ok(usize::from_ne_bytes(bytes.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_ne_bytes(bytes.try_into().unwrap()))
    }
}
