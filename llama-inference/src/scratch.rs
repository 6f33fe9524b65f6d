//! Scratch-buffer arena for forward-pass intermediates.
//!
//! The arena owns one main compute buffer plus two fixed scratch regions
//! sized from the model's size class. Each eval call borrows the storage
//! through [`ScratchArena::begin`] and claims the step's intermediate
//! buffers from whichever region is active; `use_buf` switches regions and
//! reports the bytes the previous one had handed out, which feeds the
//! per-region high-watermark. Exhausting a region is a programmer error
//! (the sizing tables bound peak usage) and panics.
//!
//! With the `scratch` cargo feature disabled, `use_buf` is a no-op and
//! every claim is served from the main buffer, which is then sized to
//! cover all three budgets.

use crate::error::{LlamaError, Result};
use crate::model::{self, Hparams, ModelKind};

/// Upper bound on addressable scratch regions.
pub const MAX_SCRATCH_BUFFERS: usize = 16;

/// Region selector: the main compute buffer or scratch region `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufId {
    Main,
    Scratch(usize),
}

pub struct ScratchArena {
    main: Vec<f32>,
    regions: Vec<Vec<f32>>,
    /// High-watermark of bytes handed out, per scratch region.
    max_used: Vec<usize>,
}

impl ScratchArena {
    pub fn new(kind: ModelKind, hparams: &Hparams) -> Result<Self> {
        let eval = model::eval_bytes(kind, hparams) / 4;
        let scratch = [
            model::scratch0_bytes(kind, hparams) / 4,
            model::scratch1_bytes(kind, hparams) / 4,
        ];

        let (main_len, region_lens) = if cfg!(feature = "scratch") {
            (eval, scratch.to_vec())
        } else {
            (eval + scratch.iter().sum::<usize>(), Vec::new())
        };

        let alloc = |n: usize| -> Result<Vec<f32>> {
            let mut v = Vec::new();
            v.try_reserve_exact(n)
                .map_err(|_| LlamaError::OutOfMemory(format!("compute buffer of {n} elements")))?;
            v.resize(n, 0.0);
            Ok(v)
        };

        Ok(Self {
            main: alloc(main_len)?,
            regions: region_lens.into_iter().map(alloc).collect::<Result<_>>()?,
            max_used: vec![0; MAX_SCRATCH_BUFFERS],
        })
    }

    /// Begin an eval: all cursors rewind to the start of their regions.
    pub fn begin(&mut self) -> ScratchGuard<'_> {
        let ScratchArena {
            main,
            regions,
            max_used,
        } = self;
        ScratchGuard {
            main: Cursor::new(main),
            regions: regions.iter_mut().map(|r| Cursor::new(r)).collect(),
            max_used,
            active: BufId::Main,
        }
    }

    /// High-watermark of scratch region `i`, in bytes.
    pub fn max_used(&self, i: usize) -> usize {
        self.max_used[i]
    }
}

struct Cursor<'a> {
    rem: &'a mut [f32],
    used: usize,
}

impl<'a> Cursor<'a> {
    fn new(storage: &'a mut Vec<f32>) -> Self {
        Self {
            rem: storage.as_mut_slice(),
            used: 0,
        }
    }

    fn alloc(&mut self, n: usize, what: BufId) -> &'a mut [f32] {
        assert!(
            n <= self.rem.len(),
            "scratch buffer overflow: {:?} needs {} more elements, {} available",
            what,
            n,
            self.rem.len()
        );
        // Claims are handed out dirty; every consumer writes before it
        // reads.
        let (out, rest) = std::mem::take(&mut self.rem).split_at_mut(n);
        self.rem = rest;
        self.used += n;
        out
    }
}

/// Per-eval view of the arena.
pub struct ScratchGuard<'a> {
    main: Cursor<'a>,
    regions: Vec<Cursor<'a>>,
    max_used: &'a mut Vec<usize>,
    active: BufId,
}

impl<'a> ScratchGuard<'a> {
    /// Switch the allocation target, returning the bytes handed out by the
    /// previously active region (zero for the main buffer). The previous
    /// region's high-watermark is updated.
    pub fn use_buf(&mut self, id: BufId) -> usize {
        if self.regions.is_empty() {
            return 0;
        }
        if let BufId::Scratch(i) = id {
            assert!(i < self.regions.len(), "scratch region {i} not configured");
        }

        let last_size = match self.active {
            BufId::Main => 0,
            BufId::Scratch(i) => {
                let used = self.regions[i].used * 4;
                self.max_used[i] = self.max_used[i].max(used);
                used
            }
        };
        self.active = id;
        last_size
    }

    /// Claim `n` f32 elements from the active region.
    pub fn alloc(&mut self, n: usize) -> &'a mut [f32] {
        let cursor = match self.active {
            BufId::Scratch(i) if !self.regions.is_empty() => &mut self.regions[i],
            _ => &mut self.main,
        };
        cursor.alloc(n, self.active)
    }

    /// Total bytes claimed so far across all regions.
    pub fn used_bytes(&self) -> usize {
        let region_used: usize = self.regions.iter().map(|c| c.used).sum();
        (self.main.used + region_used) * 4
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        for (i, cursor) in self.regions.iter().enumerate() {
            self.max_used[i] = self.max_used[i].max(cursor.used * 4);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Ftype;

    fn tiny_hparams() -> Hparams {
        Hparams {
            n_vocab: 16,
            n_ctx: 8,
            n_embd: 8,
            n_mult: 8,
            n_head: 2,
            n_layer: 1,
            n_rot: 4,
            ftype: Ftype::AllF32,
        }
    }

    fn tiny_arena() -> ScratchArena {
        ScratchArena::new(ModelKind::Unknown, &tiny_hparams()).unwrap()
    }

    #[test]
    fn allocations_are_disjoint() {
        let mut arena = tiny_arena();
        let mut guard = arena.begin();
        let a = guard.alloc(8);
        let b = guard.alloc(8);
        a.fill(1.0);
        b.fill(2.0);
        assert!(a.iter().all(|&v| v == 1.0));
        assert!(b.iter().all(|&v| v == 2.0));
    }

    #[cfg(feature = "scratch")]
    #[test]
    fn use_buf_reports_previous_region_usage() {
        let mut arena = tiny_arena();
        {
            let mut guard = arena.begin();
            guard.use_buf(BufId::Scratch(0));
            guard.alloc(10);
            let last = guard.use_buf(BufId::Scratch(1));
            assert_eq!(last, 40);
            guard.alloc(4);
            assert_eq!(guard.use_buf(BufId::Main), 16);
        }
        assert_eq!(arena.max_used(0), 40);
        assert_eq!(arena.max_used(1), 16);
    }

    #[test]
    fn cursors_rewind_between_evals() {
        let mut arena = tiny_arena();
        for _ in 0..2 {
            let mut guard = arena.begin();
            guard.use_buf(BufId::Scratch(0));
            // Claims the same storage both times; a failed rewind would
            // overflow on the second pass if the claim covered the region.
            guard.alloc(64);
        }
    }

    #[test]
    #[should_panic(expected = "scratch buffer overflow")]
    fn exhaustion_panics() {
        let mut arena = tiny_arena();
        let mut guard = arena.begin();
        guard.use_buf(BufId::Scratch(1));
        guard.alloc(usize::MAX / 8);
    }
}
