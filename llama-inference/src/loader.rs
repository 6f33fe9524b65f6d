//! Multi-shard checkpoint loader.
//!
//! Reassembles one logical tensor set from a base file plus optional
//! `.1 .. .(n-1)` shard files, deciding between memory mapping and
//! buffered reads, and hands the materialised tensors to the model
//! builder.

use crate::error::{checked_mul, LlamaError, Result};
use crate::format::{FileVersion, ShardFile, TensorShard};
use crate::model::Hparams;
use crate::vocab::Vocab;
use llama_kernels::{Tensor, TensorType};
use log::warn;
use memmap2::Mmap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// How a logical matrix is partitioned across shard files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Replicated (1-D tensors and single-shard records).
    None,
    /// Logical `ne[0] = per_shard_ne[0] * n_shards`.
    ByColumns,
    /// Logical `ne[1] = per_shard_ne[1] * n_shards`.
    ByRows,
}

/// All shards contributing to one named tensor, plus the derived logical
/// type, split mode, shape and byte size.
#[derive(Debug)]
pub struct TensorRecord {
    pub name: String,
    pub shards: Vec<TensorShard>,
    pub dtype: TensorType,
    pub split: SplitMode,
    /// Logical shape, 1 or 2 dims.
    pub ne: Vec<usize>,
    /// Logical payload bytes.
    pub size: usize,
    claimed: bool,
}

impl TensorRecord {
    fn derive(&mut self) -> Result<()> {
        let first = &self.shards[0];

        for shard in &self.shards {
            if shard.dtype != first.dtype {
                return Err(LlamaError::Inconsistent(format!(
                    "inconsistent tensor shard type in '{}'",
                    self.name
                )));
            }
            if shard.shape() != first.shape() {
                return Err(LlamaError::Inconsistent(format!(
                    "inconsistent tensor shard shape in '{}': first was {:?}, other was {:?}",
                    self.name,
                    first.shape(),
                    shard.shape()
                )));
            }
        }
        self.dtype = first.dtype;

        self.split = if first.n_dims == 1 || self.shards.len() == 1 {
            SplitMode::None
        } else if self.name.starts_with("tok_embeddings.")
            || self.name.contains(".attention.wo.weight")
            || self.name.contains(".feed_forward.w2.weight")
        {
            SplitMode::ByColumns
        } else {
            SplitMode::ByRows
        };

        let n_shards = self.shards.len();
        self.ne = match self.split {
            SplitMode::None => first.shape().to_vec(),
            SplitMode::ByColumns => vec![checked_mul(first.ne[0], n_shards)?, first.ne[1]],
            SplitMode::ByRows => vec![first.ne[0], checked_mul(first.ne[1], n_shards)?],
        };
        self.size = crate::format::tensor_size(&self.ne, self.dtype)?;
        Ok(())
    }

    fn logical_ne(&self) -> [usize; 2] {
        match self.ne.as_slice() {
            [n0] => [*n0, 1],
            [n0, n1] => [*n0, *n1],
            _ => unreachable!("tensor records are 1- or 2-D"),
        }
    }
}

pub struct ModelLoader {
    files: Vec<ShardFile>,
    records: Vec<TensorRecord>,
    name_to_idx: HashMap<String, usize>,
    pub use_mmap: bool,
    n_claimed: usize,
}

impl ModelLoader {
    pub fn open(base_path: &Path, use_mmap: bool, vocab_only: bool) -> Result<Self> {
        let mut loader = Self {
            files: Vec::new(),
            records: Vec::new(),
            name_to_idx: HashMap::new(),
            use_mmap,
            n_claimed: 0,
        };

        let first = ShardFile::open(base_path, 0)?;
        loader.append_shards(&first);
        loader.files.push(first);

        let n_parts = if vocab_only { 1 } else { loader.guess_n_parts()? };
        for i in 1..n_parts {
            let path = shard_path(base_path, i);
            let next = ShardFile::open(&path, i)?;
            if next.hparams != loader.files[0].hparams {
                return Err(LlamaError::Inconsistent(
                    "hparams inconsistent between files".into(),
                ));
            }
            loader.append_shards(&next);
            loader.files.push(next);
        }

        if loader.use_mmap && loader.alignment_prevents_mmap() {
            warn!("can't use mmap because tensors are not aligned; convert to new format to avoid this");
            loader.use_mmap = false;
        }

        for record in &mut loader.records {
            record.derive()?;
        }

        Ok(loader)
    }

    fn append_shards(&mut self, file: &ShardFile) {
        for (name, shard) in &file.shards {
            let idx = match self.name_to_idx.get(name) {
                Some(&idx) => idx,
                None => {
                    let idx = self.records.len();
                    self.records.push(TensorRecord {
                        name: name.clone(),
                        shards: Vec::new(),
                        dtype: shard.dtype,
                        split: SplitMode::None,
                        ne: Vec::new(),
                        size: 0,
                        claimed: false,
                    });
                    self.name_to_idx.insert(name.clone(), idx);
                    idx
                }
            };
            self.records[idx].shards.push(shard.clone());
        }
    }

    /// Shard count is implied by the column split of the embedding table:
    /// each part carries `n_embd / n_parts` columns of it.
    fn guess_n_parts(&self) -> Result<usize> {
        let idx = self
            .name_to_idx
            .get("tok_embeddings.weight")
            .ok_or_else(|| LlamaError::MissingTensor("tok_embeddings.weight".into()))?;
        let per_shard = self.records[*idx].shards[0].ne[0];
        let n_embd = self.files[0].hparams.n_embd as usize;
        if per_shard == 0 || n_embd % per_shard != 0 {
            return Err(LlamaError::Inconsistent(format!(
                "tok_embeddings.weight first dimension {per_shard} does not divide n_embd {n_embd}"
            )));
        }
        Ok(n_embd / per_shard)
    }

    /// Old formats place payloads unaligned, which the mmap path cannot
    /// serve: tensors would be read at unaligned addresses.
    fn alignment_prevents_mmap(&self) -> bool {
        self.records
            .iter()
            .flat_map(|r| &r.shards)
            .any(|shard| shard.file_off & 3 != 0)
    }

    pub fn hparams(&self) -> &Hparams {
        &self.files[0].hparams
    }

    pub fn file_version(&self) -> FileVersion {
        self.files[0].version
    }

    pub fn n_parts(&self) -> usize {
        self.files.len()
    }

    pub fn take_vocab(&mut self) -> Vocab {
        std::mem::take(&mut self.files[0].vocab)
    }

    pub fn records(&self) -> &[TensorRecord] {
        &self.records
    }

    pub fn total_data_size(&self) -> usize {
        self.records.iter().map(|r| r.size).sum()
    }

    /// Claim a tensor by name, checking its logical shape. Returns an index
    /// for retrieving the materialised tensor after
    /// [`ModelLoader::load_all_data`].
    pub fn claim(&mut self, name: &str, ne: &[usize]) -> Result<usize> {
        let idx = *self
            .name_to_idx
            .get(name)
            .ok_or_else(|| LlamaError::MissingTensor(name.into()))?;
        let record = &mut self.records[idx];

        if record.ne != ne {
            return Err(LlamaError::ShapeMismatch {
                name: name.into(),
                expected: ne.to_vec(),
                actual: record.ne.clone(),
            });
        }
        if record.claimed {
            return Err(LlamaError::Inconsistent(format!(
                "tensor '{name}' claimed twice"
            )));
        }
        record.claimed = true;
        self.n_claimed += 1;
        Ok(idx)
    }

    /// Fails if the file contained tensors the model builder never asked
    /// for.
    pub fn done_getting_tensors(&self) -> Result<()> {
        if self.n_claimed != self.records.len() {
            return Err(LlamaError::UnusedTensor);
        }
        Ok(())
    }

    /// Materialise every record. Returns tensors indexed like
    /// [`ModelLoader::records`] plus the mapping (if any) that their
    /// payloads borrow from.
    pub fn load_all_data(
        &mut self,
        use_mlock: bool,
        progress_callback: &mut dyn FnMut(f32),
    ) -> Result<(Vec<Option<Tensor>>, Option<Mmap>)> {
        let data_size = self.total_data_size();

        let mapping = if self.use_mmap {
            // SAFETY: the mapped checkpoint must not be truncated or
            // mutated while the model is alive; the engine never writes to
            // it and treats external modification as undefined behaviour,
            // as every GGML-format consumer does.
            let mapping = unsafe { Mmap::map(&self.files[0].file)? };
            if use_mlock {
                if let Err(err) = mapping.lock() {
                    warn!("failed to mlock {}-byte mapping: {err}", mapping.len());
                }
            }
            Some(mapping)
        } else {
            None
        };

        // With a lazy mapping there is nothing to measure, so progress is
        // not reported; with mlock the pages are resident and reporting is
        // meaningful again.
        let report_progress = !(self.use_mmap && !use_mlock);

        let mut tensors = Vec::with_capacity(self.records.len());
        let mut done_size = 0usize;

        for idx in 0..self.records.len() {
            if report_progress {
                progress_callback(done_size as f32 / data_size.max(1) as f32);
            }

            let tensor = if let Some(mapping) = &mapping {
                let record = &self.records[idx];
                if record.shards.len() != 1 {
                    return Err(LlamaError::Inconsistent(format!(
                        "tensor '{}' is split across files, which the mmap path cannot serve",
                        record.name
                    )));
                }
                let off = record.shards[0].file_off as usize;
                let bytes = &mapping[off..off + record.size];
                // SAFETY: the mapping outlives every tensor borrowing from
                // it because the model that owns the tensors also owns the
                // mapping and drops it last.
                let bytes = unsafe { std::mem::transmute::<&[u8], &'static [u8]>(bytes) };
                Tensor::new(record.dtype, record.logical_ne(), Cow::Borrowed(bytes))
            } else {
                let record = &self.records[idx];
                let data = self.materialize_owned(record)?;
                Tensor::new(record.dtype, record.logical_ne(), Cow::Owned(data))
            };

            done_size += self.records[idx].size;
            tensors.push(Some(tensor));
        }

        if report_progress {
            progress_callback(1.0);
        }

        Ok((tensors, mapping))
    }

    /// Read one record's payload into an owned buffer, reassembling the
    /// shard layout.
    pub fn materialize_owned(&self, record: &TensorRecord) -> Result<Vec<u8>> {
        let mut data = vec![0u8; record.size];

        match record.split {
            SplitMode::None => {
                self.read_shard(&record.shards[0], &mut data)?;
            }
            SplitMode::ByRows => {
                let mut offset = 0;
                for shard in &record.shards {
                    self.read_shard(shard, &mut data[offset..offset + shard.size])?;
                    offset += shard.size;
                }
                debug_assert_eq!(offset, record.size);
            }
            SplitMode::ByColumns => {
                // Load whole shards first so the OS sees large sequential
                // reads, then interleave: output row r is the concatenation
                // of row r of every shard in shard order.
                let mut shard_bufs = Vec::with_capacity(record.shards.len());
                for shard in &record.shards {
                    let mut buf = vec![0u8; shard.size];
                    self.read_shard(shard, &mut buf)?;
                    shard_bufs.push(buf);
                }

                let num_rows = record.ne[1];
                let shard_size = record.shards[0].size;
                if shard_size % num_rows != 0 {
                    return Err(LlamaError::Inconsistent(format!(
                        "shard size {shard_size} of '{}' is not a whole number of rows",
                        record.name
                    )));
                }
                let per_shard_row_size = shard_size / num_rows;

                let mut out_offset = 0;
                for row in 0..num_rows {
                    for buf in &shard_bufs {
                        let src = &buf[row * per_shard_row_size..(row + 1) * per_shard_row_size];
                        data[out_offset..out_offset + per_shard_row_size].copy_from_slice(src);
                        out_offset += per_shard_row_size;
                    }
                }
                debug_assert_eq!(out_offset, record.size);
            }
        }

        Ok(data)
    }

    fn read_shard(&self, shard: &TensorShard, out: &mut [u8]) -> Result<()> {
        let mut file = &self.files[shard.file_idx].file;
        file.seek(SeekFrom::Start(shard.file_off))?;
        file.read_exact(out)?;
        Ok(())
    }
}

/// Shards beyond the base file take numeric suffixes: `base.1`, `base.2`, …
fn shard_path(base: &Path, idx: usize) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(format!(".{idx}"));
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FileSaver;
    use crate::model::Ftype;

    fn tiny_hparams(n_embd: u32) -> Hparams {
        Hparams {
            n_vocab: 2,
            n_ctx: 0,
            n_embd,
            n_mult: 8,
            n_head: 2,
            n_layer: 1,
            n_rot: 2,
            ftype: Ftype::AllF32,
        }
    }

    fn tiny_vocab() -> Vocab {
        let mut vocab = Vocab::with_capacity(2);
        vocab.push(b"x".to_vec(), 0.0);
        vocab.push(b"y".to_vec(), 0.0);
        vocab
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Write a two-part checkpoint whose only tensor is column-split, and
    /// check the interleaved reassembly.
    #[test]
    fn column_split_interleaves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("model.bin");
        let hparams = tiny_hparams(4);

        // Each shard holds 2 of the 4 columns of a [4, 3] logical tensor.
        let shard0: Vec<f32> = vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0];
        let shard1: Vec<f32> = vec![2.0, 3.0, 12.0, 13.0, 22.0, 23.0];

        for (path, data) in [(base.clone(), &shard0), (base.with_extension("bin.1"), &shard1)] {
            let mut saver =
                FileSaver::create(&path, &hparams, &tiny_vocab(), FileVersion::GgjtV1, Ftype::AllF32)
                    .unwrap();
            saver
                .write_tensor("tok_embeddings.weight", TensorType::F32, &[2, 3], &f32_bytes(data))
                .unwrap();
            saver.finish().unwrap();
        }

        let loader = ModelLoader::open(&base, false, false).unwrap();
        assert_eq!(loader.n_parts(), 2);

        let record = &loader.records()[0];
        assert_eq!(record.split, SplitMode::ByColumns);
        assert_eq!(record.ne, vec![4, 3]);

        let data = loader.materialize_owned(record).unwrap();
        let mut merged = vec![0.0f32; 12];
        for (v, b) in merged.iter_mut().zip(data.chunks_exact(4)) {
            *v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }
        let expect: Vec<f32> = vec![
            0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0, 20.0, 21.0, 22.0, 23.0,
        ];
        assert_eq!(merged, expect);
    }

    #[test]
    fn row_split_concatenates_shards() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("model.bin");
        let hparams = tiny_hparams(2);

        // tok_embeddings single-shard (so n_parts guesses 1)... the split
        // tensor goes through an explicit two-file scan instead.
        let rows0: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let rows1: Vec<f32> = vec![5.0, 6.0, 7.0, 8.0];
        let embd: Vec<f32> = vec![0.5, 0.25, 0.75, 0.125];

        for (path, data) in [(base.clone(), &rows0), (base.with_extension("bin.1"), &rows1)] {
            let mut saver =
                FileSaver::create(&path, &hparams, &tiny_vocab(), FileVersion::GgjtV1, Ftype::AllF32)
                    .unwrap();
            saver
                .write_tensor("tok_embeddings.weight", TensorType::F32, &[1, 2], &f32_bytes(&embd[..2]))
                .unwrap();
            saver
                .write_tensor("layers.0.attention.wq.weight", TensorType::F32, &[2, 2], &f32_bytes(data))
                .unwrap();
            saver.finish().unwrap();
        }

        let loader = ModelLoader::open(&base, false, false).unwrap();
        assert_eq!(loader.n_parts(), 2);

        let idx = loader
            .records()
            .iter()
            .position(|r| r.name == "layers.0.attention.wq.weight")
            .unwrap();
        let record = &loader.records()[idx];
        assert_eq!(record.split, SplitMode::ByRows);
        assert_eq!(record.ne, vec![2, 4]);

        let data = loader.materialize_owned(record).unwrap();
        assert_eq!(data, [f32_bytes(&rows0), f32_bytes(&rows1)].concat());
    }

    #[test]
    fn missing_tensor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("model.bin");
        let hparams = tiny_hparams(4);

        let mut saver =
            FileSaver::create(&base, &hparams, &tiny_vocab(), FileVersion::GgjtV1, Ftype::AllF32)
                .unwrap();
        saver
            .write_tensor("tok_embeddings.weight", TensorType::F32, &[4, 2], &f32_bytes(&[0.0; 8]))
            .unwrap();
        saver.finish().unwrap();

        let mut loader = ModelLoader::open(&base, false, false).unwrap();
        let err = loader.claim("norm.weight", &[4]).unwrap_err();
        assert!(matches!(err, LlamaError::MissingTensor(_)));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("model.bin");
        let hparams = tiny_hparams(4);

        let mut saver =
            FileSaver::create(&base, &hparams, &tiny_vocab(), FileVersion::GgjtV1, Ftype::AllF32)
                .unwrap();
        saver
            .write_tensor("tok_embeddings.weight", TensorType::F32, &[4, 2], &f32_bytes(&[0.0; 8]))
            .unwrap();
        saver.finish().unwrap();

        let mut loader = ModelLoader::open(&base, false, false).unwrap();
        let err = loader.claim("tok_embeddings.weight", &[2, 4]).unwrap_err();
        assert!(matches!(err, LlamaError::ShapeMismatch { .. }));
    }

    #[test]
    fn unclaimed_tensors_fail_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("model.bin");
        let hparams = tiny_hparams(4);

        let mut saver =
            FileSaver::create(&base, &hparams, &tiny_vocab(), FileVersion::GgjtV1, Ftype::AllF32)
                .unwrap();
        saver
            .write_tensor("tok_embeddings.weight", TensorType::F32, &[4, 2], &f32_bytes(&[0.0; 8]))
            .unwrap();
        saver
            .write_tensor("stray.weight", TensorType::F32, &[4], &f32_bytes(&[0.0; 4]))
            .unwrap();
        saver.finish().unwrap();

        let mut loader = ModelLoader::open(&base, false, false).unwrap();
        loader.claim("tok_embeddings.weight", &[4, 2]).unwrap();
        let err = loader.done_getting_tensors().unwrap_err();
        assert!(matches!(err, LlamaError::UnusedTensor));
    }
}
