//! On-disk codec for the GGML-family checkpoint formats.
//!
//! Three layouts are recognised: the original `ggml` container (no version
//! field, no vocabulary scores), `ggmf` v1 (adds scores) and `ggjt` v1
//! (adds 32-byte payload alignment, which is what makes mmap loading
//! possible). The writer always emits `ggjt` v1.

use crate::error::{checked_mul, LlamaError, Result};
use crate::model::{Ftype, Hparams};
use crate::vocab::Vocab;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use llama_kernels::TensorType;
use log::warn;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Four ASCII bytes interpreted as a little-endian u32.
pub const MAGIC_GGML: u32 = 0x6767_6d6c;
pub const MAGIC_GGMF: u32 = 0x6767_6d66;
pub const MAGIC_GGJT: u32 = 0x6767_6a74;

/// Tensor payloads in `ggjt` files start on this boundary.
pub const GGJT_ALIGNMENT: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileVersion {
    /// `'ggml'`, unversioned.
    Ggml,
    /// `'ggmf'` v1.
    GgmfV1,
    /// `'ggjt'` v1.
    GgjtV1,
}

impl FileVersion {
    pub fn name(self) -> &'static str {
        match self {
            FileVersion::Ggml => "'ggml' (old version with low tokenizer quality and no mmap support)",
            FileVersion::GgmfV1 => "ggmf v1 (old version with no mmap support)",
            FileVersion::GgjtV1 => "ggjt v1 (latest)",
        }
    }
}

/// One file's contribution to one tensor.
#[derive(Debug, Clone)]
pub struct TensorShard {
    pub n_dims: usize,
    pub ne: [usize; 2],
    pub dtype: TensorType,
    pub file_idx: usize,
    pub file_off: u64,
    /// Payload bytes contributed by this shard.
    pub size: usize,
}

impl TensorShard {
    pub fn shape(&self) -> &[usize] {
        &self.ne[..self.n_dims]
    }
}

/// Payload bytes for `ne` elements of `dtype`, with overflow checking.
pub fn tensor_size(ne: &[usize], dtype: TensorType) -> Result<usize> {
    let mut size = dtype.type_size();
    for &dim in ne {
        size = checked_mul(size, dim)?;
    }
    Ok(size / dtype.block_size())
}

/// A parsed checkpoint shard: header, vocabulary and tensor metadata.
/// The open file handle is retained for later payload reads.
pub struct ShardFile {
    pub file: File,
    pub file_len: u64,
    pub version: FileVersion,
    pub hparams: Hparams,
    pub vocab: Vocab,
    pub shards: Vec<(String, TensorShard)>,
}

impl ShardFile {
    pub fn open(path: &Path, file_idx: usize) -> Result<Self> {
        log::info!("loading model part from {}", path.display());
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let version = read_magic(&mut reader)?;
        let hparams = read_hparams(&mut reader)?;
        let vocab = read_vocab(&mut reader, &hparams, version)?;
        let shards = read_tensor_metadata(&mut reader, file_len, file_idx, version)?;

        Ok(Self {
            file: reader.into_inner(),
            file_len,
            version,
            hparams,
            vocab,
            shards,
        })
    }
}

fn read_magic<R: Read>(reader: &mut R) -> Result<FileVersion> {
    let magic = reader.read_u32::<LittleEndian>()?;
    // The unversioned container has no version field at all.
    let version = if magic == MAGIC_GGML {
        0
    } else {
        reader.read_u32::<LittleEndian>()?
    };

    match (magic, version) {
        (MAGIC_GGML, 0) => Ok(FileVersion::Ggml),
        (MAGIC_GGMF, 1) => Ok(FileVersion::GgmfV1),
        (MAGIC_GGJT, 1) => Ok(FileVersion::GgjtV1),
        _ => Err(LlamaError::BadFormat(format!(
            "unknown (magic, version) combination: {magic:08x}, {version:08x}; is this really a GGML file?"
        ))),
    }
}

fn read_hparams<R: Read>(reader: &mut R) -> Result<Hparams> {
    let n_vocab = reader.read_u32::<LittleEndian>()?;
    let n_embd = reader.read_u32::<LittleEndian>()?;
    let n_mult = reader.read_u32::<LittleEndian>()?;
    let n_head = reader.read_u32::<LittleEndian>()?;
    let n_layer = reader.read_u32::<LittleEndian>()?;
    let n_rot = reader.read_u32::<LittleEndian>()?;
    let ftype_code = reader.read_u32::<LittleEndian>()?;
    let ftype = Ftype::from_code(ftype_code)
        .ok_or_else(|| LlamaError::BadFormat(format!("unknown ftype {ftype_code}")))?;

    Ok(Hparams {
        n_vocab,
        // Caller-supplied at context init; the stored value is a default.
        n_ctx: 0,
        n_embd,
        n_mult,
        n_head,
        n_layer,
        n_rot,
        ftype,
    })
}

fn read_vocab<R: Read>(reader: &mut R, hparams: &Hparams, version: FileVersion) -> Result<Vocab> {
    let mut vocab = Vocab::with_capacity(hparams.n_vocab as usize);
    for _ in 0..hparams.n_vocab {
        let len = reader.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;

        let score = if version >= FileVersion::GgmfV1 {
            reader.read_f32::<LittleEndian>()?
        } else {
            0.0
        };
        vocab.push(bytes, score);
    }
    Ok(vocab)
}

fn read_tensor_metadata<R: Read + Seek>(
    reader: &mut R,
    file_len: u64,
    file_idx: usize,
    version: FileVersion,
) -> Result<Vec<(String, TensorShard)>> {
    let mut shards = Vec::new();

    while reader.stream_position()? < file_len {
        let n_dims = reader.read_u32::<LittleEndian>()? as usize;
        let name_len = reader.read_u32::<LittleEndian>()? as usize;
        let type_code = reader.read_u32::<LittleEndian>()?;
        let dtype = TensorType::from_code(type_code).ok_or_else(|| {
            LlamaError::BadFormat(format!("unrecognized tensor type {type_code}"))
        })?;

        let mut dims = Vec::with_capacity(n_dims.min(4));
        for _ in 0..n_dims {
            dims.push(reader.read_u32::<LittleEndian>()? as usize);
        }

        let mut name_bytes = vec![0u8; name_len];
        reader.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| LlamaError::BadFormat("tensor name is not valid UTF-8".into()))?;

        if !(1..=2).contains(&n_dims) {
            return Err(LlamaError::BadFormat(format!(
                "tensor '{name}' should not be {n_dims}-dimensional"
            )));
        }
        let mut ne = [1usize; 2];
        ne[..n_dims].copy_from_slice(&dims);

        if version >= FileVersion::GgjtV1 {
            // Skip to the next multiple of 32 bytes.
            let pos = reader.stream_position()?;
            let pad = pos.wrapping_neg() & (GGJT_ALIGNMENT - 1);
            reader.seek(SeekFrom::Current(pad as i64))?;
        }

        let file_off = reader.stream_position()?;
        let size = tensor_size(&ne[..n_dims], dtype)?;
        reader.seek(SeekFrom::Current(size as i64))?;

        shards.push((
            name,
            TensorShard {
                n_dims,
                ne,
                dtype,
                file_idx,
                file_off,
                size,
            },
        ));
    }

    Ok(shards)
}

/// Writer for the `ggjt` v1 layout. Emits the header and vocabulary on
/// construction; tensors follow through [`FileSaver::write_tensor`].
pub struct FileSaver {
    writer: BufWriter<File>,
}

impl FileSaver {
    pub fn create(
        path: &Path,
        hparams: &Hparams,
        vocab: &Vocab,
        source_version: FileVersion,
        new_ftype: Ftype,
    ) -> Result<Self> {
        log::info!("saving model to {}", path.display());
        let mut saver = Self {
            writer: BufWriter::new(File::create(path)?),
        };
        saver.write_header(hparams, new_ftype)?;
        saver.write_vocab(vocab, source_version)?;
        Ok(saver)
    }

    fn write_header(&mut self, hparams: &Hparams, new_ftype: Ftype) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(MAGIC_GGJT)?;
        self.writer.write_u32::<LittleEndian>(1)?;

        self.writer.write_u32::<LittleEndian>(hparams.n_vocab)?;
        self.writer.write_u32::<LittleEndian>(hparams.n_embd)?;
        self.writer.write_u32::<LittleEndian>(hparams.n_mult)?;
        self.writer.write_u32::<LittleEndian>(hparams.n_head)?;
        self.writer.write_u32::<LittleEndian>(hparams.n_layer)?;
        self.writer.write_u32::<LittleEndian>(hparams.n_rot)?;
        self.writer.write_u32::<LittleEndian>(new_ftype.code())?;
        Ok(())
    }

    fn write_vocab(&mut self, vocab: &Vocab, source_version: FileVersion) -> Result<()> {
        if source_version == FileVersion::Ggml {
            warn!("input is an old file that doesn't have scores; will add dummy scores");
        }
        for token in &vocab.id_to_token {
            self.writer
                .write_u32::<LittleEndian>(token.bytes.len() as u32)?;
            self.writer.write_all(&token.bytes)?;
            self.writer.write_f32::<LittleEndian>(token.score)?;
        }
        Ok(())
    }

    pub fn write_tensor(
        &mut self,
        name: &str,
        dtype: TensorType,
        ne: &[usize],
        data: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(tensor_size(ne, dtype)?, data.len());

        self.writer.write_u32::<LittleEndian>(ne.len() as u32)?;
        self.writer.write_u32::<LittleEndian>(name.len() as u32)?;
        self.writer.write_u32::<LittleEndian>(dtype.code())?;
        for &dim in ne {
            self.writer.write_u32::<LittleEndian>(dim as u32)?;
        }
        self.writer.write_all(name.as_bytes())?;

        // Pad the payload out to the alignment boundary.
        let pos = self.writer.stream_position()?;
        let pad = pos.wrapping_neg() & (GGJT_ALIGNMENT - 1);
        self.writer.write_all(&[0u8; 32][..pad as usize])?;

        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_hparams() -> Hparams {
        Hparams {
            n_vocab: 2,
            n_ctx: 0,
            n_embd: 8,
            n_mult: 8,
            n_head: 2,
            n_layer: 1,
            n_rot: 4,
            ftype: Ftype::AllF32,
        }
    }

    fn test_vocab() -> Vocab {
        let mut vocab = Vocab::with_capacity(2);
        vocab.push(b"a".to_vec(), -1.0);
        vocab.push(b"bc".to_vec(), -2.0);
        vocab
    }

    #[test]
    fn rejects_unknown_magic() {
        let mut bytes = 0xdeadbeefu32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        let err = read_magic(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, LlamaError::BadFormat(_)));
    }

    #[test]
    fn rejects_bad_version_pairing() {
        // 'ggjt' with version 2 is not a recognised pairing.
        let mut bytes = MAGIC_GGJT.to_le_bytes().to_vec();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        let err = read_magic(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, LlamaError::BadFormat(_)));
    }

    #[test]
    fn ggjt_write_scan_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");

        let payload: Vec<u8> = (0..16 * 4).map(|i| i as u8).collect();
        let mut saver = FileSaver::create(
            &path,
            &test_hparams(),
            &test_vocab(),
            FileVersion::GgjtV1,
            Ftype::AllF32,
        )
        .unwrap();
        saver
            .write_tensor("tok.weight", TensorType::F32, &[8, 2], &payload)
            .unwrap();
        saver.finish().unwrap();

        let shard_file = ShardFile::open(&path, 0).unwrap();
        assert_eq!(shard_file.version, FileVersion::GgjtV1);
        assert_eq!(shard_file.hparams.n_embd, 8);
        assert_eq!(shard_file.vocab.n_vocab(), 2);
        assert_eq!(shard_file.vocab.token_bytes(1), Some(&b"bc"[..]));
        assert_eq!(shard_file.shards.len(), 1);

        let (name, shard) = &shard_file.shards[0];
        assert_eq!(name, "tok.weight");
        assert_eq!(shard.shape(), &[8, 2]);
        assert_eq!(shard.size, payload.len());
        assert_eq!(shard.file_off % GGJT_ALIGNMENT, 0);
    }

    #[test]
    fn tensor_size_overflow_is_caught() {
        let err = tensor_size(&[usize::MAX, 2], TensorType::F32).unwrap_err();
        assert!(matches!(err, LlamaError::Overflow(_)));
    }
}
