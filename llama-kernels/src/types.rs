use std::borrow::Cow;
use std::fmt;

/// Elements per quantisation block for the 4-bit formats.
pub(crate) const QK: usize = 32;

/// Bytes per Q4_0 block: one f32 scale + 16 packed nibble bytes.
pub(crate) const Q4_0_BLOCK_BYTES: usize = 4 + QK / 2;

/// Bytes per Q4_1 block: f32 scale + f32 offset + 16 packed nibble bytes.
pub(crate) const Q4_1_BLOCK_BYTES: usize = 4 + 4 + QK / 2;

/// Element type of a tensor payload. Discriminants match the on-disk
/// type codes of the GGML family formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TensorType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
}

impl TensorType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(TensorType::F32),
            1 => Some(TensorType::F16),
            2 => Some(TensorType::Q4_0),
            3 => Some(TensorType::Q4_1),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Bytes occupied by one block of this type.
    pub fn type_size(self) -> usize {
        match self {
            TensorType::F32 => 4,
            TensorType::F16 => 2,
            TensorType::Q4_0 => Q4_0_BLOCK_BYTES,
            TensorType::Q4_1 => Q4_1_BLOCK_BYTES,
        }
    }

    /// Elements encoded by one block of this type.
    pub fn block_size(self) -> usize {
        match self {
            TensorType::F32 | TensorType::F16 => 1,
            TensorType::Q4_0 | TensorType::Q4_1 => QK,
        }
    }

    /// Bytes needed for `n` elements. `n` must be a whole number of blocks.
    pub fn row_bytes(self, n: usize) -> usize {
        debug_assert_eq!(n % self.block_size(), 0);
        n / self.block_size() * self.type_size()
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, TensorType::Q4_0 | TensorType::Q4_1)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TensorType::F32 => "f32",
            TensorType::F16 => "f16",
            TensorType::Q4_0 => "q4_0",
            TensorType::Q4_1 => "q4_1",
        };
        f.write_str(name)
    }
}

/// A 1- or 2-D tensor over a typed byte payload.
///
/// The payload is either owned (merged from shard files) or borrowed from
/// a memory mapping kept alive by the model that owns this tensor.
/// `ne[0]` is the row length in elements, `ne[1]` the number of rows
/// (1 for 1-D tensors).
#[derive(Clone)]
pub struct Tensor {
    pub dtype: TensorType,
    pub ne: [usize; 2],
    pub data: Cow<'static, [u8]>,
}

impl Tensor {
    pub fn new(dtype: TensorType, ne: [usize; 2], data: Cow<'static, [u8]>) -> Self {
        debug_assert_eq!(data.len(), dtype.row_bytes(ne[0]) * ne[1]);
        Self { dtype, ne, data }
    }

    pub fn nelements(&self) -> usize {
        self.ne[0] * self.ne[1]
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn row_size(&self) -> usize {
        self.dtype.row_bytes(self.ne[0])
    }

    pub fn row(&self, i: usize) -> &[u8] {
        let rs = self.row_size();
        &self.data[i * rs..(i + 1) * rs]
    }

    /// The payload reinterpreted as f32. Panics if the tensor is not F32.
    pub fn as_f32(&self) -> &[f32] {
        assert_eq!(self.dtype, TensorType::F32);
        // SAFETY: the payload length is a multiple of 4 by construction and
        // f32 tolerates any bit pattern; unaligned loads are avoided by
        // reading through a pointer cast only on platforms where the
        // backing buffers are at least 4-byte aligned, which holds for both
        // Vec<u8> allocations and the 32-byte aligned GGJT mappings.
        unsafe {
            std::slice::from_raw_parts(self.data.as_ptr().cast::<f32>(), self.data.len() / 4)
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("ne", &self.ne)
            .field("owned", &matches!(self.data, Cow::Owned(_)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_geometry() {
        assert_eq!(TensorType::F32.row_bytes(64), 256);
        assert_eq!(TensorType::F16.row_bytes(64), 128);
        assert_eq!(TensorType::Q4_0.row_bytes(64), 2 * Q4_0_BLOCK_BYTES);
        assert_eq!(TensorType::Q4_1.row_bytes(64), 2 * Q4_1_BLOCK_BYTES);
    }

    #[test]
    fn type_codes_round_trip() {
        for ty in [
            TensorType::F32,
            TensorType::F16,
            TensorType::Q4_0,
            TensorType::Q4_1,
        ] {
            assert_eq!(TensorType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(TensorType::from_code(7), None);
    }
}
