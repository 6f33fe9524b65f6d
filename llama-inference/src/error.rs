use thiserror::Error;

/// Error kinds surfaced by the engine's recoverable entry points.
///
/// Forward-pass internal invariants (scratch exhaustion, cache range
/// violations) are programmer errors and panic instead.
#[derive(Debug, Error)]
pub enum LlamaError {
    /// Unknown magic/version combination or unknown element-type code.
    #[error("bad file format: {0}")]
    BadFormat(String),

    /// Shards disagree on type, shape or hyperparameters.
    #[error("inconsistent model file: {0}")]
    Inconsistent(String),

    /// A required tensor name is absent from the checkpoint.
    #[error("tensor '{0}' is missing from model")]
    MissingTensor(String),

    /// A fetched tensor's logical shape does not match the expected shape.
    #[error("tensor '{name}' has wrong shape; expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The checkpoint contained tensors the model builder never claimed.
    #[error("file contained more tensors than expected")]
    UnusedTensor,

    /// Underlying file or mmap primitive failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Context, KV, scratch or compute buffer allocation failure.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Size arithmetic overflowed the native size type.
    #[error("size overflow: {0}")]
    Overflow(String),
}

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Multiply sizes, failing with [`LlamaError::Overflow`] instead of wrapping.
pub fn checked_mul(a: usize, b: usize) -> Result<usize> {
    a.checked_mul(b)
        .ok_or_else(|| LlamaError::Overflow(format!("{a} * {b}")))
}
