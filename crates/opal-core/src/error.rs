use crate::dtype::DType;

/// Errors surfaced by graph construction and eager evaluation.
///
/// Every failure is deterministic given the same inputs and is surfaced
/// synchronously to the caller; no partial graph state is produced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OpalError {
    /// Shape/rank/dtype/parameter-domain violation detected at graph
    /// construction time. Always names the failing operator.
    #[error("[{op}] {msg}")]
    InvalidArgument { op: &'static str, msg: String },

    /// A requested combination the implementation does not provide
    /// (a caller logic error, not a data error).
    #[error("[{op}] unsupported: {msg}")]
    Unsupported { op: &'static str, msg: String },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("operation not supported for dtype {0}")]
    UnsupportedDType(DType),

    #[error("cannot broadcast shapes {a:?} and {b:?}")]
    BroadcastError { a: Vec<usize>, b: Vec<usize> },

    #[error("axis {axis} out of range for tensor with {ndim} dimensions")]
    InvalidAxis { axis: isize, ndim: usize },

    #[error("cannot reshape tensor with {numel} elements to {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<isize> },

    #[error("matmul dimension mismatch: [{m}, {k1}] @ [{k2}, {n}]")]
    MatmulDimMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    #[error("storage error: {0}")]
    StorageError(String),
}

impl OpalError {
    /// Invalid-argument with the failing operator name.
    pub fn invalid(op: &'static str, msg: impl Into<String>) -> Self {
        OpalError::InvalidArgument { op, msg: msg.into() }
    }

    /// Unsupported-operation with the failing operator name.
    pub fn unsupported(op: &'static str, msg: impl Into<String>) -> Self {
        OpalError::Unsupported { op, msg: msg.into() }
    }
}
