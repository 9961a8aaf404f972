use thiserror::Error;

use crate::dtype::DType;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },
    #[error("invalid axis {axis} for tensor with {ndim} dimensions")]
    InvalidAxis { axis: usize, ndim: usize },
    #[error("range {start}..{end} out of bounds for axis of length {len}")]
    OutOfRange { start: usize, end: usize, len: usize },
    #[error("row index {index} out of bounds for {rows} rows")]
    RowIndex { index: i64, rows: usize },
    #[error("unsupported dtype: {0}")]
    UnsupportedDType(String),
    #[error("device {device}: {message}")]
    Device { device: String, message: String },
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;
