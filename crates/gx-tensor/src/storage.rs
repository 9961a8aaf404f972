use half::f16;

use crate::dtype::{DType, Element};
use crate::error::{Result, TensorError};

/// Host-side tensor storage, one variant per element type.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
}

/// Apply a generic expression to the vector inside any storage variant,
/// re-wrapping the result in the same variant.
macro_rules! map_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            CpuStorage::F32($v) => CpuStorage::F32($body),
            CpuStorage::F16($v) => CpuStorage::F16($body),
            CpuStorage::I32($v) => CpuStorage::I32($body),
            CpuStorage::I64($v) => CpuStorage::I64($body),
            CpuStorage::U8($v) => CpuStorage::U8($body),
            CpuStorage::Bool($v) => CpuStorage::Bool($body),
        }
    };
}

impl CpuStorage {
    /// Number of elements in this storage.
    pub fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F16(v) => v.len(),
            CpuStorage::I32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::Bool(v) => v.len(),
        }
    }

    /// Returns true if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::I32(_) => DType::I32,
            CpuStorage::I64(_) => DType::I64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::Bool(_) => DType::Bool,
        }
    }

    /// Create zero-filled storage for the given dtype and element count.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::F32 => CpuStorage::F32(vec![0.0; n]),
            DType::F16 => CpuStorage::F16(vec![f16::ZERO; n]),
            DType::I32 => CpuStorage::I32(vec![0; n]),
            DType::I64 => CpuStorage::I64(vec![0; n]),
            DType::U8 => CpuStorage::U8(vec![0; n]),
            DType::Bool => CpuStorage::Bool(vec![false; n]),
        }
    }

    /// Returns the data as a typed slice.
    ///
    /// # Errors
    /// Returns `DTypeMismatch` if `T` does not match the storage variant.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        T::slice(self).ok_or(TensorError::DTypeMismatch {
            expected: T::DTYPE,
            got: self.dtype(),
        })
    }

    /// Returns the data as a mutable typed slice.
    pub fn as_slice_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let got = self.dtype();
        T::slice_mut(self).ok_or(TensorError::DTypeMismatch {
            expected: T::DTYPE,
            got,
        })
    }

    /// Convert every element to `dtype`, allocating new storage.
    pub fn cast(&self, dtype: DType) -> CpuStorage {
        if dtype == self.dtype() {
            return self.clone();
        }
        let wide: Vec<f64> = match self {
            CpuStorage::F32(v) => widen(v),
            CpuStorage::F16(v) => widen(v),
            CpuStorage::I32(v) => widen(v),
            CpuStorage::I64(v) => widen(v),
            CpuStorage::U8(v) => widen(v),
            CpuStorage::Bool(v) => widen(v),
        };
        match dtype {
            DType::F32 => CpuStorage::F32(narrow(&wide)),
            DType::F16 => CpuStorage::F16(narrow(&wide)),
            DType::I32 => CpuStorage::I32(narrow(&wide)),
            DType::I64 => CpuStorage::I64(narrow(&wide)),
            DType::U8 => CpuStorage::U8(narrow(&wide)),
            DType::Bool => CpuStorage::Bool(narrow(&wide)),
        }
    }

    /// Repeat each row of `row_len` elements `times` times, keeping the
    /// copies of one row adjacent.
    pub(crate) fn repeat_rows(&self, row_len: usize, times: usize) -> CpuStorage {
        map_storage!(self, v => repeat_rows(v, row_len, times))
    }

    /// Build new storage from the rows selected by `indices`.
    pub(crate) fn gather_rows(&self, row_len: usize, indices: &[usize]) -> CpuStorage {
        map_storage!(self, v => gather_rows(v, row_len, indices))
    }

    /// Keep `len` entries starting at `start` along an axis of size `axis_len`.
    ///
    /// The data is viewed as `[outer, axis_len, inner]`.
    pub(crate) fn narrow(
        &self,
        outer: usize,
        axis_len: usize,
        inner: usize,
        start: usize,
        len: usize,
    ) -> CpuStorage {
        map_storage!(self, v => narrow_axis(v, outer, axis_len, inner, start, len))
    }

    /// Append `other` after `self` along an axis.
    ///
    /// `self` is viewed as `[outer, a_len, inner]`, `other` as `[outer, b_len, inner]`.
    pub(crate) fn concat(
        &self,
        other: &CpuStorage,
        outer: usize,
        a_len: usize,
        b_len: usize,
        inner: usize,
    ) -> Result<CpuStorage> {
        let other = other.cast(self.dtype());
        let joined = match (self, &other) {
            (CpuStorage::F32(a), CpuStorage::F32(b)) => {
                CpuStorage::F32(concat_axis(a, b, outer, a_len, b_len, inner))
            }
            (CpuStorage::F16(a), CpuStorage::F16(b)) => {
                CpuStorage::F16(concat_axis(a, b, outer, a_len, b_len, inner))
            }
            (CpuStorage::I32(a), CpuStorage::I32(b)) => {
                CpuStorage::I32(concat_axis(a, b, outer, a_len, b_len, inner))
            }
            (CpuStorage::I64(a), CpuStorage::I64(b)) => {
                CpuStorage::I64(concat_axis(a, b, outer, a_len, b_len, inner))
            }
            (CpuStorage::U8(a), CpuStorage::U8(b)) => {
                CpuStorage::U8(concat_axis(a, b, outer, a_len, b_len, inner))
            }
            (CpuStorage::Bool(a), CpuStorage::Bool(b)) => {
                CpuStorage::Bool(concat_axis(a, b, outer, a_len, b_len, inner))
            }
            _ => {
                return Err(TensorError::DTypeMismatch {
                    expected: self.dtype(),
                    got: other.dtype(),
                })
            }
        };
        Ok(joined)
    }
}

fn widen<T: Element>(v: &[T]) -> Vec<f64> {
    v.iter().map(|x| x.to_f64()).collect()
}

fn narrow<T: Element>(v: &[f64]) -> Vec<T> {
    v.iter().map(|&x| T::from_f64(x)).collect()
}

fn repeat_rows<T: Copy>(v: &[T], row_len: usize, times: usize) -> Vec<T> {
    if row_len == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(v.len() * times);
    for row in v.chunks(row_len) {
        for _ in 0..times {
            out.extend_from_slice(row);
        }
    }
    out
}

fn gather_rows<T: Copy>(v: &[T], row_len: usize, indices: &[usize]) -> Vec<T> {
    let mut out = Vec::with_capacity(indices.len() * row_len);
    for &i in indices {
        out.extend_from_slice(&v[i * row_len..(i + 1) * row_len]);
    }
    out
}

fn narrow_axis<T: Copy>(
    v: &[T],
    outer: usize,
    axis_len: usize,
    inner: usize,
    start: usize,
    len: usize,
) -> Vec<T> {
    let mut out = Vec::with_capacity(outer * len * inner);
    for o in 0..outer {
        let base = (o * axis_len + start) * inner;
        out.extend_from_slice(&v[base..base + len * inner]);
    }
    out
}

fn concat_axis<T: Copy>(
    a: &[T],
    b: &[T],
    outer: usize,
    a_len: usize,
    b_len: usize,
    inner: usize,
) -> Vec<T> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    for o in 0..outer {
        out.extend_from_slice(&a[o * a_len * inner..(o + 1) * a_len * inner]);
        out.extend_from_slice(&b[o * b_len * inner..(o + 1) * b_len * inner]);
    }
    out
}
