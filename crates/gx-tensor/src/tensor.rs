use crate::device::DeviceType;
use crate::dtype::{DType, Element};
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::CpuStorage;

/// A tensor backed by host storage and tagged with the device it belongs to.
///
/// Holds contiguous, row-major data with an associated shape. The element
/// type is carried by the storage variant. Every operation that changes the
/// layout allocates a new tensor; nothing aliases.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    storage: CpuStorage,
    shape: Shape,
    device: DeviceType,
}

impl Tensor {
    /// Create a CPU tensor from typed data and a shape.
    ///
    /// # Errors
    /// Returns `ShapeMismatch` if `data.len() != shape.numel()`.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if data.len() != shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Tensor {
            storage: T::into_storage(data),
            shape,
            device: DeviceType::Cpu,
        })
    }

    /// Create a zero-filled CPU tensor with the given dtype and shape.
    pub fn zeros(dtype: DType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Tensor {
            storage: CpuStorage::zeros(dtype, shape.numel()),
            shape,
            device: DeviceType::Cpu,
        }
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the tensor's element type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Returns the device the tensor is placed on.
    pub fn device(&self) -> DeviceType {
        self.device
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Size of the data in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    /// Returns the underlying storage reference.
    pub fn storage(&self) -> &CpuStorage {
        &self.storage
    }

    /// Returns the data as a typed slice.
    pub fn data<T: Element>(&self) -> Result<&[T]> {
        self.storage.as_slice()
    }

    /// Returns the data as a mutable typed slice.
    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.storage.as_slice_mut()
    }

    /// Copies the data out as a typed vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.data::<T>()?.to_vec())
    }

    /// Re-tag the tensor with a device. Used by `DeviceInterface`
    /// implementations once the data lives where the tag says.
    pub fn to_device(mut self, device: DeviceType) -> Tensor {
        self.device = device;
        self
    }

    /// Reshape the tensor, returning a new tensor with the same data but
    /// a different shape.
    ///
    /// The total number of elements must remain the same.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Tensor> {
        let new_shape = new_shape.into();
        if self.shape.numel() != new_shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.dims().to_vec(),
                got: new_shape.dims().to_vec(),
            });
        }
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: new_shape,
            device: self.device,
        })
    }

    /// Convert to another element type. Always allocates.
    pub fn cast(&self, dtype: DType) -> Tensor {
        Tensor {
            storage: self.storage.cast(dtype),
            shape: self.shape.clone(),
            device: self.device,
        }
    }

    /// Repeat every row along dimension 0 `times` times.
    ///
    /// Copies of one row stay adjacent: for an input of `b` rows the result
    /// has `b * times` rows and rows `[i*times, (i+1)*times)` equal row `i`.
    pub fn repeat_rows(&self, times: usize) -> Result<Tensor> {
        let (rows, row_len) = self.rows()?;
        Ok(Tensor {
            storage: self.storage.repeat_rows(row_len, times),
            shape: self.shape.with_dim(0, rows * times)?,
            device: self.device,
        })
    }

    /// Build a tensor from the rows (dimension 0) selected by `indices`.
    pub fn gather_rows(&self, indices: &[usize]) -> Result<Tensor> {
        let (rows, row_len) = self.rows()?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= rows) {
            return Err(TensorError::RowIndex {
                index: bad as i64,
                rows,
            });
        }
        Ok(Tensor {
            storage: self.storage.gather_rows(row_len, indices),
            shape: self.shape.with_dim(0, indices.len())?,
            device: self.device,
        })
    }

    /// Keep `len` entries of `axis` starting at `start`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let (outer, axis_len, inner) = self.shape.split_at_axis(axis)?;
        if start + len > axis_len {
            return Err(TensorError::OutOfRange {
                start,
                end: start + len,
                len: axis_len,
            });
        }
        Ok(Tensor {
            storage: self.storage.narrow(outer, axis_len, inner, start, len),
            shape: self.shape.with_dim(axis, len)?,
            device: self.device,
        })
    }

    /// Append `other` after `self` along `axis`.
    ///
    /// All other dimensions must match. `other` is cast to this tensor's
    /// element type.
    pub fn concat(&self, other: &Tensor, axis: usize) -> Result<Tensor> {
        let (outer, a_len, inner) = self.shape.split_at_axis(axis)?;
        let (b_outer, b_len, b_inner) = other.shape.split_at_axis(axis)?;
        let expected = self.shape.with_dim(axis, b_len)?;
        if (outer, inner) != (b_outer, b_inner) || expected != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: expected.dims().to_vec(),
                got: other.shape.dims().to_vec(),
            });
        }
        Ok(Tensor {
            storage: self
                .storage
                .concat(&other.storage, outer, a_len, b_len, inner)?,
            shape: self.shape.with_dim(axis, a_len + b_len)?,
            device: self.device,
        })
    }

    /// `(rows, elements per row)` along dimension 0.
    fn rows(&self) -> Result<(usize, usize)> {
        let (_, rows, row_len) = self.shape.split_at_axis(0)?;
        Ok((rows, row_len))
    }
}
