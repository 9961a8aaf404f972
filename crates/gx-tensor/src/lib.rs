//! `gx-tensor` - Host tensors and device placement for the gx generation runtime.
//!
//! This crate provides:
//! - A `Tensor` type backed by typed host storage and tagged with a device
//! - A `DeviceInterface` trait for the devices an inference engine exposes
//! - A reference `CpuDevice` implementation
//! - Shape utilities
//! - Element type definitions (F32, F16, I32, I64, U8, Bool)
//!
//! Only data movement lives here (casts, row repeats and gathers, slicing and
//! concatenation along an axis). Numeric kernels belong to the engine.

pub mod device;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod storage;
pub mod tensor;

// Re-export primary types at the crate root for convenience.
pub use device::{CpuDevice, DeviceInterface, DeviceType};
pub use dtype::{DType, Element};
pub use error::{Result, TensorError};
pub use shape::Shape;
pub use storage::CpuStorage;
pub use tensor::Tensor;
