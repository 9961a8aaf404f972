use std::fmt::{self, Debug};

use crate::dtype::DType;
use crate::error::Result;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Hardware families an execution provider can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Cuda,
    Dml,
    WebGpu,
    Qnn,
    OpenVino,
    NvTensorRtRtx,
}

impl DeviceType {
    /// Maps a provider name as written in configuration files to a device.
    ///
    /// Matching is case-insensitive; unknown names yield `None`.
    pub fn from_provider_name(name: &str) -> Option<DeviceType> {
        match name.to_ascii_lowercase().as_str() {
            "cpu" => Some(DeviceType::Cpu),
            "cuda" => Some(DeviceType::Cuda),
            "dml" => Some(DeviceType::Dml),
            "webgpu" => Some(DeviceType::WebGpu),
            "qnn" => Some(DeviceType::Qnn),
            "openvino" => Some(DeviceType::OpenVino),
            "nvtensorrtrtx" => Some(DeviceType::NvTensorRtRtx),
            _ => None,
        }
    }

    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::Dml => "dml",
            DeviceType::WebGpu => "webgpu",
            DeviceType::Qnn => "qnn",
            DeviceType::OpenVino => "openvino",
            DeviceType::NvTensorRtRtx => "nvtensorrtrtx",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A device tensors can be allocated on and copied to.
///
/// The inference engine owns device memory; it hands out implementations of
/// this trait for the devices it drives. `CpuDevice` is always available.
pub trait DeviceInterface: Send + Sync + Debug {
    /// The device family this interface allocates on.
    fn device_type(&self) -> DeviceType;

    /// Returns the name of this device (e.g., "cpu", "cuda").
    fn name(&self) -> &str {
        self.device_type().name()
    }

    /// Allocate a zero-initialized tensor on this device.
    fn allocate(&self, dtype: DType, shape: Shape) -> Result<Tensor>;

    /// Copy a tensor from wherever it lives onto this device. Always
    /// allocates, even when the tensor is already resident.
    fn copy_from(&self, tensor: &Tensor) -> Result<Tensor>;
}

/// The host device.
#[derive(Debug, Clone, Default)]
pub struct CpuDevice;

impl CpuDevice {
    pub fn new() -> Self {
        CpuDevice
    }
}

impl DeviceInterface for CpuDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn allocate(&self, dtype: DType, shape: Shape) -> Result<Tensor> {
        Ok(Tensor::zeros(dtype, shape))
    }

    fn copy_from(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone().to_device(DeviceType::Cpu))
    }
}
