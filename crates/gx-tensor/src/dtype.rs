use std::fmt;

use half::f16;

use crate::storage::CpuStorage;

/// Element types a session may declare for its inputs and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point (IEEE 754 half-precision, via the `half` crate).
    F16,
    /// 32-bit signed integer (token ids, attention masks).
    I32,
    /// 64-bit signed integer (token ids, position ids, image sizes).
    I64,
    /// Unsigned byte (raw pixels).
    U8,
    /// Boolean.
    Bool,
}

impl DType {
    /// Returns the size in bytes of a single element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::U8 | DType::Bool => 1,
        }
    }

    /// Converts an ONNX `TensorProto.DataType` id to a `DType`.
    ///
    /// ONNX ids:
    /// - 1 => F32
    /// - 2 => U8
    /// - 6 => I32
    /// - 7 => I64
    /// - 9 => Bool
    /// - 10 => F16
    pub fn from_onnx_type(id: i32) -> Option<DType> {
        match id {
            1 => Some(DType::F32),
            2 => Some(DType::U8),
            6 => Some(DType::I32),
            7 => Some(DType::I64),
            9 => Some(DType::Bool),
            10 => Some(DType::F16),
            _ => None,
        }
    }

    /// Returns the ONNX `TensorProto.DataType` id for this `DType`.
    pub fn to_onnx_type(&self) -> i32 {
        match self {
            DType::F32 => 1,
            DType::U8 => 2,
            DType::I32 => 6,
            DType::I64 => 7,
            DType::Bool => 9,
            DType::F16 => 10,
        }
    }

    /// Returns true for floating point element types.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
            DType::U8 => write!(f, "u8"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

/// A Rust scalar type that maps onto one `DType` variant of `CpuStorage`.
pub trait Element: Copy + fmt::Debug + PartialEq + Send + Sync + 'static {
    const DTYPE: DType;

    fn slice(storage: &CpuStorage) -> Option<&[Self]>;
    fn slice_mut(storage: &mut CpuStorage) -> Option<&mut [Self]>;
    fn into_storage(data: Vec<Self>) -> CpuStorage;

    /// Widening conversion used by casts.
    fn to_f64(self) -> f64;
    /// Narrowing conversion used by casts (saturating for integers).
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $to:expr, $from:expr) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn slice(storage: &CpuStorage) -> Option<&[Self]> {
                match storage {
                    CpuStorage::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(storage: &mut CpuStorage) -> Option<&mut [Self]> {
                match storage {
                    CpuStorage::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }

            fn into_storage(data: Vec<Self>) -> CpuStorage {
                CpuStorage::$variant(data)
            }

            fn to_f64(self) -> f64 {
                let to: fn($ty) -> f64 = $to;
                to(self)
            }

            fn from_f64(v: f64) -> Self {
                let from: fn(f64) -> $ty = $from;
                from(v)
            }
        }
    };
}

impl_element!(f32, F32, |x| x as f64, |v| v as f32);
impl_element!(f16, F16, |x| x.to_f64(), f16::from_f64);
impl_element!(i32, I32, |x| x as f64, |v| v as i32);
impl_element!(i64, I64, |x| x as f64, |v| v as i64);
impl_element!(u8, U8, |x| x as f64, |v| v as u8);
impl_element!(bool, Bool, |x| if x { 1.0 } else { 0.0 }, |v| v != 0.0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::I64.size_in_bytes(), 8);
        assert_eq!(DType::Bool.size_in_bytes(), 1);
    }

    #[test]
    fn test_onnx_ids() {
        assert_eq!(DType::from_onnx_type(1), Some(DType::F32));
        assert_eq!(DType::from_onnx_type(7), Some(DType::I64));
        assert_eq!(DType::F16.to_onnx_type(), 10);
        assert!(DType::from_onnx_type(999).is_none());
    }

    #[test]
    fn test_element_saturates_on_narrowing() {
        assert_eq!(<u8 as Element>::from_f64(300.0), 255);
        assert_eq!(<i32 as Element>::from_f64(-1.7), -1);
        assert!(<bool as Element>::from_f64(2.0));
    }
}
