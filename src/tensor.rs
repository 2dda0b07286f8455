// src/tensor.rs

use ndarray::{Array1, ArrayD, IxDyn};
use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Invalid dimension: {0}")]
    InvalidDimension(String),
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),
    #[error("Unsupported axis: {0}")]
    UnsupportedAxis(String),
    #[error("Incompatible shapes: {0}")]
    IncompatibleShapes(String),
    #[error("Dtype mismatch: expected {expected}, got {actual}")]
    DtypeMismatch { expected: DType, actual: DType },
}

/// Element types that flow through a traced graph.
///
/// The discriminants are the ONNX `TensorProto.DataType` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32 = 1,
    I64 = 7,
}

impl DType {
    pub fn onnx_code(self) -> i32 {
        self as i32
    }

    pub fn from_onnx_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(DType::F32),
            7 => Some(DType::I64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::I64 => write!(f, "i64"),
        }
    }
}

/// A dense, row-major tensor of one of the supported element types.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I64(_) => DType::I64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::F32(a) => a.shape(),
            TensorData::I64(a) => a.shape(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(a) => a.len(),
            TensorData::I64(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scalar_f32(value: f32) -> Self {
        TensorData::F32(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn vec_i64(values: &[i64]) -> Self {
        TensorData::I64(Array1::from(values.to_vec()).into_dyn())
    }

    pub fn as_f32(&self) -> Result<&ArrayD<f32>, TensorError> {
        match self {
            TensorData::F32(a) => Ok(a),
            other => Err(TensorError::DtypeMismatch { expected: DType::F32, actual: other.dtype() }),
        }
    }

    pub fn as_i64(&self) -> Result<&ArrayD<i64>, TensorError> {
        match self {
            TensorData::I64(a) => Ok(a),
            other => Err(TensorError::DtypeMismatch { expected: DType::I64, actual: other.dtype() }),
        }
    }

    /// Little-endian element bytes in row-major order, as ONNX `raw_data` expects.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::F32(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::I64(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn from_le_bytes(dtype: DType, shape: &[usize], bytes: &[u8]) -> Result<Self, TensorError> {
        let expected_elements: usize = shape.iter().product();
        match dtype {
            DType::F32 => {
                if bytes.len() != expected_elements * 4 {
                    return Err(TensorError::ShapeMismatch(format!(
                        "expected {} bytes for f32 shape {:?}, got {}",
                        expected_elements * 4, shape, bytes.len()
                    )));
                }
                let data: Vec<f32> = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                ArrayD::from_shape_vec(IxDyn(shape), data)
                    .map(TensorData::F32)
                    .map_err(|e| TensorError::ShapeMismatch(e.to_string()))
            }
            DType::I64 => {
                if bytes.len() != expected_elements * 8 {
                    return Err(TensorError::ShapeMismatch(format!(
                        "expected {} bytes for i64 shape {:?}, got {}",
                        expected_elements * 8, shape, bytes.len()
                    )));
                }
                let data: Vec<i64> = bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect();
                ArrayD::from_shape_vec(IxDyn(shape), data)
                    .map(TensorData::I64)
                    .map_err(|e| TensorError::ShapeMismatch(e.to_string()))
            }
        }
    }
}

impl From<ArrayD<f32>> for TensorData {
    fn from(a: ArrayD<f32>) -> Self {
        TensorData::F32(a)
    }
}

impl From<ArrayD<i64>> for TensorData {
    fn from(a: ArrayD<i64>) -> Self {
        TensorData::I64(a)
    }
}
