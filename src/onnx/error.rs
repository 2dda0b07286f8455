use std::path::PathBuf;

use crate::tensor::TensorError;

/// Failures while reading an ONNX file or running it with tract.
#[derive(thiserror::Error, Debug)]
pub enum OnnxError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode ModelProto: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("model has no graph")]
    MissingGraph,

    #[error("unsupported tensor data type {0}")]
    UnsupportedDataType(i32),

    #[error("value '{0}' is not defined")]
    MissingValue(String),

    #[error("onnx runtime: {0}")]
    Runtime(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
}
