// src/error.rs

use std::path::PathBuf;

use crate::model::ModelError;
use crate::onnx::OnnxError;
use crate::settings::SettingsError;
use crate::tensor::TensorError;
use crate::tokenizer::TokenizerError;

/// Failures while turning a model identifier into loaded artifacts.
#[derive(thiserror::Error, Debug)]
pub enum ResolutionError {
    #[error("unknown model identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("'{file}' for '{id}' is not in the local cache and offline mode is enabled")]
    NotCached { id: String, file: String },

    #[error("failed to fetch '{file}' for '{id}': {reason}")]
    Fetch { id: String, file: String, reason: String },

    #[error("'{id}' does not provide any of: {files}")]
    MissingArtifact { id: String, files: String },

    #[error("corrupt artifact {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("unsupported architecture '{0}' (expected a BART-family encoder-decoder)")]
    UnsupportedArchitecture(String),

    #[error("model construction failed: {0}")]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while tracing a model and writing the ONNX file.
#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error("model must be in evaluation mode before export")]
    NotInEvalMode,

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("opset {requested} is not supported (supported range {min}..={max})")]
    UnsupportedOpset { requested: i64, min: i64, max: i64 },

    #[error("operator {op} is not available in opset {opset}")]
    UnsupportedOperator { op: String, opset: i64 },

    #[error("invalid tensor name: {0}")]
    InvalidName(String),

    #[error("tensor error during tracing: {0}")]
    Tensor(#[from] TensorError),

    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error surfaced by the binary.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("resolution failed")]
    Resolution(#[from] ResolutionError),

    #[error("export failed")]
    Export(#[from] ExportError),

    #[error("could not read exported graph")]
    Onnx(#[from] OnnxError),

    #[error("invalid settings")]
    Settings(#[from] SettingsError),

    #[error("tokenization failed")]
    Tokenizer(#[from] TokenizerError),
}
