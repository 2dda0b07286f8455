// src/onnx/mod.rs

mod error;
pub mod export;
pub mod proto;
pub mod reader;

pub use error::OnnxError;
pub use export::{ExportOptions, ExportSummary, ModelExporter, OnnxExporter, MAX_OPSET, MIN_OPSET};
pub use reader::{GraphMetadata, IoSignature, OnnxGraph};
