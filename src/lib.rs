// Exports a pretrained BART-family summarization model to ONNX.

pub mod attention;
pub mod common;
pub mod config;
pub mod error;
pub mod mlp;
pub mod model;
pub mod model_loader;
pub mod onnx;
pub mod pipeline;
pub mod resolver;
pub mod runtime_interface;
pub mod settings;
pub mod tensor;
pub mod tensor_ops;
pub mod tokenizer;
pub mod trace;

pub use error::{ExportError, ResolutionError, RuntimeError};
pub use model::Seq2SeqModel;
pub use pipeline::{export_with, run_export};
