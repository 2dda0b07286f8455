// src/onnx/export.rs

use ndarray::ArrayD;
use prost::Message;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::ExportError;
use crate::model::{Mode, Seq2SeqModel};
use crate::onnx::proto::{
    attribute_type, AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TypeProto,
    ValueInfoProto,
};
use crate::tensor::TensorData;
use crate::trace::{ir_version_for_opset, Attribute, TensorInfo, TracedGraph, Tracer};

/// Lowest opset whose `Slice` takes starts/ends/axes as inputs.
pub const MIN_OPSET: i64 = 10;
/// Highest opset whose `ReduceMean` still takes `axes` as an attribute.
pub const MAX_OPSET: i64 = 17;

const GRAPH_NAME: &str = "main_graph";

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub opset_version: i64,
    pub input_name: String,
    pub output_name: String,
    pub doc_string: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            opset_version: 12,
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            doc_string: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub node_count: usize,
    pub initializer_count: usize,
    pub opset: i64,
}

/// A target format a resolved model can be written to.
pub trait ModelExporter {
    fn export(
        &self,
        model: &Seq2SeqModel,
        input_ids: &ArrayD<i64>,
        path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportSummary, ExportError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxExporter;

impl ModelExporter for OnnxExporter {
    fn export(
        &self,
        model: &Seq2SeqModel,
        input_ids: &ArrayD<i64>,
        path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportSummary, ExportError> {
        let graph = trace_model(model, input_ids, options)?;
        let proto = to_model_proto(&graph, &options.doc_string);
        let bytes = proto.encode_to_vec();
        let bytes_written = write_atomically(path, &bytes)?;

        log::info!(
            "wrote {} ({} bytes, {} nodes, {} initializers, opset {})",
            path.display(),
            bytes_written,
            graph.nodes.len(),
            graph.initializers.len(),
            graph.opset
        );

        Ok(ExportSummary {
            path: path.to_path_buf(),
            bytes_written,
            node_count: graph.nodes.len(),
            initializer_count: graph.initializers.len(),
            opset: graph.opset,
        })
    }
}

fn check_inputs(model: &Seq2SeqModel, input_ids: &ArrayD<i64>, options: &ExportOptions) -> Result<(), ExportError> {
    if model.mode() != Mode::Eval {
        return Err(ExportError::NotInEvalMode);
    }
    if !(MIN_OPSET..=MAX_OPSET).contains(&options.opset_version) {
        return Err(ExportError::UnsupportedOpset { requested: options.opset_version, min: MIN_OPSET, max: MAX_OPSET });
    }
    if options.input_name.is_empty() || options.output_name.is_empty() {
        return Err(ExportError::InvalidName("graph input and output names must be non-empty".to_string()));
    }
    if options.input_name == options.output_name {
        return Err(ExportError::InvalidName(format!(
            "graph input and output share the name '{}'",
            options.input_name
        )));
    }

    let seq_len = match input_ids.shape() {
        [1, n] if *n > 0 => *n,
        other => {
            return Err(ExportError::ShapeMismatch(format!(
                "dummy input must have shape [1, n] with n > 0, got {:?}",
                other
            )))
        }
    };
    let config = model.config();
    if seq_len > config.max_position_embeddings {
        return Err(ExportError::ShapeMismatch(format!(
            "dummy input has {} tokens but the model supports at most {}",
            seq_len, config.max_position_embeddings
        )));
    }
    let vocab = model.vocab_size() as i64;
    if let Some(bad) = input_ids.iter().find(|&&id| id < 0 || id >= vocab) {
        return Err(ExportError::ShapeMismatch(format!(
            "token id {} is outside the model vocabulary of {}",
            bad, vocab
        )));
    }
    Ok(())
}

/// Runs one recorded forward pass over `input_ids`.
pub fn trace_model(
    model: &Seq2SeqModel,
    input_ids: &ArrayD<i64>,
    options: &ExportOptions,
) -> Result<TracedGraph, ExportError> {
    check_inputs(model, input_ids, options)?;

    let mut tracer = Tracer::recording(options.opset_version);
    let input = tracer.input(&options.input_name, TensorData::I64(input_ids.clone()));
    let logits = model.forward(&mut tracer, &input)?;
    log::debug!("traced {} nodes", tracer.node_count());
    tracer.finish(&logits, &options.output_name)
}

fn tensor_proto(name: &str, data: &TensorData) -> TensorProto {
    TensorProto {
        dims: data.shape().iter().map(|&d| d as i64).collect(),
        data_type: data.dtype().onnx_code(),
        name: name.to_string(),
        raw_data: data.to_le_bytes(),
        ..Default::default()
    }
}

fn attribute_proto(name: &str, attribute: &Attribute) -> AttributeProto {
    let mut proto = AttributeProto { name: name.to_string(), ..Default::default() };
    match attribute {
        Attribute::Int(i) => {
            proto.r#type = attribute_type::INT;
            proto.i = *i;
        }
        Attribute::Ints(ints) => {
            proto.r#type = attribute_type::INTS;
            proto.ints = ints.clone();
        }
        Attribute::Tensor(data) => {
            proto.r#type = attribute_type::TENSOR;
            proto.t = Some(tensor_proto("", data));
        }
    }
    proto
}

fn value_info(info: &TensorInfo) -> ValueInfoProto {
    ValueInfoProto {
        name: info.name.clone(),
        r#type: Some(TypeProto::tensor(info.dtype.onnx_code(), &info.shape)),
        doc_string: String::new(),
    }
}

/// Serializable form of a traced graph. Node, initializer and attribute
/// order all follow the trace, so equal traces give equal bytes.
pub fn to_model_proto(graph: &TracedGraph, doc_string: &str) -> ModelProto {
    let node = graph
        .nodes
        .iter()
        .map(|n| NodeProto {
            input: n.inputs.clone(),
            output: n.outputs.clone(),
            name: n.name.clone(),
            op_type: n.op.op_type().to_string(),
            attribute: n.attributes.iter().map(|(k, v)| attribute_proto(k, v)).collect(),
            ..Default::default()
        })
        .collect();
    let initializer = graph.initializers.iter().map(|v| tensor_proto(v.name(), v.data())).collect();

    ModelProto {
        ir_version: ir_version_for_opset(graph.opset),
        opset_import: vec![OperatorSetIdProto { domain: String::new(), version: graph.opset }],
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        doc_string: doc_string.to_string(),
        graph: Some(GraphProto {
            node,
            name: GRAPH_NAME.to_string(),
            initializer,
            input: vec![value_info(&graph.input)],
            output: vec![value_info(&graph.output)],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Writes `bytes` to a temp file beside `path` and renames it into place, so
/// `path` either holds the complete file or is left untouched.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<u64, ExportError> {
    let io_err = |source: std::io::Error| ExportError::Io { path: path.to_path_buf(), source };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(bytes.len() as u64)
}
