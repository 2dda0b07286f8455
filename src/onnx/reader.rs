// src/onnx/reader.rs
//
// Loads ONNX files written by this crate. Metadata and initializers come
// straight from the decoded protobuf; evaluation goes through tract.

use prost::Message;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tract_onnx::prelude::*;

use crate::onnx::error::OnnxError;
use crate::onnx::proto::{GraphProto, ModelProto, TensorProto, ValueInfoProto};
use crate::tensor::{DType, TensorData};

/// Name, element type and dims of a graph input or output as declared in
/// the file. Symbolic dims are `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct IoSignature {
    pub name: String,
    pub elem_type: i32,
    pub dims: Vec<Option<i64>>,
}

impl fmt::Display for IoSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ty = match DType::from_onnx_code(self.elem_type) {
            Some(d) => d.to_string(),
            None => format!("type#{}", self.elem_type),
        };
        let dims: Vec<String> = self
            .dims
            .iter()
            .map(|d| d.map_or_else(|| "?".to_string(), |v| v.to_string()))
            .collect();
        write!(f, "{}: {}[{}]", self.name, ty, dims.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphMetadata {
    pub ir_version: i64,
    pub producer_name: String,
    pub producer_version: String,
    pub doc_string: String,
    pub opsets: Vec<(String, i64)>,
    pub inputs: Vec<IoSignature>,
    pub outputs: Vec<IoSignature>,
    pub node_count: usize,
    pub initializer_count: usize,
}

#[derive(Debug, Clone)]
pub struct OnnxGraph {
    model: ModelProto,
    bytes: Vec<u8>,
}

impl OnnxGraph {
    pub fn open(path: &Path) -> Result<Self, OnnxError> {
        let bytes = fs::read(path).map_err(|source| OnnxError::Io { path: path.to_path_buf(), source })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OnnxError> {
        let model = ModelProto::decode(bytes)?;
        if model.graph.is_none() {
            return Err(OnnxError::MissingGraph);
        }
        Ok(OnnxGraph { model, bytes: bytes.to_vec() })
    }

    pub fn model(&self) -> &ModelProto {
        &self.model
    }

    fn graph(&self) -> Result<&GraphProto, OnnxError> {
        self.model.graph.as_ref().ok_or(OnnxError::MissingGraph)
    }

    /// Default-domain opset, or 1 if none is declared.
    pub fn opset(&self) -> i64 {
        self.model
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
            .map_or(1, |o| o.version)
    }

    pub fn metadata(&self) -> Result<GraphMetadata, OnnxError> {
        let graph = self.graph()?;
        Ok(GraphMetadata {
            ir_version: self.model.ir_version,
            producer_name: self.model.producer_name.clone(),
            producer_version: self.model.producer_version.clone(),
            doc_string: self.model.doc_string.clone(),
            opsets: self.model.opset_import.iter().map(|o| (o.domain.clone(), o.version)).collect(),
            inputs: graph.input.iter().map(signature).collect(),
            outputs: graph.output.iter().map(signature).collect(),
            node_count: graph.node.len(),
            initializer_count: graph.initializer.len(),
        })
    }

    pub fn op_histogram(&self) -> Result<BTreeMap<String, usize>, OnnxError> {
        let mut histogram = BTreeMap::new();
        for node in &self.graph()?.node {
            *histogram.entry(node.op_type.clone()).or_insert(0) += 1;
        }
        Ok(histogram)
    }

    pub fn initializer_names(&self) -> Result<Vec<&str>, OnnxError> {
        Ok(self.graph()?.initializer.iter().map(|t| t.name.as_str()).collect())
    }

    pub fn initializer(&self, name: &str) -> Result<TensorData, OnnxError> {
        let tensor = self
            .graph()?
            .initializer
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| OnnxError::MissingValue(name.to_string()))?;
        decode_tensor(tensor)
    }

    fn optimized(&self) -> Result<TypedModel, OnnxError> {
        tract_onnx::onnx()
            .model_for_read(&mut self.bytes.as_slice())
            .and_then(|m| m.into_optimized())
            .map_err(runtime_err)
    }

    /// Loads, type-checks and optimizes the graph with tract without
    /// running it.
    pub fn check(&self) -> Result<(), OnnxError> {
        self.optimized()?.into_runnable().map_err(runtime_err)?;
        Ok(())
    }

    /// Evaluates the graph with tract on the given named inputs and returns
    /// the graph outputs in declaration order.
    pub fn run(&self, inputs: &[(&str, TensorData)]) -> Result<Vec<(String, TensorData)>, OnnxError> {
        let graph = self.graph()?;
        let mut feed: TVec<TValue> = tvec!();
        for declared in &graph.input {
            let data = inputs
                .iter()
                .find(|(name, _)| *name == declared.name)
                .map(|(_, data)| data)
                .ok_or_else(|| OnnxError::MissingValue(declared.name.clone()))?;
            feed.push(to_tract(data)?.into());
        }

        let plan = self.optimized()?.into_runnable().map_err(runtime_err)?;
        let outputs = plan.run(feed).map_err(runtime_err)?;
        graph
            .output
            .iter()
            .zip(outputs.iter())
            .map(|(info, value)| Ok((info.name.clone(), from_tract(value)?)))
            .collect()
    }
}

fn runtime_err(e: TractError) -> OnnxError {
    OnnxError::Runtime(format!("{:#}", e))
}

fn to_tract(data: &TensorData) -> Result<Tensor, OnnxError> {
    let shape = tract_ndarray::IxDyn(data.shape());
    let tensor: Tensor = match data {
        TensorData::F32(a) => tract_ndarray::ArrayD::from_shape_vec(shape, a.iter().copied().collect())
            .map_err(|e| OnnxError::Runtime(e.to_string()))?
            .into(),
        TensorData::I64(a) => tract_ndarray::ArrayD::from_shape_vec(shape, a.iter().copied().collect())
            .map_err(|e| OnnxError::Runtime(e.to_string()))?
            .into(),
    };
    Ok(tensor)
}

fn from_tract(value: &TValue) -> Result<TensorData, OnnxError> {
    if let Ok(view) = value.to_array_view::<f32>() {
        let bytes: Vec<u8> = view.iter().flat_map(|v| v.to_le_bytes()).collect();
        return Ok(TensorData::from_le_bytes(DType::F32, view.shape(), &bytes)?);
    }
    if let Ok(view) = value.to_array_view::<i64>() {
        let bytes: Vec<u8> = view.iter().flat_map(|v| v.to_le_bytes()).collect();
        return Ok(TensorData::from_le_bytes(DType::I64, view.shape(), &bytes)?);
    }
    Err(OnnxError::Runtime(format!("unsupported output type {:?}", value.datum_type())))
}

fn signature(info: &ValueInfoProto) -> IoSignature {
    let (elem_type, dims) = info.r#type.as_ref().and_then(|t| t.tensor_signature()).unwrap_or((0, Vec::new()));
    IoSignature { name: info.name.clone(), elem_type, dims }
}

pub fn decode_tensor(tensor: &TensorProto) -> Result<TensorData, OnnxError> {
    let dtype = DType::from_onnx_code(tensor.data_type).ok_or(OnnxError::UnsupportedDataType(tensor.data_type))?;
    let shape: Vec<usize> = tensor.dims.iter().map(|&d| d.max(0) as usize).collect();
    if !tensor.raw_data.is_empty() {
        return Ok(TensorData::from_le_bytes(dtype, &shape, &tensor.raw_data)?);
    }
    let bytes: Vec<u8> = match dtype {
        DType::F32 => tensor.float_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::I64 => tensor.int64_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
    };
    Ok(TensorData::from_le_bytes(dtype, &shape, &bytes)?)
}
