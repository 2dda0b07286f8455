// src/trace/mod.rs
//
// Recording tracer. Every tensor operation in the forward pass goes through a
// `Tracer`: the result is always computed eagerly with the dense kernels, and
// when recording the operation is also appended as an ONNX node.

pub mod ops;

use ndarray::ArrayD;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::ExportError;
use crate::tensor::{DType, TensorData};
use crate::tensor_ops;

pub use ops::{ir_version_for_opset, OpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// A graph input fed by the caller.
    Input,
    /// A named model weight; serialized as an initializer on first use.
    Parameter,
    /// The output of a recorded node.
    Intermediate,
}

/// A tensor flowing through the forward pass, tagged with the graph name it
/// is known by while recording.
#[derive(Debug, Clone)]
pub struct Value {
    name: Arc<str>,
    kind: ValueKind,
    data: Arc<TensorData>,
}

impl Value {
    pub fn parameter(name: &str, data: ArrayD<f32>) -> Self {
        Value { name: Arc::from(name), kind: ValueKind::Parameter, data: Arc::new(TensorData::F32(data)) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn f32(&self) -> Result<&ArrayD<f32>, ExportError> {
        Ok(self.data.as_f32()?)
    }

    pub fn i64(&self) -> Result<&ArrayD<i64>, ExportError> {
        Ok(self.data.as_i64()?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Ints(Vec<i64>),
    Tensor(TensorData),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<(String, Attribute)>,
}

/// Name, element type and static shape of a graph input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

/// Everything recorded during one forward pass, in execution order.
#[derive(Debug, Clone)]
pub struct TracedGraph {
    pub opset: i64,
    pub nodes: Vec<Node>,
    pub initializers: Vec<Value>,
    pub input: TensorInfo,
    pub output: TensorInfo,
}

#[derive(Debug)]
struct Recording {
    opset: i64,
    nodes: Vec<Node>,
    initializers: Vec<Value>,
    seen_parameters: HashSet<Arc<str>>,
    scope: Vec<String>,
    name_counts: HashMap<String, usize>,
    inputs: Vec<Value>,
}

#[derive(Debug)]
pub struct Tracer {
    recording: Option<Recording>,
}

impl Tracer {
    /// A tracer that only computes values.
    pub fn eager() -> Self {
        Tracer { recording: None }
    }

    /// A tracer that records every operation against the given opset.
    pub fn recording(opset: i64) -> Self {
        Tracer {
            recording: Some(Recording {
                opset,
                nodes: Vec::new(),
                initializers: Vec::new(),
                seen_parameters: HashSet::new(),
                scope: Vec::new(),
                name_counts: HashMap::new(),
                inputs: Vec::new(),
            }),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn node_count(&self) -> usize {
        self.recording.as_ref().map_or(0, |r| r.nodes.len())
    }

    /// Registers a graph input under its final graph name.
    pub fn input(&mut self, name: &str, data: TensorData) -> Value {
        let value = Value { name: Arc::from(name), kind: ValueKind::Input, data: Arc::new(data) };
        if let Some(rec) = self.recording.as_mut() {
            rec.name_counts.insert(name.to_string(), 1);
            rec.inputs.push(value.clone());
        }
        value
    }

    /// Runs `f` with `name` pushed onto the node-name scope.
    pub fn scoped<R>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> R) -> R {
        if let Some(rec) = self.recording.as_mut() {
            rec.scope.push(name.to_string());
        }
        let result = f(self);
        if let Some(rec) = self.recording.as_mut() {
            rec.scope.pop();
        }
        result
    }

    fn emit(
        &mut self,
        op: OpKind,
        inputs: &[&Value],
        attributes: Vec<(String, Attribute)>,
        data: TensorData,
    ) -> Result<Value, ExportError> {
        let rec = match self.recording.as_mut() {
            None => {
                return Ok(Value { name: Arc::from(""), kind: ValueKind::Intermediate, data: Arc::new(data) });
            }
            Some(rec) => rec,
        };

        if !op.available_in(rec.opset) {
            return Err(ExportError::UnsupportedOperator { op: op.op_type().to_string(), opset: rec.opset });
        }

        for input in inputs {
            if input.kind == ValueKind::Parameter && rec.seen_parameters.insert(input.name.clone()) {
                rec.initializers.push((*input).clone());
            }
        }

        let mut base = String::new();
        for part in &rec.scope {
            base.push('/');
            base.push_str(part);
        }
        base.push('/');
        base.push_str(op.op_type());
        let node_name = unique_name(&mut rec.name_counts, base);
        let output_name = format!("{}_output_0", node_name);

        log::trace!("{} {:?} -> {:?}", node_name, inputs.iter().map(|v| v.name()).collect::<Vec<_>>(), data.shape());

        rec.nodes.push(Node {
            name: node_name,
            op,
            inputs: inputs.iter().map(|v| v.name.to_string()).collect(),
            outputs: vec![output_name.clone()],
            attributes,
        });

        Ok(Value { name: Arc::from(output_name), kind: ValueKind::Intermediate, data: Arc::new(data) })
    }

    pub fn constant(&mut self, data: TensorData) -> Result<Value, ExportError> {
        let attributes = if self.is_recording() {
            vec![("value".to_string(), Attribute::Tensor(data.clone()))]
        } else {
            Vec::new()
        };
        self.emit(OpKind::Constant, &[], attributes, data)
    }

    pub fn scalar(&mut self, value: f32) -> Result<Value, ExportError> {
        self.constant(TensorData::scalar_f32(value))
    }

    pub fn identity(&mut self, x: &Value) -> Result<Value, ExportError> {
        let data = x.data().clone();
        self.emit(OpKind::Identity, &[x], Vec::new(), data)
    }

    /// Row lookup along axis 0, as used for embedding tables.
    pub fn gather(&mut self, table: &Value, indices: &Value) -> Result<Value, ExportError> {
        let idx = indices.i64()?;
        let data = match table.data() {
            TensorData::F32(t) => TensorData::F32(tensor_ops::gather(t, idx, 0)?),
            TensorData::I64(t) => TensorData::I64(tensor_ops::gather(t, idx, 0)?),
        };
        self.emit(OpKind::Gather, &[table, indices], vec![("axis".to_string(), Attribute::Int(0))], data)
    }

    /// Unit-step slice of `[start, end)` along one axis.
    pub fn slice(&mut self, x: &Value, axis: i64, start: i64, end: i64) -> Result<Value, ExportError> {
        let axis = tensor_ops::normalize_axis(axis, x.shape().len())? as i64;
        let data = match x.data() {
            TensorData::F32(a) => TensorData::F32(tensor_ops::slice(a, &[start], &[end], &[axis])?),
            TensorData::I64(a) => TensorData::I64(tensor_ops::slice(a, &[start], &[end], &[axis])?),
        };
        let starts = self.constant(TensorData::vec_i64(&[start]))?;
        let ends = self.constant(TensorData::vec_i64(&[end]))?;
        let axes = self.constant(TensorData::vec_i64(&[axis]))?;
        self.emit(OpKind::Slice, &[x, &starts, &ends, &axes], Vec::new(), data)
    }

    pub fn concat(&mut self, parts: &[&Value], axis: i64) -> Result<Value, ExportError> {
        let first = parts
            .first()
            .ok_or_else(|| ExportError::ShapeMismatch("concat of zero tensors".to_string()))?;
        let axis = tensor_ops::normalize_axis(axis, first.shape().len())? as i64;
        let data = match first.dtype() {
            DType::F32 => {
                let arrays = parts.iter().map(|p| p.f32()).collect::<Result<Vec<_>, _>>()?;
                TensorData::F32(tensor_ops::concat(&arrays, axis)?)
            }
            DType::I64 => {
                let arrays = parts.iter().map(|p| p.i64()).collect::<Result<Vec<_>, _>>()?;
                TensorData::I64(tensor_ops::concat(&arrays, axis)?)
            }
        };
        self.emit(OpKind::Concat, parts, vec![("axis".to_string(), Attribute::Int(axis))], data)
    }

    fn binary(
        &mut self,
        op: OpKind,
        a: &Value,
        b: &Value,
        kernel: fn(&ArrayD<f32>, &ArrayD<f32>) -> Result<ArrayD<f32>, crate::tensor::TensorError>,
    ) -> Result<Value, ExportError> {
        let data = TensorData::F32(kernel(a.f32()?, b.f32()?)?);
        self.emit(op, &[a, b], Vec::new(), data)
    }

    pub fn add(&mut self, a: &Value, b: &Value) -> Result<Value, ExportError> {
        self.binary(OpKind::Add, a, b, tensor_ops::add)
    }

    pub fn sub(&mut self, a: &Value, b: &Value) -> Result<Value, ExportError> {
        self.binary(OpKind::Sub, a, b, tensor_ops::sub)
    }

    pub fn mul(&mut self, a: &Value, b: &Value) -> Result<Value, ExportError> {
        self.binary(OpKind::Mul, a, b, tensor_ops::mul)
    }

    pub fn div(&mut self, a: &Value, b: &Value) -> Result<Value, ExportError> {
        self.binary(OpKind::Div, a, b, tensor_ops::div)
    }

    pub fn pow(&mut self, a: &Value, b: &Value) -> Result<Value, ExportError> {
        self.binary(OpKind::Pow, a, b, tensor_ops::pow)
    }

    pub fn matmul(&mut self, a: &Value, b: &Value) -> Result<Value, ExportError> {
        self.binary(OpKind::MatMul, a, b, tensor_ops::matmul)
    }

    pub fn mul_scalar(&mut self, x: &Value, factor: f32) -> Result<Value, ExportError> {
        let c = self.scalar(factor)?;
        self.mul(x, &c)
    }

    fn unary(&mut self, op: OpKind, x: &Value, kernel: fn(&ArrayD<f32>) -> ArrayD<f32>) -> Result<Value, ExportError> {
        let data = TensorData::F32(kernel(x.f32()?));
        self.emit(op, &[x], Vec::new(), data)
    }

    pub fn sqrt(&mut self, x: &Value) -> Result<Value, ExportError> {
        self.unary(OpKind::Sqrt, x, tensor_ops::sqrt)
    }

    pub fn erf(&mut self, x: &Value) -> Result<Value, ExportError> {
        self.unary(OpKind::Erf, x, tensor_ops::erf)
    }

    pub fn relu(&mut self, x: &Value) -> Result<Value, ExportError> {
        self.unary(OpKind::Relu, x, tensor_ops::relu)
    }

    pub fn sigmoid(&mut self, x: &Value) -> Result<Value, ExportError> {
        self.unary(OpKind::Sigmoid, x, tensor_ops::sigmoid)
    }

    pub fn transpose(&mut self, x: &Value, perm: &[usize]) -> Result<Value, ExportError> {
        let data = match x.data() {
            TensorData::F32(a) => TensorData::F32(tensor_ops::transpose(a, perm)?),
            TensorData::I64(a) => TensorData::I64(tensor_ops::transpose(a, perm)?),
        };
        let perm_attr = perm.iter().map(|&p| p as i64).collect();
        self.emit(OpKind::Transpose, &[x], vec![("perm".to_string(), Attribute::Ints(perm_attr))], data)
    }

    pub fn reshape(&mut self, x: &Value, shape: &[i64]) -> Result<Value, ExportError> {
        let data = match x.data() {
            TensorData::F32(a) => TensorData::F32(tensor_ops::reshape(a, shape)?),
            TensorData::I64(a) => TensorData::I64(tensor_ops::reshape(a, shape)?),
        };
        let target = self.constant(TensorData::vec_i64(shape))?;
        self.emit(OpKind::Reshape, &[x, &target], Vec::new(), data)
    }

    /// Mean over `axes`. Negative axes are resolved before they are written,
    /// since opset 10 only accepts non-negative ones.
    pub fn reduce_mean(&mut self, x: &Value, axes: &[i64], keepdims: bool) -> Result<Value, ExportError> {
        let axes = axes
            .iter()
            .map(|&a| tensor_ops::normalize_axis(a, x.shape().len()).map(|a| a as i64))
            .collect::<Result<Vec<_>, _>>()?;
        let data = TensorData::F32(tensor_ops::reduce_mean(x.f32()?, &axes, keepdims)?);
        let attributes = vec![
            ("axes".to_string(), Attribute::Ints(axes)),
            ("keepdims".to_string(), Attribute::Int(keepdims as i64)),
        ];
        self.emit(OpKind::ReduceMean, &[x], attributes, data)
    }

    /// Softmax over the last axis. The per-axis and coerced-2D definitions
    /// agree there, so the node is valid on both sides of opset 13.
    pub fn softmax_last(&mut self, x: &Value) -> Result<Value, ExportError> {
        let last = tensor_ops::normalize_axis(-1, x.shape().len())? as i64;
        let data = TensorData::F32(tensor_ops::softmax(x.f32()?, last)?);
        self.emit(OpKind::Softmax, &[x], vec![("axis".to_string(), Attribute::Int(last))], data)
    }

    /// Closes the recording and names the graph output.
    ///
    /// If `output` was produced by a node, that node's output is renamed;
    /// otherwise an `Identity` node is appended to carry the name.
    pub fn finish(mut self, output: &Value, output_name: &str) -> Result<TracedGraph, ExportError> {
        let needs_identity = output.kind != ValueKind::Intermediate;
        let output = if needs_identity { self.identity(output)? } else { output.clone() };

        let mut rec = self
            .recording
            .ok_or_else(|| ExportError::ShapeMismatch("finish called on an eager tracer".to_string()))?;

        let input = match rec.inputs.as_slice() {
            [only] => TensorInfo { name: only.name().to_string(), dtype: only.dtype(), shape: only.shape().to_vec() },
            other => {
                return Err(ExportError::ShapeMismatch(format!("expected exactly one graph input, got {}", other.len())))
            }
        };

        if output_name == input.name || rec.seen_parameters.contains(output_name) {
            return Err(ExportError::InvalidName(format!(
                "output name '{}' collides with an existing graph value",
                output_name
            )));
        }

        let old_name = output.name();
        for node in rec.nodes.iter_mut() {
            for slot in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                if slot == old_name {
                    *slot = output_name.to_string();
                }
            }
        }

        Ok(TracedGraph {
            opset: rec.opset,
            nodes: rec.nodes,
            initializers: rec.initializers,
            input,
            output: TensorInfo { name: output_name.to_string(), dtype: output.dtype(), shape: output.shape().to_vec() },
        })
    }
}

fn unique_name(counts: &mut HashMap<String, usize>, base: String) -> String {
    let Some(mut n) = counts.get(&base).copied() else {
        counts.insert(base.clone(), 1);
        return base;
    };
    let mut candidate = format!("{}_{}", base, n);
    n += 1;
    while counts.contains_key(&candidate) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    counts.insert(base, n);
    counts.insert(candidate.clone(), 1);
    candidate
}
