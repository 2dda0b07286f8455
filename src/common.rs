use crate::error::ExportError;
use crate::model::ModelError;
use crate::model_loader::WeightStore;
use crate::trace::{Tracer, Value};

/// Layer normalization over the last axis, lowered to primitive ops so the
/// exported graph stays within opsets that predate `LayerNormalization`.
#[derive(Debug)]
pub struct LayerNorm {
    weight: Value, // gamma
    bias: Value,   // beta
    epsilon: f32,
}

impl LayerNorm {
    pub fn load(weights: &mut WeightStore, prefix: &str, dim: usize, epsilon: f32) -> Result<Self, ModelError> {
        Ok(Self {
            weight: weights.take(&format!("{}.weight", prefix), &[dim])?,
            bias: weights.take(&format!("{}.bias", prefix), &[dim])?,
            epsilon,
        })
    }

    pub fn forward(&self, t: &mut Tracer, x: &Value) -> Result<Value, ExportError> {
        let mean = t.reduce_mean(x, &[-1], true)?;
        let centered = t.sub(x, &mean)?;
        let two = t.scalar(2.0)?;
        let squared = t.pow(&centered, &two)?;
        let variance = t.reduce_mean(&squared, &[-1], true)?;
        let eps = t.scalar(self.epsilon)?;
        let shifted = t.add(&variance, &eps)?;
        let std_dev = t.sqrt(&shifted)?;
        let normalized = t.div(&centered, &std_dev)?;
        let scaled = t.mul(&normalized, &self.weight)?;
        t.add(&scaled, &self.bias)
    }
}

/// `y = x W^T + b` with `W` stored as `[out_features, in_features]`.
#[derive(Debug)]
pub struct Linear {
    weight: Value,
    bias: Option<Value>,
}

impl Linear {
    pub fn load(weights: &mut WeightStore, prefix: &str, in_features: usize, out_features: usize) -> Result<Self, ModelError> {
        Ok(Self {
            weight: weights.take(&format!("{}.weight", prefix), &[out_features, in_features])?,
            bias: weights.take_optional(&format!("{}.bias", prefix), &[out_features])?,
        })
    }

    pub fn forward(&self, t: &mut Tracer, x: &Value) -> Result<Value, ExportError> {
        let weight_t = t.transpose(&self.weight, &[1, 0])?;
        let y = t.matmul(x, &weight_t)?;
        match &self.bias {
            Some(bias) => t.add(&y, bias),
            None => Ok(y),
        }
    }
}

/// Lookup table indexed by integer ids along its first axis.
#[derive(Debug, Clone)]
pub struct Embedding {
    weight: Value,
}

impl Embedding {
    pub fn new(weight: Value) -> Self {
        Self { weight }
    }

    pub fn weight(&self) -> &Value {
        &self.weight
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn forward(&self, t: &mut Tracer, ids: &Value) -> Result<Value, ExportError> {
        t.gather(&self.weight, ids)
    }
}
