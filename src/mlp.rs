use std::f32::consts::SQRT_2;

use crate::common::Linear;
use crate::config::Activation;
use crate::error::ExportError;
use crate::model::ModelError;
use crate::model_loader::WeightStore;
use crate::trace::{Tracer, Value};

/// Position-wise feed-forward block: `fc2(act(fc1(x)))`.
#[derive(Debug)]
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl FeedForward {
    pub fn load(
        weights: &mut WeightStore,
        prefix: &str,
        d_model: usize,
        ffn_dim: usize,
        activation: Activation,
    ) -> Result<Self, ModelError> {
        if ffn_dim == 0 {
            return Err(ModelError::Config(format!("{}: feed-forward dimension must be positive", prefix)));
        }
        Ok(Self {
            fc1: Linear::load(weights, &format!("{}.fc1", prefix), d_model, ffn_dim)?,
            fc2: Linear::load(weights, &format!("{}.fc2", prefix), ffn_dim, d_model)?,
            activation,
        })
    }

    pub fn forward(&self, t: &mut Tracer, x: &Value) -> Result<Value, ExportError> {
        let h = t.scoped("fc1", |t| self.fc1.forward(t, x))?;
        let h = t.scoped("activation_fn", |t| activate(t, self.activation, &h))?;
        t.scoped("fc2", |t| self.fc2.forward(t, &h))
    }
}

/// Exact (erf-based) gelu, relu or silu.
pub fn activate(t: &mut Tracer, activation: Activation, x: &Value) -> Result<Value, ExportError> {
    match activation {
        Activation::Gelu => {
            let root_two = t.scalar(SQRT_2)?;
            let scaled = t.div(x, &root_two)?;
            let erf = t.erf(&scaled)?;
            let one = t.scalar(1.0)?;
            let shifted = t.add(&erf, &one)?;
            let gated = t.mul(x, &shifted)?;
            t.mul_scalar(&gated, 0.5)
        }
        Activation::Relu => t.relu(x),
        Activation::Silu => {
            let gate = t.sigmoid(x)?;
            t.mul(x, &gate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorData;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, ArrayD, IxDyn};
    use std::collections::HashMap;

    fn eval(activation: Activation, values: &[f32]) -> Vec<f32> {
        let mut t = Tracer::eager();
        let x = t.input("x", TensorData::F32(arr1(values).into_dyn()));
        activate(&mut t, activation, &x).unwrap().f32().unwrap().iter().copied().collect()
    }

    #[test]
    fn test_gelu_reference_points() {
        let y = eval(Activation::Gelu, &[0.0, 1.0, -1.0, 3.0]);
        assert_abs_diff_eq!(y[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y[1], 0.841_344_7, epsilon = 1e-5);
        assert_abs_diff_eq!(y[2], -0.158_655_3, epsilon = 1e-5);
        assert_abs_diff_eq!(y[3], 2.995_950_5, epsilon = 1e-5);
    }

    #[test]
    fn test_relu_and_silu() {
        assert_eq!(eval(Activation::Relu, &[-2.0, 0.5]), vec![0.0, 0.5]);
        let silu = eval(Activation::Silu, &[0.0, 2.0]);
        assert_abs_diff_eq!(silu[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(silu[1], 2.0 / (1.0 + (-2.0f32).exp()), epsilon = 1e-6);
    }

    #[test]
    fn test_feed_forward_shape() {
        let mut tensors = HashMap::new();
        tensors.insert("l.fc1.weight".to_string(), ArrayD::from_elem(IxDyn(&[8, 4]), 0.1f32));
        tensors.insert("l.fc1.bias".to_string(), ArrayD::zeros(IxDyn(&[8])));
        tensors.insert("l.fc2.weight".to_string(), ArrayD::from_elem(IxDyn(&[4, 8]), 0.1f32));
        tensors.insert("l.fc2.bias".to_string(), ArrayD::zeros(IxDyn(&[4])));
        let mut weights = WeightStore::new(tensors);
        let ffn = FeedForward::load(&mut weights, "l", 4, 8, Activation::Gelu).unwrap();

        let mut t = Tracer::eager();
        let x = t.input("x", TensorData::F32(ArrayD::ones(IxDyn(&[1, 3, 4]))));
        let y = ffn.forward(&mut t, &x).unwrap();
        assert_eq!(y.shape(), &[1, 3, 4]);
    }

    #[test]
    fn test_zero_ffn_dim_is_rejected() {
        let mut weights = WeightStore::new(HashMap::new());
        assert!(matches!(
            FeedForward::load(&mut weights, "l", 4, 0, Activation::Relu),
            Err(ModelError::Config(_))
        ));
    }
}
