use crate::common::Linear;
use crate::error::ExportError;
use crate::model::ModelError;
use crate::model_loader::WeightStore;
use crate::trace::{Tracer, Value};

/// Multi-head scaled dot-product attention with separate q/k/v projections.
///
/// Used for encoder self-attention, causal decoder self-attention and
/// decoder cross-attention; the caller picks the key/value source and mask.
#[derive(Debug)]
pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f32,
}

impl MultiHeadAttention {
    pub fn load(weights: &mut WeightStore, prefix: &str, embed_dim: usize, num_heads: usize) -> Result<Self, ModelError> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(ModelError::Config(format!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                embed_dim, num_heads
            )));
        }
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            q_proj: Linear::load(weights, &format!("{}.q_proj", prefix), embed_dim, embed_dim)?,
            k_proj: Linear::load(weights, &format!("{}.k_proj", prefix), embed_dim, embed_dim)?,
            v_proj: Linear::load(weights, &format!("{}.v_proj", prefix), embed_dim, embed_dim)?,
            out_proj: Linear::load(weights, &format!("{}.out_proj", prefix), embed_dim, embed_dim)?,
            num_heads,
            head_dim,
            scaling: (head_dim as f32).powf(-0.5),
        })
    }

    /// `[b, s, d] -> [b, h, s, hd]`
    fn split_heads(&self, t: &mut Tracer, x: &Value) -> Result<Value, ExportError> {
        let (batch, seq) = batch_and_seq(x)?;
        let split = t.reshape(x, &[batch, seq, self.num_heads as i64, self.head_dim as i64])?;
        t.transpose(&split, &[0, 2, 1, 3])
    }

    /// `hidden_states` is `[b, tgt, d]`; `key_value_states` (cross-attention)
    /// is `[b, src, d]`. `attention_mask` is added to the raw scores and must
    /// broadcast to `[b, h, tgt, src]`.
    pub fn forward(
        &self,
        t: &mut Tracer,
        hidden_states: &Value,
        key_value_states: Option<&Value>,
        attention_mask: Option<&Value>,
    ) -> Result<Value, ExportError> {
        let (batch, tgt_len) = batch_and_seq(hidden_states)?;
        let kv_source = key_value_states.unwrap_or(hidden_states);

        let q = t.scoped("q_proj", |t| self.q_proj.forward(t, hidden_states))?;
        let q = t.mul_scalar(&q, self.scaling)?;
        let k = t.scoped("k_proj", |t| self.k_proj.forward(t, kv_source))?;
        let v = t.scoped("v_proj", |t| self.v_proj.forward(t, kv_source))?;

        let q = self.split_heads(t, &q)?;
        let k = self.split_heads(t, &k)?;
        let v = self.split_heads(t, &v)?;

        let k_t = t.transpose(&k, &[0, 1, 3, 2])?;
        let scores = t.matmul(&q, &k_t)?;
        let scores = match attention_mask {
            Some(mask) => t.add(&scores, mask)?,
            None => scores,
        };
        let probs = t.softmax_last(&scores)?;

        let context = t.matmul(&probs, &v)?;
        let context = t.transpose(&context, &[0, 2, 1, 3])?;
        let context = t.reshape(&context, &[batch, tgt_len, (self.num_heads * self.head_dim) as i64])?;
        t.scoped("out_proj", |t| self.out_proj.forward(t, &context))
    }
}

fn batch_and_seq(x: &Value) -> Result<(i64, i64), ExportError> {
    match x.shape() {
        [b, s, _] => Ok((*b as i64, *s as i64)),
        other => Err(ExportError::ShapeMismatch(format!(
            "attention expects [batch, seq, dim], got {:?}",
            other
        ))),
    }
}
