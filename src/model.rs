use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;

use crate::attention::MultiHeadAttention;
use crate::common::{Embedding, LayerNorm};
use crate::config::{Seq2SeqConfig, POSITION_OFFSET};
use crate::error::ExportError;
use crate::mlp::FeedForward;
use crate::model_loader::WeightStore;
use crate::tensor::{TensorData, TensorError};
use crate::trace::{Tracer, Value};

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("weight not found: {0}")]
    WeightNotFound(String),
    #[error("invalid weight shape: {0}")]
    InvalidWeightShape(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

#[derive(Debug)]
struct EncoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
    normalize_before: bool,
}

impl EncoderLayer {
    fn load(weights: &mut WeightStore, prefix: &str, config: &Seq2SeqConfig) -> Result<Self, ModelError> {
        let d = config.d_model;
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: MultiHeadAttention::load(weights, &format!("{}.self_attn", prefix), d, config.encoder_attention_heads)?,
            self_attn_layer_norm: LayerNorm::load(weights, &format!("{}.self_attn_layer_norm", prefix), d, eps)?,
            ffn: FeedForward::load(weights, prefix, d, config.encoder_ffn_dim, config.activation_function)?,
            final_layer_norm: LayerNorm::load(weights, &format!("{}.final_layer_norm", prefix), d, eps)?,
            normalize_before: config.normalize_before,
        })
    }

    fn forward(&self, t: &mut Tracer, hidden: &Value) -> Result<Value, ExportError> {
        let pre = self.normalize_before;

        let x = if pre { t.scoped("self_attn_layer_norm", |t| self.self_attn_layer_norm.forward(t, hidden))? } else { hidden.clone() };
        let x = t.scoped("self_attn", |t| self.self_attn.forward(t, &x, None, None))?;
        let x = t.add(hidden, &x)?;
        let x = if pre { x } else { t.scoped("self_attn_layer_norm", |t| self.self_attn_layer_norm.forward(t, &x))? };

        let residual = x.clone();
        let x = if pre { t.scoped("final_layer_norm", |t| self.final_layer_norm.forward(t, &x))? } else { x };
        let x = self.ffn.forward(t, &x)?;
        let x = t.add(&residual, &x)?;
        if pre {
            Ok(x)
        } else {
            t.scoped("final_layer_norm", |t| self.final_layer_norm.forward(t, &x))
        }
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: MultiHeadAttention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: MultiHeadAttention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
    normalize_before: bool,
}

impl DecoderLayer {
    fn load(weights: &mut WeightStore, prefix: &str, config: &Seq2SeqConfig) -> Result<Self, ModelError> {
        let d = config.d_model;
        let eps = config.layer_norm_eps;
        let heads = config.decoder_attention_heads;
        Ok(Self {
            self_attn: MultiHeadAttention::load(weights, &format!("{}.self_attn", prefix), d, heads)?,
            self_attn_layer_norm: LayerNorm::load(weights, &format!("{}.self_attn_layer_norm", prefix), d, eps)?,
            encoder_attn: MultiHeadAttention::load(weights, &format!("{}.encoder_attn", prefix), d, heads)?,
            encoder_attn_layer_norm: LayerNorm::load(weights, &format!("{}.encoder_attn_layer_norm", prefix), d, eps)?,
            ffn: FeedForward::load(weights, prefix, d, config.decoder_ffn_dim, config.activation_function)?,
            final_layer_norm: LayerNorm::load(weights, &format!("{}.final_layer_norm", prefix), d, eps)?,
            normalize_before: config.normalize_before,
        })
    }

    fn forward(
        &self,
        t: &mut Tracer,
        hidden: &Value,
        encoder_hidden: &Value,
        causal_mask: &Value,
    ) -> Result<Value, ExportError> {
        let pre = self.normalize_before;

        let x = if pre { t.scoped("self_attn_layer_norm", |t| self.self_attn_layer_norm.forward(t, hidden))? } else { hidden.clone() };
        let x = t.scoped("self_attn", |t| self.self_attn.forward(t, &x, None, Some(causal_mask)))?;
        let x = t.add(hidden, &x)?;
        let x = if pre { x } else { t.scoped("self_attn_layer_norm", |t| self.self_attn_layer_norm.forward(t, &x))? };

        let residual = x.clone();
        let x = if pre { t.scoped("encoder_attn_layer_norm", |t| self.encoder_attn_layer_norm.forward(t, &x))? } else { x };
        let x = t.scoped("encoder_attn", |t| self.encoder_attn.forward(t, &x, Some(encoder_hidden), None))?;
        let x = t.add(&residual, &x)?;
        let x = if pre { x } else { t.scoped("encoder_attn_layer_norm", |t| self.encoder_attn_layer_norm.forward(t, &x))? };

        let residual = x.clone();
        let x = if pre { t.scoped("final_layer_norm", |t| self.final_layer_norm.forward(t, &x))? } else { x };
        let x = self.ffn.forward(t, &x)?;
        let x = t.add(&residual, &x)?;
        if pre {
            Ok(x)
        } else {
            t.scoped("final_layer_norm", |t| self.final_layer_norm.forward(t, &x))
        }
    }
}

/// Token embeddings, learned positions and the optional embedding norm,
/// shared in structure by the encoder and decoder stacks.
#[derive(Debug)]
struct EmbeddingBlock {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layernorm_embedding: Option<LayerNorm>,
    embed_scale: f32,
}

impl EmbeddingBlock {
    fn load(weights: &mut WeightStore, stack: &str, shared: &Embedding, config: &Seq2SeqConfig) -> Result<Self, ModelError> {
        let d = config.d_model;
        // Tied to `shared`; a duplicate copy in the checkpoint is dropped.
        weights.discard(&format!("{}.embed_tokens.weight", stack));
        let positions = weights.take(
            &format!("{}.embed_positions.weight", stack),
            &[config.max_position_embeddings + POSITION_OFFSET, d],
        )?;
        let layernorm_embedding = if config.normalize_embedding {
            Some(LayerNorm::load(weights, &format!("{}.layernorm_embedding", stack), d, config.layer_norm_eps)?)
        } else {
            None
        };
        Ok(Self {
            embed_tokens: shared.clone(),
            embed_positions: Embedding::new(positions),
            layernorm_embedding,
            embed_scale: config.embed_scale(),
        })
    }

    fn forward(&self, t: &mut Tracer, ids: &Value) -> Result<Value, ExportError> {
        let seq_len = ids.shape().get(1).copied().unwrap_or(0);
        let tokens = t.scoped("embed_tokens", |t| {
            let x = self.embed_tokens.forward(t, ids)?;
            if self.embed_scale != 1.0 {
                t.mul_scalar(&x, self.embed_scale)
            } else {
                Ok(x)
            }
        })?;
        let positions = t.scoped("embed_positions", |t| {
            let offset = POSITION_OFFSET as i64;
            let position_ids: Vec<i64> = (0..seq_len as i64).map(|p| p + offset).collect();
            let position_ids = t.constant(TensorData::vec_i64(&position_ids))?;
            self.embed_positions.forward(t, &position_ids)
        })?;
        let x = t.add(&tokens, &positions)?;
        match &self.layernorm_embedding {
            Some(ln) => t.scoped("layernorm_embedding", |t| ln.forward(t, &x)),
            None => Ok(x),
        }
    }
}

#[derive(Debug)]
struct Encoder {
    embeddings: EmbeddingBlock,
    layers: Vec<EncoderLayer>,
    layer_norm: Option<LayerNorm>,
}

impl Encoder {
    fn forward(&self, t: &mut Tracer, input_ids: &Value) -> Result<Value, ExportError> {
        let mut x = self.embeddings.forward(t, input_ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            x = t.scoped(&format!("layers.{}", i), |t| layer.forward(t, &x))?;
        }
        match &self.layer_norm {
            Some(ln) => t.scoped("layer_norm", |t| ln.forward(t, &x)),
            None => Ok(x),
        }
    }
}

#[derive(Debug)]
struct Decoder {
    embeddings: EmbeddingBlock,
    layers: Vec<DecoderLayer>,
    layer_norm: Option<LayerNorm>,
}

impl Decoder {
    fn forward(&self, t: &mut Tracer, decoder_ids: &Value, encoder_hidden: &Value) -> Result<Value, ExportError> {
        let seq_len = decoder_ids.shape().get(1).copied().unwrap_or(0);
        let mut x = self.embeddings.forward(t, decoder_ids)?;
        let mask = t.constant(TensorData::F32(causal_mask(seq_len)))?;
        for (i, layer) in self.layers.iter().enumerate() {
            x = t.scoped(&format!("layers.{}", i), |t| layer.forward(t, &x, encoder_hidden, &mask))?;
        }
        match &self.layer_norm {
            Some(ln) => t.scoped("layer_norm", |t| ln.forward(t, &x)),
            None => Ok(x),
        }
    }
}

/// Additive mask `[1, 1, n, n]`: zero on and below the diagonal, `f32::MIN`
/// above it.
pub fn causal_mask(seq_len: usize) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(&[1, 1, seq_len, seq_len]), |idx| {
        if idx[3] > idx[2] {
            f32::MIN
        } else {
            0.0
        }
    })
}

/// Builds decoder inputs by shifting `input_ids` one step right and placing
/// `decoder_start_token_id` in the first column.
pub fn shift_tokens_right(t: &mut Tracer, input_ids: &Value, decoder_start_token_id: u32) -> Result<Value, ExportError> {
    let (batch, seq_len) = match input_ids.shape() {
        [b, s] => (*b, *s as i64),
        other => return Err(ExportError::ShapeMismatch(format!("input_ids must be [batch, seq], got {:?}", other))),
    };
    let start = ArrayD::from_elem(IxDyn(&[batch, 1]), decoder_start_token_id as i64);
    let start = t.constant(TensorData::I64(start))?;
    let shifted = t.slice(input_ids, 1, 0, seq_len - 1)?;
    t.concat(&[&start, &shifted], 1)
}

/// BART-family encoder-decoder with a language-modelling head.
#[derive(Debug)]
pub struct Seq2SeqModel {
    config: Seq2SeqConfig,
    shared: Embedding,
    encoder: Encoder,
    decoder: Decoder,
    final_logits_bias: Value,
    mode: Mode,
}

impl Seq2SeqModel {
    /// Assembles the model from named checkpoint tensors. The model starts
    /// in `Mode::Train`.
    pub fn from_weights(config: Seq2SeqConfig, tensors: HashMap<String, ArrayD<f32>>) -> Result<Self, ModelError> {
        config.validate()?;
        let mut weights = WeightStore::new(tensors);
        let d = config.d_model;
        let vocab = config.vocab_size;

        let shared = Embedding::new(weights.take("shared.weight", &[vocab, d])?);
        // Tied to `shared`.
        weights.discard("lm_head.weight");

        let encoder = {
            let embeddings = EmbeddingBlock::load(&mut weights, "encoder", &shared, &config)?;
            let layers = (0..config.encoder_layers)
                .map(|i| EncoderLayer::load(&mut weights, &format!("encoder.layers.{}", i), &config))
                .collect::<Result<Vec<_>, _>>()?;
            let layer_norm = if config.add_final_layer_norm {
                Some(LayerNorm::load(&mut weights, "encoder.layer_norm", d, config.layer_norm_eps)?)
            } else {
                None
            };
            Encoder { embeddings, layers, layer_norm }
        };

        let decoder = {
            let embeddings = EmbeddingBlock::load(&mut weights, "decoder", &shared, &config)?;
            let layers = (0..config.decoder_layers)
                .map(|i| DecoderLayer::load(&mut weights, &format!("decoder.layers.{}", i), &config))
                .collect::<Result<Vec<_>, _>>()?;
            let layer_norm = if config.add_final_layer_norm {
                Some(LayerNorm::load(&mut weights, "decoder.layer_norm", d, config.layer_norm_eps)?)
            } else {
                None
            };
            Decoder { embeddings, layers, layer_norm }
        };

        let final_logits_bias = match weights.take_optional("final_logits_bias", &[1, vocab])? {
            Some(bias) => bias,
            None => Value::parameter("final_logits_bias", ArrayD::zeros(IxDyn(&[1, vocab]))),
        };

        let unused = weights.remaining();
        if !unused.is_empty() {
            log::warn!("{} checkpoint tensors were not used: {}", unused.len(), unused.join(", "));
        }

        Ok(Self { config, shared, encoder, decoder, final_logits_bias, mode: Mode::Train })
    }

    pub fn config(&self) -> &Seq2SeqConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switches to inference behaviour (dropout disabled).
    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    /// Computes LM logits `[batch, seq, vocab]` for `input_ids` `[batch, seq]`,
    /// recording every operation on `t`.
    pub fn forward(&self, t: &mut Tracer, input_ids: &Value) -> Result<Value, ExportError> {
        let hidden = t.scoped("model", |t| {
            let decoder_ids = shift_tokens_right(t, input_ids, self.config.decoder_start_token_id)?;
            let encoder_hidden = t.scoped("encoder", |t| self.encoder.forward(t, input_ids))?;
            t.scoped("decoder", |t| self.decoder.forward(t, &decoder_ids, &encoder_hidden))
        })?;
        let logits = t.scoped("lm_head", |t| {
            let weight_t = t.transpose(self.shared.weight(), &[1, 0])?;
            t.matmul(&hidden, &weight_t)
        })?;
        t.add(&logits, &self.final_logits_bias)
    }

    /// Runs the forward pass without recording.
    pub fn logits(&self, input_ids: &ArrayD<i64>) -> Result<ArrayD<f32>, ExportError> {
        let mut t = Tracer::eager();
        let input = t.input("input_ids", TensorData::I64(input_ids.clone()));
        let logits = self.forward(&mut t, &input)?;
        Ok(logits.f32()?.clone())
    }

    pub fn vocab_size(&self) -> usize {
        self.shared.num_embeddings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Activation;
    use crate::trace::OpKind;
    use ndarray::arr2;

    fn tiny_config() -> Seq2SeqConfig {
        serde_json::from_str(
            r#"{
                "model_type": "bart", "vocab_size": 11, "d_model": 4,
                "encoder_layers": 1, "decoder_layers": 1,
                "encoder_attention_heads": 2, "decoder_attention_heads": 2,
                "encoder_ffn_dim": 8, "decoder_ffn_dim": 8,
                "max_position_embeddings": 16
            }"#,
        )
        .unwrap()
    }

    fn tiny_weights(config: &Seq2SeqConfig) -> HashMap<String, ArrayD<f32>> {
        let d = config.d_model;
        let mut w = HashMap::new();
        let mut counter = 0.0f32;
        let mut fill = |shape: &[usize]| {
            ArrayD::from_shape_fn(IxDyn(shape), |_| {
                counter += 1.0;
                (counter * 0.37).sin() * 0.2
            })
        };
        w.insert("model.shared.weight".to_string(), fill(&[config.vocab_size, d]));
        for stack in ["encoder", "decoder"] {
            w.insert(format!("model.{}.embed_positions.weight", stack), fill(&[config.max_position_embeddings + 2, d]));
            w.insert(format!("model.{}.layernorm_embedding.weight", stack), ArrayD::ones(IxDyn(&[d])));
            w.insert(format!("model.{}.layernorm_embedding.bias", stack), ArrayD::zeros(IxDyn(&[d])));
            let p = format!("model.{}.layers.0", stack);
            let mut attn = vec!["self_attn"];
            if stack == "decoder" {
                attn.push("encoder_attn");
            }
            for a in attn {
                for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
                    w.insert(format!("{}.{}.{}.weight", p, a, proj), fill(&[d, d]));
                    w.insert(format!("{}.{}.{}.bias", p, a, proj), fill(&[d]));
                }
                w.insert(format!("{}.{}_layer_norm.weight", p, a), ArrayD::ones(IxDyn(&[d])));
                w.insert(format!("{}.{}_layer_norm.bias", p, a), ArrayD::zeros(IxDyn(&[d])));
            }
            w.insert(format!("{}.fc1.weight", p), fill(&[8, d]));
            w.insert(format!("{}.fc1.bias", p), fill(&[8]));
            w.insert(format!("{}.fc2.weight", p), fill(&[d, 8]));
            w.insert(format!("{}.fc2.bias", p), fill(&[d]));
            w.insert(format!("{}.final_layer_norm.weight", p), ArrayD::ones(IxDyn(&[d])));
            w.insert(format!("{}.final_layer_norm.bias", p), ArrayD::zeros(IxDyn(&[d])));
        }
        w
    }

    #[test]
    fn test_model_starts_in_train_mode() {
        let config = tiny_config();
        let weights = tiny_weights(&config);
        let mut model = Seq2SeqModel::from_weights(config, weights).unwrap();
        assert_eq!(model.mode(), Mode::Train);
        model.eval();
        assert_eq!(model.mode(), Mode::Eval);
        assert_eq!(model.config().activation_function, Activation::Gelu);
    }

    #[test]
    fn test_logits_shape() {
        let config = tiny_config();
        let weights = tiny_weights(&config);
        let model = Seq2SeqModel::from_weights(config, weights).unwrap();
        let ids = arr2(&[[0i64, 5, 7, 2]]).into_dyn();
        let logits = model.logits(&ids).unwrap();
        assert_eq!(logits.shape(), &[1, 4, 11]);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_missing_weight_is_reported() {
        let config = tiny_config();
        let mut weights = tiny_weights(&config);
        weights.remove("model.decoder.layers.0.fc2.bias");
        weights.remove("model.decoder.layers.0.fc2.weight");
        let err = Seq2SeqModel::from_weights(config, weights).unwrap_err();
        assert!(matches!(err, ModelError::WeightNotFound(name) if name == "model.decoder.layers.0.fc2.weight"));
    }

    #[test]
    fn test_shift_tokens_right() {
        let mut t = Tracer::eager();
        let ids = t.input("input", TensorData::I64(arr2(&[[0i64, 4, 5, 2]]).into_dyn()));
        let shifted = shift_tokens_right(&mut t, &ids, 2).unwrap();
        assert_eq!(shifted.i64().unwrap(), &arr2(&[[2i64, 0, 4, 5]]).into_dyn());
    }

    #[test]
    fn test_causal_mask_layout() {
        let mask = causal_mask(3);
        assert_eq!(mask.shape(), &[1, 1, 3, 3]);
        assert_eq!(mask[[0, 0, 0, 0]], 0.0);
        assert_eq!(mask[[0, 0, 0, 2]], f32::MIN);
        assert_eq!(mask[[0, 0, 2, 1]], 0.0);
    }

    #[test]
    fn test_traced_graph_naming() {
        let config = tiny_config();
        let weights = tiny_weights(&config);
        let mut model = Seq2SeqModel::from_weights(config, weights).unwrap();
        model.eval();

        let mut t = Tracer::recording(12);
        let input = t.input("input", TensorData::I64(arr2(&[[0i64, 3, 2]]).into_dyn()));
        let logits = model.forward(&mut t, &input).unwrap();
        let graph = t.finish(&logits, "output").unwrap();

        assert!(graph.nodes.iter().any(|n| n.name == "/model/encoder/layers.0/self_attn/q_proj/MatMul"));
        assert!(graph.nodes.iter().any(|n| n.name == "/model/decoder/layers.0/encoder_attn/Softmax"));
        assert_eq!(graph.initializers[0].name(), "model.shared.weight");
        assert!(graph.initializers.iter().any(|v| v.name() == "final_logits_bias"));
        assert_eq!(graph.output.shape, vec![1, 3, 11]);
        assert_eq!(graph.nodes.last().map(|n| n.op), Some(OpKind::Add));
    }

    // Logits for ids [0, 5, 7, 9, 2] under `sin_weights`, computed in f64 by
    // an independent implementation of the BART forward pass.
    const POST_LN_GELU: [f32; 55] = [
        -0.3761468, 0.1126338, 0.07722338, -0.434906, -0.4637806, 0.113343,
        0.3492447, -0.0644465, -0.252761, 0.2347475, 0.5901821, -0.2782988,
        0.06168642, -0.02986362, -0.4033781, -0.3509763, 0.1022714, 0.2344325,
        -0.07419529, -0.1397167, 0.2649961, 0.4826232, -0.3854307, 0.1083133,
        0.08572373, -0.429044, -0.471218, 0.1061323, 0.3553744, -0.0561242,
        -0.2573815, 0.2255873, 0.5931414, 0.02311969, -0.4425789, -0.4227272,
        0.02964402, 0.120413, -0.2452674, -0.2999805, 0.1764314, 0.4401458,
        0.1195236, -0.1236198, 0.0643902, -0.4252695, -0.4608588, 0.005419743,
        0.1541516, -0.2149249, -0.3282167, 0.1409684, 0.461951, 0.1589409,
        -0.138277,
    ];
    const PRE_LN_RELU: [f32; 55] = [
        -0.3088263, 0.1319493, 0.07209722, -0.4389426, -0.487855, 0.04372168,
        0.2599559, -0.1295658, -0.295596, 0.1863022, 0.5472721, 0.1654128,
        -0.3582106, -0.4910292, -0.05090187, 0.14564, -0.2294391, -0.4230749,
        0.0197319, 0.414509, 0.1657772, -0.1665549, -0.130841, 0.06466594,
        -0.1180895, -0.4061483, -0.2917212, 0.04649492, 0.06432509, -0.1678154,
        -0.1069015, 0.2587702, 0.3717192, -0.192806, -0.07144424, -0.08080718,
        -0.2632773, -0.3030948, -0.09843867, 0.04941601, -0.02558544, -0.0661999,
        0.1239212, 0.3065637, -0.2977264, 0.1607496, 0.06622003, -0.4688087,
        -0.4873938, 0.07367138, 0.2649259, -0.1586142, -0.3058337, 0.2134941,
        0.5624409,
    ];
    const SILU_NO_EMBEDDING_NORM: [f32; 55] = [
        -0.1677936, -0.4096764, -0.2428767, 0.05701841, 0.01413626, -0.1916431,
        -0.06561785, 0.2857394, 0.3318083, 0.06816885, 0.01389828, -0.05437479,
        -0.4973585, -0.372196, 0.1212493, 0.1551034, -0.2303106, -0.2135971,
        0.2975717, 0.4819332, 0.08356063, -0.1334355, -0.0682663, -0.4911433,
        -0.3571774, 0.1177576, 0.1394516, -0.2296572, -0.1978268, 0.2997782,
        0.4665631, 0.07856684, -0.1189709, -0.125713, -0.4506798, -0.292393,
        0.08904235, 0.06945988, -0.2136345, -0.1249295, 0.296975, 0.3931574,
        0.06805848, -0.04747084, -0.1288371, -0.4474579, -0.2886845, 0.08649295,
        0.06528916, -0.2118415, -0.1204336, 0.2959972, 0.3884842, 0.0681888,
        -0.04277401,
    ];

    /// Fills every tensor `config` needs, in checkpoint order, from
    /// `sin(0.37 k) / 5` for k = 1, 2, ... Layer norms get `1 + fill` as
    /// weight and `fill` as bias.
    struct SinFill {
        k: u32,
        tensors: HashMap<String, ArrayD<f32>>,
    }

    impl SinFill {
        fn values(&mut self, len: usize) -> Vec<f32> {
            (0..len)
                .map(|_| {
                    self.k += 1;
                    ((self.k as f64 * 0.37).sin() * 0.2) as f32
                })
                .collect()
        }

        fn put(&mut self, name: String, shape: &[usize]) {
            let values = self.values(shape.iter().product());
            self.tensors.insert(name, ArrayD::from_shape_vec(IxDyn(shape), values).unwrap());
        }

        fn put_layer_norm(&mut self, prefix: &str, d: usize) {
            let weight = self.values(d).into_iter().map(|v| 1.0 + v).collect();
            self.tensors.insert(format!("{}.weight", prefix), ArrayD::from_shape_vec(IxDyn(&[d]), weight).unwrap());
            self.put(format!("{}.bias", prefix), &[d]);
        }
    }

    fn sin_weights(config: &Seq2SeqConfig) -> HashMap<String, ArrayD<f32>> {
        let d = config.d_model;
        let mut fill = SinFill { k: 0, tensors: HashMap::new() };
        fill.put("model.shared.weight".to_string(), &[config.vocab_size, d]);
        for (stack, layers, ffn) in [
            ("encoder", config.encoder_layers, config.encoder_ffn_dim),
            ("decoder", config.decoder_layers, config.decoder_ffn_dim),
        ] {
            fill.put(format!("model.{}.embed_positions.weight", stack), &[config.max_position_embeddings + 2, d]);
            if config.normalize_embedding {
                fill.put_layer_norm(&format!("model.{}.layernorm_embedding", stack), d);
            }
            for i in 0..layers {
                let p = format!("model.{}.layers.{}", stack, i);
                let attention: &[&str] = if stack == "decoder" { &["self_attn", "encoder_attn"] } else { &["self_attn"] };
                for a in attention {
                    for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
                        fill.put(format!("{}.{}.{}.weight", p, a, proj), &[d, d]);
                        fill.put(format!("{}.{}.{}.bias", p, a, proj), &[d]);
                    }
                    fill.put_layer_norm(&format!("{}.{}_layer_norm", p, a), d);
                }
                fill.put(format!("{}.fc1.weight", p), &[ffn, d]);
                fill.put(format!("{}.fc1.bias", p), &[ffn]);
                fill.put(format!("{}.fc2.weight", p), &[d, ffn]);
                fill.put(format!("{}.fc2.bias", p), &[d]);
                fill.put_layer_norm(&format!("{}.final_layer_norm", p), d);
            }
            if config.add_final_layer_norm {
                fill.put_layer_norm(&format!("model.{}.layer_norm", stack), d);
            }
        }
        fill.put("final_logits_bias".to_string(), &[1, config.vocab_size]);
        fill.tensors
    }

    fn reference_config(overrides: serde_json::Value) -> Seq2SeqConfig {
        let mut config = serde_json::json!({
            "model_type": "bart", "vocab_size": 11, "d_model": 4,
            "encoder_layers": 2, "decoder_layers": 1,
            "encoder_attention_heads": 2, "decoder_attention_heads": 2,
            "encoder_ffn_dim": 8, "decoder_ffn_dim": 8,
            "max_position_embeddings": 16
        });
        if let (Some(base), Some(extra)) = (config.as_object_mut(), overrides.as_object()) {
            base.extend(extra.clone());
        }
        serde_json::from_value(config).unwrap()
    }

    fn assert_reference_logits(model: &Seq2SeqModel, expected: &[f32]) {
        let ids = arr2(&[[0i64, 5, 7, 9, 2]]).into_dyn();
        let logits = model.logits(&ids).unwrap();
        assert_eq!(logits.shape(), &[1, 5, 11]);
        for (i, (a, e)) in logits.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-4, "logit {}: {} vs {}", i, a, e);
        }
    }

    #[test]
    fn test_post_ln_gelu_logits_match_reference() {
        let config = reference_config(serde_json::json!({}));
        let weights = sin_weights(&config);
        let model = Seq2SeqModel::from_weights(config, weights).unwrap();
        assert_reference_logits(&model, &POST_LN_GELU);
    }

    #[test]
    fn test_pre_ln_relu_logits_match_reference() {
        let config = reference_config(serde_json::json!({
            "normalize_before": true, "add_final_layer_norm": true,
            "scale_embedding": true, "activation_function": "relu"
        }));
        let weights = sin_weights(&config);
        let model = Seq2SeqModel::from_weights(config, weights).unwrap();
        assert_reference_logits(&model, &PRE_LN_RELU);
    }

    #[test]
    fn test_silu_without_embedding_norm_logits_match_reference() {
        let config = reference_config(serde_json::json!({
            "activation_function": "silu", "normalize_embedding": false
        }));
        let weights = sin_weights(&config);
        let model = Seq2SeqModel::from_weights(config, weights).unwrap();
        assert_reference_logits(&model, &SILU_NO_EMBEDDING_NORM);
    }

    #[test]
    fn test_unprefixed_checkpoint_gives_same_logits() {
        let config = reference_config(serde_json::json!({}));
        let weights: HashMap<_, _> = sin_weights(&config)
            .into_iter()
            .map(|(k, v)| (k.strip_prefix("model.").map(str::to_string).unwrap_or(k), v))
            .collect();
        assert!(weights.contains_key("encoder.layers.1.fc2.bias"));
        let model = Seq2SeqModel::from_weights(config, weights).unwrap();
        assert_reference_logits(&model, &POST_LN_GELU);
    }

    #[test]
    fn test_final_layer_norm_weights_are_required_when_enabled() {
        let config = reference_config(serde_json::json!({"add_final_layer_norm": true}));
        let mut weights = sin_weights(&config);
        weights.remove("model.decoder.layer_norm.weight");
        let err = Seq2SeqModel::from_weights(config, weights).unwrap_err();
        assert!(matches!(err, ModelError::WeightNotFound(name) if name == "model.decoder.layer_norm.weight"));
    }
}
