use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::ResolutionError;
use crate::model::ModelError;

/// Feed-forward activation named by `activation_function` in `config.json`.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Gelu,
    Relu,
    #[serde(alias = "swish")]
    Silu,
}

/// Architecture hyper-parameters of a BART-family encoder-decoder, read from
/// a HuggingFace `config.json`. Unknown keys (dropout rates, generation
/// defaults, label maps) are ignored.
#[derive(Deserialize, Debug, Clone)]
pub struct Seq2SeqConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    #[serde(alias = "hidden_size")]
    pub d_model: usize,
    #[serde(alias = "num_hidden_layers")]
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    #[serde(alias = "num_attention_heads")]
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    #[serde(default)]
    pub activation_function: Activation,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub scale_embedding: bool,
    #[serde(default)]
    pub normalize_before: bool,
    #[serde(default)]
    pub add_final_layer_norm: bool,
    #[serde(default = "default_true")]
    pub normalize_embedding: bool,
    #[serde(default = "default_pad")]
    pub pad_token_id: u32,
    #[serde(default)]
    pub bos_token_id: u32,
    #[serde(default = "default_eos")]
    pub eos_token_id: u32,
    #[serde(default = "default_eos")]
    pub decoder_start_token_id: u32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

// Learned positional embeddings in BART reserve the first two rows.
pub const POSITION_OFFSET: usize = 2;

const SUPPORTED_MODEL_TYPES: &[&str] = &["bart"];

fn default_model_type() -> String {
    "bart".to_string()
}

fn default_true() -> bool {
    true
}

fn default_pad() -> u32 {
    1
}

fn default_eos() -> u32 {
    2
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

impl Seq2SeqConfig {
    pub fn load(config_path: &Path) -> Result<Self, ResolutionError> {
        let contents = fs::read_to_string(config_path)?;
        let config: Seq2SeqConfig = serde_json::from_str(&contents).map_err(|e| ResolutionError::Corrupt {
            path: config_path.to_path_buf(),
            reason: format!("invalid config.json: {}", e),
        })?;

        if !SUPPORTED_MODEL_TYPES.contains(&config.model_type.as_str()) {
            return Err(ResolutionError::UnsupportedArchitecture(config.model_type));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.vocab_size == 0 || self.d_model == 0 || self.max_position_embeddings == 0 {
            return Err(ModelError::Config(
                "vocab_size, d_model and max_position_embeddings must be positive".to_string(),
            ));
        }
        for (what, heads) in [
            ("encoder", self.encoder_attention_heads),
            ("decoder", self.decoder_attention_heads),
        ] {
            if heads == 0 || self.d_model % heads != 0 {
                return Err(ModelError::Config(format!(
                    "d_model ({}) must be divisible by {}_attention_heads ({})",
                    self.d_model, what, heads
                )));
            }
        }
        if self.decoder_start_token_id as usize >= self.vocab_size {
            return Err(ModelError::Config(format!(
                "decoder_start_token_id {} is outside the vocabulary ({})",
                self.decoder_start_token_id, self.vocab_size
            )));
        }
        Ok(())
    }

    pub fn embed_scale(&self) -> f32 {
        if self.scale_embedding {
            (self.d_model as f32).sqrt()
        } else {
            1.0
        }
    }
}
