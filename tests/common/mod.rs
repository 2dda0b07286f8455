// Tiny BART checkpoint written to a temp dir, shared by the integration tests.
#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use rust_seq2seq_onnx::settings::ExportSettings;

pub const VOCAB_SIZE: usize = 11;
pub const D_MODEL: usize = 8;
pub const FFN_DIM: usize = 16;
pub const MAX_POSITIONS: usize = 32;

pub const CONFIG_JSON: &str = r#"{
    "model_type": "bart",
    "architectures": ["BartForConditionalGeneration"],
    "vocab_size": 11,
    "d_model": 8,
    "encoder_layers": 2,
    "decoder_layers": 1,
    "encoder_attention_heads": 2,
    "decoder_attention_heads": 2,
    "encoder_ffn_dim": 16,
    "decoder_ffn_dim": 16,
    "activation_function": "gelu",
    "max_position_embeddings": 32,
    "dropout": 0.1,
    "pad_token_id": 1,
    "bos_token_id": 0,
    "eos_token_id": 2,
    "decoder_start_token_id": 2
}"#;

// "Hello, world!" encodes to [0, 5, 6, 7, 8, 2].
pub const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": {
        "type": "RobertaProcessing",
        "sep": ["</s>", 2],
        "cls": ["<s>", 0],
        "trim_offsets": true,
        "add_prefix_space": false
    },
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {"<s>": 0, "<pad>": 1, "</s>": 2, "<unk>": 3, "<mask>": 4,
                  "Hello": 5, ",": 6, "world": 7, "!": 8, "hello": 9, "summary": 10},
        "unk_token": "<unk>"
    }
}"#;

pub const VOCAB_JSON: &str = r#"{"<s>": 0, "<pad>": 1, "</s>": 2, "<unk>": 3, "<mask>": 4,
    "H": 5, "e": 6, "l": 7, "o": 8, "He": 9, "ll": 10}"#;
pub const MERGES_TXT: &str = "#version: 0.2\nH e\nl l\n";

fn push_tensor(
    tensors: &mut Vec<(String, Vec<usize>, Vec<f32>)>,
    rng: &mut StdRng,
    name: String,
    shape: &[usize],
) {
    let len = shape.iter().product();
    let values = (0..len).map(|_| rng.gen_range(-0.3f32..0.3)).collect();
    tensors.push((name, shape.to_vec(), values));
}

fn push_layer_norm(tensors: &mut Vec<(String, Vec<usize>, Vec<f32>)>, prefix: &str) {
    tensors.push((format!("{}.weight", prefix), vec![D_MODEL], vec![1.0; D_MODEL]));
    tensors.push((format!("{}.bias", prefix), vec![D_MODEL], vec![0.0; D_MODEL]));
}

fn checkpoint_tensors(seed: u64) -> Vec<(String, Vec<usize>, Vec<f32>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = Vec::new();
    let d = D_MODEL;

    push_tensor(&mut tensors, &mut rng, "model.shared.weight".to_string(), &[VOCAB_SIZE, d]);
    for (stack, layers) in [("encoder", 2), ("decoder", 1)] {
        push_tensor(
            &mut tensors,
            &mut rng,
            format!("model.{}.embed_positions.weight", stack),
            &[MAX_POSITIONS + 2, d],
        );
        push_layer_norm(&mut tensors, &format!("model.{}.layernorm_embedding", stack));
        for i in 0..layers {
            let p = format!("model.{}.layers.{}", stack, i);
            let attention = if stack == "decoder" { vec!["self_attn", "encoder_attn"] } else { vec!["self_attn"] };
            for a in attention {
                for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
                    push_tensor(&mut tensors, &mut rng, format!("{}.{}.{}.weight", p, a, proj), &[d, d]);
                    push_tensor(&mut tensors, &mut rng, format!("{}.{}.{}.bias", p, a, proj), &[d]);
                }
                push_layer_norm(&mut tensors, &format!("{}.{}_layer_norm", p, a));
            }
            push_tensor(&mut tensors, &mut rng, format!("{}.fc1.weight", p), &[FFN_DIM, d]);
            push_tensor(&mut tensors, &mut rng, format!("{}.fc1.bias", p), &[FFN_DIM]);
            push_tensor(&mut tensors, &mut rng, format!("{}.fc2.weight", p), &[d, FFN_DIM]);
            push_tensor(&mut tensors, &mut rng, format!("{}.fc2.bias", p), &[d]);
            push_layer_norm(&mut tensors, &format!("{}.final_layer_norm", p));
        }
    }
    push_tensor(&mut tensors, &mut rng, "final_logits_bias".to_string(), &[1, VOCAB_SIZE]);
    tensors
}

/// Serializes F32 tensors in the safetensors layout: a little-endian u64
/// header length, the JSON header, then the packed data.
pub fn safetensors_bytes(tensors: &[(String, Vec<usize>, Vec<f32>)]) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, shape, values) in tensors {
        let start = data.len();
        data.extend(values.iter().flat_map(|v| v.to_le_bytes()));
        header.insert(
            name.clone(),
            json!({"dtype": "F32", "shape": shape, "data_offsets": [start, data.len()]}),
        );
    }
    let header = serde_json::Value::Object(header).to_string();
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend(data);
    bytes
}

pub fn write_model_files(dir: &Path) {
    fs::write(dir.join("config.json"), CONFIG_JSON).unwrap();
    fs::write(dir.join("model.safetensors"), safetensors_bytes(&checkpoint_tensors(17))).unwrap();
}

/// A model directory with `config.json`, `model.safetensors` and
/// `tokenizer.json`.
pub fn tiny_bart() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_model_files(dir.path());
    fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    dir
}

/// Same model, but the tokenizer only ships `vocab.json` + `merges.txt`.
pub fn tiny_bart_with_bpe_files() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_model_files(dir.path());
    fs::write(dir.path().join("vocab.json"), VOCAB_JSON).unwrap();
    fs::write(dir.path().join("merges.txt"), MERGES_TXT).unwrap();
    dir
}

pub fn settings_for(model_dir: &Path, output: PathBuf) -> ExportSettings {
    ExportSettings {
        model_id: model_dir.to_string_lossy().into_owned(),
        output_path: output,
        offline: true,
        ..Default::default()
    }
}
