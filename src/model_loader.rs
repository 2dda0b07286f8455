// src/model_loader.rs

use ndarray::{ArrayD, IxDyn};
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::ResolutionError;
use crate::model::ModelError;
use crate::trace::Value;

/// Reads every tensor of a `.safetensors` file as `f32`.
///
/// Only `F32` checkpoints are accepted; any other dtype, a header that fails
/// to parse, or a truncated data section is reported as `Corrupt`.
pub fn load_safetensors(path: &Path) -> Result<HashMap<String, ArrayD<f32>>, ResolutionError> {
    let bytes = fs::read(path)?;
    let corrupt = |reason: String| ResolutionError::Corrupt { path: path.to_path_buf(), reason };

    let safetensors = SafeTensors::deserialize(&bytes).map_err(|e| corrupt(format!("{:?}", e)))?;

    let mut tensors = HashMap::new();
    for (name, view) in safetensors.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(corrupt(format!(
                "unsupported dtype {:?} for tensor '{}', only F32 is supported",
                view.dtype(),
                name
            )));
        }
        let data: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let array = ArrayD::from_shape_vec(IxDyn(view.shape()), data)
            .map_err(|e| corrupt(format!("tensor '{}': {}", name, e)))?;
        tensors.insert(name, array);
    }

    log::debug!("loaded {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Named checkpoint tensors, handed out once each with their shape checked.
///
/// Accepts both the `model.`-prefixed layout of conditional-generation
/// checkpoints and the unprefixed layout of bare encoder-decoder ones.
#[derive(Debug)]
pub struct WeightStore {
    tensors: HashMap<String, ArrayD<f32>>,
    prefix: &'static str,
}

// These live at the top level even in prefixed checkpoints.
const UNPREFIXED: &[&str] = &["lm_head.", "final_logits_bias"];

impl WeightStore {
    pub fn new(tensors: HashMap<String, ArrayD<f32>>) -> Self {
        let prefix = if tensors.keys().any(|k| k.starts_with("model.")) { "model." } else { "" };
        WeightStore { tensors, prefix }
    }

    fn full_name(&self, name: &str) -> String {
        if UNPREFIXED.iter().any(|p| name.starts_with(p)) {
            name.to_string()
        } else {
            format!("{}{}", self.prefix, name)
        }
    }

    pub fn take_optional(&mut self, name: &str, expected_shape: &[usize]) -> Result<Option<Value>, ModelError> {
        let full = self.full_name(name);
        let array = match self.tensors.remove(&full) {
            Some(a) => a,
            None => return Ok(None),
        };
        if array.shape() != expected_shape {
            return Err(ModelError::InvalidWeightShape(format!(
                "weight '{}' has shape {:?}, expected {:?}",
                full,
                array.shape(),
                expected_shape
            )));
        }
        Ok(Some(Value::parameter(&full, array)))
    }

    pub fn take(&mut self, name: &str, expected_shape: &[usize]) -> Result<Value, ModelError> {
        let full = self.full_name(name);
        self.take_optional(name, expected_shape)?.ok_or(ModelError::WeightNotFound(full))
    }

    /// Drops a tensor that the model shares with another one.
    pub fn discard(&mut self, name: &str) {
        let full = self.full_name(name);
        self.tensors.remove(&full);
    }

    pub fn remaining(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_dummy_safetensors_bytes(json_str: &str, tensor_data: &[u8]) -> Vec<u8> {
        let json_bytes = json_str.as_bytes();
        let mut file_bytes = Vec::new();
        file_bytes.write_all(&(json_bytes.len() as u64).to_le_bytes()).unwrap();
        file_bytes.write_all(json_bytes).unwrap();
        file_bytes.write_all(tensor_data).unwrap();
        file_bytes
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn test_load_two_tensors() {
        let json_header = r#"{"tensor_a":{"dtype":"F32","shape":[1,2],"data_offsets":[0,8]},"tensor_b":{"dtype":"F32","shape":[3],"data_offsets":[8,20]}}"#;
        let data = f32_bytes(&[1.1, 2.2, 3.3, 4.4, 5.5]);
        let file = write_temp(&create_dummy_safetensors_bytes(json_header, &data));

        let tensors = load_safetensors(file.path()).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors["tensor_a"].shape(), &[1, 2]);
        assert_eq!(tensors["tensor_b"].iter().copied().collect::<Vec<_>>(), vec![3.3, 4.4, 5.5]);
    }

    #[test]
    fn test_file_not_found() {
        let result = load_safetensors(Path::new("non_existent_file.safetensors"));
        assert!(matches!(result, Err(ResolutionError::Io(_))));
    }

    #[test]
    fn test_truncated_header_length() {
        let file = write_temp(&[1, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(load_safetensors(file.path()), Err(ResolutionError::Corrupt { .. })));
    }

    #[test]
    fn test_malformed_json() {
        let json_header = r#"{"t": {"dtype": "F32", "shape": [2, 2], "data_offsets": [0, 16]]}"#;
        let file = write_temp(&create_dummy_safetensors_bytes(json_header, &[]));
        assert!(matches!(load_safetensors(file.path()), Err(ResolutionError::Corrupt { .. })));
    }

    #[test]
    fn test_unsupported_dtype() {
        let json_header = r#"{"t":{"dtype":"F16","shape":[2,2],"data_offsets":[0,8]}}"#;
        let file = write_temp(&create_dummy_safetensors_bytes(json_header, &[0u8; 8]));
        let result = load_safetensors(file.path());
        assert!(matches!(result, Err(ResolutionError::Corrupt { reason, .. }) if reason.contains("F16")));
    }

    #[test]
    fn test_not_enough_bytes_for_tensor() {
        let json_header = r#"{"t":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]}}"#;
        let file = write_temp(&create_dummy_safetensors_bytes(json_header, &f32_bytes(&[1.0, 2.0])));
        assert!(matches!(load_safetensors(file.path()), Err(ResolutionError::Corrupt { .. })));
    }

    fn store_with(names: &[&str]) -> WeightStore {
        let tensors = names
            .iter()
            .map(|n| (n.to_string(), ArrayD::<f32>::zeros(IxDyn(&[2, 3]))))
            .collect();
        WeightStore::new(tensors)
    }

    #[test]
    fn test_store_prefixed_layout() {
        let mut store = store_with(&["model.shared.weight", "lm_head.weight"]);
        let shared = store.take("shared.weight", &[2, 3]).unwrap();
        assert_eq!(shared.name(), "model.shared.weight");
        store.discard("lm_head.weight");
        assert!(store.remaining().is_empty());
    }

    #[test]
    fn test_store_unprefixed_layout() {
        let mut store = store_with(&["shared.weight", "encoder.layernorm_embedding.weight"]);
        assert_eq!(store.take("shared.weight", &[2, 3]).unwrap().name(), "shared.weight");
        assert_eq!(store.remaining(), vec!["encoder.layernorm_embedding.weight"]);
    }

    #[test]
    fn test_store_shape_and_missing_errors() {
        let mut store = store_with(&["shared.weight"]);
        assert!(matches!(store.take("shared.weight", &[3, 2]), Err(ModelError::InvalidWeightShape(_))));
        assert!(matches!(store.take("encoder.missing", &[1]), Err(ModelError::WeightNotFound(n)) if n == "encoder.missing"));
        assert!(store.take_optional("final_logits_bias", &[1, 2]).unwrap().is_none());
    }
}
