use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::onnx::ExportOptions;

pub const DEFAULT_MODEL_ID: &str = "sshleifer/distilbart-cnn-12-6";
pub const DEFAULT_EXAMPLE_TEXT: &str = "Hello, world!";
pub const DEFAULT_OUTPUT_PATH: &str = "summary_model.onnx";

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("could not read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Everything one export run needs. Missing keys in a settings file fall
/// back to the defaults; CLI flags are applied on top by the caller.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExportSettings {
    pub model_id: String,
    /// Defaults to `model_id`.
    pub tokenizer_id: Option<String>,
    pub example_text: String,
    pub output_path: PathBuf,
    pub opset_version: i64,
    pub input_name: String,
    pub output_name: String,
    pub cache_dir: Option<PathBuf>,
    pub offline: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        let options = ExportOptions::default();
        ExportSettings {
            model_id: DEFAULT_MODEL_ID.to_string(),
            tokenizer_id: None,
            example_text: DEFAULT_EXAMPLE_TEXT.to_string(),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            opset_version: options.opset_version,
            input_name: options.input_name,
            output_name: options.output_name,
            cache_dir: None,
            offline: false,
        }
    }
}

impl ExportSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Io { path: path.to_path_buf(), source })?;
        let settings: ExportSettings =
            serde_json::from_str(&contents).map_err(|source| SettingsError::Parse { path: path.to_path_buf(), source })?;
        log::debug!("loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn tokenizer_id(&self) -> &str {
        self.tokenizer_id.as_deref().unwrap_or(&self.model_id)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.model_id.trim().is_empty() {
            return Err(SettingsError::Invalid("model_id must not be empty".to_string()));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(SettingsError::Invalid("output_path must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            opset_version: self.opset_version,
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
            doc_string: self.model_id.clone(),
        }
    }
}
