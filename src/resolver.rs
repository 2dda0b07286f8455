// src/resolver.rs
//
// Maps a model identifier to local artifact files and builds the model and
// tokenizer from them.

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::Cache;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Seq2SeqConfig;
use crate::error::ResolutionError;
use crate::model::Seq2SeqModel;
use crate::model_loader;
use crate::tokenizer::TokenizerWrapper;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const VOCAB_FILE: &str = "vocab.json";
pub const MERGES_FILE: &str = "merges.txt";

/// Where a model lives: a directory on disk or a hub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelId {
    Local(PathBuf),
    Hub(String),
}

impl ModelId {
    /// Paths (absolute, `./`, `../`, or an existing directory) are local;
    /// anything else must look like `name` or `owner/name`.
    pub fn parse(raw: &str) -> Result<Self, ResolutionError> {
        let unknown = || ResolutionError::UnknownIdentifier(raw.to_string());
        if raw.trim().is_empty() {
            return Err(unknown());
        }

        let path = Path::new(raw);
        let looks_like_path = path.is_absolute() || raw.starts_with("./") || raw.starts_with("../") || raw == ".";
        if looks_like_path || path.is_dir() {
            if !path.is_dir() {
                return Err(unknown());
            }
            return Ok(ModelId::Local(path.to_path_buf()));
        }

        let parts: Vec<&str> = raw.split('/').collect();
        let valid_part = |p: &&str| {
            !p.is_empty()
                && !p.starts_with('.')
                && !p.contains("..")
                && p.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        };
        if parts.len() > 2 || !parts.iter().all(valid_part) {
            return Err(unknown());
        }
        Ok(ModelId::Hub(raw.to_string()))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelId::Local(path) => write!(f, "{}", path.display()),
            ModelId::Hub(id) => f.write_str(id),
        }
    }
}

/// A place artifact files can be fetched from.
pub trait ArtifactSource {
    /// `Ok(None)` means the model does not provide `file`.
    fn fetch(&self, id: &ModelId, file: &str) -> Result<Option<PathBuf>, ResolutionError>;
}

fn fetch_local(dir: &Path, file: &str) -> Option<PathBuf> {
    let path = dir.join(file);
    path.is_file().then_some(path)
}

/// Resolves only local directories.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDirSource;

impl ArtifactSource for LocalDirSource {
    fn fetch(&self, id: &ModelId, file: &str) -> Result<Option<PathBuf>, ResolutionError> {
        match id {
            ModelId::Local(dir) => Ok(fetch_local(dir, file)),
            ModelId::Hub(name) => Err(ResolutionError::UnknownIdentifier(name.clone())),
        }
    }
}

/// Local directories, then the HuggingFace hub cache, then (unless offline)
/// the hub itself. Downloads land in the cache.
pub struct HubSource {
    cache: Cache,
    api: Option<Api>,
}

impl fmt::Debug for HubSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubSource")
            .field("cache", &self.cache.path())
            .field("offline", &self.api.is_none())
            .finish()
    }
}

impl HubSource {
    pub fn new(cache_dir: Option<PathBuf>, offline: bool) -> Result<Self, ResolutionError> {
        let cache = match &cache_dir {
            Some(dir) => Cache::new(dir.clone()),
            None => Cache::default(),
        };
        let api = if offline {
            None
        } else {
            let api = ApiBuilder::new()
                .with_cache_dir(cache.path().clone())
                .with_progress(false)
                .build()
                .map_err(|e| ResolutionError::Fetch {
                    id: String::new(),
                    file: String::new(),
                    reason: format!("could not initialise hub client: {}", e),
                })?;
            Some(api)
        };
        Ok(HubSource { cache, api })
    }

    pub fn is_offline(&self) -> bool {
        self.api.is_none()
    }
}

impl ArtifactSource for HubSource {
    fn fetch(&self, id: &ModelId, file: &str) -> Result<Option<PathBuf>, ResolutionError> {
        let repo_id = match id {
            ModelId::Local(dir) => return Ok(fetch_local(dir, file)),
            ModelId::Hub(repo_id) => repo_id,
        };

        if let Some(path) = self.cache.model(repo_id.clone()).get(file) {
            log::debug!("{} for {} found in cache", file, repo_id);
            return Ok(Some(path));
        }

        let api = match &self.api {
            Some(api) => api,
            None => return Err(ResolutionError::NotCached { id: repo_id.clone(), file: file.to_string() }),
        };

        let fetch_err = |reason: String| ResolutionError::Fetch { id: repo_id.clone(), file: file.to_string(), reason };
        let repo = api.model(repo_id.clone());
        let info = repo.info().map_err(|e| fetch_err(e.to_string()))?;
        if !info.siblings.iter().any(|s| s.rfilename == file) {
            return Ok(None);
        }

        log::info!("downloading {} from {}", file, repo_id);
        repo.get(file).map(Some).map_err(|e| fetch_err(e.to_string()))
    }
}

fn require(source: &dyn ArtifactSource, id: &ModelId, file: &str) -> Result<PathBuf, ResolutionError> {
    source
        .fetch(id, file)?
        .ok_or_else(|| ResolutionError::MissingArtifact { id: id.to_string(), files: file.to_string() })
}

/// Fetches `config.json` and `model.safetensors` and assembles the model.
pub fn resolve_model(source: &dyn ArtifactSource, id: &ModelId) -> Result<Seq2SeqModel, ResolutionError> {
    let config_path = require(source, id, CONFIG_FILE)?;
    let config = Seq2SeqConfig::load(&config_path)?;
    log::info!(
        "resolved {} config: d_model={}, {} encoder / {} decoder layers, vocab {}",
        id,
        config.d_model,
        config.encoder_layers,
        config.decoder_layers,
        config.vocab_size
    );

    let weights_path = require(source, id, WEIGHTS_FILE)?;
    let tensors = model_loader::load_safetensors(&weights_path)?;
    Ok(Seq2SeqModel::from_weights(config, tensors)?)
}

/// Prefers `tokenizer.json`, falling back to a byte-level BPE built from
/// `vocab.json` + `merges.txt`.
pub fn resolve_tokenizer(source: &dyn ArtifactSource, id: &ModelId) -> Result<TokenizerWrapper, ResolutionError> {
    let mut not_cached = None;
    let mut lookup = |file: &str| match source.fetch(id, file) {
        Ok(found) => Ok(found),
        Err(e @ ResolutionError::NotCached { .. }) => {
            not_cached.get_or_insert(e);
            Ok(None)
        }
        Err(e) => Err(e),
    };

    if let Some(path) = lookup(TOKENIZER_FILE)? {
        log::info!("loading tokenizer from {}", path.display());
        return TokenizerWrapper::from_file(&path).map_err(|e| corrupt(&path, e));
    }

    let vocab = lookup(VOCAB_FILE)?;
    let merges = lookup(MERGES_FILE)?;
    if let (Some(vocab), Some(merges)) = (vocab, merges) {
        log::info!("no {} for {}, building BPE from {} + {}", TOKENIZER_FILE, id, VOCAB_FILE, MERGES_FILE);
        return TokenizerWrapper::from_vocab_merges(&vocab, &merges).map_err(|e| corrupt(&vocab, e));
    }

    match not_cached {
        Some(e) => Err(e),
        None => Err(ResolutionError::MissingArtifact {
            id: id.to_string(),
            files: format!("{} or {} + {}", TOKENIZER_FILE, VOCAB_FILE, MERGES_FILE),
        }),
    }
}

fn corrupt(path: &Path, err: impl fmt::Display) -> ResolutionError {
    ResolutionError::Corrupt { path: path.to_path_buf(), reason: err.to_string() }
}

/// Model and tokenizer vocabularies are assumed compatible; a tokenizer that
/// can emit ids past the embedding table is only reported.
pub fn warn_on_vocab_mismatch(model: &Seq2SeqModel, tokenizer: &TokenizerWrapper) {
    let tokenizer_vocab = tokenizer.get_vocab_size() as usize;
    if tokenizer_vocab > model.vocab_size() {
        log::warn!(
            "tokenizer vocabulary ({}) is larger than the model vocabulary ({})",
            tokenizer_vocab,
            model.vocab_size()
        );
    }
}
