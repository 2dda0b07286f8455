use std::path::{Path, PathBuf};
use tokenizers::decoders::byte_level::ByteLevel;
use tokenizers::models::bpe::BPE;
use tokenizers::processors::roberta::RobertaProcessing;
use tokenizers::{AddedToken, Tokenizer};

/// Special tokens of the BART byte-level BPE vocabulary, in id order.
pub const BART_SPECIAL_TOKENS: [&str; 5] = ["<s>", "<pad>", "</s>", "<unk>", "<mask>"];

#[derive(thiserror::Error, Debug)]
pub enum TokenizerError {
    #[error("failed to load tokenizer from {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("encoding failed for '{text}': {reason}")]
    Encode { text: String, reason: String },
    #[error("decoding failed for {ids:?}: {reason}")]
    Decode { ids: Vec<u32>, reason: String },
}

#[derive(Debug)]
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
}

impl TokenizerWrapper {
    /// Loads a serialized `tokenizer.json`.
    pub fn from_file(tokenizer_path: &Path) -> Result<Self, TokenizerError> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| TokenizerError::Load {
            path: tokenizer_path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self { tokenizer })
    }

    /// Builds a byte-level BPE tokenizer from `vocab.json` + `merges.txt`,
    /// wrapping every sequence as `<s> ... </s>`.
    pub fn from_vocab_merges(vocab_path: &Path, merges_path: &Path) -> Result<Self, TokenizerError> {
        let load_err = |path: &Path, reason: String| TokenizerError::Load { path: path.to_path_buf(), reason };
        let vocab = vocab_path
            .to_str()
            .ok_or_else(|| load_err(vocab_path, "path is not valid UTF-8".to_string()))?;
        let merges = merges_path
            .to_str()
            .ok_or_else(|| load_err(merges_path, "path is not valid UTF-8".to_string()))?;

        let bpe = BPE::from_file(vocab, merges)
            .unk_token("<unk>".to_string())
            .build()
            .map_err(|e| load_err(vocab_path, format!("BPE build failed: {}", e)))?;

        let mut tokenizer = Tokenizer::new(bpe);
        let byte_level = ByteLevel::default().add_prefix_space(false);
        tokenizer.with_pre_tokenizer(byte_level.clone());
        tokenizer.with_decoder(byte_level);
        tokenizer.with_post_processor(
            RobertaProcessing::new(("</s>".to_string(), 2), ("<s>".to_string(), 0)).add_prefix_space(false),
        );
        let specials: Vec<AddedToken> = BART_SPECIAL_TOKENS.iter().map(|t| AddedToken::from(*t, true)).collect();
        tokenizer.add_special_tokens(&specials);

        Ok(Self { tokenizer })
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self.tokenizer.encode(text, add_special_tokens).map_err(|e| TokenizerError::Encode {
            text: text.to_string(),
            reason: e.to_string(),
        })?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TokenizerError> {
        self.tokenizer.decode(ids, skip_special_tokens).map_err(|e| TokenizerError::Decode {
            ids: ids.to_vec(),
            reason: e.to_string(),
        })
    }

    pub fn get_vocab_size(&self) -> u32 {
        self.tokenizer.get_vocab_size(true) as u32
    }
}
