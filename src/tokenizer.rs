//! Tokenizer adapters
//!
//! The lens only needs two things from a tokenizer: encode a prompt to ids,
//! and decode a single id to a display string. Decoding never fails; unknown
//! ids render as `<id>`.

use std::path::Path;

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

/// Encode prompts and label individual token ids
pub trait TokenCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode_token(&self, token_id: u32) -> String;
}

impl TokenCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode_token(&self, token_id: u32) -> String {
        // Out-of-vocabulary ids decode to "" rather than failing
        if self.id_to_token(token_id).is_none() {
            return format!("<{token_id}>");
        }
        self.decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }
}

/// Labels ids as `<id>`; used when no vocabulary is available
#[derive(Debug, Clone, Copy, Default)]
pub struct IdCodec;

impl TokenCodec for IdCodec {
    fn encode(&self, _text: &str) -> Result<Vec<u32>> {
        anyhow::bail!("No tokenizer loaded: cannot encode text")
    }

    fn decode_token(&self, token_id: u32) -> String {
        format!("<{token_id}>")
    }
}

/// Load a `tokenizer.json` from disk
pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {e}", path.display()))
}

/// Fetch `tokenizer.json` for a model from the HuggingFace Hub
pub fn fetch_tokenizer(model_id: &str) -> Result<Tokenizer> {
    info!("Fetching tokenizer for {}", model_id);
    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
    let tokenizer_path = repo
        .get("tokenizer.json")
        .context("Failed to download tokenizer.json")?;
    load_tokenizer(&tokenizer_path)
}

/// Helper to format a token for single-line display
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}
