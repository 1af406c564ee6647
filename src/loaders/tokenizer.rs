use anyhow::{anyhow, Context, Result};
use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

/// Sequence length of every CLIP text encoder in the SD family
pub const CLIP_MAX_LENGTH: usize = 77;

const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";

/// Prompt to fixed-length token ids
pub trait PromptTokenizer: Send + Sync {
    fn max_length(&self) -> usize;

    /// Exactly `max_length()` ids: truncated, then padded
    fn encode_padded(&self, prompt: &str) -> Result<Vec<u32>>;
}

pub struct ClipTokenizer {
    tokenizer: Tokenizer,
    pad_id: u32,
    max_length: usize,
}

#[derive(Debug, Deserialize)]
struct SpecialTokensMap {
    #[serde(default)]
    pad_token: Option<TokenEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenEntry {
    Plain(String),
    Detailed { content: String },
}

impl TokenEntry {
    fn content(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Detailed { content } => content,
        }
    }
}

impl ClipTokenizer {
    /// `tokenizer_name` (a `tokenizer.json` or a directory holding one) wins
    /// over `<model>/tokenizer/`
    pub fn load(model_dir: &Path, tokenizer_name: Option<&Path>) -> Result<Self> {
        let dir = match tokenizer_name {
            Some(path) if path.is_file() => path.parent().map(Path::to_path_buf).unwrap_or_default(),
            Some(path) => path.to_path_buf(),
            None => model_dir.join("tokenizer"),
        };
        let file = match tokenizer_name {
            Some(path) if path.is_file() => path.to_path_buf(),
            _ => dir.join("tokenizer.json"),
        };

        let tokenizer = Tokenizer::from_file(&file)
            .map_err(|e| anyhow!("Failed to load CLIP tokenizer from {}: {}", file.display(), e))?;
        let pad_token = read_pad_token(&dir)?.unwrap_or_else(|| DEFAULT_PAD_TOKEN.to_string());
        let pad_id = tokenizer
            .token_to_id(&pad_token)
            .with_context(|| format!("pad token {} is not in the vocabulary", pad_token))?;

        info!("Loaded tokenizer from {} (pad {})", file.display(), pad_token);
        Ok(Self::from_tokenizer(tokenizer, pad_id))
    }

    pub fn from_tokenizer(tokenizer: Tokenizer, pad_id: u32) -> Self {
        Self {
            tokenizer,
            pad_id,
            max_length: CLIP_MAX_LENGTH,
        }
    }
}

fn read_pad_token(dir: &Path) -> Result<Option<String>> {
    let path: PathBuf = dir.join("special_tokens_map.json");
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let map: SpecialTokensMap =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(map.pad_token.map(|t| t.content().to_string()))
}

/// Truncate keeping the final (end-of-text) id, then pad
pub fn fit_to_length(mut ids: Vec<u32>, max_length: usize, pad_id: u32) -> Vec<u32> {
    if ids.len() > max_length {
        let last = ids[ids.len() - 1];
        ids.truncate(max_length.saturating_sub(1));
        ids.push(last);
    }
    ids.resize(max_length, pad_id);
    ids
}

impl PromptTokenizer for ClipTokenizer {
    fn max_length(&self) -> usize {
        self.max_length
    }

    fn encode_padded(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Failed to tokenize prompt: {}", e))?;
        Ok(fit_to_length(encoding.get_ids().to_vec(), self.max_length, self.pad_id))
    }
}
