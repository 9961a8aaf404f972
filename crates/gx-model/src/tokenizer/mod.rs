//! Text to token ids and back.
//!
//! `Tokenizer` wraps a `TokenizerEngine` (the built-in one is byte-fallback
//! BPE loaded from `tokenizer.json`) together with the special token ids from
//! the model configuration. It is shared through `Arc`; only its
//! `TokenizerOptions` change after construction. Incremental decoding goes
//! through a `TokenizerStream`, one per sequence.

pub mod bpe;
mod chat;
pub mod stream;
pub mod vocab;

use std::path::Path;
use std::sync::Arc;

use gx_tensor::Tensor;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::config::Config;
use crate::error::{ModelError, Result};

pub use bpe::BpeTokenizer;
pub use stream::TokenizerStream;
pub use vocab::Vocab;

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// A tokenization algorithm.
pub trait TokenizerEngine: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<i32>>;

    /// Raw bytes a token contributes to decoded text.
    fn token_bytes(&self, id: i32) -> Option<Vec<u8>>;

    fn is_special(&self, id: i32) -> bool;

    fn token_to_id(&self, token: &str) -> Option<i32>;

    fn vocab_size(&self) -> usize;
}

/// Which end of a row padding goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadSide {
    Left,
    #[default]
    Right,
}

/// Pad sequences to a common length with `pad_token_id`.
///
/// Returns the flattened `[batch, max_len]` buffer, right-padded: row `i`
/// starts with the `len_i` tokens of sequence `i`.
pub fn pad_inputs<S: AsRef<[i32]>>(sequences: &[S], pad_token_id: i32) -> Vec<i32> {
    pad_inputs_with(sequences, pad_token_id, PadSide::Right)
}

pub fn pad_inputs_with<S: AsRef<[i32]>>(
    sequences: &[S],
    pad_token_id: i32,
    side: PadSide,
) -> Vec<i32> {
    let max_len = sequences.iter().map(|s| s.as_ref().len()).max().unwrap_or(0);
    let mut result = Vec::with_capacity(max_len * sequences.len());
    for seq in sequences {
        let seq = seq.as_ref();
        let padding = std::iter::repeat(pad_token_id).take(max_len - seq.len());
        match side {
            PadSide::Right => {
                result.extend_from_slice(seq);
                result.extend(padding);
            }
            PadSide::Left => {
                result.extend(padding);
                result.extend_from_slice(seq);
            }
        }
    }
    result
}

/// Option key: prepend the bos token when encoding.
pub const ADD_SPECIAL_TOKENS: &str = "add_special_tokens";
/// Option key: drop special tokens when decoding.
pub const SKIP_SPECIAL_TOKENS: &str = "skip_special_tokens";

/// Runtime switches, changed through `Tokenizer::update_options`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerOptions {
    pub add_special_tokens: bool,
    pub skip_special_tokens: bool,
}

impl Default for TokenizerOptions {
    fn default() -> Self {
        Self {
            add_special_tokens: false,
            skip_special_tokens: true,
        }
    }
}

impl TokenizerOptions {
    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let flag = match value {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                return Err(ModelError::InvalidArgument(format!(
                    "tokenizer option {} expects true or false, got {:?}",
                    key, other
                )))
            }
        };
        match key {
            ADD_SPECIAL_TOKENS => self.add_special_tokens = flag,
            SKIP_SPECIAL_TOKENS => self.skip_special_tokens = flag,
            other => {
                return Err(ModelError::InvalidArgument(format!(
                    "unknown tokenizer option {:?}",
                    other
                )))
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Default)]
struct TokenizerConfigJson {
    #[serde(default)]
    chat_template: Option<String>,
    #[serde(default)]
    bos_token: Option<SpecialToken>,
    #[serde(default)]
    eos_token: Option<SpecialToken>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Added { content: String },
}

impl SpecialToken {
    fn into_content(self) -> String {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Added { content } => content,
        }
    }
}

pub struct Tokenizer {
    engine: Box<dyn TokenizerEngine>,
    bos_token_id: Option<i32>,
    eos_token_ids: Vec<i32>,
    pad_token_id: i32,
    chat_template: Option<String>,
    bos_token: String,
    eos_token: String,
    options: RwLock<TokenizerOptions>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.engine.vocab_size())
            .field("bos_token_id", &self.bos_token_id)
            .field("eos_token_ids", &self.eos_token_ids)
            .field("pad_token_id", &self.pad_token_id)
            .field("options", &self.options())
            .finish()
    }
}

impl Tokenizer {
    /// Load `tokenizer.json` (and `tokenizer_config.json` if present) from
    /// the configuration directory.
    pub fn from_config(config: &Config) -> Result<Tokenizer> {
        let dir = &config.config_path;
        let path = dir.join(TOKENIZER_FILE);
        if !path.exists() {
            return Err(ModelError::Config(format!(
                "{} not found in {}",
                TOKENIZER_FILE,
                dir.display()
            )));
        }
        let vocab = Vocab::from_file(&path)?;
        let extra = read_tokenizer_config(&dir.join(TOKENIZER_CONFIG_FILE))?;
        info!(path = %path.display(), vocab_size = vocab.len(), "loaded tokenizer");

        let mut tokenizer = Self::with_engine(Box::new(BpeTokenizer::new(vocab)), config)?;
        tokenizer.chat_template = extra.chat_template;
        if let Some(bos) = extra.bos_token {
            tokenizer.bos_token = bos.into_content();
        }
        if let Some(eos) = extra.eos_token {
            tokenizer.eos_token = eos.into_content();
        }
        Ok(tokenizer)
    }

    /// Wrap an engine with the special token ids from `config`.
    ///
    /// # Errors
    /// Returns a configuration error when no eos id is configured.
    pub fn with_engine(engine: Box<dyn TokenizerEngine>, config: &Config) -> Result<Tokenizer> {
        let model = &config.model;
        let eos_token_ids = model.eos_token_id.to_vec();
        let first_eos = *eos_token_ids
            .first()
            .ok_or_else(|| ModelError::MissingField("model.eos_token_id".to_string()))?;
        let pad_token_id = model.pad_token_id.unwrap_or(first_eos);
        let token_text = |id: Option<i32>| {
            id.and_then(|id| engine.token_bytes(id))
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default()
        };
        let bos_token = token_text(model.bos_token_id);
        let eos_token = token_text(Some(first_eos));
        Ok(Tokenizer {
            engine,
            bos_token_id: model.bos_token_id,
            eos_token_ids,
            pad_token_id,
            chat_template: None,
            bos_token,
            eos_token,
            options: RwLock::new(TokenizerOptions::default()),
        })
    }

    pub fn options(&self) -> TokenizerOptions {
        *self.options.read()
    }

    /// Apply `key = value` switches (`add_special_tokens`,
    /// `skip_special_tokens`, each `true`/`false`). Either every pair is
    /// applied or, on an unknown key or bad value, none is.
    pub fn update_options(&self, options: &[(&str, &str)]) -> Result<()> {
        let mut next = self.options();
        for (key, value) in options {
            next.set(key, value)?;
        }
        *self.options.write() = next;
        Ok(())
    }

    pub fn encode(&self, text: &str) -> Result<Vec<i32>> {
        let mut ids = self.leading_special_tokens();
        ids.extend(self.engine.encode(text)?);
        Ok(ids)
    }

    /// Encode part of a prompt: never adds special tokens.
    pub(crate) fn encode_fragment(&self, text: &str) -> Result<Vec<i32>> {
        self.engine.encode(text)
    }

    /// Tokens `encode` puts in front of every sequence.
    pub(crate) fn leading_special_tokens(&self) -> Vec<i32> {
        match self.bos_token_id {
            Some(bos) if self.options().add_special_tokens => vec![bos],
            _ => Vec::new(),
        }
    }

    /// Decode ids to text. Special tokens are dropped unless
    /// `skip_special_tokens` is off.
    pub fn decode(&self, tokens: &[i32]) -> Result<String> {
        let skip = self.options().skip_special_tokens;
        let mut bytes = Vec::new();
        for &id in tokens {
            if skip && self.engine.is_special(id) {
                continue;
            }
            bytes.extend(self.token_bytes(id)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn encode_batch_sequences<S: AsRef<str>>(&self, strings: &[S]) -> Result<Vec<Vec<i32>>> {
        strings.iter().map(|s| self.encode(s.as_ref())).collect()
    }

    /// Encode several strings into a right-padded `[batch, max_len]` i32 tensor.
    pub fn encode_batch<S: AsRef<str>>(&self, strings: &[S]) -> Result<Tensor> {
        let sequences = self.encode_batch_sequences(strings)?;
        let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let padded = pad_inputs(&sequences, self.pad_token_id);
        Ok(Tensor::from_vec(padded, [sequences.len(), max_len])?)
    }

    /// Split `flat` into `count` equal rows and decode each.
    pub fn decode_batch(&self, flat: &[i32], count: usize) -> Result<Vec<String>> {
        if count == 0 || flat.len() % count != 0 {
            return Err(ModelError::InvalidArgument(format!(
                "{} tokens cannot be split into {} sequences",
                flat.len(),
                count
            )));
        }
        let row = flat.len() / count;
        if row == 0 {
            return Ok(vec![String::new(); count]);
        }
        flat.chunks(row).map(|chunk| self.decode(chunk)).collect()
    }

    pub fn token_to_id(&self, token: &str) -> Result<i32> {
        self.engine
            .token_to_id(token)
            .ok_or_else(|| ModelError::TokenizerError(format!("unknown token {:?}", token)))
    }

    pub fn create_stream(self: &Arc<Self>) -> TokenizerStream {
        TokenizerStream::new(Arc::clone(self))
    }

    /// Render a chat prompt.
    ///
    /// `messages` is a JSON array of `{role, content}` objects and `tools` an
    /// optional JSON document. Without an explicit `template` the one from
    /// `tokenizer_config.json` is used.
    pub fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &str,
        tools: Option<&str>,
        add_generation_prompt: bool,
    ) -> Result<String> {
        let template = template
            .or(self.chat_template.as_deref())
            .ok_or_else(|| ModelError::Config("no chat template available".to_string()))?;
        chat::render(&chat::ChatRequest {
            template,
            messages,
            tools,
            add_generation_prompt,
            bos_token: &self.bos_token,
            eos_token: &self.eos_token,
        })
    }

    pub fn bos_token_id(&self) -> Option<i32> {
        self.bos_token_id
    }

    pub fn eos_token_ids(&self) -> &[i32] {
        &self.eos_token_ids
    }

    pub fn pad_token_id(&self) -> i32 {
        self.pad_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.engine.vocab_size()
    }

    /// Whether decoding drops `id`.
    pub(crate) fn skips(&self, id: i32) -> bool {
        self.options().skip_special_tokens && self.engine.is_special(id)
    }

    pub(crate) fn token_bytes(&self, id: i32) -> Result<Vec<u8>> {
        self.engine
            .token_bytes(id)
            .ok_or_else(|| ModelError::TokenizerError(format!("token id {} out of range", id)))
    }
}

fn read_tokenizer_config(path: &Path) -> Result<TokenizerConfigJson> {
    if !path.exists() {
        return Ok(TokenizerConfigJson::default());
    }
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| ModelError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_tokenizer, write_model_dir, ModelDirOptions};

    #[test]
    fn test_pad_inputs_right() {
        let seqs = vec![vec![1, 2, 3], vec![4], vec![]];
        let padded = pad_inputs(&seqs, 0);
        assert_eq!(padded, vec![1, 2, 3, 4, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_pad_inputs_property() {
        let seqs: Vec<Vec<i32>> = vec![vec![7; 5], vec![3, 1], vec![9, 9, 9, 9], vec![2]];
        let pad = -1;
        let padded = pad_inputs(&seqs, pad);
        let max_len = 5;
        assert_eq!(padded.len(), seqs.len() * max_len);
        for (i, seq) in seqs.iter().enumerate() {
            let row = &padded[i * max_len..(i + 1) * max_len];
            assert_eq!(&row[..seq.len()], seq.as_slice());
            assert!(row[seq.len()..].iter().all(|&t| t == pad));
        }
    }

    #[test]
    fn test_pad_inputs_left() {
        let padded = pad_inputs_with(&[vec![1, 2], vec![3]], 0, PadSide::Left);
        assert_eq!(padded, vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let tok = tiny_tokenizer();
        for text in ["hello world", "hello", "world hello", "é€", ""] {
            let ids = tok.encode(text).unwrap();
            assert_eq!(tok.decode(&ids).unwrap(), text);
        }
    }

    #[test]
    fn test_decode_skips_special() {
        let tok = tiny_tokenizer();
        let mut ids = vec![1];
        ids.extend(tok.encode("hello").unwrap());
        ids.push(2);
        assert_eq!(tok.decode(&ids).unwrap(), "hello");
    }

    #[test]
    fn test_encode_batch_pads_with_pad_id() {
        let tok = tiny_tokenizer();
        let t = tok.encode_batch(&["hello world", "hello"]).unwrap();
        let hello = tok.encode("hello").unwrap();
        let full = tok.encode("hello world").unwrap();
        assert_eq!(t.shape().dims(), &[2, full.len()]);
        let data = t.data::<i32>().unwrap();
        assert_eq!(&data[full.len()..full.len() + hello.len()], hello.as_slice());
        assert_eq!(data[data.len() - 1], tok.pad_token_id());
    }

    #[test]
    fn test_decode_batch() {
        let tok = tiny_tokenizer();
        let row = tok.encode("hello world").unwrap();
        assert_eq!(row.len(), 2);
        let mut flat = row.clone();
        flat.extend(&row);
        assert_eq!(
            tok.decode_batch(&flat, 2).unwrap(),
            vec!["hello world", "hello world"]
        );
        assert!(tok.decode_batch(&flat[..3], 2).is_err());
        assert!(tok.decode_batch(&flat, 0).is_err());
        assert_eq!(tok.decode_batch(&[], 2).unwrap(), vec!["", ""]);
    }

    #[test]
    fn test_update_options() {
        let tok = tiny_tokenizer();
        assert_eq!(tok.options(), TokenizerOptions::default());
        assert_eq!(tok.encode("hello").unwrap(), vec![14]);

        tok.update_options(&[(ADD_SPECIAL_TOKENS, "true"), (SKIP_SPECIAL_TOKENS, "false")])
            .unwrap();
        assert_eq!(tok.encode("hello").unwrap(), vec![1, 14]);
        assert_eq!(tok.decode(&[1, 14, 2]).unwrap(), "<s>hello</s>");

        // a bad pair leaves every option as it was
        assert!(tok
            .update_options(&[(SKIP_SPECIAL_TOKENS, "true"), ("lowercase", "true")])
            .is_err());
        assert!(tok.update_options(&[(ADD_SPECIAL_TOKENS, "yes")]).is_err());
        assert!(!tok.options().skip_special_tokens);
        assert!(tok.options().add_special_tokens);
    }

    #[test]
    fn test_special_ids_and_lookup() {
        let tok = tiny_tokenizer();
        assert_eq!(tok.bos_token_id(), Some(1));
        assert_eq!(tok.eos_token_ids(), &[2, 19]);
        // no pad configured: first eos
        assert_eq!(tok.pad_token_id(), 2);
        assert_eq!(tok.token_to_id("hello").unwrap(), 14);
        assert!(tok.token_to_id("zebra").is_err());
    }

    #[test]
    fn test_missing_eos_is_config_error() {
        let vocab = Vocab::from_json(r#"{"model": {"vocab": {"a": 0}}}"#).unwrap();
        let err = Tokenizer::with_engine(Box::new(BpeTokenizer::new(vocab)), &Config::default())
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_from_config_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_model_dir(dir.path(), &ModelDirOptions::default());
        let tok = Tokenizer::from_config(&config).unwrap();
        let out = tok
            .apply_chat_template(None, r#"[{"role": "user", "content": "hi"}]"#, None, true)
            .unwrap();
        assert_eq!(out, "<s><|user|>\nhi</s>\n<|assistant|>\n");
    }

    #[test]
    fn test_from_config_without_tokenizer_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.config_path = dir.path().to_path_buf();
        config.model.eos_token_id = crate::config::TokenIds::One(2);
        let err = Tokenizer::from_config(&config).unwrap_err();
        assert!(err.is_configuration_error());
    }
}
