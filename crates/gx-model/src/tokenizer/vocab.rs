use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::{ModelError, Result};

/// Word-boundary marker used in place of spaces inside vocabulary entries.
pub const SPACE_MARKER: char = '\u{2581}';

/// Token vocabulary loaded from a `tokenizer.json` document.
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    /// Token strings, indexed by token ID. Gaps in the ID space are empty.
    pub tokens: Vec<String>,
    /// Reverse mapping from token string to token ID.
    pub token_to_id: HashMap<String, i32>,
    /// IDs of added tokens flagged as special.
    pub special: HashSet<i32>,
    /// Added tokens matched verbatim before BPE runs, longest first.
    pub added: Vec<(String, i32)>,
    pub unk_id: Option<i32>,
    /// Ordered merge rules, highest priority first.
    pub merges: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct TokenizerJson {
    model: BpeModelJson,
    #[serde(default)]
    added_tokens: Vec<AddedToken>,
}

#[derive(Deserialize)]
struct BpeModelJson {
    #[serde(rename = "type", default)]
    model_type: Option<String>,
    vocab: HashMap<String, i32>,
    #[serde(default)]
    merges: Vec<Merge>,
    #[serde(default)]
    unk_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Merge {
    Joined(String),
    Pair(String, String),
}

#[derive(Deserialize)]
struct AddedToken {
    id: i32,
    content: String,
    #[serde(default)]
    special: bool,
}

impl Vocab {
    /// Load the vocabulary, merges and added tokens from `tokenizer.json`.
    pub fn from_file(path: &Path) -> Result<Vocab> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModelError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text).map_err(|e| match e {
            ModelError::Json { source, .. } => ModelError::Json {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(json: &str) -> Result<Vocab> {
        let doc: TokenizerJson = serde_json::from_str(json).map_err(|source| ModelError::Json {
            path: "tokenizer.json".into(),
            source,
        })?;
        if let Some(kind) = doc.model.model_type.as_deref() {
            if kind != "BPE" {
                return Err(ModelError::TokenizerError(format!(
                    "unsupported tokenizer model type: {}",
                    kind
                )));
            }
        }

        let mut merges = Vec::with_capacity(doc.model.merges.len());
        for merge in doc.model.merges {
            let pair = match merge {
                Merge::Pair(a, b) => (a, b),
                Merge::Joined(entry) => match entry.split_once(' ') {
                    Some((a, b)) => (a.to_string(), b.to_string()),
                    None => {
                        return Err(ModelError::TokenizerError(format!(
                            "invalid merge entry: {:?}",
                            entry
                        )))
                    }
                },
            };
            merges.push(pair);
        }

        let mut token_to_id = doc.model.vocab;
        let mut special = HashSet::new();
        let mut added = Vec::with_capacity(doc.added_tokens.len());
        for token in doc.added_tokens {
            if token.special {
                special.insert(token.id);
            }
            token_to_id.insert(token.content.clone(), token.id);
            added.push((token.content, token.id));
        }
        added.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let size = token_to_id.values().copied().max().map_or(0, |m| m as usize + 1);
        let mut tokens = vec![String::new(); size];
        for (tok, &id) in &token_to_id {
            if id < 0 {
                return Err(ModelError::TokenizerError(format!(
                    "negative id {} for token {:?}",
                    id, tok
                )));
            }
            tokens[id as usize] = tok.clone();
        }

        let unk_id = doc
            .model
            .unk_token
            .as_ref()
            .and_then(|t| token_to_id.get(t).copied());

        Ok(Vocab {
            tokens,
            token_to_id,
            special,
            added,
            unk_id,
            merges,
        })
    }

    /// Number of token slots in the vocabulary.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, id: i32) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.tokens.get(i))
            .filter(|t| !t.is_empty())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_vocab_and_added_tokens() {
        let vocab = Vocab::from_json(
            r#"{
                "model": {
                    "type": "BPE",
                    "vocab": {"<unk>": 0, "a": 1, "b": 2, "ab": 3},
                    "merges": ["a b"],
                    "unk_token": "<unk>"
                },
                "added_tokens": [
                    {"id": 4, "content": "<|end|>", "special": true},
                    {"id": 5, "content": "<|e|>", "special": false}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(vocab.len(), 6);
        assert_eq!(vocab.token(3), Some("ab"));
        assert_eq!(vocab.token(-1), None);
        assert_eq!(vocab.unk_id, Some(0));
        assert!(vocab.special.contains(&4));
        assert!(!vocab.special.contains(&5));
        assert_eq!(vocab.added[0].0, "<|end|>");
        assert_eq!(vocab.merges, vec![("a".to_string(), "b".to_string())]);
    }

    #[test]
    fn test_pair_merges() {
        let vocab = Vocab::from_json(
            r#"{"model": {"vocab": {"a": 0, "b": 1}, "merges": [["a", "b"]]}}"#,
        )
        .unwrap();
        assert_eq!(vocab.merges.len(), 1);
    }

    #[test]
    fn test_rejects_other_model_types() {
        let err = Vocab::from_json(r#"{"model": {"type": "Unigram", "vocab": {}}}"#);
        assert!(err.is_err());
    }
}
