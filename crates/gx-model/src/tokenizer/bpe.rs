use std::collections::HashMap;

use super::vocab::{Vocab, SPACE_MARKER};
use super::TokenizerEngine;
use crate::error::{ModelError, Result};

/// Byte-Pair Encoding tokenizer with byte fallback.
pub struct BpeTokenizer {
    /// The token vocabulary (strings, special and added token IDs).
    pub vocab: Vocab,
    /// Map from merge pair to priority rank (lower rank = higher priority).
    merge_ranks: HashMap<(String, String), usize>,
}

impl BpeTokenizer {
    pub fn new(vocab: Vocab) -> BpeTokenizer {
        let merge_ranks = vocab
            .merges
            .iter()
            .enumerate()
            .map(|(rank, pair)| (pair.clone(), rank))
            .collect();
        BpeTokenizer { vocab, merge_ranks }
    }

    /// Encode a piece of text that contains no added tokens.
    ///
    /// Algorithm:
    /// 1. Replace spaces with the word-boundary marker.
    /// 2. Map each character to its vocabulary entry, or to its UTF-8 bytes
    ///    as `<0xHH>` tokens when the character is not in the vocabulary.
    /// 3. Iteratively apply the highest-priority merge among adjacent pairs
    ///    until none applies.
    /// 4. Convert the resulting token strings to IDs.
    fn encode_piece(&self, text: &str, ids: &mut Vec<i32>) -> Result<()> {
        let normalized: String = text
            .chars()
            .map(|c| if c == ' ' { SPACE_MARKER } else { c })
            .collect();

        let mut tokens: Vec<String> = Vec::new();
        for ch in normalized.chars() {
            let ch_str = ch.to_string();
            if self.vocab.token_to_id.contains_key(&ch_str) {
                tokens.push(ch_str);
                continue;
            }
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                tokens.push(format!("<0x{:02X}>", byte));
            }
        }

        loop {
            if tokens.len() < 2 {
                break;
            }

            let mut best_rank = usize::MAX;
            let mut best_idx = usize::MAX;
            for i in 0..tokens.len() - 1 {
                let pair = (tokens[i].clone(), tokens[i + 1].clone());
                if let Some(&rank) = self.merge_ranks.get(&pair) {
                    if rank < best_rank {
                        best_rank = rank;
                        best_idx = i;
                    }
                }
            }

            if best_idx == usize::MAX {
                break;
            }

            let merged = format!("{}{}", tokens[best_idx], tokens[best_idx + 1]);
            tokens[best_idx] = merged;
            tokens.remove(best_idx + 1);
        }

        for tok in &tokens {
            match self.vocab.token_to_id.get(tok).copied().or(self.vocab.unk_id) {
                Some(id) => ids.push(id),
                None => {
                    return Err(ModelError::TokenizerError(format!(
                        "no token for {:?} and no unknown token configured",
                        tok
                    )))
                }
            }
        }
        Ok(())
    }

    /// Find the earliest added token in `text`, preferring the longest at a
    /// given position.
    fn next_added(&self, text: &str) -> Option<(usize, &str, i32)> {
        let mut best: Option<(usize, &str, i32)> = None;
        for (content, id) in &self.vocab.added {
            if let Some(pos) = text.find(content.as_str()) {
                // added is sorted longest first, so ties keep the longer match
                if best.map_or(true, |(b, _, _)| pos < b) {
                    best = Some((pos, content.as_str(), *id));
                }
            }
        }
        best
    }
}

/// Parse a `<0xHH>` byte-fallback token.
fn byte_token(tok: &str) -> Option<u8> {
    if tok.len() == 6 && tok.starts_with("<0x") && tok.ends_with('>') {
        u8::from_str_radix(&tok[3..5], 16).ok()
    } else {
        None
    }
}

impl TokenizerEngine for BpeTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i32>> {
        let mut ids = Vec::new();
        let mut rest = text;
        while let Some((pos, content, id)) = self.next_added(rest) {
            if pos > 0 {
                self.encode_piece(&rest[..pos], &mut ids)?;
            }
            ids.push(id);
            rest = &rest[pos + content.len()..];
        }
        if !rest.is_empty() {
            self.encode_piece(rest, &mut ids)?;
        }
        Ok(ids)
    }

    fn token_bytes(&self, id: i32) -> Option<Vec<u8>> {
        let tok = self.vocab.token(id)?;
        if let Some(byte) = byte_token(tok) {
            return Some(vec![byte]);
        }
        Some(tok.replace(SPACE_MARKER, " ").into_bytes())
    }

    fn is_special(&self, id: i32) -> bool {
        self.vocab.special.contains(&id)
    }

    fn token_to_id(&self, token: &str) -> Option<i32> {
        self.vocab.token_to_id.get(token).copied()
    }

    fn vocab_size(&self) -> usize {
        self.vocab.len()
    }
}
