use std::sync::Arc;

use super::Tokenizer;
use crate::error::Result;

/// Incremental decoder for one sequence.
///
/// Tokens often carry a fragment of a multi-byte character. The stream keeps
/// those bytes pending and emits text only once a complete character can be
/// formed. Bytes that can never form a character come out as U+FFFD.
pub struct TokenizerStream {
    tokenizer: Arc<Tokenizer>,
    pending: Vec<u8>,
    chunk: String,
}

impl TokenizerStream {
    pub(crate) fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            tokenizer,
            pending: Vec::new(),
            chunk: String::new(),
        }
    }

    /// Feed one token and return the text it completes, possibly empty.
    pub fn decode(&mut self, token: i32) -> Result<&str> {
        self.chunk.clear();
        if self.tokenizer.skips(token) {
            return Ok(&self.chunk);
        }
        let bytes = self.tokenizer.token_bytes(token)?;
        self.pending.extend_from_slice(&bytes);

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.chunk.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.chunk
                        .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            self.chunk.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
        Ok(&self.chunk)
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
