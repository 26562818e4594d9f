//! StreamingDetokenizer: incremental, UTF-8-safe token-to-text decoding.
//!
//! Generalizes the teacher's `TokenOutputStream` (decode-the-whole-buffer-
//! and-diff-against-the-previous-decode trick) but replaces its
//! `is_alphanumeric()` completeness heuristic — which wrongly withholds
//! punctuation-ending chunks and wrongly emits text ending in a BPE
//! replacement character — with an explicit check against U+FFFD.

use std::sync::Arc;

use candle_core::Result as CandleResult;
use tokenizers::Tokenizer;

pub struct StreamingDetokenizer {
    tokenizer: Arc<Tokenizer>,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl StreamingDetokenizer {
    pub fn new(tokenizer: Arc<Tokenizer>) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    fn decode(&self, tokens: &[u32]) -> CandleResult<String> {
        match self.tokenizer.decode(tokens, true) {
            Ok(s) => Ok(s),
            Err(err) => candle_core::bail!("cannot decode: {err}"),
        }
    }

    /// Buffers one more token. Does not decode yet — call `next()` to pull
    /// whatever text this (and any still-buffered) tokens newly complete.
    pub fn append(&mut self, token: u32) {
        self.tokens.push(token);
    }

    /// Returns newly-completed text, or `None` if the buffered suffix still
    /// ends mid-codepoint (or mid-grapheme, for scripts whose tokenizer
    /// emits partial UTF-8 sequences across several tokens).
    pub fn next(&mut self) -> CandleResult<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;

        if text.len() <= prev_text.len() {
            return Ok(None);
        }
        if text.ends_with('\u{FFFD}') {
            // Incomplete multi-byte sequence — withhold until more tokens arrive.
            return Ok(None);
        }

        let new_part = text[prev_text.len()..].to_string();
        self.prev_index = self.current_index;
        self.current_index = self.tokens.len();

        if new_part.ends_with('\n') {
            self.resync();
        }

        Ok(Some(new_part))
    }

    /// Drops already-emitted tokens once a newline boundary confirms they
    /// can never again affect a future decode diff. Purely a memory
    /// optimization — it must never change what `next()`/`decode_rest()`
    /// would otherwise have produced.
    fn resync(&mut self) {
        if self.current_index == 0 {
            return;
        }
        self.tokens.drain(0..self.current_index);
        self.prev_index = 0;
        self.current_index = 0;
    }

    /// Flushes whatever trailing text remains once generation ends, even if
    /// it still looked incomplete to `next()` (there is nothing more coming
    /// that could complete it further, so decode it as-is).
    pub fn decode_rest(&self) -> CandleResult<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decode(&self.tokens[self.prev_index..self.current_index])?
        };
        let text = self.decode(&self.tokens[self.prev_index..])?;
        if text.len() > prev_text.len() {
            Ok(Some(text[prev_text.len()..].to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn decode_all(&self) -> CandleResult<String> {
        self.decode(&self.tokens)
    }

    pub fn get_token(&self, token_s: &str) -> Option<u32> {
        self.tokenizer.get_vocab(true).get(token_s).copied()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.prev_index = 0;
        self.current_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_tokenizer() -> Arc<Tokenizer> {
        Arc::new(Tokenizer::new(tokenizers::models::wordlevel::WordLevel::default()))
    }

    #[test]
    fn resync_only_drops_already_emitted_tokens() {
        let mut d = StreamingDetokenizer::new(empty_tokenizer());
        d.append(1);
        d.append(2);
        d.prev_index = 0;
        d.current_index = 2;
        d.resync();
        assert_eq!(d.tokens.len(), 0);
        assert_eq!(d.prev_index, 0);
        assert_eq!(d.current_index, 0);
    }

    #[test]
    fn clear_resets_all_bookkeeping() {
        let mut d = StreamingDetokenizer::new(empty_tokenizer());
        d.append(5);
        d.current_index = 1;
        d.clear();
        assert!(d.tokens.is_empty());
        assert_eq!(d.prev_index, 0);
        assert_eq!(d.current_index, 0);
    }
}
