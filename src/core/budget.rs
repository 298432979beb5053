//! Token accounting backed by tiktoken-rs with content-hash caching.

use anyhow::{anyhow, Context, Result};
use moka::sync::Cache;
use tiktoken_rs::{cl100k_base, get_bpe_from_model, o200k_base, CoreBPE};
use xxhash_rust::xxh64::Xxh64;

/// Fixed per-message overhead in the chat format (role + framing tokens).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Budget manager backed by tiktoken-rs with token caching.
pub struct Budgeter {
    /// Byte Pair Encoding (BPE) tokenizer for counting tokens
    bpe: CoreBPE,

    /// Name the tokenizer was resolved for; part of feature cache keys
    model: String,

    /// Token count cache for fast repeated queries
    cache: Cache<u64, usize>,
}

impl Budgeter {
    /// Create a new Budgeter for a given model or encoding name.
    ///
    /// Supported values include model names (e.g., "gpt-4o") or encoding
    /// names ("cl100k_base", "o200k_base"). Falls back to encoding names
    /// if model lookup fails.
    pub fn new(model_or_encoding: &str) -> Result<Self> {
        let lower = model_or_encoding.to_ascii_lowercase();

        let bpe = match get_bpe_from_model(&lower) {
            Ok(b) => b,
            Err(_) => match lower.as_str() {
                "o200k_base" => o200k_base().context("load o200k_base")?,
                "cl100k_base" => cl100k_base().context("load cl100k_base")?,
                _ => return Err(anyhow!("Unsupported model/encoding: {model_or_encoding}")),
            },
        };

        Ok(Self {
            bpe,
            model: lower,
            cache: Cache::new(100_000),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Count the number of tokens in the given string, using cache for
    /// efficiency. Keys are xxhash64 digests of the content.
    pub fn count(&self, s: &str) -> usize {
        let mut hasher = Xxh64::new(0);
        hasher.update(s.as_bytes());
        let key = hasher.digest();

        if let Some(t) = self.cache.get(&key) {
            return t;
        }

        let t = self.bpe.encode_ordinary(s).len();
        self.cache.insert(key, t);

        t
    }

    /// Tokens for a chat message: fixed framing overhead plus content.
    pub fn count_message(&self, content: &str) -> usize {
        MESSAGE_OVERHEAD_TOKENS + self.count(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_matches_encoder() {
        let b = Budgeter::new("gpt-4o").unwrap();
        let text = "fn add(a: i32, b: i32) -> i32 { a + b }";
        let direct = b.bpe.encode_ordinary(text).len();
        assert_eq!(b.count(text), direct);
        // Second call hits the cache and must agree
        assert_eq!(b.count(text), direct);
    }

    #[test]
    fn test_encoding_name_fallback() {
        assert!(Budgeter::new("cl100k_base").is_ok());
        assert!(Budgeter::new("o200k_base").is_ok());
        assert!(Budgeter::new("definitely-not-a-model").is_err());
    }

    #[test]
    fn test_message_overhead() {
        let b = Budgeter::new("cl100k_base").unwrap();
        assert_eq!(
            b.count_message("hello"),
            MESSAGE_OVERHEAD_TOKENS + b.count("hello")
        );
    }
}
