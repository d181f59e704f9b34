use std::path::Path;

use crate::engine::EngineError;

/// Encode/decode capability consumed by the engines.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError>;

    /// Decode `ids` to text. `skip_special` drops special tokens such as EOS;
    /// `clean_spaces` applies [`clean_up_tokenization`].
    fn decode(&self, ids: &[u32], skip_special: bool, clean_spaces: bool)
        -> Result<String, EngineError>;

    fn eos_token_id(&self) -> u32;

    fn vocab_size(&self) -> Option<usize> {
        None
    }
}

/// [`Tokenizer`] backed by a HuggingFace `tokenizer.json`.
pub struct TokenizerWrapper {
    inner: tokenizers::Tokenizer,
    eos_token_id: u32,
}

impl TokenizerWrapper {
    /// Load `tokenizer.json` and resolve `eos_token` (e.g. `"</s>"`) to its id.
    pub fn from_file(path: &Path, eos_token: &str) -> anyhow::Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        let eos_token_id = inner
            .token_to_id(eos_token)
            .ok_or_else(|| anyhow::anyhow!("eos token {eos_token:?} not in vocabulary"))?;
        Ok(Self {
            inner,
            eos_token_id,
        })
    }

    pub fn with_eos_token_id(inner: tokenizers::Tokenizer, eos_token_id: u32) -> Self {
        Self {
            inner,
            eos_token_id,
        }
    }
}

impl Tokenizer for TokenizerWrapper {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EngineError::Tokenization(format!("encode: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(
        &self,
        ids: &[u32],
        skip_special: bool,
        clean_spaces: bool,
    ) -> Result<String, EngineError> {
        let text = self
            .inner
            .decode(ids, skip_special)
            .map_err(|e| EngineError::Tokenization(format!("decode: {e}")))?;
        Ok(if clean_spaces {
            clean_up_tokenization(&text)
        } else {
            text
        })
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn vocab_size(&self) -> Option<usize> {
        Some(self.inner.get_vocab_size(true))
    }
}

/// Undo the spaces word-level tokenizers leave before punctuation and
/// English contractions.
pub fn clean_up_tokenization(text: &str) -> String {
    const REPLACEMENTS: &[(&str, &str)] = &[
        (" .", "."),
        (" ?", "?"),
        (" !", "!"),
        (" ,", ","),
        (" ' ", "'"),
        (" n't", "n't"),
        (" 'm", "'m"),
        (" 's", "'s"),
        (" 've", "'ve"),
        (" 're", "'re"),
    ];
    REPLACEMENTS
        .iter()
        .fold(text.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Bytes of trailing U+FFFD in `text`.
///
/// Decoding a prefix that ends inside a multi-byte character yields a
/// replacement character which the next token turns into the real one, so
/// streamed text must not commit to it yet.
pub fn incomplete_suffix_len(text: &str) -> usize {
    let kept = text.trim_end_matches(char::REPLACEMENT_CHARACTER).len();
    text.len() - kept
}
