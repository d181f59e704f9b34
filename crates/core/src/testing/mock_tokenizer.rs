use crate::engine::EngineError;
use crate::tokenizer::{clean_up_tokenization, Tokenizer};

/// Word-level tokenizer where token `n` is the word `t{n}`.
///
/// The EOS id is the only special token.
pub struct MockTokenizer {
    vocab_size: usize,
    eos_token_id: u32,
}

impl MockTokenizer {
    pub fn new(vocab_size: usize, eos_token_id: u32) -> Self {
        Self {
            vocab_size,
            eos_token_id,
        }
    }
}

impl Tokenizer for MockTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        text.split_whitespace()
            .map(|word| {
                word.strip_prefix('t')
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|&id| (id as usize) < self.vocab_size)
                    .ok_or_else(|| EngineError::Tokenization(format!("unknown word {word:?}")))
            })
            .collect()
    }

    fn decode(
        &self,
        ids: &[u32],
        skip_special: bool,
        clean_spaces: bool,
    ) -> Result<String, EngineError> {
        let words: Vec<String> = ids
            .iter()
            .filter(|&&id| !(skip_special && id == self.eos_token_id))
            .map(|id| format!("t{id}"))
            .collect();
        let text = words.join(" ");
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
        Some(self.vocab_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_skips_eos_when_asked() {
        let tok = MockTokenizer::new(10, 0);
        assert_eq!(tok.decode(&[1, 0, 2], true, false).unwrap(), "t1 t2");
        assert_eq!(tok.decode(&[1, 0, 2], false, false).unwrap(), "t1 t0 t2");
    }

    #[test]
    fn encode_parses_words() {
        let tok = MockTokenizer::new(10, 0);
        assert_eq!(tok.encode("t3 t4").unwrap(), vec![3, 4]);
        assert!(matches!(
            tok.encode("hello"),
            Err(EngineError::Tokenization(_))
        ));
        assert!(tok.encode("t99").is_err());
    }
}
