//! Stop-condition evaluation.
//!
//! A request stops on a stop token (EOS is always one), on a stop string
//! found in the decoded continuation, or when the token budget runs out.
//! Token and string stops take precedence over the budget.

use std::sync::Arc;

use crate::engine::EngineError;
use crate::request::FinishReason;
use crate::tokenizer::Tokenizer;

/// Token ids and literal strings that end generation for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopConditions {
    token_ids: Arc<[u32]>,
    strings: Arc<[String]>,
}

impl StopConditions {
    /// `eos_token_id` is always part of the token set. Duplicates and empty
    /// strings are dropped.
    pub fn new(eos_token_id: u32, token_ids: &[u32], strings: &[String]) -> Self {
        let mut ids = Vec::with_capacity(token_ids.len() + 1);
        for &id in std::iter::once(&eos_token_id).chain(token_ids) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        let mut strs: Vec<String> = Vec::with_capacity(strings.len());
        for s in strings {
            if !s.is_empty() && !strs.contains(s) {
                strs.push(s.clone());
            }
        }
        Self {
            token_ids: ids.into(),
            strings: strs.into(),
        }
    }

    /// Build the stop set for a request: EOS plus the caller's ids, and the
    /// caller's strings plus the decoded text of every non-zero stop id.
    pub fn prepare(
        stop_token_ids: &[u32],
        stop: &[String],
        tokenizer: &dyn Tokenizer,
    ) -> Result<Self, EngineError> {
        let mut strings = stop.to_vec();
        for &id in stop_token_ids {
            if id == 0 {
                continue;
            }
            let text = tokenizer.decode(&[id], true, false)?;
            if !text.is_empty() {
                strings.push(text);
            }
        }
        Ok(Self::new(tokenizer.eos_token_id(), stop_token_ids, &strings))
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn matches_token(&self, token_id: u32) -> bool {
        self.token_ids.contains(&token_id)
    }

    /// Byte offset of the earliest stop-string occurrence in `text`.
    pub fn find_stop(&self, text: &str) -> Option<usize> {
        self.strings.iter().filter_map(|s| text.find(s.as_str())).min()
    }

    /// Length in bytes of the longest suffix of `text` that is a proper
    /// prefix of some stop string. Streaming emissions hold this back so a
    /// later match never retracts text already sent.
    pub fn holdback_len(&self, text: &str) -> usize {
        let mut longest = 0;
        for stop in self.strings.iter() {
            let max = (stop.len() - 1).min(text.len());
            for len in (longest + 1..=max).rev() {
                let start = text.len() - len;
                if !text.is_char_boundary(start) {
                    continue;
                }
                if stop.starts_with(&text[start..]) {
                    longest = len;
                    break;
                }
            }
        }
        longest
    }
}

/// Outcome of [`StopChecker::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCheck {
    Continue,
    /// Generation just finished. `truncate_at` is the byte offset to cut the
    /// decoded text at when a stop string matched.
    Finished {
        reason: FinishReason,
        truncate_at: Option<usize>,
    },
    /// Generation had already finished before this call.
    AlreadyFinished(FinishReason),
}

/// Per-alternative stop state.
#[derive(Debug, Clone)]
pub struct StopChecker {
    conditions: StopConditions,
    max_new_tokens: usize,
    stopped: Option<FinishReason>,
}

impl StopChecker {
    pub fn new(conditions: StopConditions, max_new_tokens: usize) -> Self {
        Self {
            conditions,
            max_new_tokens,
            stopped: None,
        }
    }

    pub fn conditions(&self) -> &StopConditions {
        &self.conditions
    }

    /// Check the state after `token` was appended. `text` is the decoded
    /// continuation including that token; `num_generated` counts it too.
    ///
    /// Once finished, every later call returns `AlreadyFinished` without
    /// changing state.
    pub fn evaluate(&mut self, token: u32, text: &str, num_generated: usize) -> StopCheck {
        if let Some(reason) = self.stopped {
            return StopCheck::AlreadyFinished(reason);
        }

        let check = if self.conditions.matches_token(token) {
            StopCheck::Finished {
                reason: FinishReason::Stop,
                truncate_at: self.conditions.find_stop(text),
            }
        } else if let Some(pos) = self.conditions.find_stop(text) {
            StopCheck::Finished {
                reason: FinishReason::Stop,
                truncate_at: Some(pos),
            }
        } else if num_generated >= self.max_new_tokens {
            StopCheck::Finished {
                reason: FinishReason::Length,
                truncate_at: None,
            }
        } else {
            StopCheck::Continue
        };

        if let StopCheck::Finished { reason, .. } = check {
            self.stopped = Some(reason);
        }
        check
    }

    /// Mark the alternative finished from outside (e.g. the runtime ended).
    pub fn finish(&mut self, reason: FinishReason) {
        self.stopped.get_or_insert(reason);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.stopped
    }
}
