//! Per-request decode state for the sequential engine.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::output::{CompletionChunk, PromptLogprobs, SampleLogprobs};
use crate::request::FinishReason;
use crate::sampling::SamplerState;
use crate::stop::{StopCheck, StopChecker};
use crate::tokenizer::incomplete_suffix_len;

use super::model_forward::KvCache;

/// Where one alternative is in the decode state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodePhase {
    Prefill,
    Decode,
    Stopped,
    LengthExceeded,
}

impl DecodePhase {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Stopped | Self::LengthExceeded)
    }
}

/// One alternative (`n`-way lane) of a request.
pub(crate) struct LaneState {
    pub index: usize,
    pub phase: DecodePhase,
    pub output_token_ids: Vec<u32>,
    pub cumulative_logprob: f32,
    pub sample_logprobs: Option<SampleLogprobs>,
    pub cache: Option<KvCache>,
    pub sampler: SamplerState,
    pub checker: StopChecker,
    /// Decoded continuation, already truncated at a stop string.
    pub text: String,
}

impl LaneState {
    pub fn new(index: usize, sampler: SamplerState, checker: StopChecker, logprobs: bool) -> Self {
        Self {
            index,
            phase: DecodePhase::Prefill,
            output_token_ids: Vec::new(),
            cumulative_logprob: 0.0,
            sample_logprobs: logprobs.then(Vec::new),
            cache: None,
            sampler,
            checker,
            text: String::new(),
        }
    }

    pub fn last_token(&self) -> Option<u32> {
        self.output_token_ids.last().copied()
    }

    /// Append a sampled token and its raw log-probability.
    pub fn push_token(&mut self, token_id: u32, logprob: Option<f32>) {
        self.output_token_ids.push(token_id);
        if let Some(lp) = logprob {
            self.cumulative_logprob += lp;
            if let Some(entries) = self.sample_logprobs.as_mut() {
                entries.push(HashMap::from([(token_id, lp)]));
            }
        }
    }

    /// Record the decoded text for the newest token and advance the phase.
    pub fn apply_text(&mut self, mut text: String) {
        let token = self.last_token().unwrap_or_default();
        let check = self
            .checker
            .evaluate(token, &text, self.output_token_ids.len());
        match check {
            StopCheck::Continue => {
                self.text = text;
                self.phase = DecodePhase::Decode;
            }
            StopCheck::Finished {
                reason,
                truncate_at,
            } => {
                if let Some(pos) = truncate_at {
                    text.truncate(pos);
                }
                self.text = text;
                self.phase = match reason {
                    FinishReason::Stop => DecodePhase::Stopped,
                    FinishReason::Length => DecodePhase::LengthExceeded,
                };
                self.cache = None;
            }
            StopCheck::AlreadyFinished(_) => {}
        }
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self.phase {
            DecodePhase::Stopped => Some(FinishReason::Stop),
            DecodePhase::LengthExceeded => Some(FinishReason::Length),
            _ => None,
        }
    }

    /// Chunk for a non-final emission. Unfinished lanes withhold a trailing
    /// partial stop string or partial character.
    pub fn streaming_chunk(&self) -> CompletionChunk {
        let text = if self.phase.is_finished() {
            self.text.clone()
        } else {
            let hold = self
                .checker
                .conditions()
                .holdback_len(&self.text)
                .max(incomplete_suffix_len(&self.text));
            self.text[..self.text.len() - hold].to_string()
        };
        CompletionChunk {
            index: self.index,
            text,
            token_ids: self.output_token_ids.clone(),
            cumulative_logprob: self.cumulative_logprob,
            logprobs: self.sample_logprobs.clone(),
            finish_reason: self.finish_reason(),
        }
    }

    /// Chunk for the terminal emission: token ids carry the prompt too.
    pub fn terminal_chunk(&self, prompt_token_ids: &[u32]) -> CompletionChunk {
        let mut token_ids = Vec::with_capacity(prompt_token_ids.len() + self.output_token_ids.len());
        token_ids.extend_from_slice(prompt_token_ids);
        token_ids.extend_from_slice(&self.output_token_ids);
        CompletionChunk {
            index: self.index,
            text: self.text.clone(),
            token_ids,
            cumulative_logprob: self.cumulative_logprob,
            logprobs: self.sample_logprobs.clone(),
            finish_reason: self.finish_reason(),
        }
    }
}

/// Everything one in-flight request owns while decoding.
pub(crate) struct DecodeState {
    pub step: usize,
    pub lanes: Vec<LaneState>,
    /// Encoder output, computed once for encoder-decoder models.
    pub encoder_output: Option<Tensor>,
    pub prompt_logprobs: Option<PromptLogprobs>,
    pub terminal_emitted: bool,
}

impl DecodeState {
    pub fn new(lanes: Vec<LaneState>, encoder_output: Option<Tensor>) -> Self {
        Self {
            step: 0,
            lanes,
            encoder_output,
            prompt_logprobs: None,
            terminal_emitted: false,
        }
    }

    pub fn all_finished(&self) -> bool {
        self.lanes.iter().all(|lane| lane.phase.is_finished())
    }

    /// Drop every cache handle and the encoder output.
    pub fn release(&mut self) {
        for lane in &mut self.lanes {
            lane.cache = None;
        }
        self.encoder_output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopConditions;

    fn lane(stop: &[&str], max: usize) -> LaneState {
        let strings: Vec<String> = stop.iter().map(|s| s.to_string()).collect();
        LaneState::new(
            0,
            SamplerState::new(Some(0)),
            StopChecker::new(StopConditions::new(0, &[], &strings), max),
            true,
        )
    }

    #[test]
    fn push_token_accumulates_logprobs() {
        let mut lane = lane(&[], 10);
        lane.push_token(4, Some(-0.5));
        lane.push_token(5, Some(-1.0));
        assert_eq!(lane.cumulative_logprob, -1.5);
        let entries = lane.sample_logprobs.as_ref().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1][&5], -1.0);
    }

    #[test]
    fn streaming_chunk_holds_back_partial_stop() {
        let mut lane = lane(&["t9 t9"], 10);
        lane.push_token(1, None);
        lane.apply_text("t1 t9".to_string());
        assert_eq!(lane.phase, DecodePhase::Decode);
        assert_eq!(lane.streaming_chunk().text, "t1 ");

        lane.push_token(9, None);
        lane.apply_text("t1 t9 t9".to_string());
        assert_eq!(lane.phase, DecodePhase::Stopped);
        assert_eq!(lane.streaming_chunk().text, "t1 ");
        assert_eq!(lane.streaming_chunk().finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn streaming_chunk_holds_back_split_character() {
        let mut lane = lane(&[], 10);
        lane.push_token(1, None);
        lane.apply_text("a\u{FFFD}".to_string());
        assert_eq!(lane.streaming_chunk().text, "a");

        lane.push_token(2, None);
        lane.apply_text("a\u{e9}".to_string());
        assert_eq!(lane.streaming_chunk().text, "a\u{e9}");
    }

    #[test]
    fn finished_lane_releases_replacement_character() {
        let mut lane = lane(&[], 1);
        lane.push_token(1, None);
        lane.apply_text("a\u{FFFD}".to_string());
        assert_eq!(lane.phase, DecodePhase::LengthExceeded);
        assert_eq!(lane.streaming_chunk().text, "a\u{FFFD}");
    }

    #[test]
    fn length_phase_and_terminal_chunk() {
        let mut lane = lane(&[], 1);
        lane.push_token(3, None);
        lane.apply_text("t3".to_string());
        assert_eq!(lane.phase, DecodePhase::LengthExceeded);
        let chunk = lane.terminal_chunk(&[1, 2]);
        assert_eq!(chunk.token_ids, vec![1, 2, 3]);
        assert_eq!(chunk.finish_reason, Some(FinishReason::Length));
    }
}
