//! Canonical generation output.
//!
//! Every engine emits [`GenerationOutput`] values: a run of non-final
//! emissions followed by exactly one with `finished == true`.

pub mod delta;
pub mod sse;

pub use delta::DeltaReconciler;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::request::{FinishReason, RequestId};

/// One `{token_id: logprob}` map per generated token.
pub type SampleLogprobs = Vec<HashMap<u32, f32>>;

/// One entry per prompt token; the first prompt token has no score.
pub type PromptLogprobs = Vec<Option<HashMap<u32, f32>>>;

/// One alternative's output fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub index: usize,
    pub text: String,
    pub token_ids: Vec<u32>,
    pub cumulative_logprob: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<SampleLogprobs>,
    pub finish_reason: Option<FinishReason>,
}

impl CompletionChunk {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            text: String::new(),
            token_ids: Vec::new(),
            cumulative_logprob: 0.0,
            logprobs: None,
            finish_reason: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// One emission of the engine for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    #[serde(default)]
    pub prompt: String,
    pub finished: bool,
    pub request_id: RequestId,
    pub outputs: Vec<CompletionChunk>,
    pub prompt_token_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_logprobs: Option<PromptLogprobs>,
}

impl GenerationOutput {
    pub fn new(request_id: RequestId, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt: String::new(),
            finished: false,
            request_id,
            outputs: Vec::new(),
            prompt_token_ids,
            prompt_logprobs: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Text of alternative `index`, or `""` if absent.
    pub fn text(&self, index: usize) -> &str {
        self.outputs
            .iter()
            .find(|c| c.index == index)
            .map_or("", |c| c.text.as_str())
    }
}
