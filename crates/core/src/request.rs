use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::stop::StopConditions;

pub type RequestId = String;

/// Why an alternative stopped producing tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// A stop token or stop string matched.
    Stop,
    /// The `max_new_tokens` budget was exhausted.
    Length,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
        }
    }
}

/// Numeric generation parameters for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Token budget. `None` defers to the engine default.
    pub max_new_tokens: Option<usize>,
    /// Temperature for logit scaling. Below 1e-5 decoding is greedy.
    pub temperature: f32,
    /// Nucleus threshold. Below 1e-8 decoding is greedy; 1.0 disables it.
    pub top_p: f32,
    /// Top-K filtering. 0 disables it.
    pub top_k: usize,
    /// Ctrl-style repetition penalty. 1.0 disables it.
    pub repetition_penalty: f32,
    /// Record the sampled token's log-probability at every step.
    pub logprobs: bool,
    /// Score the prompt tokens during prefill.
    pub prompt_logprobs: bool,
    /// Number of alternatives to return.
    pub n: usize,
    /// Number of candidates a batched scheduler may draw before keeping `n`.
    pub best_of: Option<usize>,
    pub seed: Option<u64>,
    /// Overrides the model/engine context length for this request.
    pub context_length: Option<usize>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: None,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            logprobs: false,
            prompt_logprobs: false,
            n: 1,
            best_of: None,
            seed: None,
            context_length: None,
        }
    }
}

impl GenerationConfig {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.n == 0 {
            return Err(EngineError::Configuration("n must be at least 1".to_string()));
        }
        if self.max_new_tokens == Some(0) {
            return Err(EngineError::Configuration(
                "max_new_tokens must be at least 1".to_string(),
            ));
        }
        if !(self.temperature >= 0.0) {
            return Err(EngineError::Configuration(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(EngineError::Configuration(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(EngineError::Configuration(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        if let Some(best_of) = self.best_of {
            if best_of < self.n {
                return Err(EngineError::Configuration(format!(
                    "best_of ({best_of}) must be at least n ({})",
                    self.n
                )));
            }
        }
        Ok(())
    }
}

/// Caller-facing input for one generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt_token_ids: Vec<u32>,
    /// Prompt text copied onto every emitted output.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Generated when absent.
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stop_token_ids: Vec<u32>,
    #[serde(default)]
    pub config: GenerationConfig,
}

impl GenerationRequest {
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_adapter(mut self, adapter_id: impl Into<String>) -> Self {
        self.adapter_id = Some(adapter_id.into());
        self
    }

    pub fn with_stop(mut self, stop: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_stop_token_ids(mut self, stop_token_ids: Vec<u32>) -> Self {
        self.stop_token_ids = stop_token_ids;
        self
    }
}

/// A request after id assignment, stop-set preparation and default
/// resolution. This is what backend engines consume.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
    pub adapter_id: Option<String>,
    pub stop: StopConditions,
    pub config: GenerationConfig,
    /// Resolved token budget.
    pub max_new_tokens: usize,
    /// Resolved sampling seed.
    pub seed: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FinishReason::Stop).unwrap(),
            "\"stop\""
        );
        assert_eq!(
            serde_json::to_string(&FinishReason::Length).unwrap(),
            "\"length\""
        );
        assert_eq!(FinishReason::Length.as_str(), "length");
    }

    #[test]
    fn default_config_is_valid() {
        assert!(GenerationConfig::default().validate().is_ok());
        assert!(GenerationConfig::greedy().validate().is_ok());
    }

    #[test]
    fn zero_alternatives_rejected() {
        let config = GenerationConfig {
            n: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn zero_budget_rejected() {
        let config = GenerationConfig {
            max_new_tokens: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn out_of_range_numeric_params_rejected() {
        for config in [
            GenerationConfig {
                temperature: -0.5,
                ..Default::default()
            },
            GenerationConfig {
                temperature: f32::NAN,
                ..Default::default()
            },
            GenerationConfig {
                top_p: 1.5,
                ..Default::default()
            },
            GenerationConfig {
                repetition_penalty: 0.0,
                ..Default::default()
            },
            GenerationConfig {
                n: 3,
                best_of: Some(2),
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"prompt_token_ids": [1, 2, 3]}"#).unwrap();
        assert_eq!(request.prompt_token_ids, vec![1, 2, 3]);
        assert!(request.request_id.is_none());
        assert!(request.stop.is_empty());
        assert_eq!(request.config.n, 1);
        assert_eq!(request.config.max_new_tokens, None);
    }

    #[test]
    fn builder_sets_fields() {
        let request = GenerationRequest::new(vec![5])
            .with_request_id("req-1")
            .with_prompt("hello")
            .with_adapter("sql")
            .with_stop(["\n"])
            .with_stop_token_ids(vec![9]);
        assert_eq!(request.request_id.as_deref(), Some("req-1"));
        assert_eq!(request.prompt.as_deref(), Some("hello"));
        assert_eq!(request.adapter_id.as_deref(), Some("sql"));
        assert_eq!(request.stop, vec!["\n".to_string()]);
        assert_eq!(request.stop_token_ids, vec![9]);
    }
}
