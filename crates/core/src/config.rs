use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Context length assumed when a model config names none of the known keys.
pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;

/// Keys under which HuggingFace configs record the maximum sequence length,
/// in lookup order.
const CONTEXT_LENGTH_KEYS: &[&str] = &[
    "max_position_embeddings",
    "n_positions",
    "max_seq_len",
    "seq_length",
    "max_sequence_length",
    "model_max_length",
    "max_target_positions",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid model config: {0}")]
    Model(String),
}

/// Architecture metadata the decode loop needs from the model provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub is_encoder_decoder: bool,
    pub context_length: usize,
    pub vocab_size: usize,
    /// First decoder input for encoder-decoder models.
    #[serde(default)]
    pub decoder_start_token_id: Option<u32>,
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            is_encoder_decoder: false,
            context_length: DEFAULT_CONTEXT_LENGTH,
            vocab_size: 32000,
            decoder_start_token_id: None,
        }
    }
}

impl ModelMetadata {
    /// Extract metadata from a HuggingFace `config.json` document.
    pub fn from_hf_config(config: &serde_json::Value) -> Result<Self, ConfigError> {
        let vocab_size = config
            .get("vocab_size")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ConfigError::Model("missing vocab_size".to_string()))?
            as usize;

        let is_encoder_decoder = config
            .get("is_encoder_decoder")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let base_length = CONTEXT_LENGTH_KEYS
            .iter()
            .find_map(|key| config.get(*key).and_then(serde_json::Value::as_u64))
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);

        // Linear / dynamic RoPE scaling stretches the usable window.
        let rope_factor = config
            .get("rope_scaling")
            .and_then(|s| s.get("factor"))
            .and_then(serde_json::Value::as_f64)
            .filter(|f| *f > 1.0)
            .unwrap_or(1.0);

        let token_id = |key: &str| {
            config
                .get(key)
                .and_then(serde_json::Value::as_u64)
                .map(|v| v as u32)
        };

        Ok(Self {
            is_encoder_decoder,
            context_length: (base_length as f64 * rope_factor) as usize,
            vocab_size,
            decoder_start_token_id: token_id("decoder_start_token_id"),
        })
    }

    pub fn from_hf_config_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Model(format!("{}: {e}", path.display())))?;
        Self::from_hf_config(&value)
    }
}

/// Engine-level configuration, loadable from TOML.
///
/// ```toml
/// backend = "sequential"
/// context_length = 4096
/// default_max_new_tokens = 128
/// log_requests = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Registry name of the backend to construct.
    pub backend: String,
    /// Overrides the context length reported by the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<usize>,
    /// Token budget for requests that do not set `max_new_tokens`.
    pub default_max_new_tokens: usize,
    /// Seed for requests that do not carry one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Log request start/finish at `info` instead of `debug`.
    pub log_requests: bool,
    /// Capacity of channels bridging external schedulers into streams.
    pub stream_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: "sequential".to_string(),
            context_length: None,
            default_max_new_tokens: 256,
            seed: None,
            log_requests: false,
            stream_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAN_T5_CONFIG: &str = r#"{
        "architectures": ["T5ForConditionalGeneration"],
        "d_model": 512,
        "decoder_start_token_id": 0,
        "eos_token_id": 1,
        "is_encoder_decoder": true,
        "model_type": "t5",
        "n_positions": 512,
        "num_layers": 8,
        "pad_token_id": 0,
        "vocab_size": 32128
    }"#;

    const LLAMA_CONFIG: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "bos_token_id": 1,
        "eos_token_id": 2,
        "hidden_size": 4096,
        "max_position_embeddings": 4096,
        "model_type": "llama",
        "rope_scaling": {"type": "linear", "factor": 2.0},
        "vocab_size": 32000
    }"#;

    #[test]
    fn parse_encoder_decoder_config() {
        let value: serde_json::Value = serde_json::from_str(FLAN_T5_CONFIG).unwrap();
        let meta = ModelMetadata::from_hf_config(&value).unwrap();

        assert!(meta.is_encoder_decoder);
        assert_eq!(meta.context_length, 512);
        assert_eq!(meta.vocab_size, 32128);
        assert_eq!(meta.decoder_start_token_id, Some(0));
    }

    #[test]
    fn rope_scaling_extends_context_length() {
        let value: serde_json::Value = serde_json::from_str(LLAMA_CONFIG).unwrap();
        let meta = ModelMetadata::from_hf_config(&value).unwrap();

        assert!(!meta.is_encoder_decoder);
        assert_eq!(meta.context_length, 8192);
        assert_eq!(meta.decoder_start_token_id, None);
    }

    #[test]
    fn missing_context_keys_fall_back_to_default() {
        let value = serde_json::json!({ "vocab_size": 100 });
        let meta = ModelMetadata::from_hf_config(&value).unwrap();
        assert_eq!(meta.context_length, DEFAULT_CONTEXT_LENGTH);
    }

    #[test]
    fn missing_vocab_size_is_rejected() {
        let value = serde_json::json!({ "n_positions": 1024 });
        assert!(matches!(
            ModelMetadata::from_hf_config(&value),
            Err(ConfigError::Model(_))
        ));
    }

    #[test]
    fn engine_config_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("backend = \"batched\"\nseed = 7\n").unwrap();
        assert_eq!(config.backend, "batched");
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.default_max_new_tokens, 256);
        assert_eq!(config.stream_buffer, 64);
        assert!(!config.log_requests);
    }

    #[test]
    fn engine_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            "backend = \"external\"\ncontext_length = 1024\nlog_requests = true\n",
        )
        .unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.backend, "external");
        assert_eq!(config.context_length, Some(1024));
        assert!(config.log_requests);
    }

    #[test]
    fn engine_config_rejects_bad_types() {
        let err = EngineConfig::from_toml_str("default_max_new_tokens = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn engine_config_missing_file_is_io_error() {
        let err = EngineConfig::load_from(Path::new("/nonexistent/engine.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
