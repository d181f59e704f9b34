//! Core types shared by every backend engine.

use std::fmt;
use std::str::FromStr;

use futures::stream::BoxStream;
use thiserror::Error;

use crate::output::GenerationOutput;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ─── Engine errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// No backend registered under the requested name.
    #[error("backend not found: {0}")]
    NotFound(String),
    /// The backend's runtime dependency is missing or unavailable.
    #[error("backend dependency unavailable: {0}")]
    Dependency(String),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("tokenization error: {0}")]
    Tokenization(String),
    /// Failure raised while running the model or an external runtime.
    /// The original error is kept as the source.
    #[error("execution failed: {context}")]
    Execution {
        context: String,
        #[source]
        source: BoxError,
    },
}

impl EngineError {
    pub fn execution(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Execution {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Short machine-readable kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Dependency(_) => "dependency",
            Self::UnsupportedFeature(_) => "unsupported_feature",
            Self::Configuration(_) => "configuration",
            Self::Tokenization(_) => "tokenization",
            Self::Execution { .. } => "execution",
        }
    }
}

impl From<candle_core::Error> for EngineError {
    fn from(e: candle_core::Error) -> Self {
        Self::execution("model forward", e)
    }
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

// ─── Streaming types ──────────────────────────────────────────────────────

/// Lazy, cancellable sequence of outputs for one request. The last
/// successful item has `finished == true`; dropping the stream cancels work.
pub type OutputStream = BoxStream<'static, Result<GenerationOutput, EngineError>>;

/// Representation chosen for a streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnType {
    /// Every cumulative output, terminal included.
    #[default]
    Object,
    /// Per-step deltas as output objects; terminal passes through whole.
    Token,
    /// Per-step text deltas only.
    Text,
    /// Server-sent-event frames followed by the done sentinel.
    Sse,
}

impl ReturnType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Token => "token",
            Self::Text => "text",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReturnType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "object" => Ok(Self::Object),
            "token" => Ok(Self::Token),
            "text" => Ok(Self::Text),
            "sse" => Ok(Self::Sse),
            other => Err(EngineError::Configuration(format!(
                "unknown return type '{other}', expected one of object, token, text, sse"
            ))),
        }
    }
}

/// One item of a streaming call, shaped by its [`ReturnType`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Output(GenerationOutput),
    Text { index: usize, text: String },
    Frame(String),
}

impl StreamItem {
    pub fn into_output(self) -> Option<GenerationOutput> {
        match self {
            Self::Output(output) => Some(output),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn return_type_parsing() {
        assert_eq!("object".parse::<ReturnType>().unwrap(), ReturnType::Object);
        assert_eq!("token".parse::<ReturnType>().unwrap(), ReturnType::Token);
        assert_eq!("text".parse::<ReturnType>().unwrap(), ReturnType::Text);
        assert_eq!("sse".parse::<ReturnType>().unwrap(), ReturnType::Sse);
        assert_eq!(ReturnType::Sse.to_string(), "sse");
    }

    #[test]
    fn unknown_return_type_is_configuration_error() {
        let err = "xml".parse::<ReturnType>().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(ref m) if m.contains("xml")));
    }

    #[test]
    fn execution_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "device lost");
        let err = EngineError::execution("forward step 3", io);
        assert_eq!(err.kind(), "execution");
        assert_eq!(err.to_string(), "execution failed: forward step 3");
        assert_eq!(err.source().unwrap().to_string(), "device lost");
    }

    #[test]
    fn candle_error_maps_to_execution() {
        let err: EngineError = candle_core::Error::Msg("shape mismatch".into()).into();
        match err {
            EngineError::Execution { source, .. } => {
                assert!(source.to_string().contains("shape mismatch"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
