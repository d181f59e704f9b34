//! Shared test utilities for llmrun-core.
//!
//! Mock models, tokenizer and external backends for exercising the engines
//! on CPU without real weights.

mod mock_backends;
mod mock_model;
mod mock_tokenizer;

pub use mock_backends::{MockRuntime, MockScheduler};
pub use mock_model::{ContextModel, ScriptedModel};
pub use mock_tokenizer::MockTokenizer;
