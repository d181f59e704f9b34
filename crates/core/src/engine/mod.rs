//! Generation engines.
//!
//! # Architecture
//!
//! - [`Engine`] is a closed enum over the three backends, built only through
//!   the [`BackendRegistry`].
//! - [`SequentialDecodeEngine`] owns the prefill/decode loop and drives a
//!   [`CausalModel`] directly.
//! - [`BatchedEngine`] forwards to an external [`BatchScheduler`].
//! - [`ExternalStreamEngine`] wraps a token-at-a-time [`TokenStreamRuntime`].
//! - [`EngineHandle`] is the caller-facing facade: request preparation,
//!   aggregation and streaming representations.
//!
//! # Example
//!
//! ```ignore
//! let ctx = BackendContext::new(config).with_model(model).with_tokenizer(tokenizer);
//! let handle = EngineHandle::new(BackendRegistry::global(), ctx)?;
//! let output = handle.generate(GenerationRequest::new(prompt_ids)).await?;
//! ```

mod batched;
mod context;
mod external;
mod handle;
mod model_forward;
mod registry;
mod sequential;
mod types;

pub use batched::{BatchScheduler, BatchedEngine, ScheduledRequest};
pub use external::{
    ExternalStreamEngine, StreamedToken, TokenStream, TokenStreamOptions, TokenStreamRuntime,
};
pub use handle::{EngineHandle, ItemStream};
pub use model_forward::{CausalModel, ForwardOutput, KvCache};
pub use registry::{BackendContext, BackendKind, BackendRegistry, EngineFactory};
pub use sequential::SequentialDecodeEngine;
pub use types::{EngineError, OutputStream, ReturnType, StreamItem};

use crate::request::PreparedRequest;

/// A constructed backend engine.
pub enum Engine {
    Batched(BatchedEngine),
    Sequential(SequentialDecodeEngine),
    ExternalStream(ExternalStreamEngine),
}

impl Engine {
    /// Start generating `request`. Outputs are produced lazily as the
    /// stream is polled; dropping the stream abandons the request.
    pub fn generate_iterator(&self, request: PreparedRequest) -> OutputStream {
        match self {
            Self::Batched(engine) => engine.generate_iterator(request),
            Self::Sequential(engine) => engine.generate_iterator(request),
            Self::ExternalStream(engine) => engine.generate_iterator(request),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Batched(_) => BackendKind::Batched,
            Self::Sequential(_) => BackendKind::Sequential,
            Self::ExternalStream(_) => BackendKind::ExternalStream,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().default_name()
    }

    pub fn supports_adapters(&self) -> bool {
        match self {
            Self::Batched(engine) => engine.supports_adapters(),
            Self::Sequential(engine) => engine.supports_adapters(),
            Self::ExternalStream(_) => false,
        }
    }

    /// Vocabulary size known to the backend itself, if any.
    pub fn vocab_size(&self) -> Option<usize> {
        match self {
            Self::Sequential(engine) => Some(engine.vocab_size()),
            _ => None,
        }
    }
}
