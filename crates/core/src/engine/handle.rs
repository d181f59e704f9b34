//! EngineHandle - caller-facing facade over a constructed engine.

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::output::{sse, DeltaReconciler, GenerationOutput};
use crate::request::{GenerationRequest, PreparedRequest};
use crate::stop::StopConditions;
use crate::tokenizer::Tokenizer;

use super::registry::{BackendContext, BackendRegistry};
use super::types::{EngineError, OutputStream, ReturnType, StreamItem};
use super::Engine;

pub type ItemStream = BoxStream<'static, Result<StreamItem, EngineError>>;

/// Handle to a generation engine, cloneable for sharing across tasks.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Engine>,
    tokenizer: Arc<dyn Tokenizer>,
    config: Arc<EngineConfig>,
}

impl EngineHandle {
    /// Build the backend named by `ctx.config.backend` through `registry`.
    pub fn new(registry: &BackendRegistry, ctx: BackendContext) -> Result<Self, EngineError> {
        let tokenizer = ctx.tokenizer.clone().ok_or_else(|| {
            EngineError::Dependency("engine handle requires a tokenizer".to_string())
        })?;
        let engine = registry.create(&ctx.config.backend, &ctx)?;
        Ok(Self {
            engine: Arc::new(engine),
            tokenizer,
            config: Arc::new(ctx.config),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `request` and resolve ids, stop conditions and defaults.
    pub fn prepare(&self, request: GenerationRequest) -> Result<PreparedRequest, EngineError> {
        request.config.validate()?;
        if request.prompt_token_ids.is_empty() {
            return Err(EngineError::Configuration("prompt is empty".to_string()));
        }
        let vocab_size = self
            .engine
            .vocab_size()
            .or_else(|| self.tokenizer.vocab_size());
        if let Some(vocab_size) = vocab_size {
            if let Some(bad) = request
                .prompt_token_ids
                .iter()
                .find(|&&id| id as usize >= vocab_size)
            {
                return Err(EngineError::Configuration(format!(
                    "prompt token id {bad} is outside the vocabulary of size {vocab_size}"
                )));
            }
        }

        let stop = StopConditions::prepare(
            &request.stop_token_ids,
            &request.stop,
            self.tokenizer.as_ref(),
        )?;
        let request_id = request
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let max_new_tokens = request
            .config
            .max_new_tokens
            .unwrap_or(self.config.default_max_new_tokens);
        let seed = request.config.seed.or(self.config.seed);

        Ok(PreparedRequest {
            request_id,
            prompt_token_ids: request.prompt_token_ids,
            adapter_id: request.adapter_id,
            stop,
            config: request.config,
            max_new_tokens,
            seed,
        })
    }

    /// Stream of cumulative outputs for `request`, ending with the terminal
    /// one. Work advances only as the stream is polled.
    pub fn generate_iterator(&self, request: GenerationRequest) -> Result<OutputStream, EngineError> {
        let prompt = request.prompt.clone().unwrap_or_default();
        let prepared = self.prepare(request)?;
        let request_id = prepared.request_id.clone();
        let log_requests = self.config.log_requests;
        let backend = self.engine.name();

        if log_requests {
            info!(request_id = %request_id, backend, prompt_tokens = prepared.prompt_token_ids.len(), max_new_tokens = prepared.max_new_tokens, "generation started");
        } else {
            debug!(request_id = %request_id, backend, prompt_tokens = prepared.prompt_token_ids.len(), max_new_tokens = prepared.max_new_tokens, "generation started");
        }

        let inner = self.engine.generate_iterator(prepared);
        let stream = inner.map(move |item| {
            let mut output = match item {
                Ok(output) => output,
                Err(e) => {
                    warn!(request_id = %request_id, kind = e.kind(), error = %e, "generation failed");
                    return Err(e);
                }
            };
            if !prompt.is_empty() {
                output.prompt = prompt.clone();
            }
            if output.finished {
                let reasons: Vec<&str> = output
                    .outputs
                    .iter()
                    .filter_map(|c| c.finish_reason.map(|r| r.as_str()))
                    .collect();
                if log_requests {
                    info!(request_id = %request_id, finish_reason = ?reasons, "generation finished");
                } else {
                    debug!(request_id = %request_id, finish_reason = ?reasons, "generation finished");
                }
            }
            Ok(output)
        });
        Ok(stream.boxed())
    }

    /// Run `request` to completion and return the terminal output.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutput, EngineError> {
        let mut stream = self.generate_iterator(request)?;
        while let Some(item) = stream.next().await {
            let output = item?;
            if output.finished {
                return Ok(output);
            }
        }
        Err(EngineError::execution(
            "generate",
            "output stream ended without a terminal output",
        ))
    }

    /// Stream `request` in the representation named by `return_type`.
    ///
    /// Generation runs on a spawned task feeding a bounded channel of
    /// `stream_buffer` items; dropping the returned stream stops that task
    /// at its next send.
    pub async fn generate_stream(
        &self,
        request: GenerationRequest,
        return_type: ReturnType,
    ) -> Result<ItemStream, EngineError> {
        let n = request.config.n;
        let outputs = self.generate_iterator(request)?;
        let items: ItemStream = match return_type {
            ReturnType::Object => outputs.map(|r| r.map(StreamItem::Output)).boxed(),
            ReturnType::Token => {
                let mut reconciler = DeltaReconciler::new(n);
                outputs
                    .map(move |r| r.map(|o| StreamItem::Output(reconciler.reconcile(o))))
                    .boxed()
            }
            ReturnType::Text => {
                let mut reconciler = DeltaReconciler::new(n);
                outputs
                    .flat_map(move |r| {
                        let items: Vec<Result<StreamItem, EngineError>> = match r {
                            Ok(o) => reconciler
                                .reconcile_text(&o)
                                .into_iter()
                                .map(|(index, text)| Ok(StreamItem::Text { index, text }))
                                .collect(),
                            Err(e) => vec![Err(e)],
                        };
                        futures::stream::iter(items)
                    })
                    .boxed()
            }
            ReturnType::Sse => sse::sse_stream(outputs)
                .map(|r| r.map(StreamItem::Frame))
                .boxed(),
        };

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        tokio::spawn(pump(items, tx));
        Ok(ReceiverStream::new(rx).boxed())
    }

    /// [`Self::generate_stream`] with the return type given by name.
    pub async fn generate_stream_named(
        &self,
        request: GenerationRequest,
        return_type: &str,
    ) -> Result<ItemStream, EngineError> {
        self.generate_stream(request, return_type.parse()?).await
    }
}

async fn pump(mut items: ItemStream, tx: mpsc::Sender<Result<StreamItem, EngineError>>) {
    while let Some(item) = items.next().await {
        if tx.send(item).await.is_err() {
            debug!("stream consumer disconnected");
            return;
        }
    }
}
