//! Engine that forwards requests to an external continuous-batching scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::output::GenerationOutput;
use crate::request::{GenerationConfig, PreparedRequest, RequestId};
use crate::sampling::SamplingParams;

use super::types::{EngineError, OutputStream};

/// What the scheduler receives for one request.
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
    pub adapter_id: Option<String>,
    pub stop_token_ids: Vec<u32>,
    pub stop: Vec<String>,
    pub sampling: SamplingParams,
    pub max_new_tokens: usize,
    pub n: usize,
    pub best_of: usize,
    pub logprobs: bool,
    pub prompt_logprobs: bool,
}

impl ScheduledRequest {
    fn from_prepared(request: &PreparedRequest) -> Self {
        let GenerationConfig {
            n,
            best_of,
            logprobs,
            prompt_logprobs,
            ..
        } = request.config;
        Self {
            request_id: request.request_id.clone(),
            prompt_token_ids: request.prompt_token_ids.clone(),
            adapter_id: request.adapter_id.clone(),
            stop_token_ids: request.stop.token_ids().to_vec(),
            stop: request.stop.strings().to_vec(),
            sampling: SamplingParams {
                seed: request.seed,
                ..SamplingParams::from_config(&request.config)
            },
            max_new_tokens: request.max_new_tokens,
            n,
            best_of: best_of.unwrap_or(n),
            logprobs,
            prompt_logprobs,
        }
    }
}

/// An external continuous-batching scheduler.
///
/// It batches concurrently submitted requests itself and reports cumulative
/// [`GenerationOutput`]s, ending with one where `finished == true`.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    /// Whether several adapters can be loaded and selected per request.
    fn supports_adapters(&self) -> bool {
        false
    }

    async fn submit(
        &self,
        request: ScheduledRequest,
    ) -> Result<mpsc::Receiver<GenerationOutput>, EngineError>;

    /// Stop work on `request_id` and free its resources.
    async fn abort(&self, request_id: &str);
}

pub struct BatchedEngine {
    scheduler: Arc<dyn BatchScheduler>,
}

impl BatchedEngine {
    pub(crate) fn new(scheduler: Arc<dyn BatchScheduler>) -> Result<Self, EngineError> {
        if !scheduler.is_available() {
            return Err(EngineError::Dependency(
                "batching scheduler is not available".to_string(),
            ));
        }
        Ok(Self { scheduler })
    }

    pub fn supports_adapters(&self) -> bool {
        self.scheduler.supports_adapters()
    }

    pub fn generate_iterator(&self, request: PreparedRequest) -> OutputStream {
        let scheduler = self.scheduler.clone();
        async_stream::stream! {
            if let Some(adapter_id) = &request.adapter_id {
                if !scheduler.supports_adapters() {
                    yield Err(EngineError::UnsupportedFeature(format!(
                        "adapter '{adapter_id}' requested but the scheduler has no adapter support"
                    )));
                    return;
                }
            }

            let request_id = request.request_id.clone();
            let mut rx = match scheduler.submit(ScheduledRequest::from_prepared(&request)).await {
                Ok(rx) => rx,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let mut guard = AbortGuard::new(scheduler.clone(), request_id.clone());

            while let Some(mut output) = rx.recv().await {
                if output.request_id.is_empty() {
                    output.request_id = request_id.clone();
                }
                let finished = output.finished;
                yield Ok(output);
                if finished {
                    guard.defuse();
                    return;
                }
            }

            guard.defuse();
            yield Err(EngineError::execution(
                format!("batched request {request_id}"),
                "scheduler closed the output channel before the terminal output",
            ));
        }
        .boxed()
    }
}

/// Aborts the scheduled request when dropped, unless defused.
///
/// Dropping the output stream (consumer disconnect) drops the guard with it,
/// which hands the scheduler an abort for the in-flight request.
struct AbortGuard {
    scheduler: Option<Arc<dyn BatchScheduler>>,
    request_id: RequestId,
}

impl AbortGuard {
    fn new(scheduler: Arc<dyn BatchScheduler>, request_id: RequestId) -> Self {
        Self {
            scheduler: Some(scheduler),
            request_id,
        }
    }

    fn defuse(&mut self) {
        self.scheduler = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let Some(scheduler) = self.scheduler.take() else {
            return;
        };
        let request_id = std::mem::take(&mut self.request_id);
        debug!(request_id = %request_id, "consumer disconnected, aborting scheduled request");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    scheduler.abort(&request_id).await;
                });
            }
            Err(_) => {
                debug!(request_id = %request_id, "no runtime to deliver abort");
            }
        }
    }
}
