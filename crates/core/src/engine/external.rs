//! Engine over a token-streaming external runtime.
//!
//! The runtime yields one token at a time; text, log-probabilities and stop
//! evaluation are handled here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::output::{CompletionChunk, GenerationOutput};
use crate::request::{FinishReason, PreparedRequest};
use crate::sampling::SamplingParams;
use crate::stop::{StopCheck, StopChecker};
use crate::tokenizer::{incomplete_suffix_len, Tokenizer};

use super::types::{EngineError, OutputStream};

/// One token reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamedToken {
    pub token_id: u32,
    pub log_prob: f32,
    /// The runtime will produce nothing after this token.
    pub is_last: bool,
}

#[derive(Debug, Clone)]
pub struct TokenStreamOptions {
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
    /// Token ids at which the runtime itself stops.
    pub end_token_ids: Vec<u32>,
}

pub type TokenStream = BoxStream<'static, Result<StreamedToken, EngineError>>;

#[async_trait]
pub trait TokenStreamRuntime: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    async fn generate_tokens(
        &self,
        prompt_token_ids: Vec<u32>,
        options: TokenStreamOptions,
    ) -> Result<TokenStream, EngineError>;
}

pub struct ExternalStreamEngine {
    runtime: Arc<dyn TokenStreamRuntime>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl ExternalStreamEngine {
    pub(crate) fn new(
        runtime: Arc<dyn TokenStreamRuntime>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self, EngineError> {
        if !runtime.is_available() {
            return Err(EngineError::Dependency(
                "token streaming runtime is not available".to_string(),
            ));
        }
        Ok(Self { runtime, tokenizer })
    }

    pub fn generate_iterator(&self, request: PreparedRequest) -> OutputStream {
        let runtime = self.runtime.clone();
        let tokenizer = self.tokenizer.clone();

        async_stream::stream! {
            if let Some(adapter_id) = &request.adapter_id {
                yield Err(EngineError::UnsupportedFeature(format!(
                    "adapter '{adapter_id}' requested but the streaming runtime has no adapter support"
                )));
                return;
            }
            if request.config.n > 1 {
                yield Err(EngineError::UnsupportedFeature(
                    "the streaming runtime produces a single alternative".to_string(),
                ));
                return;
            }
            if request.config.prompt_logprobs {
                yield Err(EngineError::UnsupportedFeature(
                    "the streaming runtime does not score prompt tokens".to_string(),
                ));
                return;
            }

            let options = TokenStreamOptions {
                max_new_tokens: request.max_new_tokens,
                sampling: SamplingParams {
                    seed: request.seed,
                    ..SamplingParams::from_config(&request.config)
                },
                end_token_ids: request.stop.token_ids().to_vec(),
            };
            let mut tokens = match runtime
                .generate_tokens(request.prompt_token_ids.clone(), options)
                .await
            {
                Ok(tokens) => tokens,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut checker = StopChecker::new(request.stop.clone(), request.max_new_tokens);
            let mut chunk = CompletionChunk::new(0);
            let mut output_ids = Vec::new();
            if request.config.logprobs {
                chunk.logprobs = Some(Vec::new());
            }

            while let Some(item) = tokens.next().await {
                let token = match item {
                    Ok(token) => token,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                output_ids.push(token.token_id);
                if let Some(entries) = chunk.logprobs.as_mut() {
                    chunk.cumulative_logprob += token.log_prob;
                    entries.push(HashMap::from([(token.token_id, token.log_prob)]));
                }

                let mut text = match tokenizer.decode(&output_ids, true, true) {
                    Ok(text) => text,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let check = checker.evaluate(token.token_id, &text, output_ids.len());
                if let StopCheck::Finished { truncate_at: Some(pos), .. } = check {
                    text.truncate(pos);
                }
                if check == StopCheck::Continue && token.is_last {
                    checker.finish(FinishReason::Stop);
                }

                chunk.text = text;
                chunk.token_ids = output_ids.clone();
                chunk.finish_reason = checker.finish_reason();
                let mut visible = chunk.clone();
                if chunk.finish_reason.is_none() {
                    let hold = checker
                        .conditions()
                        .holdback_len(&chunk.text)
                        .max(incomplete_suffix_len(&chunk.text));
                    visible.text.truncate(chunk.text.len() - hold);
                }

                let mut output = GenerationOutput::new(
                    request.request_id.clone(),
                    request.prompt_token_ids.clone(),
                );
                output.outputs.push(visible);
                yield Ok(output);

                if checker.is_stopped() {
                    break;
                }
            }

            if !checker.is_stopped() {
                debug!(request_id = %request.request_id, "runtime stream ended without a final token");
                checker.finish(FinishReason::Stop);
            }
            // Stop reading from the runtime before the terminal emission.
            drop(tokens);

            chunk.finish_reason = checker.finish_reason();
            let mut token_ids = request.prompt_token_ids.clone();
            token_ids.extend_from_slice(&output_ids);
            chunk.token_ids = token_ids;

            let mut output = GenerationOutput::new(
                request.request_id.clone(),
                request.prompt_token_ids.clone(),
            );
            output.finished = true;
            output.outputs.push(chunk);
            yield Ok(output);
        }
        .boxed()
    }
}
