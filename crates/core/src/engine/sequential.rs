//! Sequential decode engine: owns the prefill/decode step loop.
//!
//! Forward passes from concurrent requests are serialized on a device lock;
//! each request keeps its own cache handles, so interleaved steps never
//! touch another request's state.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Tensor;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::output::{GenerationOutput, PromptLogprobs};
use crate::request::PreparedRequest;
use crate::sampling::{log_softmax, sample, SamplerState, SamplingParams};
use crate::stop::StopChecker;
use crate::tokenizer::Tokenizer;

use super::context::{DecodePhase, DecodeState, LaneState};
use super::model_forward::{last_logits, logits_rows, CausalModel, ForwardOutput, KvCache};
use super::types::{EngineError, OutputStream};

pub struct SequentialDecodeEngine {
    model: Arc<dyn CausalModel>,
    tokenizer: Arc<dyn Tokenizer>,
    device_lock: Arc<Mutex<()>>,
    context_length: usize,
}

impl SequentialDecodeEngine {
    pub(crate) fn new(
        model: Arc<dyn CausalModel>,
        tokenizer: Arc<dyn Tokenizer>,
        context_length: Option<usize>,
    ) -> Self {
        let context_length = context_length.unwrap_or(model.metadata().context_length);
        Self {
            model,
            tokenizer,
            device_lock: Arc::new(Mutex::new(())),
            context_length,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.model.metadata().vocab_size
    }

    pub fn supports_adapters(&self) -> bool {
        self.model.supports_adapters()
    }

    pub fn generate_iterator(&self, request: PreparedRequest) -> OutputStream {
        let shared = Shared {
            model: self.model.clone(),
            tokenizer: self.tokenizer.clone(),
            device_lock: self.device_lock.clone(),
        };
        let context_length = request.config.context_length.unwrap_or(self.context_length);

        async_stream::stream! {
            let mut decode = match DecodeLoop::start(shared, request, context_length).await {
                Ok(decode) => decode,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            loop {
                match decode.step().await {
                    Ok(Some(output)) => {
                        let finished = output.finished;
                        yield Ok(output);
                        if finished {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(request_id = %decode.request_id, step = decode.state.step, error = %e, "decode step failed");
                        decode.state.release();
                        yield Err(e);
                        break;
                    }
                }
            }
        }
        .boxed()
    }
}

#[derive(Clone)]
struct Shared {
    model: Arc<dyn CausalModel>,
    tokenizer: Arc<dyn Tokenizer>,
    device_lock: Arc<Mutex<()>>,
}

/// Drives one request from prefill to its terminal output.
struct DecodeLoop {
    shared: Shared,
    request_id: String,
    /// Prompt after truncation; what the model actually sees.
    source_ids: Vec<u32>,
    decoder_start_token_id: Option<u32>,
    params: SamplingParams,
    logprobs: bool,
    prompt_logprobs: bool,
    state: DecodeState,
}

impl DecodeLoop {
    async fn start(
        shared: Shared,
        request: PreparedRequest,
        context_length: usize,
    ) -> Result<Self, EngineError> {
        let meta = shared.model.metadata().clone();
        let config = &request.config;

        if meta.is_encoder_decoder && (config.logprobs || config.prompt_logprobs) {
            return Err(EngineError::UnsupportedFeature(
                "log-probabilities are not supported for encoder-decoder models".to_string(),
            ));
        }
        if request.prompt_token_ids.is_empty() {
            return Err(EngineError::Configuration("prompt is empty".to_string()));
        }

        let source_ids = if meta.is_encoder_decoder {
            truncate_keep_suffix(&request.prompt_token_ids, context_length)
        } else {
            let window = context_length
                .checked_sub(request.max_new_tokens + 1)
                .filter(|w| *w > 0)
                .ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "max_new_tokens {} leaves no room for the prompt in a context of {}",
                        request.max_new_tokens, context_length
                    ))
                })?;
            truncate_keep_suffix(&request.prompt_token_ids, window)
        };
        if source_ids.len() < request.prompt_token_ids.len() {
            debug!(
                request_id = %request.request_id,
                original = request.prompt_token_ids.len(),
                kept = source_ids.len(),
                "prompt truncated to fit context window"
            );
        }

        let decoder_start_token_id = if meta.is_encoder_decoder {
            Some(meta.decoder_start_token_id.ok_or_else(|| {
                EngineError::Configuration(
                    "encoder-decoder model has no decoder_start_token_id".to_string(),
                )
            })?)
        } else {
            None
        };

        if let Some(adapter_id) = request.adapter_id.clone() {
            if !shared.model.supports_adapters() {
                return Err(EngineError::UnsupportedFeature(format!(
                    "adapter '{adapter_id}' requested but the loaded model has no adapter support"
                )));
            }
            let _guard = shared.device_lock.lock().await;
            shared
                .model
                .set_adapter(&adapter_id)
                .map_err(|e| EngineError::execution(format!("activate adapter '{adapter_id}'"), e))?;
        }

        let encoder_output = if meta.is_encoder_decoder {
            Some(run_encoder(&shared, source_ids.clone()).await?)
        } else {
            None
        };

        let n = config.n.max(1);
        let lanes = (0..n)
            .map(|i| {
                let seed = request.seed.map(|s| s.wrapping_add(i as u64));
                LaneState::new(
                    i,
                    SamplerState::new(seed),
                    StopChecker::new(request.stop.clone(), request.max_new_tokens),
                    config.logprobs,
                )
            })
            .collect();

        Ok(Self {
            params: SamplingParams::from_config(config),
            logprobs: config.logprobs,
            prompt_logprobs: config.prompt_logprobs,
            decoder_start_token_id,
            request_id: request.request_id,
            source_ids,
            state: DecodeState::new(lanes, encoder_output),
            shared,
        })
    }

    /// Advance every unfinished lane by one token. Returns the non-final
    /// emission for that step, the terminal emission once all lanes are
    /// done, and `None` afterwards.
    async fn step(&mut self) -> Result<Option<GenerationOutput>, EngineError> {
        if self.state.terminal_emitted {
            return Ok(None);
        }
        if self.state.all_finished() {
            self.state.terminal_emitted = true;
            self.state.release();
            return Ok(Some(self.terminal_output()));
        }

        for lane_idx in 0..self.state.lanes.len() {
            if self.state.lanes[lane_idx].phase.is_finished() {
                continue;
            }
            self.step_lane(lane_idx).await?;
        }
        self.state.step += 1;

        let mut output = GenerationOutput::new(self.request_id.clone(), self.source_ids.clone());
        output.outputs = self
            .state
            .lanes
            .iter()
            .map(LaneState::streaming_chunk)
            .collect();
        output.prompt_logprobs = self.state.prompt_logprobs.clone();
        Ok(Some(output))
    }

    async fn step_lane(&mut self, lane_idx: usize) -> Result<(), EngineError> {
        let lane = &mut self.state.lanes[lane_idx];
        let is_prefill = lane.phase == DecodePhase::Prefill;
        let input_ids = match (is_prefill, lane.last_token()) {
            (true, _) => match self.decoder_start_token_id {
                Some(start) => vec![start],
                None => self.source_ids.clone(),
            },
            (false, Some(last)) => vec![last],
            (false, None) => {
                return Err(EngineError::execution(
                    "decode step",
                    "lane entered decode without a sampled token",
                ))
            }
        };
        let cache = lane.cache.take();

        let ForwardOutput { logits, cache } = run_forward(
            &self.shared,
            input_ids,
            self.state.encoder_output.clone(),
            cache,
            self.state.step,
        )
        .await?;

        if is_prefill && lane_idx == 0 && self.prompt_logprobs {
            self.state.prompt_logprobs = Some(prompt_logprobs(&logits, &self.source_ids)?);
        }
        let next_logits = last_logits(&logits)?;
        drop(logits);

        let lane = &mut self.state.lanes[lane_idx];
        lane.cache = Some(cache);

        let token = if self.decoder_start_token_id.is_some() {
            sample(&next_logits, &self.params, &lane.output_token_ids, &mut lane.sampler)
        } else {
            let mut history = Vec::with_capacity(self.source_ids.len() + lane.output_token_ids.len());
            history.extend_from_slice(&self.source_ids);
            history.extend_from_slice(&lane.output_token_ids);
            sample(&next_logits, &self.params, &history, &mut lane.sampler)
        };
        let logprob = self
            .logprobs
            .then(|| log_softmax(&next_logits)[token as usize]);
        lane.push_token(token, logprob);

        let text = self
            .shared
            .tokenizer
            .decode(&lane.output_token_ids, true, true)?;
        lane.apply_text(text);
        if let Some(reason) = lane.finish_reason() {
            debug!(
                request_id = %self.request_id,
                index = lane.index,
                step = self.state.step,
                finish_reason = reason.as_str(),
                "alternative finished"
            );
        }
        Ok(())
    }

    fn terminal_output(&self) -> GenerationOutput {
        let mut output = GenerationOutput::new(self.request_id.clone(), self.source_ids.clone());
        output.finished = true;
        output.outputs = self
            .state
            .lanes
            .iter()
            .map(|lane| lane.terminal_chunk(&self.source_ids))
            .collect();
        output.prompt_logprobs = self.state.prompt_logprobs.clone();
        output
    }
}

impl Drop for DecodeLoop {
    fn drop(&mut self) {
        if !self.state.terminal_emitted {
            debug!(
                request_id = %self.request_id,
                step = self.state.step,
                "decode loop abandoned before completion"
            );
        }
        self.state.release();
    }
}

fn truncate_keep_suffix(ids: &[u32], max_len: usize) -> Vec<u32> {
    ids[ids.len().saturating_sub(max_len)..].to_vec()
}

/// Position `i - 1` scores prompt token `i`; the first token has no score.
fn prompt_logprobs(logits: &Tensor, prompt: &[u32]) -> Result<PromptLogprobs, EngineError> {
    let rows = logits_rows(logits)?;
    if rows.len() < prompt.len() {
        return Err(EngineError::UnsupportedFeature(format!(
            "model returned {} logit rows for a {}-token prompt; prompt log-probabilities need one per position",
            rows.len(),
            prompt.len()
        )));
    }
    let mut result = Vec::with_capacity(prompt.len());
    result.push(None);
    for (row, &token) in rows.iter().zip(prompt.iter().skip(1)) {
        let lp = log_softmax(row);
        let value = lp.get(token as usize).copied().unwrap_or(f32::NEG_INFINITY);
        result.push(Some(HashMap::from([(token, value)])));
    }
    Ok(result)
}

async fn run_forward(
    shared: &Shared,
    input_ids: Vec<u32>,
    encoder_output: Option<Tensor>,
    cache: Option<KvCache>,
    step: usize,
) -> Result<ForwardOutput, EngineError> {
    let guard = shared.device_lock.clone().lock_owned().await;
    let model = shared.model.clone();
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let len = input_ids.len();
        let input = Tensor::from_vec(input_ids, (1, len), model.device())?;
        model.forward(&input, encoder_output.as_ref(), cache)
    })
    .await
    .map_err(|e| EngineError::execution("forward task panicked", e))?
    .map_err(|e| EngineError::execution(format!("forward pass at step {step}"), e))
}

async fn run_encoder(shared: &Shared, source_ids: Vec<u32>) -> Result<Tensor, EngineError> {
    let guard = shared.device_lock.clone().lock_owned().await;
    let model = shared.model.clone();
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let len = source_ids.len();
        let input = Tensor::from_vec(source_ids, (1, len), model.device())?;
        model.encode(&input)
    })
    .await
    .map_err(|e| EngineError::execution("encoder task panicked", e))?
    .map_err(|e| EngineError::execution("encoder pass", e))
}
