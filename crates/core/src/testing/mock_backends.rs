use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::engine::{
    BatchScheduler, EngineError, ScheduledRequest, StreamedToken, TokenStream,
    TokenStreamOptions, TokenStreamRuntime,
};
use crate::output::{CompletionChunk, GenerationOutput};
use crate::request::FinishReason;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Continuous-batching scheduler stand-in.
///
/// Each request produces `max_new_tokens` cumulative outputs cycling through
/// `script`, then a terminal output with `finish_reason = length`.
pub struct MockScheduler {
    script: Vec<u32>,
    available: bool,
    adapters: bool,
    delay: Option<Duration>,
    close_after: Option<usize>,
    leave_request_id_empty: bool,
    submitted: Mutex<Vec<ScheduledRequest>>,
    aborted: Arc<Mutex<Vec<String>>>,
}

impl MockScheduler {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            available: true,
            adapters: false,
            delay: None,
            close_after: None,
            leave_request_id_empty: false,
            submitted: Mutex::new(Vec::new()),
            aborted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(vec![1])
        }
    }

    pub fn with_adapters(mut self) -> Self {
        self.adapters = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Drop the channel after `count` outputs without a terminal one.
    pub fn close_after(mut self, count: usize) -> Self {
        self.close_after = Some(count);
        self
    }

    /// Send outputs with an empty request id.
    pub fn anonymous_outputs(mut self) -> Self {
        self.leave_request_id_empty = true;
        self
    }

    pub fn submitted(&self) -> Vec<ScheduledRequest> {
        lock(&self.submitted).clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        lock(&self.aborted).clone()
    }
}

#[async_trait]
impl BatchScheduler for MockScheduler {
    fn is_available(&self) -> bool {
        self.available
    }

    fn supports_adapters(&self) -> bool {
        self.adapters
    }

    async fn submit(
        &self,
        request: ScheduledRequest,
    ) -> Result<mpsc::Receiver<GenerationOutput>, EngineError> {
        lock(&self.submitted).push(request.clone());
        let (tx, rx) = mpsc::channel(4);
        let script = self.script.clone();
        let delay = self.delay;
        let close_after = self.close_after;
        let request_id = if self.leave_request_id_empty {
            String::new()
        } else {
            request.request_id.clone()
        };
        let aborted = self.aborted.clone();

        tokio::spawn(async move {
            let mut token_ids = Vec::new();
            for step in 0..request.max_new_tokens {
                if close_after == Some(step) {
                    return;
                }
                if lock(&aborted).contains(&request.request_id) {
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                token_ids.push(script[step % script.len()]);
                let outputs = (0..request.n)
                    .map(|index| CompletionChunk {
                        index,
                        text: token_ids
                            .iter()
                            .map(|t| format!("t{t}"))
                            .collect::<Vec<_>>()
                            .join(" "),
                        token_ids: token_ids.clone(),
                        cumulative_logprob: 0.0,
                        logprobs: None,
                        finish_reason: None,
                    })
                    .collect::<Vec<_>>();
                let mut output =
                    GenerationOutput::new(request_id.clone(), request.prompt_token_ids.clone());
                output.outputs = outputs;
                if tx.send(output.clone()).await.is_err() {
                    return;
                }
                if step + 1 == request.max_new_tokens {
                    output.finished = true;
                    for chunk in &mut output.outputs {
                        chunk.finish_reason = Some(FinishReason::Length);
                    }
                    let _ = tx.send(output).await;
                }
            }
        });
        Ok(rx)
    }

    async fn abort(&self, request_id: &str) {
        lock(&self.aborted).push(request_id.to_string());
    }
}

/// Token-streaming runtime stand-in.
///
/// Emits `script` one token at a time with a fixed log-probability, marking
/// the token `is_last` when it is an end token, the budget is reached or the
/// script runs out.
pub struct MockRuntime {
    script: Vec<u32>,
    log_prob: f32,
    available: bool,
    calls: Mutex<Vec<(Vec<u32>, TokenStreamOptions)>>,
    fail_after: Option<usize>,
}

impl MockRuntime {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            log_prob: -0.5,
            available: true,
            calls: Mutex::new(Vec::new()),
            fail_after: None,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(vec![1])
        }
    }

    /// Yield an error after `count` tokens.
    pub fn fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn calls(&self) -> Vec<(Vec<u32>, TokenStreamOptions)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl TokenStreamRuntime for MockRuntime {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn generate_tokens(
        &self,
        prompt_token_ids: Vec<u32>,
        options: TokenStreamOptions,
    ) -> Result<TokenStream, EngineError> {
        lock(&self.calls).push((prompt_token_ids, options.clone()));
        let mut items = Vec::new();
        for (i, &token_id) in self.script.iter().take(options.max_new_tokens).enumerate() {
            if self.fail_after == Some(i) {
                items.push(Err(EngineError::execution(
                    "runtime step",
                    "simulated runtime failure",
                )));
                break;
            }
            let is_last = options.end_token_ids.contains(&token_id)
                || i + 1 == options.max_new_tokens
                || i + 1 == self.script.len();
            items.push(Ok(StreamedToken {
                token_id,
                log_prob: self.log_prob,
                is_last,
            }));
            if is_last {
                break;
            }
        }
        Ok(futures::stream::iter(items).boxed())
    }
}
