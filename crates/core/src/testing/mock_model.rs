use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};

use crate::config::ModelMetadata;
use crate::engine::{CausalModel, ForwardOutput, KvCache};

/// Logits peaked at `token` for every one of `seq_len` positions.
fn peaked_logits(
    token: u32,
    seq_len: usize,
    vocab_size: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut row = vec![-100.0f32; vocab_size];
    row[token as usize] = 100.0;
    let logits: Vec<f32> = row.iter().copied().cycle().take(seq_len * vocab_size).collect();
    Tensor::from_vec(logits, (1, seq_len, vocab_size), device)
}

/// Emits `script[step % script.len()]` at decode step `step`.
///
/// The step counter lives in the returned [`KvCache`], so a cache handed to
/// the wrong request produces the wrong token.
pub struct ScriptedModel {
    script: Vec<u32>,
    metadata: ModelMetadata,
    device: Device,
    fail_at: Option<usize>,
    delay: Option<Duration>,
    adapters: bool,
    active_adapter: Mutex<Option<String>>,
    forward_calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(script: Vec<u32>, vocab_size: usize) -> Self {
        assert!(!script.is_empty(), "script must not be empty");
        assert!(script.iter().all(|&t| (t as usize) < vocab_size));
        Self {
            script,
            metadata: ModelMetadata {
                vocab_size,
                ..Default::default()
            },
            device: Device::Cpu,
            fail_at: None,
            delay: None,
            adapters: false,
            active_adapter: Mutex::new(None),
            forward_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.metadata.context_length = context_length;
        self
    }

    /// Act as an encoder-decoder model starting decoding from `start`.
    pub fn encoder_decoder(mut self, decoder_start_token_id: u32) -> Self {
        self.metadata.is_encoder_decoder = true;
        self.metadata.decoder_start_token_id = Some(decoder_start_token_id);
        self
    }

    /// Fail the forward pass at decode step `step`.
    pub fn fail_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_adapters(mut self) -> Self {
        self.adapters = true;
        self
    }

    pub fn active_adapter(&self) -> Option<String> {
        self.active_adapter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }
}

impl CausalModel for ScriptedModel {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        cache: Option<KvCache>,
    ) -> candle_core::Result<ForwardOutput> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.metadata.is_encoder_decoder && encoder_hidden_states.is_none() {
            return Err(candle_core::Error::Msg(
                "decoder called without encoder output".to_string(),
            ));
        }

        let step = match &cache {
            Some(cache) => cache.layers()[0].0.to_vec1::<u32>()?[0] as usize,
            None => 0,
        };
        if self.fail_at == Some(step) {
            return Err(candle_core::Error::Msg(format!(
                "simulated device failure at step {step}"
            )));
        }

        let seq_len = input_ids.dim(1)?;
        let token = self.script[step % self.script.len()];
        let logits = peaked_logits(token, seq_len, self.metadata.vocab_size, &self.device)?;
        let step_tensor = Tensor::new(&[step as u32 + 1], &self.device)?;
        Ok(ForwardOutput {
            logits,
            cache: KvCache::new(vec![(step_tensor.clone(), step_tensor)]),
        })
    }

    fn encode(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        if !self.metadata.is_encoder_decoder {
            return Err(candle_core::Error::Msg("model has no encoder".to_string()));
        }
        input_ids.to_dtype(DType::F32)
    }

    fn supports_adapters(&self) -> bool {
        self.adapters
    }

    fn set_adapter(&self, adapter_id: &str) -> candle_core::Result<()> {
        if !self.adapters {
            return Err(candle_core::Error::Msg("no adapter support".to_string()));
        }
        *self
            .active_adapter
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(adapter_id.to_string());
        Ok(())
    }
}

/// Next token is a hash of every id the cache has consumed, so any mix-up of
/// cache handles between requests changes the output.
pub struct ContextModel {
    metadata: ModelMetadata,
    device: Device,
    delay: Option<Duration>,
}

impl ContextModel {
    pub fn new(vocab_size: usize) -> Self {
        assert!(vocab_size > 1);
        Self {
            metadata: ModelMetadata {
                vocab_size,
                ..Default::default()
            },
            device: Device::Cpu,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Token produced after consuming `ids`. Never the id 0.
    pub fn next_token(&self, ids: &[u32]) -> u32 {
        let hash = ids.iter().fold(17u64, |h, &id| {
            h.wrapping_mul(31).wrapping_add(u64::from(id) + 1)
        });
        (hash % (self.metadata.vocab_size as u64 - 1)) as u32 + 1
    }
}

impl CausalModel for ContextModel {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        _encoder_hidden_states: Option<&Tensor>,
        cache: Option<KvCache>,
    ) -> candle_core::Result<ForwardOutput> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut consumed = match cache {
            Some(cache) => cache.into_layers().remove(0).0.to_vec1::<u32>()?,
            None => Vec::new(),
        };
        consumed.extend(input_ids.flatten_all()?.to_vec1::<u32>()?);

        let token = self.next_token(&consumed);
        let seq_len = input_ids.dim(1)?;
        let logits = peaked_logits(token, seq_len, self.metadata.vocab_size, &self.device)?;
        let ids = Tensor::new(consumed.as_slice(), &self.device)?;
        Ok(ForwardOutput {
            logits,
            cache: KvCache::new(vec![(ids.clone(), ids)]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[u32]) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    #[test]
    fn scripted_model_advances_through_cache() {
        let model = ScriptedModel::new(vec![3, 4], 8);
        let first = model.forward(&ids(&[1, 2]), None, None).unwrap();
        assert_eq!(first.logits.dims(), &[1, 2, 8]);
        let second = model.forward(&ids(&[3]), None, Some(first.cache)).unwrap();
        let row = second.logits.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(row[0][4], 100.0);
        assert_eq!(model.forward_calls(), 2);
    }

    #[test]
    fn scripted_model_fails_on_request() {
        let model = ScriptedModel::new(vec![1], 4).fail_at(0);
        assert!(model.forward(&ids(&[1]), None, None).is_err());
    }

    #[test]
    fn context_model_depends_on_history() {
        let model = ContextModel::new(50);
        let a = model.forward(&ids(&[1, 2]), None, None).unwrap();
        let b = model.forward(&ids(&[2, 1]), None, None).unwrap();
        let top = |t: &Tensor| {
            let rows = t.squeeze(0).unwrap().to_vec2::<f32>().unwrap();
            rows[0].iter().position(|&v| v == 100.0).unwrap() as u32
        };
        assert_eq!(top(&a.logits), model.next_token(&[1, 2]));
        assert_eq!(top(&b.logits), model.next_token(&[2, 1]));
        assert_ne!(model.next_token(&[1, 2]), 0);
    }
}
