//! Forward-pass capability the sequential engine drives.

use candle_core::{DType, Device, IndexOp, Tensor};

use crate::config::ModelMetadata;

/// Per-layer key/value tensors from previous steps.
///
/// Opaque to the engine: it is handed back to the model on the next step
/// and never inspected. Move-only so one request's cache cannot be aliased
/// by another.
#[derive(Debug)]
pub struct KvCache {
    layers: Vec<(Tensor, Tensor)>,
}

impl KvCache {
    pub fn new(layers: Vec<(Tensor, Tensor)>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[(Tensor, Tensor)] {
        &self.layers
    }

    pub fn into_layers(self) -> Vec<(Tensor, Tensor)> {
        self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// Result of one forward pass.
pub struct ForwardOutput {
    /// `[1, seq_len, vocab]` scores for every input position.
    pub logits: Tensor,
    /// Cache to pass into the next step.
    pub cache: KvCache,
}

/// A loaded model the sequential engine can step.
pub trait CausalModel: Send + Sync + 'static {
    fn metadata(&self) -> &ModelMetadata;

    fn device(&self) -> &Device;

    /// Run the decoder over `input_ids` (`[1, len]`, `u32`).
    ///
    /// Prefill passes the whole prompt and no cache; decode passes the last
    /// token and the cache returned by the previous call.
    /// `encoder_hidden_states` is `Some` for encoder-decoder models.
    fn forward(
        &self,
        input_ids: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        cache: Option<KvCache>,
    ) -> candle_core::Result<ForwardOutput>;

    /// Run the encoder over the source prompt. Only encoder-decoder models
    /// implement this.
    fn encode(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let _ = input_ids;
        Err(candle_core::Error::Msg(
            "model has no encoder".to_string(),
        ))
    }

    /// Whether [`CausalModel::set_adapter`] can switch adapter weights.
    fn supports_adapters(&self) -> bool {
        false
    }

    /// Activate adapter `adapter_id` for subsequent forward passes.
    fn set_adapter(&self, adapter_id: &str) -> candle_core::Result<()> {
        Err(candle_core::Error::Msg(format!(
            "adapter {adapter_id} requested but model has no adapter support"
        )))
    }
}

/// Scores at every position as `f32` rows, accepting `[1, seq, vocab]`,
/// `[seq, vocab]` or `[vocab]`.
pub(crate) fn logits_rows(logits: &Tensor) -> candle_core::Result<Vec<Vec<f32>>> {
    let logits = logits.to_dtype(DType::F32)?;
    match logits.rank() {
        3 => logits.squeeze(0)?.to_vec2(),
        2 => logits.to_vec2(),
        1 => Ok(vec![logits.to_vec1()?]),
        rank => Err(candle_core::Error::Msg(format!(
            "expected logits of rank 1..=3, got rank {rank}"
        ))),
    }
}

/// Scores at the last position. Only that row is copied off the device.
pub(crate) fn last_logits(logits: &Tensor) -> candle_core::Result<Vec<f32>> {
    let last = |len: usize| {
        len.checked_sub(1)
            .ok_or_else(|| candle_core::Error::Msg("empty logits".to_string()))
    };
    let row = match logits.rank() {
        3 => logits.i((0, last(logits.dim(1)?)?))?,
        2 => logits.i(last(logits.dim(0)?)?)?,
        1 => logits.clone(),
        rank => {
            return Err(candle_core::Error::Msg(format!(
                "expected logits of rank 1..=3, got rank {rank}"
            )))
        }
    };
    row.to_dtype(DType::F32)?.to_vec1()
}
