//! Token sampling.
//!
//! Turns one position's raw logits into the next token id: logits processors
//! (repetition penalty, temperature), then either greedy argmax or top-k /
//! top-p truncation followed by a categorical draw.

pub mod logits_processor;

pub use logits_processor::{
    LogitsProcessor, LogitsProcessorPipeline, RepetitionPenaltyProcessor, TemperatureProcessor,
};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::request::GenerationConfig;

/// Temperatures below this decode greedily.
pub const GREEDY_TEMPERATURE_EPS: f32 = 1e-5;
/// Nucleus thresholds below this decode greedily.
pub const GREEDY_TOP_P_EPS: f32 = 1e-8;

/// Parameters controlling token sampling behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Temperature for logit scaling. 0.0 = greedy, higher = more random.
    pub temperature: f32,
    /// Nucleus sampling threshold (0..1). 1.0 = disabled.
    pub top_p: f32,
    /// Top-K filtering. 0 = disabled.
    pub top_k: usize,
    /// Penalty for repeated tokens. 1.0 = none, >1.0 discourages repeats.
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repetition_penalty: config.repetition_penalty,
            seed: config.seed,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < GREEDY_TEMPERATURE_EPS || self.top_p < GREEDY_TOP_P_EPS
    }
}

/// Per-alternative RNG.
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

/// Sample a token from one position's logits.
///
/// `history` is every token this alternative has seen so far (prompt and
/// generated) and feeds the repetition penalty.
pub fn sample(
    logits: &[f32],
    params: &SamplingParams,
    history: &[u32],
    state: &mut SamplerState,
) -> u32 {
    let mut logits = logits.to_vec();
    LogitsProcessorPipeline::from_params(params).process(&mut logits, history);

    if params.is_greedy() {
        return argmax(&logits);
    }

    let vocab_size = logits.len();
    let mut probs = softmax(&logits);

    if params.top_k > 0 && params.top_k < vocab_size {
        apply_top_k(&mut probs, params.top_k);
    }
    if params.top_p < 1.0 {
        apply_top_p(&mut probs, params.top_p);
    }

    let sum: f32 = probs.iter().sum();
    if sum > 0.0 && sum != 1.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }

    sample_from_probs(&probs, &mut state.rng)
}

fn apply_top_k(probs: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k.min(sorted.len()) - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Keep the smallest prefix of tokens (by descending probability) whose mass
/// exceeds `top_p`. The most likely token always survives.
fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0f32;
    let mut cutoff_idx = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum > top_p {
            cutoff_idx = i + 1;
            break;
        }
    }

    for &(idx, _) in &indexed[cutoff_idx..] {
        probs[idx] = 0.0;
    }
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Numerically stable log-softmax over the full vocabulary.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max_logit - exp_sum_ln).collect()
}

/// Index of the largest value; ties resolve to the lowest index.
fn argmax(values: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best as u32
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    let mut last_nonzero = 0usize;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last_nonzero = i;
        }
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    // Rounding left `r` above the accumulated mass.
    last_nonzero as u32
}
