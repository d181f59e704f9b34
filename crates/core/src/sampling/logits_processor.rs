//! Logits processor pipeline.
//!
//! Each processor rewrites the raw logit vector in place. Processors run in
//! registration order: penalties first, then temperature scaling. Truncation
//! (top-k / top-p) happens on probabilities and lives in [`super::sample`].
//!
//! ```ignore
//! let pipeline = LogitsProcessorPipeline::from_params(&params);
//! pipeline.process(&mut logits, &history);
//! ```

use std::collections::HashSet;

use super::SamplingParams;

/// A logit transformation applied before sampling.
///
/// The slice has length `vocab_size` and holds raw (unnormalized) scores.
/// `history` is every token the model has seen for this alternative.
pub trait LogitsProcessor: Send + Sync {
    fn process(&self, logits: &mut [f32], history: &[u32]);

    fn name(&self) -> &'static str;
}

/// Ctrl-style repetition penalty: positive logits of already-seen tokens are
/// divided by the penalty, negative ones multiplied. Each distinct token is
/// penalized once no matter how often it occurs.
pub struct RepetitionPenaltyProcessor {
    penalty: f32,
}

impl RepetitionPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for RepetitionPenaltyProcessor {
    fn process(&self, logits: &mut [f32], history: &[u32]) {
        let mut seen = HashSet::with_capacity(history.len());
        for &token_id in history {
            if !seen.insert(token_id) {
                continue;
            }
            if let Some(logit) = logits.get_mut(token_id as usize) {
                if *logit > 0.0 {
                    *logit /= self.penalty;
                } else {
                    *logit *= self.penalty;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "repetition_penalty"
    }
}

/// Divides every logit by the temperature.
pub struct TemperatureProcessor {
    temperature: f32,
}

impl TemperatureProcessor {
    pub fn new(temperature: f32) -> Self {
        Self { temperature }
    }
}

impl LogitsProcessor for TemperatureProcessor {
    fn process(&self, logits: &mut [f32], _history: &[u32]) {
        let inv_temp = 1.0 / self.temperature;
        for logit in logits.iter_mut() {
            *logit *= inv_temp;
        }
    }

    fn name(&self) -> &'static str {
        "temperature"
    }
}

/// Ordered list of processors.
#[derive(Default)]
pub struct LogitsProcessorPipeline {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the pipeline implied by `params`. Identity settings add nothing;
    /// greedy decoding skips temperature since it cannot change the argmax.
    pub fn from_params(params: &SamplingParams) -> Self {
        let mut pipeline = Self::new();
        if params.repetition_penalty != 1.0 {
            pipeline.push(Box::new(RepetitionPenaltyProcessor::new(
                params.repetition_penalty,
            )));
        }
        if !params.is_greedy() && params.temperature != 1.0 {
            pipeline.push(Box::new(TemperatureProcessor::new(params.temperature)));
        }
        pipeline
    }

    pub fn push(&mut self, processor: Box<dyn LogitsProcessor>) {
        self.processors.push(processor);
    }

    pub fn process(&self, logits: &mut [f32], history: &[u32]) {
        for processor in &self.processors {
            processor.process(logits, history);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetition_penalty_divides_positive_multiplies_negative() {
        let processor = RepetitionPenaltyProcessor::new(2.0);
        let mut logits = vec![4.0, -4.0, 4.0];
        processor.process(&mut logits, &[0, 1]);
        assert_eq!(logits, vec![2.0, -8.0, 4.0]);
    }

    #[test]
    fn repetition_penalty_applies_once_per_distinct_token() {
        let processor = RepetitionPenaltyProcessor::new(2.0);
        let mut logits = vec![8.0, 1.0];
        processor.process(&mut logits, &[0, 0, 0]);
        assert_eq!(logits[0], 4.0);
    }

    #[test]
    fn repetition_penalty_ignores_out_of_vocab_ids() {
        let processor = RepetitionPenaltyProcessor::new(2.0);
        let mut logits = vec![1.0, 1.0];
        processor.process(&mut logits, &[99]);
        assert_eq!(logits, vec![1.0, 1.0]);
    }

    #[test]
    fn temperature_scales_logits() {
        let processor = TemperatureProcessor::new(0.5);
        let mut logits = vec![1.0, -2.0];
        processor.process(&mut logits, &[]);
        assert_eq!(logits, vec![2.0, -4.0]);
    }

    #[test]
    fn pipeline_from_default_params_is_empty() {
        let pipeline = LogitsProcessorPipeline::from_params(&SamplingParams::default());
        assert!(pipeline.is_empty());
    }

    #[test]
    fn pipeline_orders_penalty_before_temperature() {
        let params = SamplingParams {
            temperature: 0.7,
            repetition_penalty: 1.3,
            ..Default::default()
        };
        let pipeline = LogitsProcessorPipeline::from_params(&params);
        assert_eq!(pipeline.names(), vec!["repetition_penalty", "temperature"]);
    }

    #[test]
    fn greedy_pipeline_skips_temperature() {
        let params = SamplingParams {
            temperature: 0.0,
            repetition_penalty: 1.3,
            ..Default::default()
        };
        let pipeline = LogitsProcessorPipeline::from_params(&params);
        assert_eq!(pipeline.names(), vec!["repetition_penalty"]);
    }
}
