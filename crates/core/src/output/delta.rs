//! Text-delta reconciliation for streaming consumers.

use crate::output::GenerationOutput;

/// Converts cumulative outputs into per-alternative deltas.
///
/// Holds, per alternative index, how much text and how many tokens were
/// already emitted. Create one per request.
#[derive(Debug, Default)]
pub struct DeltaReconciler {
    prev_text_len: Vec<usize>,
    prev_num_tokens: Vec<usize>,
}

impl DeltaReconciler {
    pub fn new(n: usize) -> Self {
        Self {
            prev_text_len: vec![0; n],
            prev_num_tokens: vec![0; n],
        }
    }

    fn ensure(&mut self, index: usize) {
        if index >= self.prev_text_len.len() {
            self.prev_text_len.resize(index + 1, 0);
            self.prev_num_tokens.resize(index + 1, 0);
        }
    }

    /// Reduce every chunk of `output` to what is new since the previous call.
    /// A finished output is returned as-is.
    pub fn reconcile(&mut self, mut output: GenerationOutput) -> GenerationOutput {
        if output.finished {
            return output;
        }
        for chunk in &mut output.outputs {
            self.ensure(chunk.index);
            let prev_len = self.prev_text_len[chunk.index];
            let prev_tokens = self.prev_num_tokens[chunk.index];

            chunk.text = chunk.text.get(prev_len..).unwrap_or_default().to_string();
            self.prev_text_len[chunk.index] = prev_len + chunk.text.len();

            let num_tokens = chunk.token_ids.len();
            chunk.token_ids = chunk.token_ids.get(prev_tokens..).unwrap_or_default().to_vec();
            if let Some(logprobs) = chunk.logprobs.as_mut() {
                *logprobs = logprobs.get(prev_tokens..).unwrap_or_default().to_vec();
            }
            self.prev_num_tokens[chunk.index] = num_tokens.max(prev_tokens);
        }
        output
    }

    /// Text deltas of `output`, skipping alternatives with nothing new.
    /// Returns nothing for a finished output.
    pub fn reconcile_text(&mut self, output: &GenerationOutput) -> Vec<(usize, String)> {
        if output.finished {
            return Vec::new();
        }
        let mut deltas = Vec::new();
        for chunk in &output.outputs {
            self.ensure(chunk.index);
            let prev_len = self.prev_text_len[chunk.index];
            let delta = chunk.text.get(prev_len..).unwrap_or_default();
            if delta.is_empty() {
                continue;
            }
            self.prev_text_len[chunk.index] = chunk.text.len();
            deltas.push((chunk.index, delta.to_string()));
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CompletionChunk;
    use crate::request::FinishReason;
    use proptest::prelude::*;

    fn emission(texts: &[&str], finished: bool) -> GenerationOutput {
        let mut output = GenerationOutput::new("r".to_string(), vec![9]);
        output.finished = finished;
        for (i, text) in texts.iter().enumerate() {
            let mut chunk = CompletionChunk::new(i);
            chunk.text = text.to_string();
            chunk.token_ids = (0..text.len() as u32).collect();
            if finished {
                chunk.finish_reason = Some(FinishReason::Stop);
            }
            output.outputs.push(chunk);
        }
        output
    }

    #[test]
    fn reconcile_slices_text_and_tokens() {
        let mut reconciler = DeltaReconciler::new(1);
        let first = reconciler.reconcile(emission(&["ab"], false));
        assert_eq!(first.outputs[0].text, "ab");
        assert_eq!(first.outputs[0].token_ids, vec![0, 1]);

        let second = reconciler.reconcile(emission(&["abcd"], false));
        assert_eq!(second.outputs[0].text, "cd");
        assert_eq!(second.outputs[0].token_ids, vec![2, 3]);
    }

    #[test]
    fn alternatives_tracked_independently() {
        let mut reconciler = DeltaReconciler::new(2);
        reconciler.reconcile(emission(&["a", "xyz"], false));
        let next = reconciler.reconcile(emission(&["ab", "xyz!"], false));
        assert_eq!(next.outputs[0].text, "b");
        assert_eq!(next.outputs[1].text, "!");
    }

    #[test]
    fn terminal_passes_through_unchanged() {
        let mut reconciler = DeltaReconciler::new(1);
        reconciler.reconcile(emission(&["abc"], false));
        let terminal = emission(&["abc"], true);
        assert_eq!(reconciler.reconcile(terminal.clone()), terminal);
        assert!(reconciler.reconcile_text(&terminal).is_empty());
    }

    #[test]
    fn reconcile_text_skips_empty_deltas() {
        let mut reconciler = DeltaReconciler::new(2);
        assert_eq!(
            reconciler.reconcile_text(&emission(&["a", ""], false)),
            vec![(0, "a".to_string())]
        );
        assert_eq!(
            reconciler.reconcile_text(&emission(&["a", "b"], false)),
            vec![(1, "b".to_string())]
        );
    }

    #[test]
    fn grows_for_unexpected_index() {
        let mut reconciler = DeltaReconciler::new(0);
        let out = reconciler.reconcile(emission(&["x", "y", "z"], false));
        assert_eq!(out.outputs.len(), 3);
        assert_eq!(out.outputs[2].text, "z");
    }

    proptest! {
        #[test]
        fn deltas_concatenate_to_final_text(
            pieces in proptest::collection::vec("[a-z é]{0,4}", 1..12)
        ) {
            let mut reconciler = DeltaReconciler::new(1);
            let mut cumulative = String::new();
            let mut joined = String::new();
            for piece in &pieces {
                cumulative.push_str(piece);
                let out = reconciler.reconcile(emission(&[cumulative.as_str()], false));
                joined.push_str(&out.outputs[0].text);
            }
            prop_assert_eq!(joined, cumulative);
        }
    }
}
