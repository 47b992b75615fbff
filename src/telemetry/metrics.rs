//! Metric recording helpers.
//!
//! Everything goes through the `metrics` facade; without an installed
//! recorder the calls are no-ops.

use metrics::{counter, histogram};

use crate::kernels::{AcceptanceCounts, CommitCounts};

/// Record the outcome of one acceptance pass.
pub fn record_acceptance(counts: &AcceptanceCounts) {
    counter!("specdec_draft_tokens_accepted_total").increment(counts.accepted);
    counter!("specdec_draft_tokens_rejected_total").increment(counts.rejected);
    counter!("specdec_draft_exhausted_total").increment(counts.exhausted);
    if counts.tested() > 0 {
        let rate = counts.accepted as f64 / counts.tested() as f64;
        histogram!("specdec_acceptance_rate").record(rate);
    }
}

/// Record bonus tokens drawn for rejected sequences.
pub fn record_bonus_tokens(count: u64) {
    counter!("specdec_bonus_tokens_total").increment(count);
}

/// Record committed tokens and the sequences they finished.
pub fn record_commit(counts: &CommitCounts) {
    counter!("specdec_tokens_committed_total").increment(counts.committed);
    counter!("specdec_sequences_finished_total", "reason" => "eos").increment(counts.finished_eos);
    counter!("specdec_sequences_finished_total", "reason" => "max_length")
        .increment(counts.finished_max_length);
}

/// Record a step that failed with an error.
pub fn record_step_failure(layer: &'static str) {
    counter!("specdec_step_failures_total", "layer" => layer).increment(1);
}
