//! Draft-token verification kernels: candidate masking, the acceptance
//! test and the output commit.

use rand::{RngCore, SeedableRng};

use super::select::argmax;
use crate::layers::{
    AcceptanceThreshold, DecodingOutputs, FinishedState, GeneratorStates, TokenId, UNSELECTED,
};

/// Floor applied to draft probabilities before dividing by them.
pub const PROB_EPSILON: f32 = 1e-7;

/// Inputs of [`mask_target_logits`].
#[derive(Debug, Clone, Copy)]
pub struct MaskParams<'a> {
    pub batch_slots: &'a [usize],
    /// Slot-indexed; inactive slots are left alone.
    pub active: &'a [bool],
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
    /// Slot-indexed candidate rows.
    pub candidates: &'a [TokenId],
    /// Dense rows; their argmax resolves rows without candidates.
    pub runtime_probs: &'a [f32],
}

/// Restrict each active row of `target_logits` to its candidate set and
/// resolve the target output id.
///
/// `mask` records membership per slot row. The resolved id is the first
/// candidate, or the argmax of the runtime probabilities when the row has
/// none.
pub fn mask_target_logits(
    params: &MaskParams<'_>,
    mask: &mut [bool],
    target_logits: &mut [f32],
    target_output_ids: &mut [TokenId],
) {
    let vp = params.vocab_size_padded;
    for (index, &slot) in params.batch_slots.iter().enumerate() {
        if !params.active[slot] {
            continue;
        }
        let candidates = &params.candidates[slot * vp..(slot + 1) * vp];
        let mask_row = &mut mask[slot * vp..(slot + 1) * vp];
        mask_row.fill(false);
        for &id in candidates.iter().take_while(|&&id| id != UNSELECTED) {
            if (id as usize) < params.vocab_size {
                mask_row[id as usize] = true;
            }
        }

        target_output_ids[slot] = match candidates[0] {
            UNSELECTED => {
                let row = &params.runtime_probs[index * vp..(index + 1) * vp];
                argmax(row, params.vocab_size)
            }
            first => first,
        };

        let logits = &mut target_logits[index * vp..(index + 1) * vp];
        for (logit, &keep) in logits.iter_mut().zip(mask_row.iter()) {
            if !keep {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
}

/// Inputs of [`accept_draft_tokens`].
#[derive(Debug, Clone, Copy)]
pub struct AcceptParams<'a> {
    pub batch_slots: &'a [usize],
    pub active: &'a [bool],
    pub step: usize,
    pub max_draft_tokens: usize,
    pub vocab_size_padded: usize,
    /// Slot-indexed `max_draft_tokens` rows per slot.
    pub draft_probs: &'a [f32],
    /// Dense rows of the masked target distribution.
    pub target_probs: &'a [f32],
    /// Slot-indexed `max_draft_tokens` ids per slot.
    pub draft_token_ids: &'a [TokenId],
    pub num_draft_tokens: &'a [usize],
    pub use_draft_logits: &'a [bool],
    pub target_output_ids: &'a [TokenId],
    pub threshold: AcceptanceThreshold,
}

/// Outcome counts of one acceptance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptanceCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub exhausted: u64,
}

impl AcceptanceCounts {
    /// Sequences that took part in the test.
    pub fn tested(&self) -> u64 {
        self.accepted + self.rejected
    }
}

/// Accept or reject the draft token at `step` for every active slot.
///
/// Rejected slots and slots without a draft token at `step` are moved to
/// [`FinishedState::SkipDecoding`] and left unaccepted so they receive a
/// bonus token. A random threshold is only drawn for slots that compare
/// probabilities.
pub fn accept_draft_tokens<R: RngCore + SeedableRng>(
    params: &AcceptParams<'_>,
    generators: &mut GeneratorStates<R>,
    is_accepted: &mut [bool],
    finished: &mut [FinishedState],
) -> AcceptanceCounts {
    let vp = params.vocab_size_padded;
    let md = params.max_draft_tokens;
    let mut counts = AcceptanceCounts::default();

    for (index, &slot) in params.batch_slots.iter().enumerate() {
        if !params.active[slot] {
            continue;
        }
        if params.step >= params.num_draft_tokens[slot] {
            is_accepted[slot] = false;
            finished[slot] = FinishedState::SkipDecoding;
            counts.exhausted += 1;
            continue;
        }

        let token = params.draft_token_ids[slot * md + params.step];
        let accepted = if params.use_draft_logits[slot] {
            let draft = params.draft_probs[(slot * md + params.step) * vp + token as usize];
            let target = params.target_probs[index * vp + token as usize];
            let threshold = match params.threshold {
                AcceptanceThreshold::Random => generators.uniform(slot),
                AcceptanceThreshold::Constant(value) => value,
            };
            target / draft.max(PROB_EPSILON) >= threshold
        } else {
            token == params.target_output_ids[slot]
        };

        is_accepted[slot] = accepted;
        if accepted {
            counts.accepted += 1;
        } else {
            finished[slot] = FinishedState::SkipDecoding;
            counts.rejected += 1;
        }
    }
    counts
}

/// Inputs of [`forward_accepted_tokens`].
#[derive(Debug, Clone, Copy)]
pub struct CommitParams<'a> {
    pub batch_slots: &'a [usize],
    pub active: &'a [bool],
    pub is_accepted: &'a [bool],
    pub step: usize,
    pub max_draft_tokens: usize,
    pub draft_token_ids: &'a [TokenId],
    pub target_output_ids: &'a [TokenId],
    /// Slot-indexed end ids.
    pub end_ids: &'a [TokenId],
    pub max_seq_len: usize,
}

/// Terminations raised by one commit pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitCounts {
    pub committed: u64,
    pub finished_eos: u64,
    pub finished_max_length: u64,
}

/// Append one token per active slot to its output row.
///
/// The token is the draft token at `step` when accepted, otherwise the
/// resolved target (or bonus) id. Callers guarantee every active slot has
/// room for one more token.
pub fn forward_accepted_tokens(
    params: &CommitParams<'_>,
    outputs: &mut DecodingOutputs<'_>,
) -> CommitCounts {
    let mut counts = CommitCounts::default();
    for &slot in params.batch_slots {
        if !params.active[slot] {
            continue;
        }
        let token = if params.is_accepted[slot] {
            params.draft_token_ids[slot * params.max_draft_tokens + params.step]
        } else {
            params.target_output_ids[slot]
        };

        let len = outputs.sequence_lengths[slot];
        outputs.output_ids.row_mut(slot)[len] = token;
        let len = len + 1;
        outputs.sequence_lengths[slot] = len;
        counts.committed += 1;

        if token == params.end_ids[slot] {
            outputs.finished[slot] = FinishedState::FinishedEos;
            counts.finished_eos += 1;
        } else if len >= params.max_seq_len {
            outputs.finished[slot] = FinishedState::FinishedMaxLength;
            counts.finished_max_length += 1;
        }
    }
    counts
}
