//! Layer modes, setup parameters and per-step inputs and outputs.

use super::domain::expect_len;
use super::{DecoderDomain, DecodingError, FinishedState, TokenId};

/// Decoding algorithm a layer is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingMode {
    /// Plain top-k / top-p sampling.
    TopKTopP,
    /// Verification of draft tokens proposed by an external model.
    ExternalDraftTokens,
    /// Not supported by any layer in this crate.
    BeamSearch { beam_width: usize },
}

impl DecodingMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TopKTopP => "top_k_top_p",
            Self::ExternalDraftTokens => "external_draft_tokens",
            Self::BeamSearch { .. } => "beam_search",
        }
    }
}

/// Sampling parameters shared by every sampling-based layer.
///
/// Each array holds one value for the whole batch or one per sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingSetupParams {
    pub random_seed: Option<Vec<u64>>,
    pub runtime_top_k: Option<Vec<i32>>,
    pub runtime_top_p: Option<Vec<f32>>,
}

impl SamplingSetupParams {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(vec![seed]);
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<u64>) -> Self {
        self.random_seed = Some(seeds);
        self
    }

    pub fn with_top_k(mut self, top_k: Vec<i32>) -> Self {
        self.runtime_top_k = Some(top_k);
        self
    }

    pub fn with_top_p(mut self, top_p: Vec<f32>) -> Self {
        self.runtime_top_p = Some(top_p);
        self
    }
}

/// Setup parameters, one variant per layer kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupParams {
    Standard(SamplingSetupParams),
    ExternalDraftTokens(SamplingSetupParams),
}

/// Reject a mode a layer does not serve.
pub(crate) fn check_mode(mode: DecodingMode, served: DecodingMode) -> Result<(), DecodingError> {
    match mode {
        DecodingMode::BeamSearch { beam_width } => Err(DecodingError::InvalidConfiguration(format!(
            "beam search (beam width {beam_width}) is not supported"
        ))),
        mode if mode == served => Ok(()),
        mode => Err(DecodingError::UnsupportedMode(format!(
            "{} layer cannot run {}",
            served.name(),
            mode.name()
        ))),
    }
}

impl SetupParams {
    pub(crate) fn variant_name(&self) -> &'static str {
        match self {
            Self::Standard(_) => "standard",
            Self::ExternalDraftTokens(_) => "external_draft_tokens",
        }
    }
}

/// How the acceptance threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcceptanceThreshold {
    /// Uniform draw in `[0, 1)` from the sequence's generator.
    Random,
    /// Fixed threshold for every sequence.
    Constant(f32),
}

impl Default for AcceptanceThreshold {
    fn default() -> Self {
        Self::Random
    }
}

/// Per-step inputs of the standard sampling layer.
#[derive(Debug, Clone, Copy)]
pub struct StandardInputs<'a, T> {
    /// Dense `batch_size × vocab_size_padded` logits.
    pub logits: &'a [T],
    /// Optional bias, `vocab_size_padded` long, added before softmax.
    pub bias: Option<&'a [f32]>,
    pub batch_slots: &'a [usize],
    /// Slot-indexed end-of-sequence ids.
    pub end_ids: &'a [TokenId],
}

/// Per-step inputs of the external-draft-tokens layer.
#[derive(Debug, Clone, Copy)]
pub struct ExternalDraftTokensInputs<'a, T> {
    /// Dense `batch_size × vocab_size_padded` target logits.
    pub logits: &'a [T],
    /// Optional bias, `vocab_size_padded` long, added before softmax.
    pub bias: Option<&'a [f32]>,
    pub batch_slots: &'a [usize],
    /// Slot-indexed end-of-sequence ids.
    pub end_ids: &'a [TokenId],
    /// Slot-indexed `max_batch_size × max_draft_tokens × vocab_size_padded`
    /// draft logits. Only read at step 0.
    pub draft_logits: Option<&'a [T]>,
    /// Slot-indexed `max_batch_size × max_draft_tokens` draft ids.
    pub draft_token_ids: &'a [TokenId],
    /// Slot-indexed number of valid draft tokens.
    pub num_draft_tokens: &'a [usize],
    /// Slot-indexed: compare probabilities instead of ids.
    pub use_draft_logits: &'a [bool],
    /// Position inside the current draft cycle.
    pub step: usize,
    pub acceptance: AcceptanceThreshold,
}

/// Per-step inputs, one variant per layer kind.
#[derive(Debug, Clone, Copy)]
pub enum DecodingInputs<'a, T> {
    Standard(StandardInputs<'a, T>),
    ExternalDraftTokens(ExternalDraftTokensInputs<'a, T>),
}

impl<T> DecodingInputs<'_, T> {
    pub fn batch_slots(&self) -> &[usize] {
        match self {
            Self::Standard(inputs) => inputs.batch_slots,
            Self::ExternalDraftTokens(inputs) => inputs.batch_slots,
        }
    }

    pub(crate) fn variant_name(&self) -> &'static str {
        match self {
            Self::Standard(_) => "standard",
            Self::ExternalDraftTokens(_) => "external_draft_tokens",
        }
    }
}

/// `max_batch_size × max_seq_len` output token matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputIds {
    ids: Vec<TokenId>,
    max_batch_size: usize,
    max_seq_len: usize,
}

impl OutputIds {
    pub fn new(max_batch_size: usize, max_seq_len: usize) -> Self {
        Self {
            ids: vec![0; max_batch_size * max_seq_len],
            max_batch_size,
            max_seq_len,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn row(&self, slot: usize) -> &[TokenId] {
        &self.ids[slot * self.max_seq_len..(slot + 1) * self.max_seq_len]
    }

    pub fn row_mut(&mut self, slot: usize) -> &mut [TokenId] {
        &mut self.ids[slot * self.max_seq_len..(slot + 1) * self.max_seq_len]
    }
}

/// State a layer shares with the enclosing decoder. All slices are
/// slot-indexed.
#[derive(Debug)]
pub struct DecodingOutputs<'a> {
    pub finished: &'a mut [FinishedState],
    pub sequence_lengths: &'a mut [usize],
    pub output_ids: &'a mut OutputIds,
}

impl DecodingOutputs<'_> {
    pub(crate) fn check_shape(&self, domain: &DecoderDomain) -> Result<(), DecodingError> {
        let max_batch = domain.max_batch_size();
        expect_len("finished", self.finished.len(), max_batch)?;
        expect_len("sequence_lengths", self.sequence_lengths.len(), max_batch)?;
        if self.output_ids.max_batch_size() != max_batch
            || self.output_ids.max_seq_len() != domain.max_seq_len()
        {
            return Err(DecodingError::invalid_argument(format!(
                "output ids are {}x{}, expected {}x{}",
                self.output_ids.max_batch_size(),
                self.output_ids.max_seq_len(),
                max_batch,
                domain.max_seq_len()
            )));
        }
        Ok(())
    }

    /// Mark which slots of the batch take part in this step.
    ///
    /// A slot takes part unless it is finished or skipping, and must then
    /// have room for one more token. Slots outside the batch are cleared.
    /// Returns how many take part.
    pub(crate) fn snapshot_active(
        &self,
        domain: &DecoderDomain,
        batch_slots: &[usize],
        active: &mut [bool],
    ) -> Result<usize, DecodingError> {
        active.fill(false);
        let mut count = 0;
        for &slot in batch_slots {
            active[slot] = !self.finished[slot].is_skip_decoding();
            if !active[slot] {
                continue;
            }
            if self.sequence_lengths[slot] >= domain.max_seq_len() {
                return Err(DecodingError::invalid_argument(format!(
                    "slot {slot} is full ({} tokens) but not finished",
                    self.sequence_lengths[slot]
                )));
            }
            count += 1;
        }
        Ok(count)
    }
}

/// Owned backing storage for [`DecodingOutputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceBuffers {
    pub finished: Vec<FinishedState>,
    pub sequence_lengths: Vec<usize>,
    pub output_ids: OutputIds,
}

impl SequenceBuffers {
    pub fn new(max_batch_size: usize, max_seq_len: usize) -> Self {
        Self {
            finished: vec![FinishedState::Running; max_batch_size],
            sequence_lengths: vec![0; max_batch_size],
            output_ids: OutputIds::new(max_batch_size, max_seq_len),
        }
    }

    pub fn for_domain(domain: &DecoderDomain) -> Self {
        Self::new(domain.max_batch_size(), domain.max_seq_len())
    }

    /// Write `tokens` as the prefix of a slot's row and set its length.
    pub fn set_prompt(&mut self, slot: usize, tokens: &[TokenId]) -> Result<(), DecodingError> {
        if slot >= self.sequence_lengths.len() || tokens.len() > self.output_ids.max_seq_len() {
            return Err(DecodingError::invalid_argument(format!(
                "prompt of {} tokens does not fit slot {slot}",
                tokens.len()
            )));
        }
        self.output_ids.row_mut(slot)[..tokens.len()].copy_from_slice(tokens);
        self.sequence_lengths[slot] = tokens.len();
        self.finished[slot] = FinishedState::Running;
        Ok(())
    }

    pub fn as_outputs(&mut self) -> DecodingOutputs<'_> {
        DecodingOutputs {
            finished: &mut self.finished,
            sequence_lengths: &mut self.sequence_lengths,
            output_ids: &mut self.output_ids,
        }
    }

    /// Tokens written so far for a slot.
    pub fn tokens(&self, slot: usize) -> &[TokenId] {
        &self.output_ids.row(slot)[..self.sequence_lengths[slot]]
    }
}
