//! Acceptance and sampling stage for draft tokens proposed by an external
//! model.
//!
//! One `forward` call verifies the draft token at position `step` of every
//! active sequence:
//!
//! 1. copy the target logits and softmax them into runtime probabilities
//! 2. collect each sequence's top-k or top-p candidate set
//! 3. mask the target logits to that set and test the draft token
//! 4. sample a bonus token for sequences whose draft was rejected
//! 5. append the accepted or bonus token to the output row
//!
//! Rejected sequences move to `SkipDecoding` and sit out the remaining steps
//! of the draft cycle.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::domain::{all_of_batch_slots, expect_len, max_of_batch_slots};
use super::params::check_mode;
use super::{
    DecoderDomain, DecodingError, DecodingInputs, DecodingLayer, DecodingMode, DecodingOutputs,
    ExternalDraftTokensInputs, FinishedState, Logit, SamplingRuntime, SetupParams, TokenId,
    TOP_K_MAX, UNSELECTED,
};
use crate::kernels::{
    accept_draft_tokens, add_bias_softmax, batch_top_k, batch_top_p, forward_accepted_tokens,
    mask_target_logits, AcceptParams, AcceptanceCounts, CommitCounts, CommitParams, MaskParams,
    Selection, TopKParams, TopPParams,
};
use crate::memory::{Workspace, WorkspaceLayout};
use crate::telemetry::{self, SpanExt, StepSpan};

/// Decoding layer that accepts or replaces externally drafted tokens.
#[derive(Debug)]
pub struct ExternalDraftTokensLayer<R = StdRng> {
    domain: DecoderDomain,
    runtime: SamplingRuntime<R>,
    /// Dense target logits, masked to the candidate set.
    target_logits: Vec<f32>,
    /// Dense softmax of the masked target logits.
    target_probs: Vec<f32>,
    /// Slot-indexed `max_draft_tokens` rows per slot, filled at step 0.
    draft_probs: Vec<f32>,
    draft_probs_ready: Vec<bool>,
    /// Slot-indexed candidate rows.
    candidates: Vec<TokenId>,
    candidate_mask: Vec<bool>,
    /// Always 1.0: bonus tokens are drawn from the whole target distribution.
    multinomial_top_p: Vec<f32>,
    is_accepted: Vec<bool>,
    target_output_ids: Vec<TokenId>,
    /// Slots taking part in the current step.
    active: Vec<bool>,
    /// Per-stage skip flags handed to the candidate kernels.
    stage_skip: Vec<bool>,
}

impl ExternalDraftTokensLayer {
    /// Create a layer using the default generator.
    pub fn new(mode: DecodingMode, domain: DecoderDomain) -> Result<Self, DecodingError> {
        Self::with_generator(mode, domain)
    }
}

impl<R: RngCore + SeedableRng> ExternalDraftTokensLayer<R> {
    /// Create a layer drawing randomness from generators of type `R`.
    pub fn with_generator(
        mode: DecodingMode,
        domain: DecoderDomain,
    ) -> Result<Self, DecodingError> {
        check_mode(mode, DecodingMode::ExternalDraftTokens)?;

        let max_batch = domain.max_batch_size();
        let vp = domain.vocab_size_padded();
        let md = domain.max_draft_tokens();
        tracing::debug!(
            max_batch_size = max_batch,
            vocab_size = domain.vocab_size(),
            max_draft_tokens = md,
            "external draft tokens layer created"
        );

        Ok(Self {
            domain,
            runtime: SamplingRuntime::new(domain),
            target_logits: vec![0.0; max_batch * vp],
            target_probs: vec![0.0; max_batch * vp],
            draft_probs: vec![0.0; max_batch * md * vp],
            draft_probs_ready: vec![false; max_batch],
            candidates: vec![UNSELECTED; max_batch * vp],
            candidate_mask: vec![false; max_batch * vp],
            multinomial_top_p: vec![1.0; max_batch],
            is_accepted: vec![false; max_batch],
            target_output_ids: vec![0; max_batch],
            active: vec![false; max_batch],
            stage_skip: vec![true; max_batch],
        })
    }

    fn forward_layout(domain: &DecoderDomain) -> WorkspaceLayout {
        WorkspaceLayout::new()
            .push::<f32>(domain.max_batch_size() * domain.vocab_size_padded())
            .push::<u32>(domain.vocab_size())
            .push::<u32>(TOP_K_MAX.min(domain.vocab_size()))
    }

    /// Scratch required by `setup` and `forward`, whichever is larger.
    pub fn workspace_layout(&self) -> WorkspaceLayout {
        SamplingRuntime::<R>::setup_layout(&self.domain).max(Self::forward_layout(&self.domain))
    }

    pub fn runtime(&self) -> &SamplingRuntime<R> {
        &self.runtime
    }

    /// Whether the last step accepted the slot's draft token.
    pub fn is_accepted(&self, slot: usize) -> bool {
        self.is_accepted[slot]
    }

    /// Token committed for a rejected slot in the last step: the most
    /// probable candidate, replaced by the bonus draw when one was made.
    pub fn target_output_id(&self, slot: usize) -> TokenId {
        self.target_output_ids[slot]
    }

    /// Candidate set of a slot from the last step, most probable first.
    pub fn candidates(&self, slot: usize) -> &[TokenId] {
        let vp = self.domain.vocab_size_padded();
        let row = &self.candidates[slot * vp..(slot + 1) * vp];
        let len = row.iter().position(|&id| id == UNSELECTED).unwrap_or(vp);
        &row[..len]
    }

    /// Target probabilities of dense batch row `index` from the last step.
    pub fn target_probs(&self, index: usize) -> &[f32] {
        let vp = self.domain.vocab_size_padded();
        &self.target_probs[index * vp..(index + 1) * vp]
    }

    fn validate<T>(
        &self,
        outputs: &DecodingOutputs<'_>,
        inputs: &ExternalDraftTokensInputs<'_, T>,
    ) -> Result<(), DecodingError> {
        let max_batch = self.domain.max_batch_size();
        let vp = self.domain.vocab_size_padded();
        let md = self.domain.max_draft_tokens();

        self.domain.check_batch_slots(inputs.batch_slots)?;
        outputs.check_shape(&self.domain)?;
        expect_len("logits", inputs.logits.len(), inputs.batch_slots.len() * vp)?;
        if let Some(bias) = inputs.bias {
            expect_len("bias", bias.len(), vp)?;
        }
        expect_len("end_ids", inputs.end_ids.len(), max_batch)?;
        expect_len("draft_token_ids", inputs.draft_token_ids.len(), max_batch * md)?;
        expect_len("num_draft_tokens", inputs.num_draft_tokens.len(), max_batch)?;
        expect_len("use_draft_logits", inputs.use_draft_logits.len(), max_batch)?;
        if let Some(draft_logits) = inputs.draft_logits {
            expect_len("draft_logits", draft_logits.len(), max_batch * md * vp)?;
        }
        if inputs.step > md {
            return Err(DecodingError::invalid_argument(format!(
                "step {} exceeds max draft tokens {md}",
                inputs.step
            )));
        }
        Ok(())
    }

    /// Checks that depend on which slots take part in the step.
    fn validate_active<T>(
        &self,
        inputs: &ExternalDraftTokensInputs<'_, T>,
    ) -> Result<(), DecodingError> {
        let md = self.domain.max_draft_tokens();
        let step = inputs.step;
        for &slot in inputs.batch_slots {
            if !self.active[slot] {
                continue;
            }
            let num_draft = inputs.num_draft_tokens[slot];
            if num_draft > md {
                return Err(DecodingError::invalid_argument(format!(
                    "slot {slot} has {num_draft} draft tokens, max is {md}"
                )));
            }
            if step >= num_draft {
                continue;
            }
            let token = inputs.draft_token_ids[slot * md + step];
            if token as usize >= self.domain.vocab_size() {
                return Err(DecodingError::invalid_argument(format!(
                    "draft token {token} of slot {slot} is outside the vocabulary"
                )));
            }
            if inputs.use_draft_logits[slot] {
                if step == 0 && inputs.draft_logits.is_none() {
                    return Err(DecodingError::invalid_argument(format!(
                        "slot {slot} uses draft logits but none were supplied at step 0"
                    )));
                }
                if step > 0 && !self.draft_probs_ready[slot] {
                    return Err(DecodingError::invalid_argument(format!(
                        "draft probabilities of slot {slot} were never computed"
                    )));
                }
            }
        }
        Ok(())
    }

    fn forward_step<T: Logit>(
        &mut self,
        outputs: &mut DecodingOutputs<'_>,
        inputs: &ExternalDraftTokensInputs<'_, T>,
        workspace: &mut Workspace,
    ) -> Result<AcceptanceCounts, DecodingError> {
        workspace.reset();
        self.validate(outputs, inputs)?;
        let active = outputs.snapshot_active(&self.domain, inputs.batch_slots, &mut self.active)?;
        self.validate_active(inputs)?;
        if inputs.step == 0 {
            // A new draft cycle: probabilities of the previous one are stale
            // for every slot in the batch, active or not.
            for &slot in inputs.batch_slots {
                self.draft_probs_ready[slot] = false;
            }
        }
        if active == 0 {
            tracing::trace!("no active sequences");
            return Ok(AcceptanceCounts::default());
        }

        let workspace = &*workspace;
        let mut runtime_probs = workspace
            .carve::<f32>(inputs.batch_slots.len() * self.domain.vocab_size_padded())?;
        let mut order = workspace.carve::<u32>(self.domain.vocab_size())?;

        self.prepare_logits(inputs, &mut runtime_probs);
        self.generate_candidates(inputs.batch_slots, &runtime_probs, &mut order, workspace)?;
        let counts = self.test_acceptance(inputs, &runtime_probs, outputs.finished);
        let bonus = self.sample_bonus_tokens(inputs.batch_slots, &mut order)?;
        let commits = self.commit_tokens(inputs, outputs);

        telemetry::record_acceptance(&counts);
        telemetry::record_bonus_tokens(bonus);
        telemetry::record_commit(&commits);
        Ok(counts)
    }

    /// Copy the biased target logits into the layer and their softmax into
    /// `runtime_probs`. The masked logits and target probabilities derive
    /// from the same biased rows.
    fn prepare_logits<T: Logit>(
        &mut self,
        inputs: &ExternalDraftTokensInputs<'_, T>,
        runtime_probs: &mut [f32],
    ) {
        tracing::trace!(stage = "prepare_logits", "start");
        let vs = self.domain.vocab_size();
        let vp = self.domain.vocab_size_padded();
        let batch_slots = inputs.batch_slots;
        let n = runtime_probs.len();
        for (dst, &src) in self.target_logits[..n].iter_mut().zip(inputs.logits) {
            *dst = src.to_f32();
        }
        if let Some(bias) = inputs.bias {
            for (index, &slot) in batch_slots.iter().enumerate() {
                if !self.active[slot] {
                    continue;
                }
                let row = &mut self.target_logits[index * vp..index * vp + vs];
                for (v, b) in row.iter_mut().zip(bias) {
                    *v += *b;
                }
            }
        }
        runtime_probs.copy_from_slice(&self.target_logits[..n]);

        let active = &self.active;
        add_bias_softmax(runtime_probs, None, vs, vp, |row| active[batch_slots[row]]);
        tracing::trace!(stage = "prepare_logits", "stop");
    }

    fn generate_candidates(
        &mut self,
        batch_slots: &[usize],
        runtime_probs: &[f32],
        order: &mut [u32],
        workspace: &Workspace,
    ) -> Result<(), DecodingError> {
        let vs = self.domain.vocab_size();
        let vp = self.domain.vocab_size_padded();
        for &slot in batch_slots {
            if self.active[slot] {
                self.candidates[slot * vp..(slot + 1) * vp].fill(UNSELECTED);
            }
        }

        if !all_of_batch_slots(batch_slots, self.runtime.skip_top_k.host(), true) {
            tracing::trace!(stage = "top_k", "start");
            let active = &self.active;
            let skip_top_k = self.runtime.skip_top_k.host();
            let max_top_k = max_of_batch_slots(batch_slots, self.runtime.top_k.host(), |slot| {
                active[slot] && !skip_top_k[slot]
            })
            .min(vs);
            let mut kept = workspace.carve::<u32>(max_top_k)?;
            for &slot in batch_slots {
                self.stage_skip[slot] =
                    !self.active[slot] || self.runtime.skip_top_k.device()[slot];
            }
            let params = TopKParams {
                logits: runtime_probs,
                logits_has_probs: true,
                top_ks: self.runtime.top_k.device(),
                top_ps: &self.runtime.top_p,
                max_top_k,
                skip_decode: &self.stage_skip,
                batch_slots,
                vocab_size: vs,
                vocab_size_padded: vp,
            };
            let mut selection: Selection<'_, R> = Selection::ReturnAll(&mut self.candidates);
            batch_top_k(&params, &mut kept, &mut [], &mut selection)?;
            tracing::trace!(stage = "top_k", "stop");
        }

        if !all_of_batch_slots(batch_slots, self.runtime.skip_top_p.host(), true) {
            tracing::trace!(stage = "top_p", "start");
            for &slot in batch_slots {
                self.stage_skip[slot] =
                    !self.active[slot] || self.runtime.skip_top_p.device()[slot];
            }
            let params = TopPParams {
                probs: runtime_probs,
                top_ps: &self.runtime.top_p,
                skip_decode: &self.stage_skip,
                batch_slots,
                vocab_size: vs,
                vocab_size_padded: vp,
            };
            let mut selection: Selection<'_, R> = Selection::ReturnAll(&mut self.candidates);
            batch_top_p(&params, order, &mut selection)?;
            tracing::trace!(stage = "top_p", "stop");
        }
        Ok(())
    }

    fn test_acceptance<T: Logit>(
        &mut self,
        inputs: &ExternalDraftTokensInputs<'_, T>,
        runtime_probs: &[f32],
        finished: &mut [FinishedState],
    ) -> AcceptanceCounts {
        tracing::trace!(stage = "accept", "start");
        let batch_slots = inputs.batch_slots;
        let vs = self.domain.vocab_size();
        let vp = self.domain.vocab_size_padded();

        let mask = MaskParams {
            batch_slots,
            active: &self.active,
            vocab_size: vs,
            vocab_size_padded: vp,
            candidates: &self.candidates,
            runtime_probs,
        };
        mask_target_logits(
            &mask,
            &mut self.candidate_mask,
            &mut self.target_logits,
            &mut self.target_output_ids,
        );

        if inputs.step == 0 {
            self.compute_draft_probs(inputs);
        }

        let n = batch_slots.len() * vp;
        self.target_probs[..n].copy_from_slice(&self.target_logits[..n]);
        let active = &self.active;
        add_bias_softmax(&mut self.target_probs[..n], None, vs, vp, |row| active[batch_slots[row]]);

        let params = AcceptParams {
            batch_slots,
            active: &self.active,
            step: inputs.step,
            max_draft_tokens: self.domain.max_draft_tokens(),
            vocab_size_padded: vp,
            draft_probs: &self.draft_probs,
            target_probs: &self.target_probs,
            draft_token_ids: inputs.draft_token_ids,
            num_draft_tokens: inputs.num_draft_tokens,
            use_draft_logits: inputs.use_draft_logits,
            target_output_ids: &self.target_output_ids,
            threshold: inputs.acceptance,
        };
        let counts = accept_draft_tokens(
            &params,
            &mut self.runtime.generators,
            &mut self.is_accepted,
            finished,
        );
        tracing::trace!(
            stage = "accept",
            accepted = counts.accepted,
            rejected = counts.rejected,
            "stop"
        );
        counts
    }

    /// Softmax the draft logits of every active slot. Only runs at step 0.
    fn compute_draft_probs<T: Logit>(&mut self, inputs: &ExternalDraftTokensInputs<'_, T>) {
        let md = self.domain.max_draft_tokens();
        let vp = self.domain.vocab_size_padded();
        let row_len = md * vp;

        let Some(draft_logits) = inputs.draft_logits else {
            return;
        };

        for &slot in inputs.batch_slots {
            if !self.active[slot] {
                continue;
            }
            let range = slot * row_len..(slot + 1) * row_len;
            let dst = &mut self.draft_probs[range.clone()];
            for (dst, &src) in dst.iter_mut().zip(&draft_logits[range]) {
                *dst = src.to_f32();
            }
            self.draft_probs_ready[slot] = true;
        }

        let active = &self.active;
        add_bias_softmax(
            &mut self.draft_probs,
            None,
            self.domain.vocab_size(),
            vp,
            |row| active[row / md],
        );
    }

    /// Draw a replacement token for every active slot whose draft was not
    /// accepted. Accepted slots make no draw.
    fn sample_bonus_tokens(
        &mut self,
        batch_slots: &[usize],
        order: &mut [u32],
    ) -> Result<u64, DecodingError> {
        let mut bonus = 0u64;
        for &slot in batch_slots {
            let skip = !self.active[slot] || self.is_accepted[slot];
            self.stage_skip[slot] = skip;
            if !skip {
                bonus += 1;
            }
        }
        if bonus == 0 {
            return Ok(0);
        }

        tracing::trace!(stage = "bonus", sequences = bonus, "start");
        let params = TopPParams {
            probs: &self.target_probs,
            top_ps: &self.multinomial_top_p,
            skip_decode: &self.stage_skip,
            batch_slots,
            vocab_size: self.domain.vocab_size(),
            vocab_size_padded: self.domain.vocab_size_padded(),
        };
        let mut selection = Selection::Sample {
            tokens: &mut self.target_output_ids,
            generators: &mut self.runtime.generators,
        };
        batch_top_p(&params, order, &mut selection)?;
        tracing::trace!(stage = "bonus", "stop");
        Ok(bonus)
    }

    fn commit_tokens<T>(
        &self,
        inputs: &ExternalDraftTokensInputs<'_, T>,
        outputs: &mut DecodingOutputs<'_>,
    ) -> CommitCounts {
        let params = CommitParams {
            batch_slots: inputs.batch_slots,
            active: &self.active,
            is_accepted: &self.is_accepted,
            step: inputs.step,
            max_draft_tokens: self.domain.max_draft_tokens(),
            draft_token_ids: inputs.draft_token_ids,
            target_output_ids: &self.target_output_ids,
            end_ids: inputs.end_ids,
            max_seq_len: self.domain.max_seq_len(),
        };
        forward_accepted_tokens(&params, outputs)
    }
}

impl<R: RngCore + SeedableRng> DecodingLayer for ExternalDraftTokensLayer<R> {
    fn setup(
        &mut self,
        batch_slots: &[usize],
        params: &SetupParams,
        workspace: &mut Workspace,
    ) -> Result<(), DecodingError> {
        let SetupParams::ExternalDraftTokens(sampling) = params else {
            return Err(DecodingError::invalid_argument(format!(
                "external draft tokens layer cannot be set up with {} parameters",
                params.variant_name()
            )));
        };
        workspace.reset();
        self.runtime.setup(batch_slots, sampling, workspace)?;
        for &slot in batch_slots {
            self.multinomial_top_p[slot] = 1.0;
            self.draft_probs_ready[slot] = false;
            self.is_accepted[slot] = false;
        }
        Ok(())
    }

    fn forward<T: Logit>(
        &mut self,
        outputs: &mut DecodingOutputs<'_>,
        inputs: &DecodingInputs<'_, T>,
        workspace: &mut Workspace,
    ) -> Result<(), DecodingError> {
        let DecodingInputs::ExternalDraftTokens(inputs) = inputs else {
            return Err(DecodingError::invalid_argument(format!(
                "external draft tokens layer cannot run {} inputs",
                inputs.variant_name()
            )));
        };

        let span = StepSpan::new("external_draft_tokens", inputs.batch_slots.len(), inputs.step);
        let _guard = span.enter();
        let result = self.forward_step(outputs, inputs, workspace);
        if let Ok(counts) = &result {
            span.record("accepted", counts.accepted);
            span.record("rejected", counts.rejected);
        }
        span.record_result(&result);
        if result.is_err() {
            telemetry::record_step_failure("external_draft_tokens");
        }
        result.map(|_| ())
    }

    fn workspace_size(&self) -> usize {
        self.workspace_layout().size_bytes()
    }

    fn domain(&self) -> &DecoderDomain {
        &self.domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{AcceptanceThreshold, SamplingSetupParams, SequenceBuffers, StandardInputs};

    fn domain() -> DecoderDomain {
        DecoderDomain::new(2, 4, 8, 2, 6).unwrap()
    }

    fn draft_layer() -> ExternalDraftTokensLayer {
        ExternalDraftTokensLayer::new(DecodingMode::ExternalDraftTokens, domain()).unwrap()
    }

    #[test]
    fn test_beam_search_rejected() {
        let mode = DecodingMode::BeamSearch { beam_width: 4 };
        let err = ExternalDraftTokensLayer::new(mode, domain()).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_wrong_mode_rejected() {
        let err = ExternalDraftTokensLayer::new(DecodingMode::TopKTopP, domain()).unwrap_err();
        assert!(matches!(err, DecodingError::UnsupportedMode(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_workspace_covers_setup_and_forward() {
        let layer = draft_layer();
        let setup = SamplingRuntime::<StdRng>::setup_layout(layer.domain()).size_bytes();
        assert!(layer.workspace_size() >= setup);
        // Runtime probabilities alone need a full padded row per slot.
        assert!(layer.workspace_size() >= 2 * 8 * 4);
    }

    #[test]
    fn test_standard_variants_rejected() {
        let mut layer = draft_layer();
        let mut workspace = Workspace::new(layer.workspace_size());
        let setup = SetupParams::Standard(SamplingSetupParams::default());
        assert!(layer.setup(&[0], &setup, &mut workspace).is_err());

        let mut buffers = SequenceBuffers::for_domain(layer.domain());
        let logits = vec![0.0f32; 8];
        let inputs = DecodingInputs::Standard(StandardInputs {
            logits: &logits,
            bias: None,
            batch_slots: &[0],
            end_ids: &[0, 0],
        });
        let err = layer.forward(&mut buffers.as_outputs(), &inputs, &mut workspace).unwrap_err();
        assert!(matches!(err, DecodingError::InvalidArgument(_)));
    }

    #[test]
    fn test_draft_logits_required_at_step_zero() {
        let mut layer = draft_layer();
        let mut workspace = Workspace::new(layer.workspace_size());
        let setup = SetupParams::ExternalDraftTokens(SamplingSetupParams::default());
        layer.setup(&[0], &setup, &mut workspace).unwrap();

        let mut buffers = SequenceBuffers::for_domain(layer.domain());
        let logits = vec![0.0f32; 8];
        let inputs = DecodingInputs::ExternalDraftTokens(ExternalDraftTokensInputs {
            logits: &logits,
            bias: None,
            batch_slots: &[0],
            end_ids: &[3, 3],
            draft_logits: None,
            draft_token_ids: &[1, 1, 0, 0],
            num_draft_tokens: &[2, 0],
            use_draft_logits: &[true, false],
            step: 0,
            acceptance: AcceptanceThreshold::Random,
        });
        let err = layer.forward(&mut buffers.as_outputs(), &inputs, &mut workspace).unwrap_err();
        assert!(err.to_string().contains("draft logits"));
        assert!(buffers.tokens(0).is_empty());
    }
}
