//! Plain top-k / top-p sampling of one token per sequence and step.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::domain::{all_of_batch_slots, expect_len, max_of_batch_slots};
use super::params::check_mode;
use super::{
    DecoderDomain, DecodingError, DecodingInputs, DecodingLayer, DecodingMode, DecodingOutputs,
    Logit, SamplingRuntime, SetupParams, StandardInputs, TokenId, TOP_K_MAX,
};
use crate::kernels::select::argmax;
use crate::kernels::{
    add_bias_softmax, batch_top_k, batch_top_p, forward_accepted_tokens, CommitParams, Selection,
    TopKParams, TopPParams,
};
use crate::memory::{Workspace, WorkspaceLayout};
use crate::telemetry::{self, SpanExt, StepSpan};

/// Decoding layer sampling each sequence under its own top-k or top-p.
///
/// Sequences with `top_k > 0` sample from their top-k set (trimmed by top-p
/// when below 1); the rest sample from their nucleus.
#[derive(Debug)]
pub struct SamplingLayer<R = StdRng> {
    domain: DecoderDomain,
    runtime: SamplingRuntime<R>,
    sampled: Vec<TokenId>,
    active: Vec<bool>,
    stage_skip: Vec<bool>,
    /// Nothing is drafted, so the commit never forwards a draft token.
    not_accepted: Vec<bool>,
}

impl SamplingLayer {
    pub fn new(mode: DecodingMode, domain: DecoderDomain) -> Result<Self, DecodingError> {
        Self::with_generator(mode, domain)
    }
}

impl<R: RngCore + SeedableRng> SamplingLayer<R> {
    pub fn with_generator(
        mode: DecodingMode,
        domain: DecoderDomain,
    ) -> Result<Self, DecodingError> {
        check_mode(mode, DecodingMode::TopKTopP)?;
        let max_batch = domain.max_batch_size();
        Ok(Self {
            domain,
            runtime: SamplingRuntime::new(domain),
            sampled: vec![0; max_batch],
            active: vec![false; max_batch],
            stage_skip: vec![true; max_batch],
            not_accepted: vec![false; max_batch],
        })
    }

    fn forward_layout(domain: &DecoderDomain) -> WorkspaceLayout {
        let vp = domain.vocab_size_padded();
        WorkspaceLayout::new()
            .push::<f32>(domain.max_batch_size() * vp)
            .push::<f32>(vp)
            .push::<u32>(domain.vocab_size())
            .push::<u32>(TOP_K_MAX.min(domain.vocab_size()))
    }

    pub fn workspace_layout(&self) -> WorkspaceLayout {
        SamplingRuntime::<R>::setup_layout(&self.domain).max(Self::forward_layout(&self.domain))
    }

    pub fn runtime(&self) -> &SamplingRuntime<R> {
        &self.runtime
    }

    fn validate<T>(
        &self,
        outputs: &DecodingOutputs<'_>,
        inputs: &StandardInputs<'_, T>,
    ) -> Result<(), DecodingError> {
        let vp = self.domain.vocab_size_padded();
        self.domain.check_batch_slots(inputs.batch_slots)?;
        outputs.check_shape(&self.domain)?;
        expect_len("logits", inputs.logits.len(), inputs.batch_slots.len() * vp)?;
        if let Some(bias) = inputs.bias {
            expect_len("bias", bias.len(), vp)?;
        }
        expect_len("end_ids", inputs.end_ids.len(), self.domain.max_batch_size())
    }

    fn forward_step<T: Logit>(
        &mut self,
        outputs: &mut DecodingOutputs<'_>,
        inputs: &StandardInputs<'_, T>,
        workspace: &mut Workspace,
    ) -> Result<(), DecodingError> {
        workspace.reset();
        self.validate(outputs, inputs)?;
        if outputs.snapshot_active(&self.domain, inputs.batch_slots, &mut self.active)? == 0 {
            return Ok(());
        }

        let vs = self.domain.vocab_size();
        let vp = self.domain.vocab_size_padded();
        let batch_slots = inputs.batch_slots;
        let workspace = &*workspace;
        let mut rows = workspace.carve::<f32>(batch_slots.len() * vp)?;
        let mut row_scratch = workspace.carve::<f32>(vp)?;
        let mut order = workspace.carve::<u32>(vs)?;

        // Raw logits plus bias; the top-k kernel normalizes its own rows.
        for (index, &slot) in batch_slots.iter().enumerate() {
            let row = &mut rows[index * vp..(index + 1) * vp];
            for (dst, &src) in row.iter_mut().zip(&inputs.logits[index * vp..(index + 1) * vp]) {
                *dst = src.to_f32();
            }
            if let Some(bias) = inputs.bias {
                for (v, b) in row[..vs].iter_mut().zip(bias) {
                    *v += *b;
                }
            }
            if self.active[slot] {
                self.sampled[slot] = argmax(row, vs);
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
                logits: &rows,
                logits_has_probs: false,
                top_ks: self.runtime.top_k.device(),
                top_ps: &self.runtime.top_p,
                max_top_k,
                skip_decode: &self.stage_skip,
                batch_slots,
                vocab_size: vs,
                vocab_size_padded: vp,
            };
            let mut selection = Selection::Sample {
                tokens: &mut self.sampled,
                generators: &mut self.runtime.generators,
            };
            batch_top_k(&params, &mut kept, &mut row_scratch, &mut selection)?;
            tracing::trace!(stage = "top_k", "stop");
        }

        if !all_of_batch_slots(batch_slots, self.runtime.skip_top_p.host(), true) {
            tracing::trace!(stage = "top_p", "start");
            for &slot in batch_slots {
                self.stage_skip[slot] =
                    !self.active[slot] || self.runtime.skip_top_p.device()[slot];
            }
            let stage_skip = &self.stage_skip;
            add_bias_softmax(&mut rows, None, vs, vp, |row| !stage_skip[batch_slots[row]]);
            let params = TopPParams {
                probs: &rows,
                top_ps: &self.runtime.top_p,
                skip_decode: &self.stage_skip,
                batch_slots,
                vocab_size: vs,
                vocab_size_padded: vp,
            };
            let mut selection = Selection::Sample {
                tokens: &mut self.sampled,
                generators: &mut self.runtime.generators,
            };
            batch_top_p(&params, &mut order, &mut selection)?;
            tracing::trace!(stage = "top_p", "stop");
        }

        let params = CommitParams {
            batch_slots,
            active: &self.active,
            is_accepted: &self.not_accepted,
            step: 0,
            max_draft_tokens: 0,
            draft_token_ids: &[],
            target_output_ids: &self.sampled,
            end_ids: inputs.end_ids,
            max_seq_len: self.domain.max_seq_len(),
        };
        let commits = forward_accepted_tokens(&params, outputs);
        telemetry::record_commit(&commits);
        Ok(())
    }
}

impl<R: RngCore + SeedableRng> DecodingLayer for SamplingLayer<R> {
    fn setup(
        &mut self,
        batch_slots: &[usize],
        params: &SetupParams,
        workspace: &mut Workspace,
    ) -> Result<(), DecodingError> {
        let SetupParams::Standard(sampling) = params else {
            return Err(DecodingError::invalid_argument(format!(
                "sampling layer cannot be set up with {} parameters",
                params.variant_name()
            )));
        };
        workspace.reset();
        self.runtime.setup(batch_slots, sampling, workspace)
    }

    fn forward<T: Logit>(
        &mut self,
        outputs: &mut DecodingOutputs<'_>,
        inputs: &DecodingInputs<'_, T>,
        workspace: &mut Workspace,
    ) -> Result<(), DecodingError> {
        let DecodingInputs::Standard(inputs) = inputs else {
            return Err(DecodingError::invalid_argument(format!(
                "sampling layer cannot run {} inputs",
                inputs.variant_name()
            )));
        };
        let span = StepSpan::new("sampling", inputs.batch_slots.len(), 0);
        let _guard = span.enter();
        let result = self.forward_step(outputs, inputs, workspace);
        span.record_result(&result);
        if result.is_err() {
            telemetry::record_step_failure("sampling");
        }
        result
    }

    fn workspace_size(&self) -> usize {
        self.workspace_layout().size_bytes()
    }

    fn domain(&self) -> &DecoderDomain {
        &self.domain
    }
}
