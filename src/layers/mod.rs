//! Decoding layers and the types they share.
//!
//! A layer is built once for a [`DecoderDomain`], configured per batch with
//! `setup` and run once per decoding step with `forward`. Per-sequence state
//! lives in slot-indexed buffers sized for the maximum batch; the batch-slot
//! mapping ties the dense rows of a step to those slots.

mod domain;
mod error;
mod external_draft;
pub mod finished;
mod logit;
mod params;
mod random;
mod runtime;
mod sampling;

pub use domain::{
    all_of_batch_slots, max_of_batch_slots, DecoderDomain, TokenId, TOP_K_MAX, UNSELECTED,
};
pub use error::DecodingError;
pub use external_draft::ExternalDraftTokensLayer;
pub use finished::{reset_skip_decoding, FinishedState};
pub use logit::Logit;
pub use params::{
    AcceptanceThreshold, DecodingInputs, DecodingMode, DecodingOutputs, ExternalDraftTokensInputs,
    OutputIds, SamplingSetupParams, SequenceBuffers, SetupParams, StandardInputs,
};
pub use random::GeneratorStates;
pub use runtime::SamplingRuntime;
pub use sampling::SamplingLayer;

use crate::memory::Workspace;

/// A stage of the decoder that turns one step of logits into tokens.
pub trait DecodingLayer {
    /// Configure the slots in `batch_slots` for the coming steps.
    fn setup(
        &mut self,
        batch_slots: &[usize],
        params: &SetupParams,
        workspace: &mut Workspace,
    ) -> Result<(), DecodingError>;

    /// Run one decoding step. Nothing in `outputs` may be relied on after an
    /// error.
    fn forward<T: Logit>(
        &mut self,
        outputs: &mut DecodingOutputs<'_>,
        inputs: &DecodingInputs<'_, T>,
        workspace: &mut Workspace,
    ) -> Result<(), DecodingError>;

    /// Bytes of scratch `setup` and `forward` need.
    fn workspace_size(&self) -> usize;

    fn domain(&self) -> &DecoderDomain;
}
