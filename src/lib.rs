//! Speculative decoding acceptance and sampling stage.
//!
//! Given draft tokens proposed by a cheap model and target logits from the
//! full model, [`ExternalDraftTokensLayer`] decides per sequence which draft
//! tokens to accept, samples a bonus token where a draft is rejected and
//! appends the result to each sequence's output.
//!
//! # Pipeline (per step)
//!
//! - Logit preparation: copy target logits, add bias, softmax
//! - Candidates: top-k or top-p set of every sequence
//! - Acceptance: mask to the candidate set, compare draft and target
//! - Bonus sampling: multinomial draw for rejected sequences
//! - Commit: append the token, update length and finished state
//!
//! [`SamplingLayer`] reuses the same setup and kernels for plain top-k /
//! top-p sampling.

pub mod config;
pub mod kernels;
pub mod layers;
pub mod memory;
pub mod telemetry;

pub use config::{AcceptanceConfig, ConfigError, DecoderConfig};
pub use layers::{
    AcceptanceThreshold, DecoderDomain, DecodingError, DecodingInputs, DecodingLayer,
    DecodingMode, DecodingOutputs, ExternalDraftTokensInputs, ExternalDraftTokensLayer,
    FinishedState, GeneratorStates, Logit, OutputIds, SamplingLayer, SamplingSetupParams,
    SequenceBuffers, SetupParams, StandardInputs, TokenId, TOP_K_MAX, UNSELECTED,
};
pub use memory::{Workspace, WorkspaceError, WorkspaceLayout};
