//! Host implementations of the batch kernels used by the decoding layers.
//!
//! Each kernel processes one independent row per active sequence. Rows are
//! addressed through the batch-slot mapping: dense rows belong to the current
//! batch, slot rows to the max-batch arena.

pub mod runtime_args;
pub mod select;
pub mod softmax;
pub mod speculative;
pub mod top_k;
pub mod top_p;

pub use runtime_args::{
    clamp_top_k, clamp_top_p, expand_match_elements, regularize_top_k_top_p,
    setup_top_k_top_p_runtime_args, Broadcast,
};
pub use select::Selection;
pub use softmax::{add_bias_softmax, softmax_row};
pub use top_k::{batch_top_k, TopKParams};
pub use top_p::{batch_top_p, TopPParams};
pub use speculative::{
    accept_draft_tokens, forward_accepted_tokens, mask_target_logits, AcceptParams,
    AcceptanceCounts, CommitCounts, CommitParams, MaskParams, PROB_EPSILON,
};
