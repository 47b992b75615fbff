//! Per-sequence top-k / top-p runtime arguments.

use crate::layers::{DecodingError, TOP_K_MAX};

/// A parameter supplied either once for the whole batch or per sequence.
#[derive(Debug, Clone, Copy)]
pub enum Broadcast<'a, T> {
    Scalar(T),
    PerSequence(&'a [T]),
}

impl<T: Copy> Broadcast<'_, T> {
    /// Value for dense batch position `index`.
    pub fn get(&self, index: usize) -> T {
        match self {
            Self::Scalar(value) => *value,
            Self::PerSequence(values) => values[index],
        }
    }
}

/// Clamp a requested top-k into `[0, TOP_K_MAX]`.
pub fn clamp_top_k(top_k: i32) -> usize {
    if top_k < 0 {
        tracing::warn!(top_k, "top_k below 0, clamping to 0");
        0
    } else if top_k as usize > TOP_K_MAX {
        tracing::warn!(top_k, max = TOP_K_MAX, "top_k above maximum, clamping");
        TOP_K_MAX
    } else {
        top_k as usize
    }
}

/// Clamp a requested top-p into `[0, 1]`. Non-finite values become 1.0.
pub fn clamp_top_p(top_p: f32) -> f32 {
    if !top_p.is_finite() {
        tracing::warn!(top_p, "top_p is not finite, using 1.0");
        1.0
    } else if top_p < 0.0 {
        tracing::warn!(top_p, "top_p below 0, clamping to 0");
        0.0
    } else if top_p > 1.0 {
        tracing::warn!(top_p, "top_p above 1, clamping to 1");
        1.0
    } else {
        top_p
    }
}

/// Resolve degenerate combinations after clamping.
///
/// `(0, 0)` becomes `(0, 1.0)` so sampling still happens over the full
/// distribution, and `(k, 0)` becomes `(k, 1.0)` so top-k runs untrimmed.
/// Afterwards `top_p` is always in `(0, 1]`.
pub fn regularize_top_k_top_p(top_k: usize, top_p: f32) -> (usize, f32) {
    if top_p == 0.0 {
        (top_k, 1.0)
    } else {
        (top_k, top_p)
    }
}

/// Expand top-k / top-p arrays of length 1 to `batch_size`.
///
/// Returns the common length: 1 when both are scalars, `batch_size`
/// otherwise. Any other length is an error.
pub fn expand_match_elements(
    batch_size: usize,
    top_ks: &mut Vec<i32>,
    top_ps: &mut Vec<f32>,
) -> Result<usize, DecodingError> {
    let valid = |len: usize| len == 1 || len == batch_size;
    if !valid(top_ks.len()) || !valid(top_ps.len()) {
        return Err(DecodingError::invalid_argument(format!(
            "expected top-k/top-p arrays of length 1 or batch size {batch_size}, \
             got top_k.len() = {}, top_p.len() = {}",
            top_ks.len(),
            top_ps.len()
        )));
    }
    if top_ks.len() == 1 && top_ps.len() == 1 {
        return Ok(1);
    }
    if top_ks.len() == 1 {
        let value = top_ks[0];
        top_ks.resize(batch_size, value);
    }
    if top_ps.len() == 1 {
        let value = top_ps[0];
        top_ps.resize(batch_size, value);
    }
    Ok(batch_size)
}

/// Write per-slot runtime top-k / top-p and derive the skip flags.
///
/// A sequence skips top-k when `k == 0` and skips top-p when `p == 0` or
/// top-k is active, so each sequence runs at most one candidate stage.
/// `top_ps_out` may be `None` for a host-only pass that needs only top-k.
pub fn setup_top_k_top_p_runtime_args(
    batch_slots: &[usize],
    top_ks: Broadcast<'_, usize>,
    top_ps: Broadcast<'_, f32>,
    top_ks_out: &mut [usize],
    mut top_ps_out: Option<&mut [f32]>,
    skip_top_k: &mut [bool],
    skip_top_p: &mut [bool],
) {
    for (index, &slot) in batch_slots.iter().enumerate() {
        let k = top_ks.get(index);
        let p = top_ps.get(index);
        top_ks_out[slot] = k;
        if let Some(out) = top_ps_out.as_deref_mut() {
            out[slot] = p;
        }
        skip_top_k[slot] = k == 0;
        skip_top_p[slot] = p == 0.0 || k > 0;
    }
}
