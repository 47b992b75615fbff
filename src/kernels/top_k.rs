//! Top-k candidate selection.

use rand::{RngCore, SeedableRng};

use super::select::{rank_key, nucleus_len, Selection};
use super::softmax::softmax_row;
use crate::layers::DecodingError;

/// Inputs of [`batch_top_k`].
#[derive(Debug, Clone, Copy)]
pub struct TopKParams<'a> {
    /// Dense rows, `vocab_size_padded` wide.
    pub logits: &'a [f32],
    /// Rows already hold probabilities. Otherwise each row is run through
    /// softmax before selection.
    pub logits_has_probs: bool,
    /// Slot-indexed k.
    pub top_ks: &'a [usize],
    /// Slot-indexed nucleus applied inside the top-k set; 1.0 disables it.
    pub top_ps: &'a [f32],
    /// Largest k over the rows that run, capped at `vocab_size`; sizes the
    /// ranking scratch.
    pub max_top_k: usize,
    /// Slot-indexed; rows whose flag is set are not touched.
    pub skip_decode: &'a [bool],
    pub batch_slots: &'a [usize],
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
}

/// Select the `k` most probable ids of every non-skipped row.
///
/// `kept` needs `max_top_k` entries and `row_scratch` one padded row when
/// `logits_has_probs` is false. Ties at the k-th probability go to the lower
/// id. If the slot's top-p is below 1 the survivors are trimmed to the
/// shortest prefix holding `top_p` of their mass.
pub fn batch_top_k<R: RngCore + SeedableRng>(
    params: &TopKParams<'_>,
    kept: &mut [u32],
    row_scratch: &mut [f32],
    selection: &mut Selection<'_, R>,
) -> Result<(), DecodingError> {
    let vp = params.vocab_size_padded;
    if kept.len() < params.max_top_k {
        return Err(DecodingError::Execution {
            stage: "top_k",
            reason: format!("ranking scratch holds {} ids, need {}", kept.len(), params.max_top_k),
        });
    }
    if !params.logits_has_probs && row_scratch.len() < vp {
        return Err(DecodingError::Execution {
            stage: "top_k",
            reason: format!("row scratch holds {} values, need {vp}", row_scratch.len()),
        });
    }

    for (index, &slot) in params.batch_slots.iter().enumerate() {
        if params.skip_decode[slot] {
            continue;
        }
        let k = params.top_ks[slot].min(params.vocab_size);
        if k > params.max_top_k {
            return Err(DecodingError::Execution {
                stage: "top_k",
                reason: format!(
                    "slot {slot} asks for k = {k} above batch maximum {}",
                    params.max_top_k
                ),
            });
        }

        let logits = &params.logits[index * vp..(index + 1) * vp];
        let probs: &[f32] = if params.logits_has_probs {
            logits
        } else {
            let row = &mut row_scratch[..vp];
            row.copy_from_slice(logits);
            softmax_row(row, None, params.vocab_size);
            row
        };

        let n = rank_top_k(probs, params.vocab_size, &mut kept[..k]);
        let ids = &kept[..n];
        let prob = |id: u32| rank_key(probs[id as usize]).max(0.0);
        let kept_mass: f32 = ids.iter().map(|&id| prob(id)).sum();

        let top_p = params.top_ps[slot];
        let (len, mass) = if top_p < 1.0 {
            nucleus_len(ids, prob, top_p * kept_mass)
        } else {
            (n, kept_mass)
        };
        selection.emit(slot, vp, &ids[..len], prob, mass);
    }
    Ok(())
}

/// Fill `kept` with the ids of the `kept.len()` most probable entries,
/// sorted most probable first. Returns how many were written.
///
/// Ids are scanned in ascending order and an id only displaces a held one
/// when strictly more probable, so ties keep the lower id.
fn rank_top_k(probs: &[f32], vocab_size: usize, kept: &mut [u32]) -> usize {
    let k = kept.len().min(vocab_size);
    if k == 0 {
        return 0;
    }
    let mut n = 0usize;
    for id in 0..vocab_size as u32 {
        let key = rank_key(probs[id as usize]);
        if n == k {
            let worst = rank_key(probs[kept[k - 1] as usize]);
            if key <= worst {
                continue;
            }
            n -= 1;
        }
        let pos = kept[..n].partition_point(|&other| rank_key(probs[other as usize]) >= key);
        kept.copy_within(pos..n, pos + 1);
        kept[pos] = id;
        n += 1;
    }
    n
}
