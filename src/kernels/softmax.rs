//! Bias-add and softmax over padded vocabulary rows.

use rayon::prelude::*;

/// Softmax one row in place.
///
/// Ids at or past `vocab_size` end with probability 0. A row without any
/// finite logit becomes all zeros instead of NaN; NaN logits count as -inf.
pub fn softmax_row(row: &mut [f32], bias: Option<&[f32]>, vocab_size: usize) {
    let (valid, padded) = row.split_at_mut(vocab_size.min(row.len()));
    padded.fill(0.0);

    if let Some(bias) = bias {
        for (v, b) in valid.iter_mut().zip(bias) {
            *v += *b;
        }
    }

    let max = valid
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);

    if max == f32::NEG_INFINITY {
        valid.fill(0.0);
        return;
    }

    let mut sum = 0.0f32;
    for v in valid.iter_mut() {
        *v = if max == f32::INFINITY {
            // Only the infinite entries share the mass.
            if *v == f32::INFINITY { 1.0 } else { 0.0 }
        } else if v.is_nan() {
            0.0
        } else {
            (*v - max).exp()
        };
        sum += *v;
    }

    let inv = 1.0 / sum;
    for v in valid.iter_mut() {
        *v *= inv;
    }
}

/// Softmax every row of `rows` (each `vocab_size_padded` wide) for which
/// `active(row_index)` holds. Other rows are left as they are.
pub fn add_bias_softmax<F>(
    rows: &mut [f32],
    bias: Option<&[f32]>,
    vocab_size: usize,
    vocab_size_padded: usize,
    active: F,
) where
    F: Fn(usize) -> bool + Sync,
{
    rows.par_chunks_mut(vocab_size_padded)
        .enumerate()
        .for_each(|(row_index, row)| {
            if active(row_index) {
                softmax_row(row, bias, vocab_size);
            }
        });
}
