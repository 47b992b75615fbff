//! Ranking and drawing helpers shared by the candidate kernels.

use std::cmp::Ordering;

use rand::{RngCore, SeedableRng};

use crate::layers::{GeneratorStates, TokenId, UNSELECTED};

/// Where a candidate kernel writes its result.
pub enum Selection<'a, R> {
    /// Write every surviving id, most probable first, into the slot's
    /// `vocab_size_padded`-wide row and fill the rest with [`UNSELECTED`].
    ReturnAll(&'a mut [TokenId]),
    /// Draw one surviving id per slot with the slot's generator and store it
    /// in `tokens[slot]`. Rows without probability mass draw nothing.
    Sample {
        tokens: &'a mut [TokenId],
        generators: &'a mut GeneratorStates<R>,
    },
}

impl<R: RngCore + SeedableRng> Selection<'_, R> {
    /// Emit the ranked survivors `ids` of one slot. `mass` is their total
    /// probability.
    pub(crate) fn emit<F>(
        &mut self,
        slot: usize,
        vocab_size_padded: usize,
        ids: &[u32],
        prob: F,
        mass: f32,
    ) where
        F: Fn(u32) -> f32,
    {
        match self {
            Self::ReturnAll(rows) => {
                let row = &mut rows[slot * vocab_size_padded..(slot + 1) * vocab_size_padded];
                row[..ids.len()].copy_from_slice(ids);
                row[ids.len()..].fill(UNSELECTED);
            }
            Self::Sample { tokens, generators } => {
                if ids.is_empty() || !(mass > 0.0) {
                    return;
                }
                let u = generators.uniform(slot);
                if let Some(token) = draw(ids, prob, mass, u) {
                    tokens[slot] = token;
                }
            }
        }
    }
}

/// Ranking key: NaN ranks like -inf.
#[inline]
pub(crate) fn rank_key(p: f32) -> f32 {
    if p.is_nan() {
        f32::NEG_INFINITY
    } else {
        p
    }
}

/// Descending probability, ties broken by the lower id.
#[inline]
pub(crate) fn rank_order(probs: &[f32], a: u32, b: u32) -> Ordering {
    rank_key(probs[b as usize])
        .partial_cmp(&rank_key(probs[a as usize]))
        .unwrap_or(Ordering::Equal)
        .then(a.cmp(&b))
}

/// Shortest prefix of `ids` whose mass reaches `threshold`, with that mass.
///
/// At least one id is kept. When rounding keeps the running sum below the
/// threshold the whole list is kept.
pub(crate) fn nucleus_len<F>(ids: &[u32], prob: F, threshold: f32) -> (usize, f32)
where
    F: Fn(u32) -> f32,
{
    let mut cumulative = 0.0f32;
    for (i, &id) in ids.iter().enumerate() {
        cumulative += prob(id).max(0.0);
        if cumulative >= threshold {
            return (i + 1, cumulative);
        }
    }
    (ids.len(), cumulative)
}

/// Pick the id at which the running mass first exceeds `u * mass`.
fn draw<F>(ids: &[u32], prob: F, mass: f32, u: f32) -> Option<TokenId>
where
    F: Fn(u32) -> f32,
{
    let target = u * mass;
    let mut cumulative = 0.0f32;
    for &id in ids {
        cumulative += prob(id).max(0.0);
        if cumulative > target {
            return Some(id);
        }
    }
    ids.last().copied()
}

/// Most probable id among the first `vocab_size` entries, lowest id on ties.
pub(crate) fn argmax(row: &[f32], vocab_size: usize) -> TokenId {
    let mut best = 0usize;
    for id in 1..vocab_size.min(row.len()) {
        if rank_key(row[id]) > rank_key(row[best]) {
            best = id;
        }
    }
    best as TokenId
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;

    #[test]
    fn test_rank_order_breaks_ties_by_id() {
        let probs = [0.2, 0.4, 0.4, f32::NAN];
        let mut ids = vec![3u32, 2, 1, 0];
        ids.sort_by(|&a, &b| rank_order(&probs, a, b));
        assert_eq!(ids, vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_nucleus_keeps_at_least_one() {
        let probs = [0.9f32, 0.05, 0.05];
        let (len, mass) = nucleus_len(&[0, 1, 2], |id| probs[id as usize], 0.1);
        assert_eq!(len, 1);
        assert!((mass - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nucleus_tolerates_rounding() {
        let probs = [0.5f32, 0.49999];
        let (len, _) = nucleus_len(&[0, 1], |id| probs[id as usize], 1.0);
        assert_eq!(len, 2);
    }

    #[test]
    fn test_draw_walks_mass() {
        let probs = [0.25f32, 0.75];
        assert_eq!(draw(&[1, 0], |id| probs[id as usize], 1.0, 0.1), Some(1));
        assert_eq!(draw(&[1, 0], |id| probs[id as usize], 1.0, 0.9), Some(0));
    }

    #[test]
    fn test_sample_skips_zero_mass_rows() {
        let mut generators: GeneratorStates<StdRng> = GeneratorStates::new(1);
        let mut tokens = [7u32];
        let mut selection = Selection::Sample {
            tokens: &mut tokens,
            generators: &mut generators,
        };
        selection.emit(0, 2, &[0, 1], |_| 0.0, 0.0);
        drop(selection);
        assert_eq!(tokens[0], 7);
        assert_eq!(generators.draws(0), 0);
    }

    #[test]
    fn test_argmax_lowest_id_on_tie() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.9], 3), 1);
    }
}
