//! Top-p (nucleus) candidate selection.

use rand::{RngCore, SeedableRng};

use super::select::{nucleus_len, rank_key, rank_order, Selection};
use crate::layers::DecodingError;

/// Inputs of [`batch_top_p`].
#[derive(Debug, Clone, Copy)]
pub struct TopPParams<'a> {
    /// Dense rows of probabilities, `vocab_size_padded` wide.
    pub probs: &'a [f32],
    /// Slot-indexed nucleus mass.
    pub top_ps: &'a [f32],
    /// Slot-indexed; rows whose flag is set are not touched.
    pub skip_decode: &'a [bool],
    pub batch_slots: &'a [usize],
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
}

/// Select, per non-skipped row, the shortest most-probable-first prefix of
/// the vocabulary whose mass reaches the slot's top-p.
///
/// `order` needs `vocab_size` entries. Padded ids are never ranked. With
/// top-p = 1 and [`Selection::Sample`] this is plain multinomial sampling.
pub fn batch_top_p<R: RngCore + SeedableRng>(
    params: &TopPParams<'_>,
    order: &mut [u32],
    selection: &mut Selection<'_, R>,
) -> Result<(), DecodingError> {
    let vs = params.vocab_size;
    let vp = params.vocab_size_padded;
    if order.len() < vs {
        return Err(DecodingError::Execution {
            stage: "top_p",
            reason: format!("sort scratch holds {} ids, need {vs}", order.len()),
        });
    }
    let order = &mut order[..vs];

    for (index, &slot) in params.batch_slots.iter().enumerate() {
        if params.skip_decode[slot] {
            continue;
        }
        let probs = &params.probs[index * vp..(index + 1) * vp];
        for (i, id) in order.iter_mut().enumerate() {
            *id = i as u32;
        }
        order.sort_unstable_by(|&a, &b| rank_order(probs, a, b));

        let prob = |id: u32| rank_key(probs[id as usize]).max(0.0);
        let (len, mass) = nucleus_len(order, prob, params.top_ps[slot]);
        selection.emit(slot, vp, &order[..len], prob, mass);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{GeneratorStates, UNSELECTED};
    use rand::rngs::StdRng;

    #[test]
    fn test_small_top_p_keeps_top_token() {
        let probs = [0.9f32, 0.05, 0.05];
        let mut out = vec![0u32; 3];
        let mut order = vec![0u32; 3];
        let params = TopPParams {
            probs: &probs,
            top_ps: &[0.1],
            skip_decode: &[false],
            batch_slots: &[0],
            vocab_size: 3,
            vocab_size_padded: 3,
        };
        let mut selection: Selection<'_, StdRng> = Selection::ReturnAll(&mut out);
        batch_top_p(&params, &mut order, &mut selection).unwrap();
        assert_eq!(out, vec![0, UNSELECTED, UNSELECTED]);
    }

    #[test]
    fn test_padding_never_selected() {
        let probs = [0.3f32, 0.7, 0.0, 0.0];
        let mut out = vec![0u32; 4];
        let mut order = vec![0u32; 2];
        let params = TopPParams {
            probs: &probs,
            top_ps: &[1.0],
            skip_decode: &[false],
            batch_slots: &[0],
            vocab_size: 2,
            vocab_size_padded: 4,
        };
        let mut selection: Selection<'_, StdRng> = Selection::ReturnAll(&mut out);
        batch_top_p(&params, &mut order, &mut selection).unwrap();
        assert_eq!(out, vec![1, 0, UNSELECTED, UNSELECTED]);
    }

    #[test]
    fn test_multinomial_draw_stays_in_support() {
        let probs = [0.0f32, 0.5, 0.5, 0.0];
        let mut order = vec![0u32; 4];
        let mut generators: GeneratorStates<StdRng> = GeneratorStates::new(1);
        generators.seed(0, 11);
        let params = TopPParams {
            probs: &probs,
            top_ps: &[1.0],
            skip_decode: &[false],
            batch_slots: &[0],
            vocab_size: 4,
            vocab_size_padded: 4,
        };
        for _ in 0..32 {
            let mut tokens = [UNSELECTED];
            let mut selection = Selection::Sample {
                tokens: &mut tokens,
                generators: &mut generators,
            };
            batch_top_p(&params, &mut order, &mut selection).unwrap();
            assert!(tokens[0] == 1 || tokens[0] == 2);
        }
        assert_eq!(generators.draws(0), 32);
    }
}
