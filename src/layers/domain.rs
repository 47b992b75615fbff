//! Batch descriptor and batch-slot helpers shared by decoding layers.

use super::DecodingError;

/// Token id type used throughout the decoding layers.
pub type TokenId = u32;

/// Largest top-k a sequence may request.
pub const TOP_K_MAX: usize = 1024;

/// Sentinel marking the end of a candidate row. Never a valid token id.
pub const UNSELECTED: TokenId = TokenId::MAX;

/// Static shape of the batch a layer is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderDomain {
    max_batch_size: usize,
    vocab_size: usize,
    vocab_size_padded: usize,
    max_draft_tokens: usize,
    max_seq_len: usize,
}

impl DecoderDomain {
    /// Build and validate a domain.
    pub fn new(
        max_batch_size: usize,
        vocab_size: usize,
        vocab_size_padded: usize,
        max_draft_tokens: usize,
        max_seq_len: usize,
    ) -> Result<Self, DecodingError> {
        if max_batch_size == 0 {
            return Err(DecodingError::InvalidConfiguration(
                "max_batch_size must be > 0".into(),
            ));
        }
        if vocab_size == 0 {
            return Err(DecodingError::InvalidConfiguration("vocab_size must be > 0".into()));
        }
        if vocab_size_padded < vocab_size {
            return Err(DecodingError::InvalidConfiguration(format!(
                "vocab_size_padded ({vocab_size_padded}) must be >= vocab_size ({vocab_size})"
            )));
        }
        if vocab_size_padded >= UNSELECTED as usize {
            return Err(DecodingError::InvalidConfiguration(format!(
                "vocab_size_padded ({vocab_size_padded}) collides with the candidate sentinel"
            )));
        }
        if max_draft_tokens == 0 {
            return Err(DecodingError::InvalidConfiguration(
                "max_draft_tokens must be > 0".into(),
            ));
        }
        if max_seq_len == 0 {
            return Err(DecodingError::InvalidConfiguration("max_seq_len must be > 0".into()));
        }
        Ok(Self {
            max_batch_size,
            vocab_size,
            vocab_size_padded,
            max_draft_tokens,
            max_seq_len,
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn vocab_size_padded(&self) -> usize {
        self.vocab_size_padded
    }

    pub fn max_draft_tokens(&self) -> usize {
        self.max_draft_tokens
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Check a batch-slot mapping against this domain.
    ///
    /// Slots must be in range and unique; otherwise two dense rows would write
    /// the same sparse storage.
    pub fn check_batch_slots(&self, batch_slots: &[usize]) -> Result<(), DecodingError> {
        if batch_slots.len() > self.max_batch_size {
            return Err(DecodingError::invalid_argument(format!(
                "batch size {} exceeds max batch size {}",
                batch_slots.len(),
                self.max_batch_size
            )));
        }
        let mut seen = vec![false; self.max_batch_size];
        for &slot in batch_slots {
            if slot >= self.max_batch_size {
                return Err(DecodingError::invalid_argument(format!(
                    "batch slot {slot} out of range (max batch size {})",
                    self.max_batch_size
                )));
            }
            if std::mem::replace(&mut seen[slot], true) {
                return Err(DecodingError::invalid_argument(format!(
                    "batch slot {slot} appears twice"
                )));
            }
        }
        Ok(())
    }
}

/// Fail with `InvalidArgument` unless a buffer has the expected length.
pub(crate) fn expect_len(name: &str, actual: usize, expected: usize) -> Result<(), DecodingError> {
    if actual != expected {
        return Err(DecodingError::invalid_argument(format!(
            "{name} has {actual} elements, expected {expected}"
        )));
    }
    Ok(())
}

/// True if `values[slot] == expected` for every slot in the batch.
pub fn all_of_batch_slots<T: PartialEq + Copy>(
    batch_slots: &[usize],
    values: &[T],
    expected: T,
) -> bool {
    batch_slots.iter().all(|&slot| values[slot] == expected)
}

/// Maximum of `values[slot]` over the batch slots for which `include(slot)`
/// holds, or `T::default()` if there are none.
pub fn max_of_batch_slots<T, F>(batch_slots: &[usize], values: &[T], include: F) -> T
where
    T: PartialOrd + Copy + Default,
    F: Fn(usize) -> bool,
{
    batch_slots
        .iter()
        .filter(|&&slot| include(slot))
        .map(|&slot| values[slot])
        .fold(T::default(), |acc, v| if v > acc { v } else { acc })
}
