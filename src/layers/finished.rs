//! Per-sequence finished state.

/// Decoding status of one sequence slot.
///
/// `SkipDecoding` is not a terminal state: the sequence is only excluded from
/// the remaining steps of the current draft cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FinishedState {
    #[default]
    Running,
    SkipDecoding,
    FinishedEos,
    FinishedMaxLength,
}

impl FinishedState {
    /// True for any terminal state.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::FinishedEos | Self::FinishedMaxLength)
    }

    /// True if a step must leave this sequence untouched.
    pub fn is_skip_decoding(self) -> bool {
        self != Self::Running
    }

    /// Stable byte encoding for serialization boundaries.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::FinishedEos => 1,
            Self::FinishedMaxLength => 4,
            Self::SkipDecoding => 8,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Running),
            1 => Some(Self::FinishedEos),
            4 => Some(Self::FinishedMaxLength),
            8 => Some(Self::SkipDecoding),
            _ => None,
        }
    }
}

/// Return skipped sequences to `Running` before the next draft cycle.
/// Terminal states are kept.
pub fn reset_skip_decoding(finished: &mut [FinishedState]) {
    for state in finished.iter_mut() {
        if *state == FinishedState::SkipDecoding {
            *state = FinishedState::Running;
        }
    }
}
