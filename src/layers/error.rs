//! Decoding error types.
//!
//! All errors are fatal for the step that raised them: a failed step leaves
//! no partially committed outputs behind that callers may rely on.

use thiserror::Error;

use crate::memory::WorkspaceError;

/// Errors raised by decoding layers.
#[derive(Debug, Error)]
pub enum DecodingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported decoding mode: {0}")]
    UnsupportedMode(String),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Kernel execution failed in {stage}: {reason}")]
    Execution { stage: &'static str, reason: String },
}

impl DecodingError {
    /// Returns true if the error was raised while configuring a layer rather
    /// than while running a step.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_) | Self::UnsupportedMode(_))
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
