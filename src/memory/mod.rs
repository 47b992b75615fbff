//! Scratch and mirrored buffers used by the decoding layers.

mod arena;
mod mirrored;

pub use arena::{Scratch, ScratchSlice, Workspace, WorkspaceError, WorkspaceLayout};
pub use mirrored::HostMirrored;
