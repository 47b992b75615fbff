//! Element types accepted for logits.

use half::{bf16, f16};

/// A scalar logit. Kernels compute in `f32` and convert at the boundary.
pub trait Logit: Copy + Send + Sync + 'static {
    fn to_f32(self) -> f32;
}

impl Logit for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Logit for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

impl Logit for bf16 {
    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
}
