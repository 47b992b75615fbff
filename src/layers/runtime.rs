//! Per-slot sampling state shared by the sampling-based layers.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::{DecoderDomain, DecodingError, GeneratorStates, SamplingSetupParams};
use crate::kernels::{
    clamp_top_k, clamp_top_p, expand_match_elements, regularize_top_k_top_p,
    setup_top_k_top_p_runtime_args, Broadcast,
};
use crate::memory::{HostMirrored, Workspace, WorkspaceLayout};

/// Runtime top-k / top-p, skip flags and generator states for every slot.
///
/// Kernels read the device copies; control code reads the host copies to
/// decide whether a stage runs at all.
#[derive(Debug, Clone)]
pub struct SamplingRuntime<R = StdRng> {
    domain: DecoderDomain,
    pub(crate) generators: GeneratorStates<R>,
    pub(crate) top_k: HostMirrored<usize>,
    pub(crate) top_p: Vec<f32>,
    pub(crate) skip_top_k: HostMirrored<bool>,
    pub(crate) skip_top_p: HostMirrored<bool>,
}

impl<R: RngCore + SeedableRng> SamplingRuntime<R> {
    /// State for every slot of `domain`. Until `setup` runs each slot samples
    /// from its full distribution.
    pub fn new(domain: DecoderDomain) -> Self {
        let max_batch = domain.max_batch_size();
        Self {
            domain,
            generators: GeneratorStates::new(max_batch),
            top_k: HostMirrored::new(max_batch, 0),
            top_p: vec![1.0; max_batch],
            skip_top_k: HostMirrored::new(max_batch, true),
            skip_top_p: HostMirrored::new(max_batch, false),
        }
    }

    /// Scratch needed by `setup` to stage per-sequence arrays.
    pub fn setup_layout(domain: &DecoderDomain) -> WorkspaceLayout {
        WorkspaceLayout::new()
            .push::<usize>(domain.max_batch_size())
            .push::<f32>(domain.max_batch_size())
    }

    /// Seed generators and resolve top-k / top-p for the slots in
    /// `batch_slots`. Other slots keep their state.
    pub fn setup(
        &mut self,
        batch_slots: &[usize],
        params: &SamplingSetupParams,
        workspace: &Workspace,
    ) -> Result<(), DecodingError> {
        self.domain.check_batch_slots(batch_slots)?;
        let batch_size = batch_slots.len();

        match params.random_seed.as_deref() {
            None => {
                for &slot in batch_slots {
                    self.generators.seed(slot, 0);
                }
            }
            Some([seed]) => {
                for &slot in batch_slots {
                    self.generators.seed(slot, *seed);
                }
            }
            Some(seeds) if seeds.len() == batch_size => {
                for (&slot, &seed) in batch_slots.iter().zip(seeds) {
                    self.generators.seed(slot, seed);
                }
            }
            Some(seeds) => {
                return Err(DecodingError::invalid_argument(format!(
                    "expected 1 or {batch_size} random seeds, got {}",
                    seeds.len()
                )));
            }
        }

        let mut top_ks = params.runtime_top_k.clone().unwrap_or_else(|| vec![0]);
        let mut top_ps = params.runtime_top_p.clone().unwrap_or_else(|| vec![0.0]);
        let len = expand_match_elements(batch_size, &mut top_ks, &mut top_ps)?;

        let regularized = |k: i32, p: f32| regularize_top_k_top_p(clamp_top_k(k), clamp_top_p(p));

        if len == 1 {
            let (k, p) = regularized(top_ks[0], top_ps[0]);
            self.write_runtime_args(batch_slots, Broadcast::Scalar(k), Broadcast::Scalar(p));
            tracing::debug!(batch_size, top_k = k, top_p = p, "sampling runtime configured");
        } else {
            let mut staged_k = workspace.carve::<usize>(batch_size)?;
            let mut staged_p = workspace.carve::<f32>(batch_size)?;
            for i in 0..batch_size {
                let (k, p) = regularized(top_ks[i], top_ps[i]);
                staged_k[i] = k;
                staged_p[i] = p;
            }
            self.write_runtime_args(
                batch_slots,
                Broadcast::PerSequence(&staged_k[..]),
                Broadcast::PerSequence(&staged_p[..]),
            );
            tracing::debug!(batch_size, "sampling runtime configured per sequence");
        }
        Ok(())
    }

    fn write_runtime_args(
        &mut self,
        batch_slots: &[usize],
        top_ks: Broadcast<'_, usize>,
        top_ps: Broadcast<'_, f32>,
    ) {
        setup_top_k_top_p_runtime_args(
            batch_slots,
            top_ks,
            top_ps,
            self.top_k.device_mut(),
            Some(self.top_p.as_mut_slice()),
            self.skip_top_k.device_mut(),
            self.skip_top_p.device_mut(),
        );
        setup_top_k_top_p_runtime_args(
            batch_slots,
            top_ks,
            top_ps,
            self.top_k.host_mut(),
            None,
            self.skip_top_k.host_mut(),
            self.skip_top_p.host_mut(),
        );
    }

    pub fn domain(&self) -> &DecoderDomain {
        &self.domain
    }

    pub fn generators(&self) -> &GeneratorStates<R> {
        &self.generators
    }

    pub fn top_k(&self) -> &HostMirrored<usize> {
        &self.top_k
    }

    pub fn top_p(&self) -> &[f32] {
        &self.top_p
    }

    pub fn skip_top_k(&self) -> &HostMirrored<bool> {
        &self.skip_top_k
    }

    pub fn skip_top_p(&self) -> &HostMirrored<bool> {
        &self.skip_top_p
    }
}
