//! Synthetic input set fed to the module for the one tracing pass.

use candle_core::{DType, Device, Tensor};

use crate::{
    descriptor::{Conditioning, NetworkDescriptor},
    error::{Error, Result},
    profile::CHUNK_SLOTS,
};

/// Latent side length used for the representative trace; corresponds to a
/// 512x512 image under 8x tiling.
pub const REPRESENTATIVE_LATENT_SIDE: usize = 64;
/// Batch size used for the representative trace.
pub const REPRESENTATIVE_BATCH: usize = 1;

/// The named tensors the module is invoked with while tracing. Built
/// immediately before the trace, dropped when the export call returns.
pub struct SyntheticInputs {
    pub sample: Tensor,
    pub timesteps: Tensor,
    pub context: Tensor,
    /// Present only when the descriptor declares the control branch active.
    pub control: Option<Tensor>,
}

impl SyntheticInputs {
    /// Build the fixed representative configuration: batch 1, 64x64 latent,
    /// one 75-token prompt chunk (77 context slots).
    pub fn representative(descriptor: &NetworkDescriptor) -> Result<Self> {
        let b = REPRESENTATIVE_BATCH;
        let side = REPRESENTATIVE_LATENT_SIDE;

        let sample = synth("sample", (b, descriptor.latent_channels, side, side))?;
        let timesteps = synth("timesteps", (b,))?;
        let context = synth("context", (b, CHUNK_SLOTS, descriptor.context_width))?;
        let control = match descriptor.conditioning {
            Conditioning::Inactive => None,
            Conditioning::Active { channels } => {
                Some(synth("control", (b, channels, side, side))?)
            }
        };

        Ok(Self {
            sample,
            timesteps,
            context,
            control,
        })
    }
}

fn synth<S: Into<candle_core::Shape>>(name: &str, shape: S) -> Result<Tensor> {
    Tensor::zeros(shape, DType::F32, &Device::Cpu).map_err(|e| Error::Trace {
        reason: format!("building synthetic {name} tensor: {e}"),
    })
}
