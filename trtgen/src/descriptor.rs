//! Checkpoint-derived metadata the exporter and profile builder consume.

use serde::{Deserialize, Serialize};

/// Whether the network carries the auxiliary control branch, and with which
/// channel count. Kept as an explicit variant instead of letting the trace
/// discover the active branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conditioning {
    /// Plain denoising network, no auxiliary input.
    Inactive,
    /// Control branch active; the control tensor mirrors the latent sample
    /// with this channel count.
    Active { channels: usize },
}

impl Conditioning {
    pub fn is_active(&self) -> bool {
        matches!(self, Conditioning::Active { .. })
    }
}

/// Immutable description of the loaded checkpoint. Owned by the host model
/// registry; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    /// Name the checkpoint was registered under; default artifact filenames
    /// derive from it.
    pub model_name: String,
    /// Channel count of the latent sample input.
    pub latent_channels: usize,
    /// Spatial downsampling factor between image space and latent space.
    /// Width and height of every profile level must be divisible by it.
    pub latent_tiling: usize,
    /// Embedding width of the text-encoder output.
    pub context_width: usize,
    pub conditioning: Conditioning,
}

impl NetworkDescriptor {
    /// Descriptor for the stock Stable-Diffusion UNet: 4 latent channels,
    /// 8x spatial tiling, 768-wide text context.
    pub fn stable_diffusion(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            latent_channels: 4,
            latent_tiling: 8,
            context_width: 768,
            conditioning: Conditioning::Inactive,
        }
    }

    pub fn with_conditioning(mut self, conditioning: Conditioning) -> Self {
        self.conditioning = conditioning;
        self
    }
}
