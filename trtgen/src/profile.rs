//! Dynamic-shape profile derivation for the engine compiler.
//!
//! The compiled engine stays valid over a declared range of batch, spatial
//! and prompt-length values; this module turns that range into the concrete
//! min/opt/max shape of every dynamic input tensor the network exposes.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    descriptor::{Conditioning, NetworkDescriptor},
    error::{Error, Result},
    module::{CONTEXT, CONTROL, SAMPLE, TIMESTEPS},
};

/// Prompt tokens per encoder chunk.
pub const CHUNK_TOKENS: usize = 75;
/// Slots each chunk occupies in the context tensor once padded with the
/// begin/end markers.
pub const CHUNK_SLOTS: usize = 77;

/// Context sequence length for a prompt of `tokens` tokens. Partial chunks
/// round up to a whole padded chunk: 75 tokens -> 77 slots, 76 -> 154.
pub fn sequence_length(tokens: usize) -> usize {
    tokens.div_ceil(CHUNK_TOKENS) * CHUNK_SLOTS
}

/// A (min, opt, max) triple for one axis of the shape range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: usize,
    pub opt: usize,
    pub max: usize,
}

impl AxisRange {
    pub fn new(min: usize, opt: usize, max: usize) -> Self {
        Self { min, opt, max }
    }

    /// Range collapsed to a single value, the common case for batch size.
    pub fn fixed(value: usize) -> Self {
        Self {
            min: value,
            opt: value,
            max: value,
        }
    }

    fn levels(&self) -> [usize; 3] {
        [self.min, self.opt, self.max]
    }

    fn is_ordered(&self) -> bool {
        self.min >= 1 && self.min <= self.opt && self.opt <= self.max
    }
}

/// The user-declared range the engine must cover, one [`AxisRange`] per
/// dynamic axis. Width and height are in image pixels, not latent units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRange {
    pub batch: AxisRange,
    pub width: AxisRange,
    pub height: AxisRange,
    pub tokens: AxisRange,
}

impl ShapeRange {
    /// Check the range invariants: every axis positive and ordered, and
    /// width/height divisible by the latent tiling factor at all three
    /// levels. Runs before any command is assembled.
    pub fn validate(&self, latent_tiling: usize) -> Result<()> {
        for (name, axis) in self.axes() {
            if !axis.is_ordered() {
                return Err(Error::Profile {
                    reason: format!(
                        "{name} range must satisfy 1 <= min <= opt <= max, got \
                         min={} opt={} max={}",
                        axis.min, axis.opt, axis.max
                    ),
                });
            }
        }
        for (name, axis) in [("width", self.width), ("height", self.height)] {
            for value in axis.levels() {
                if value % latent_tiling != 0 {
                    return Err(Error::Profile {
                        reason: format!(
                            "{name} {value} is not divisible by the latent tiling \
                             factor {latent_tiling}"
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn axes(&self) -> [(&'static str, AxisRange); 4] {
        [
            ("batch", self.batch),
            ("width", self.width),
            ("height", self.height),
            ("token count", self.tokens),
        ]
    }
}

/// Profile level selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Min,
    Opt,
    Max,
}

impl Level {
    fn pick(&self, axis: AxisRange) -> usize {
        match self {
            Level::Min => axis.min,
            Level::Opt => axis.opt,
            Level::Max => axis.max,
        }
    }
}

/// Shape triple of one named dynamic tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorProfile {
    pub name: String,
    pub min: Vec<usize>,
    pub opt: Vec<usize>,
    pub max: Vec<usize>,
}

impl TensorProfile {
    pub fn shape(&self, level: Level) -> &[usize] {
        match level {
            Level::Min => &self.min,
            Level::Opt => &self.opt,
            Level::Max => &self.max,
        }
    }
}

/// The full derived profile: every dynamic input tensor mapped to its
/// min/opt/max shapes. Even a collapsed axis lists all three levels, since
/// the compiler requires each of them to be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProfile {
    tensors: Vec<TensorProfile>,
}

impl EngineProfile {
    /// Derive the profile for `range`, validating it first. The descriptor
    /// supplies channel counts, the tiling factor and whether the control
    /// tensor participates.
    pub fn build(range: &ShapeRange, descriptor: &NetworkDescriptor) -> Result<Self> {
        range.validate(descriptor.latent_tiling)?;

        let at = |level: Level| {
            input_shapes(
                level.pick(range.batch),
                level.pick(range.width),
                level.pick(range.height),
                level.pick(range.tokens),
                descriptor,
            )
        };
        let tensors = at(Level::Min)
            .into_iter()
            .zip(at(Level::Opt))
            .zip(at(Level::Max))
            .map(|(((name, min), (_, opt)), (_, max))| TensorProfile {
                name: name.to_string(),
                min,
                opt,
                max,
            })
            .collect();

        Ok(Self { tensors })
    }

    pub fn tensors(&self) -> &[TensorProfile] {
        &self.tensors
    }

    /// Render one level in the compiler's shape-expression syntax:
    /// `sample:1x4x64x64,timesteps:1,context:1x77x768`.
    pub fn shape_arg(&self, level: Level) -> String {
        self.tensors
            .iter()
            .map(|t| {
                format!(
                    "{}:{}",
                    t.name,
                    t.shape(level).iter().map(ToString::to_string).join("x")
                )
            })
            .join(",")
    }
}

/// Concrete shape of every input tensor at one (batch, width, height,
/// tokens) point. Width and height map to latent units through the tiling
/// factor; the context length comes from the chunked prompt encoding.
fn input_shapes(
    batch: usize,
    width: usize,
    height: usize,
    tokens: usize,
    descriptor: &NetworkDescriptor,
) -> Vec<(&'static str, Vec<usize>)> {
    let tiling = descriptor.latent_tiling;
    let mut shapes = vec![
        (
            SAMPLE,
            vec![
                batch,
                descriptor.latent_channels,
                height / tiling,
                width / tiling,
            ],
        ),
        (TIMESTEPS, vec![batch]),
        (
            CONTEXT,
            vec![batch, sequence_length(tokens), descriptor.context_width],
        ),
    ];
    if let Conditioning::Active { channels } = descriptor.conditioning {
        shapes.push((CONTROL, vec![batch, channels, height / tiling, width / tiling]));
    }
    shapes
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::descriptor::{Conditioning, NetworkDescriptor};

    fn descriptor() -> NetworkDescriptor {
        NetworkDescriptor::stable_diffusion("v1-5")
    }

    fn range_512() -> ShapeRange {
        ShapeRange {
            batch: AxisRange::fixed(1),
            width: AxisRange::fixed(512),
            height: AxisRange::fixed(512),
            tokens: AxisRange::fixed(75),
        }
    }

    #[rstest]
    #[case(75, 77)]
    #[case(150, 154)]
    #[case(76, 154)]
    #[case(1, 77)]
    #[case(750, 770)]
    fn prompt_chunks_round_up(#[case] tokens: usize, #[case] slots: usize) {
        assert_eq!(sequence_length(tokens), slots);
    }

    #[test]
    fn fixed_range_lists_all_three_levels() {
        let profile = EngineProfile::build(&range_512(), &descriptor()).unwrap();

        let sample = &profile.tensors()[0];
        assert_eq!(sample.name, "sample");
        assert_eq!(sample.min, vec![1, 4, 64, 64]);
        assert_eq!(sample.opt, vec![1, 4, 64, 64]);
        assert_eq!(sample.max, vec![1, 4, 64, 64]);

        let context = &profile.tensors()[2];
        assert_eq!(context.min, vec![1, 77, 768]);
    }

    #[test]
    fn profile_is_component_wise_ordered() {
        let range = ShapeRange {
            batch: AxisRange::new(1, 2, 16),
            width: AxisRange::new(256, 512, 2048),
            height: AxisRange::new(64, 512, 1024),
            tokens: AxisRange::new(75, 150, 750),
        };
        let profile = EngineProfile::build(&range, &descriptor()).unwrap();

        for tensor in profile.tensors() {
            for ((lo, mid), hi) in tensor.min.iter().zip(&tensor.opt).zip(&tensor.max) {
                assert!(lo <= mid && mid <= hi, "unordered profile for {}", tensor.name);
            }
        }
    }

    #[test]
    fn control_tensor_only_when_conditioning_active() {
        let plain = EngineProfile::build(&range_512(), &descriptor()).unwrap();
        assert!(plain.tensors().iter().all(|t| t.name != "control"));

        let conditioned = descriptor().with_conditioning(Conditioning::Active { channels: 3 });
        let profile = EngineProfile::build(&range_512(), &conditioned).unwrap();
        let control = profile
            .tensors()
            .iter()
            .find(|t| t.name == "control")
            .expect("control tensor in profile");
        assert_eq!(control.max, vec![1, 3, 64, 64]);
    }

    #[rstest]
    #[case(ShapeRange { batch: AxisRange::new(2, 1, 4), ..range_512() })]
    #[case(ShapeRange { batch: AxisRange::new(1, 4, 2), ..range_512() })]
    #[case(ShapeRange { batch: AxisRange::fixed(0), ..range_512() })]
    fn unordered_axes_are_rejected(#[case] range: ShapeRange) {
        let err = EngineProfile::build(&range, &descriptor()).unwrap_err();
        assert!(matches!(err, crate::Error::Profile { .. }));
    }

    #[rstest]
    #[case(ShapeRange { width: AxisRange::fixed(500), ..range_512() })]
    #[case(ShapeRange { height: AxisRange::new(512, 512, 513), ..range_512() })]
    fn off_tile_spatial_sizes_are_rejected(#[case] range: ShapeRange) {
        let err = EngineProfile::build(&range, &descriptor()).unwrap_err();
        assert!(matches!(err, crate::Error::Profile { .. }));
    }

    #[test]
    fn shape_arg_matches_compiler_syntax() {
        let profile = EngineProfile::build(&range_512(), &descriptor()).unwrap();
        assert_eq!(
            profile.shape_arg(Level::Min),
            "sample:1x4x64x64,timesteps:1,context:1x77x768"
        );
        assert_eq!(profile.shape_arg(Level::Min), profile.shape_arg(Level::Opt));
        assert_eq!(profile.shape_arg(Level::Min), profile.shape_arg(Level::Max));
    }
}
