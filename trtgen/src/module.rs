//! Seam between the host's loaded network and the exporter.

use tract_onnx::pb::GraphProto;

use crate::{
    descriptor::{Conditioning, NetworkDescriptor},
    inputs::SyntheticInputs,
};

/// Graph input/output names the denoising network exposes. The engine
/// compiler addresses dynamic tensors by these names, so the exporter and
/// the profile builder must agree on them.
pub const SAMPLE: &str = "sample";
pub const TIMESTEPS: &str = "timesteps";
pub const CONTEXT: &str = "context";
pub const CONTROL: &str = "control";
pub const OUT_SAMPLE: &str = "out_sample";

/// Input names a network described by `descriptor` must expose.
pub fn expected_input_names(descriptor: &NetworkDescriptor) -> Vec<&'static str> {
    let mut names = vec![SAMPLE, TIMESTEPS, CONTEXT];
    if let Conditioning::Active { .. } = descriptor.conditioning {
        names.push(CONTROL);
    }
    names
}

/// A loaded denoising network, as supplied by the host model registry.
///
/// The host implementation wraps whatever runtime actually holds the
/// weights; this crate only needs to flip its train/eval flag, ask which
/// inputs it consumes, and run it once over a synthetic input set to capture
/// the computation as a static graph.
pub trait DenoisingModule {
    /// Current state of the train/eval flag. This is shared mutable state on
    /// the host's model; [`crate::export::export`] saves and restores it
    /// around the trace.
    fn training(&self) -> bool;

    fn set_training(&mut self, training: bool);

    /// Names of the graph inputs the module consumes. Checked against the
    /// descriptor before tracing, since tracing itself does not enforce
    /// consistency.
    fn input_names(&self) -> Vec<String>;

    /// Execute the module once over `inputs` and capture the resulting
    /// computation graph. Input and output value infos carry the literal
    /// dimensions of the synthetic tensors; the exporter rewrites the
    /// dynamic axes afterwards.
    fn trace(&self, inputs: &SyntheticInputs) -> anyhow::Result<GraphProto>;
}
