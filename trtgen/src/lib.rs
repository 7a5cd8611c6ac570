//! Two-stage lowering of a loaded denoising network: trace it into an
//! opset-tagged ONNX graph, then assemble (and optionally run) the external
//! compiler invocation that turns the graph into a TensorRT engine valid
//! over a declared range of batch, spatial and prompt-length values.

pub mod command;
pub mod descriptor;
pub mod error;
pub mod export;
pub mod inputs;
pub mod module;
pub mod paths;
pub mod profile;
pub mod testing;

pub use command::{AccessPolicy, CompileCommand};
pub use descriptor::{Conditioning, NetworkDescriptor};
pub use error::Error;
pub use export::{DEFAULT_OPSET_VERSION, export};
pub use inputs::SyntheticInputs;
pub use module::DenoisingModule;
pub use profile::{AxisRange, EngineProfile, Level, ShapeRange};
