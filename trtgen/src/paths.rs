//! Conventional artifact locations under the host's models directory.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Subdirectory for exported graphs.
pub const ONNX_SUBDIR: &str = "Unet-onnx";
/// Sibling subdirectory for compiled engines.
pub const ENGINE_SUBDIR: &str = "Unet-trt";

pub const ONNX_EXTENSION: &str = "onnx";
pub const ENGINE_EXTENSION: &str = "trt";

/// Default graph location: `<models>/Unet-onnx/<model_name>.onnx`.
pub fn default_onnx_path(models_dir: &Path, model_name: &str) -> PathBuf {
    models_dir
        .join(ONNX_SUBDIR)
        .join(model_name)
        .with_extension(ONNX_EXTENSION)
}

/// Default engine location: the graph's file stem moved to
/// `<models>/Unet-trt/` with the engine extension.
pub fn default_engine_path(models_dir: &Path, onnx_path: &Path) -> PathBuf {
    let stem = onnx_path.file_stem().unwrap_or_else(|| OsStr::new("unet"));
    models_dir
        .join(ENGINE_SUBDIR)
        .join(stem)
        .with_extension(ENGINE_EXTENSION)
}
