//! Panel-facing adapter over the export pipeline.
//!
//! The host UI wires each button to one of these functions; they take the
//! form parameters, default the artifact paths, and fold every failure into
//! a displayable outcome instead of propagating it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::error;
use trtgen::{
    AccessPolicy, CompileCommand, DenoisingModule, EngineProfile, NetworkDescriptor, ShapeRange,
    paths::{default_engine_path, default_onnx_path},
};

/// What the panel displays after an action: a short status line and an
/// optional detail block (the generated command, or the failure text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelOutcome {
    pub success: bool,
    pub status: String,
    pub detail: String,
}

impl PanelOutcome {
    fn saved(path: &Path) -> Self {
        Self {
            success: true,
            status: format!("Saved as {}", path.display()),
            detail: String::new(),
        }
    }

    fn failed(err: trtgen::Error) -> Self {
        error!("{err}");
        Self {
            success: false,
            status: "Conversion failed".to_string(),
            detail: err.to_string(),
        }
    }
}

/// Parameters of the graph-to-engine half of the panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileRequest {
    pub onnx_path: PathBuf,
    /// Defaults to the conventional engine directory when empty.
    pub engine_path: Option<PathBuf>,
    pub range: ShapeRange,
    pub fp16: bool,
    /// Passed to the compiler verbatim.
    pub extra_args: String,
}

/// Export the loaded checkpoint's denoising network to ONNX. An empty
/// `filename` falls back to `<models>/Unet-onnx/<model name>.onnx`.
pub fn export_unet_to_onnx(
    module: &mut dyn DenoisingModule,
    descriptor: &NetworkDescriptor,
    models_dir: &Path,
    filename: Option<PathBuf>,
    opset_version: i64,
) -> PanelOutcome {
    let path =
        filename.unwrap_or_else(|| default_onnx_path(models_dir, &descriptor.model_name));
    match trtgen::export(module, descriptor, &path, opset_version) {
        Ok(path) => PanelOutcome::saved(&path),
        Err(err) => PanelOutcome::failed(err),
    }
}

/// Assemble the compiler invocation and hand it back for display, without
/// running anything. This is the consent step before [`compile_engine`].
pub fn show_compile_command(
    request: &CompileRequest,
    descriptor: &NetworkDescriptor,
    models_dir: &Path,
) -> PanelOutcome {
    match assemble(request, descriptor, models_dir) {
        Ok((_, command)) => PanelOutcome {
            success: true,
            status: "Command generated".to_string(),
            detail: command.shell_line(),
        },
        Err(err) => PanelOutcome::failed(err),
    }
}

/// Assemble the compiler invocation and run it synchronously.
pub fn compile_engine(
    request: &CompileRequest,
    descriptor: &NetworkDescriptor,
    models_dir: &Path,
    policy: &AccessPolicy,
) -> PanelOutcome {
    let (engine_path, command) = match assemble(request, descriptor, models_dir) {
        Ok(assembled) => assembled,
        Err(err) => return PanelOutcome::failed(err),
    };
    match command.run(policy) {
        Ok(()) => PanelOutcome::saved(&engine_path),
        Err(err) => PanelOutcome::failed(err),
    }
}

fn assemble(
    request: &CompileRequest,
    descriptor: &NetworkDescriptor,
    models_dir: &Path,
) -> Result<(PathBuf, CompileCommand), trtgen::Error> {
    let engine_path = request
        .engine_path
        .clone()
        .unwrap_or_else(|| default_engine_path(models_dir, &request.onnx_path));
    let profile = EngineProfile::build(&request.range, descriptor)?;
    let command = CompileCommand::build(
        &request.onnx_path,
        &engine_path,
        &profile,
        request.fp16,
        &request.extra_args,
    );
    Ok((engine_path, command))
}
