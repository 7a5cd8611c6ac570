//! Error type shared by the export and compile halves of the crate.

use std::{io, path::PathBuf};

/// Failures surfaced to the caller. None of these are retried internally;
/// the host decides what to show the user.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Architecture or input mismatch while capturing the module's graph.
    /// The underlying reason is surfaced verbatim.
    #[error("failed to trace denoising module: {reason}")]
    Trace { reason: String },

    /// Filesystem failure, reported with the path that was being touched.
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The requested shape range breaks an invariant. Raised before any
    /// command is assembled or any process is started.
    #[error("invalid shape range: {reason}")]
    Profile { reason: String },

    /// Extension-level command execution is switched off on the host.
    #[error(
        "won't run the engine compiler because extension-level command execution \
         is disabled (use --enable-insecure-extension-access)"
    )]
    ExecutionDisabled,

    /// The external compiler ran and exited non-zero; its captured output is
    /// attached for the failure report.
    #[error("engine compiler exited with status {code:?}:\n{output}")]
    CompilerProcess { code: Option<i32>, output: String },
}

pub type Result<T> = std::result::Result<T, Error>;
