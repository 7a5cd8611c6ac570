//! Assembly and execution of the external engine-compiler invocation.
//!
//! Building the command and running it are deliberately split: the host UI
//! shows the assembled command to the user before asking for consent to run
//! it, because the command shells out with user-controlled extra arguments.

use std::{
    fmt,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use itertools::Itertools;
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    profile::{EngineProfile, Level},
};

/// The external graph compiler. Treated as a black box with a fixed
/// argument contract.
const COMPILER: &str = "trtexec";

/// Host-controlled gate for spawning external processes.
#[derive(Debug, Clone, Copy)]
pub struct AccessPolicy {
    /// Mirrors the host's insecure-extension-access switch. When false,
    /// [`CompileCommand::run`] refuses without spawning anything.
    pub insecure_extension_access: bool,
}

/// One fully assembled compiler invocation. Created fresh per request,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileCommand {
    program: String,
    args: Vec<String>,
    extra: String,
}

impl CompileCommand {
    /// Assemble the invocation: graph path, engine path, one shape argument
    /// per profile level, the precision flag, and the caller's extra
    /// arguments appended last, verbatim and unescaped. The caller owns
    /// shell-safety of the extras; that is the escape hatch, not a bug.
    pub fn build(
        onnx_path: &Path,
        engine_path: &Path,
        profile: &EngineProfile,
        fp16: bool,
        extra_args: &str,
    ) -> Self {
        let mut args = vec![
            format!("--onnx={}", onnx_path.display()),
            format!("--saveEngine={}", engine_path.display()),
            format!("--minShapes={}", profile.shape_arg(Level::Min)),
            format!("--optShapes={}", profile.shape_arg(Level::Opt)),
            format!("--maxShapes={}", profile.shape_arg(Level::Max)),
        ];
        if fp16 {
            args.push("--fp16".to_string());
        }
        Self {
            program: COMPILER.to_string(),
            args,
            extra: extra_args.trim().to_string(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn extra(&self) -> &str {
        &self.extra
    }

    /// The single-line form shown to the user before they consent to run.
    pub fn shell_line(&self) -> String {
        let mut line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .join(" ");
        if !self.extra.is_empty() {
            line.push(' ');
            line.push_str(&self.extra);
        }
        line
    }

    /// Run the compiler synchronously, streaming its output through the log
    /// while capturing it for the failure report. Compilation can take tens
    /// of minutes; dispatching this off any UI thread is the host's job.
    pub fn run(&self, policy: &AccessPolicy) -> Result<()> {
        if !policy.insecure_extension_access {
            return Err(Error::ExecutionDisabled);
        }

        info!("running {}", self.shell_line());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(self.extra.split_whitespace())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Io {
                path: PathBuf::from(&self.program),
                source,
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut captured = String::new();
        let err_tail = std::thread::scope(|scope| {
            let stderr_lines = scope.spawn(move || {
                let mut buf = String::new();
                for line in BufReader::new(stderr).lines().map_while(io::Result::ok) {
                    warn!("{line}");
                    buf.push_str(&line);
                    buf.push('\n');
                }
                buf
            });
            for line in BufReader::new(stdout).lines().map_while(io::Result::ok) {
                info!("{line}");
                captured.push_str(&line);
                captured.push('\n');
            }
            stderr_lines.join().unwrap_or_default()
        });
        captured.push_str(&err_tail);

        let status = child.wait().map_err(|source| Error::Io {
            path: PathBuf::from(&self.program),
            source,
        })?;
        if !status.success() {
            return Err(Error::CompilerProcess {
                code: status.code(),
                output: captured,
            });
        }
        info!("engine compilation finished");
        Ok(())
    }
}

impl fmt::Display for CompileCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.shell_line())
    }
}
