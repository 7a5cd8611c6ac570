use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};
use trt_panel::{CompileRequest, PanelOutcome, compile_engine, show_compile_command};
use trtgen::{AccessPolicy, AxisRange, Conditioning, NetworkDescriptor, ShapeRange};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Root models directory of the host installation.
    #[arg(long, env = "SD_MODELS_DIR", default_value = "models")]
    models_dir: PathBuf,

    /// Allow spawning the external engine compiler. Off by default because
    /// the command carries user-controlled arguments.
    #[arg(long, env = "ENABLE_INSECURE_EXTENSION_ACCESS")]
    enable_insecure_extension_access: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the engine-compiler invocation without running it.
    ShowCommand(CompileArgs),

    /// Compile the exported graph into an engine.
    Compile(CompileArgs),
}

#[derive(clap::Args)]
struct CompileArgs {
    /// Path to the exported ONNX graph.
    #[arg(short, long)]
    onnx: PathBuf,

    /// Engine output path. Defaults to <models>/Unet-trt/<graph stem>.trt.
    #[arg(short, long)]
    engine: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    min_batch: usize,
    /// Defaults to the maximum when omitted.
    #[arg(long)]
    opt_batch: Option<usize>,
    #[arg(long, default_value_t = 1)]
    max_batch: usize,

    #[arg(long, default_value_t = 512)]
    min_width: usize,
    #[arg(long)]
    opt_width: Option<usize>,
    #[arg(long, default_value_t = 512)]
    max_width: usize,

    #[arg(long, default_value_t = 512)]
    min_height: usize,
    #[arg(long)]
    opt_height: Option<usize>,
    #[arg(long, default_value_t = 512)]
    max_height: usize,

    #[arg(long, default_value_t = 75)]
    min_tokens: usize,
    #[arg(long)]
    opt_tokens: Option<usize>,
    #[arg(long, default_value_t = 75)]
    max_tokens: usize,

    /// Build at full precision instead of half floats.
    #[arg(long)]
    full_precision: bool,

    /// Extra arguments appended to the compiler command verbatim.
    #[arg(long, default_value = "")]
    extra_args: String,

    /// Channel count of the control input, for engines that must accept the
    /// control branch.
    #[arg(long)]
    control_channels: Option<usize>,
}

impl CompileArgs {
    fn request(&self) -> CompileRequest {
        let axis = |min, opt: Option<usize>, max| AxisRange::new(min, opt.unwrap_or(max), max);
        CompileRequest {
            onnx_path: self.onnx.clone(),
            engine_path: self.engine.clone(),
            range: ShapeRange {
                batch: axis(self.min_batch, self.opt_batch, self.max_batch),
                width: axis(self.min_width, self.opt_width, self.max_width),
                height: axis(self.min_height, self.opt_height, self.max_height),
                tokens: axis(self.min_tokens, self.opt_tokens, self.max_tokens),
            },
            fp16: !self.full_precision,
            extra_args: self.extra_args.clone(),
        }
    }

    fn descriptor(&self) -> NetworkDescriptor {
        let descriptor = NetworkDescriptor::stable_diffusion("unet");
        match self.control_channels {
            Some(channels) => descriptor.with_conditioning(Conditioning::Active { channels }),
            None => descriptor,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let outcome = match &args.command {
        Command::ShowCommand(compile) => {
            show_compile_command(&compile.request(), &compile.descriptor(), &args.models_dir)
        }
        Command::Compile(compile) => compile_engine(
            &compile.request(),
            &compile.descriptor(),
            &args.models_dir,
            &AccessPolicy {
                insecure_extension_access: args.enable_insecure_extension_access,
            },
        ),
    };
    report(&outcome)
}

fn report(outcome: &PanelOutcome) -> anyhow::Result<()> {
    println!("{}", outcome.status);
    if !outcome.detail.is_empty() {
        println!("{}", outcome.detail);
    }
    if !outcome.success {
        bail!("command did not complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_original_form() {
        let args = Args::try_parse_from(["trt-cli", "show-command", "--onnx", "v.onnx"]).unwrap();
        let Command::ShowCommand(compile) = &args.command else {
            panic!("wrong subcommand");
        };

        let request = compile.request();
        assert_eq!(request.range.batch, AxisRange::fixed(1));
        assert_eq!(request.range.width, AxisRange::fixed(512));
        assert_eq!(request.range.height, AxisRange::fixed(512));
        assert_eq!(request.range.tokens, AxisRange::fixed(75));
        assert!(request.fp16);
        assert!(request.engine_path.is_none());
        assert!(!args.enable_insecure_extension_access);
        assert!(!compile.descriptor().conditioning.is_active());
    }

    #[test]
    fn opt_levels_default_to_max() {
        let args = Args::try_parse_from([
            "trt-cli",
            "compile",
            "--onnx",
            "v.onnx",
            "--min-width",
            "256",
            "--max-width",
            "1024",
        ])
        .unwrap();
        let Command::Compile(compile) = &args.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(compile.request().range.width, AxisRange::new(256, 1024, 1024));
    }

    #[test]
    fn control_channels_switch_the_conditioning_variant() {
        let args = Args::try_parse_from([
            "trt-cli",
            "show-command",
            "--onnx",
            "v.onnx",
            "--control-channels",
            "3",
        ])
        .unwrap();
        let Command::ShowCommand(compile) = &args.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(
            compile.descriptor().conditioning,
            Conditioning::Active { channels: 3 }
        );
    }
}
