use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use photo3d_contracts::printability::{fit_to_bed_scale, target_size_scale, BedSize, OptimizeOptions};
use photo3d_contracts::providers::GenerationOptions;
use photo3d_contracts::tasks::{ModelFormat, TaskStatus};
use photo3d_contracts::views::{GenerationMode, ViewAngle};
use photo3d_engine::mesh::{analyze_model_file, optimize_model_file};
use photo3d_engine::{
    EngineConfig, GenerationService, LocalWorkspace, MultiViewPlan, ProgressEvent, StartRequest,
    ViewsRequest,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PHOTO3D_LOG";

#[derive(Debug, Parser)]
#[command(name = "photo3d", version, about = "Photo to 3D model pipeline")]
struct Cli {
    /// Directory holding pipeline documents, files and event logs.
    #[arg(long, global = true, default_value = "photo3d-workspace")]
    workspace: PathBuf,
    /// JSON file overriding environment-derived configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a pipeline from a reference photo.
    New(NewArgs),
    /// Generate mesh and texture views from the reference photo.
    Views(ViewsArgs),
    /// Submit the pipeline to a 3D provider.
    Start(StartArgs),
    /// Poll the provider once.
    Status(PipelineArgs),
    /// Poll until the task finishes or the timeout passes.
    Watch(WatchArgs),
    /// Show the stored pipeline document.
    Show(PipelineArgs),
    /// List providers, their capabilities and credential state.
    Providers,
    /// Printability report for a GLB, OBJ or STL model.
    Analyze(AnalyzeArgs),
    /// Clean, scale and ground a model, writing a binary STL.
    Optimize(OptimizeArgs),
}

#[derive(Debug, Args)]
struct PipelineArgs {
    #[arg(long)]
    pipeline: String,
}

#[derive(Debug, Args)]
struct NewArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Args)]
struct ViewsArgs {
    #[arg(long)]
    pipeline: String,
    #[arg(long, default_value = "simplified")]
    mode: GenerationMode,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, value_delimiter = ',', default_value = "front,back,left,right")]
    angles: Vec<ViewAngle>,
    #[arg(long, value_delimiter = ',')]
    texture_angles: Vec<ViewAngle>,
    #[arg(long)]
    colors: Option<usize>,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[arg(long)]
    pipeline: String,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    quality: Option<String>,
    #[arg(long)]
    format: Option<ModelFormat>,
    #[arg(long)]
    pbr: bool,
    #[arg(long)]
    faces: Option<u32>,
    /// Resubmit a pipeline whose previous generation failed.
    #[arg(long)]
    retry_failed: bool,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[arg(long)]
    pipeline: String,
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,
    #[arg(long, default_value_t = 900)]
    timeout_secs: u64,
}

#[derive(Debug, Args)]
struct SizeArgs {
    /// Print bed as WIDTHxHEIGHTxDEPTH in mm.
    #[arg(long)]
    bed: Option<String>,
    /// Desired size per axis in mm; unset axes are ignored.
    #[arg(long)]
    target_width: Option<f64>,
    #[arg(long)]
    target_height: Option<f64>,
    #[arg(long)]
    target_depth: Option<f64>,
}

impl SizeArgs {
    fn bed(&self) -> Result<Option<BedSize>> {
        self.bed.as_deref().map(parse_bed).transpose()
    }

    fn target(&self) -> [Option<f64>; 3] {
        [self.target_width, self.target_height, self.target_depth]
    }
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long)]
    model: PathBuf,
    #[command(flatten)]
    size: SizeArgs,
}

#[derive(Debug, Args)]
struct OptimizeArgs {
    #[arg(long)]
    model: PathBuf,
    /// Destination binary STL.
    #[arg(long)]
    output: PathBuf,
    #[command(flatten)]
    size: SizeArgs,
    /// Uniform scale factor, used when no target size is given.
    #[arg(long)]
    scale: Option<f64>,
    /// Keep the model where it is instead of centering it on the bed.
    #[arg(long)]
    no_center: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("photo3d error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Providers => {
            let service = open_service(&cli.workspace, cli.config.as_deref())?;
            print_json(&service.list_providers())?;
            Ok(0)
        }
        Command::Analyze(args) => run_analyze(args),
        Command::Optimize(args) => run_optimize(args),
        command => {
            let service = open_service(&cli.workspace, cli.config.as_deref())?;
            run_pipeline_command(&service, command)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn open_service(workspace: &Path, config_path: Option<&Path>) -> Result<GenerationService> {
    let config = match config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env(),
    };
    let workspace = Arc::new(LocalWorkspace::open(workspace)?);
    Ok(GenerationService::local(config, workspace))
}

fn run_pipeline_command(service: &GenerationService, command: Command) -> Result<i32> {
    match command {
        Command::New(args) => {
            let bytes = fs::read(&args.image)
                .with_context(|| format!("failed reading {}", args.image.display()))?;
            let record = service.create_pipeline(args.id.as_deref(), &bytes)?;
            print_json(&record)?;
            Ok(0)
        }
        Command::Views(args) => run_views(service, args),
        Command::Start(args) => {
            let request = StartRequest {
                provider: args.provider,
                options: GenerationOptions {
                    quality: args.quality,
                    format: args.format,
                    enable_pbr: args.pbr,
                    face_count: args.faces,
                },
                retry_failed: args.retry_failed,
            };
            let outcome = service.start_generation(&args.pipeline, &request)?;
            print_json(&outcome)?;
            Ok(0)
        }
        Command::Status(args) => {
            let outcome = service.check_generation_status(&args.pipeline)?;
            print_json(&outcome)?;
            Ok(exit_code(outcome.status))
        }
        Command::Watch(args) => {
            let outcome = service.watch_generation(
                &args.pipeline,
                Duration::from_secs(args.interval_secs),
                Duration::from_secs(args.timeout_secs),
                |update| {
                    info!(
                        pipeline_id = %update.pipeline_id,
                        status = %update.status,
                        progress = ?update.progress,
                        "generation status"
                    );
                },
            )?;
            print_json(&outcome)?;
            Ok(exit_code(outcome.status))
        }
        Command::Show(args) => {
            print_json(&service.pipeline(&args.pipeline)?)?;
            Ok(0)
        }
        Command::Providers | Command::Analyze(_) | Command::Optimize(_) => Ok(0),
    }
}

fn run_views(service: &GenerationService, args: ViewsArgs) -> Result<i32> {
    let request = ViewsRequest {
        mode: args.mode,
        description: args.description,
        plan: MultiViewPlan {
            mesh_angles: args.angles,
            texture_angles: args.texture_angles,
        },
        expected_colors: args.colors,
    };
    let (sender, receiver) = mpsc::channel::<ProgressEvent>();
    let outcome = thread::scope(|scope| {
        scope.spawn(move || {
            for event in receiver {
                eprintln!("{event}");
            }
        });
        let outcome = service.generate_views(&args.pipeline, &request, Some(&sender));
        drop(sender);
        outcome
    })?;
    print_json(&outcome)?;
    Ok(if outcome.failures.is_empty() { 0 } else { 2 })
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let report = analyze_model_file(&args.model)?;
    let bed_scale = args
        .size
        .bed()?
        .and_then(|bed| fit_to_bed_scale(report.stats.extents, bed));
    let target_scale = target_size_scale(report.stats.extents, args.size.target());
    print_json(&json!({
        "report": report,
        "fit_to_bed_scale": bed_scale,
        "target_size_scale": target_scale,
    }))?;
    Ok(0)
}

fn run_optimize(args: OptimizeArgs) -> Result<i32> {
    let options = OptimizeOptions {
        target_size: args.size.target(),
        uniform_scale: args.scale,
        print_bed: args.size.bed()?,
        center: !args.no_center,
    };
    let report = optimize_model_file(&args.model, &args.output, &options)?;
    info!(output = %args.output.display(), "optimized model written");
    print_json(&report)?;
    Ok(0)
}

fn parse_bed(raw: &str) -> Result<BedSize> {
    let parts = raw
        .split(['x', 'X'])
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .with_context(|| format!("invalid bed dimension '{part}'"))
        })
        .collect::<Result<Vec<f64>>>()?;
    match parts.as_slice() {
        [width, height, depth] => Ok(BedSize {
            width: *width,
            height: *height,
            depth: *depth,
        }),
        _ => anyhow::bail!("bed size must look like 220x220x250, got '{raw}'"),
    }
}

fn exit_code(status: TaskStatus) -> i32 {
    match status {
        TaskStatus::Failed => 2,
        _ => 0,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{parse_bed, Cli, Command};

    #[test]
    fn bed_size_parses_three_dimensions() -> anyhow::Result<()> {
        let bed = parse_bed("220x220X250")?;
        assert_eq!((bed.width, bed.height, bed.depth), (220.0, 220.0, 250.0));
        assert!(parse_bed("220x220").is_err());
        assert!(parse_bed("axbxc").is_err());
        Ok(())
    }

    #[test]
    fn views_command_accepts_angle_lists() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "photo3d",
            "views",
            "--pipeline",
            "pipe-1",
            "--angles",
            "front,back",
            "--texture-angles",
            "front",
        ])?;
        match cli.command {
            Command::Views(args) => {
                assert_eq!(args.angles.len(), 2);
                assert_eq!(args.texture_angles.len(), 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn optimize_command_reads_size_flags() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "photo3d",
            "optimize",
            "--model",
            "model.glb",
            "--output",
            "print.stl",
            "--bed",
            "220x220x250",
            "--target-height",
            "80",
            "--no-center",
        ])?;
        match cli.command {
            Command::Optimize(args) => {
                assert_eq!(args.size.target(), [None, Some(80.0), None]);
                assert!(args.size.bed()?.is_some());
                assert!(args.no_center);
                assert_eq!(args.scale, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
        Ok(())
    }
}
