//! FastPipe CLI - deterministic image transform pipeline
//!
//! Runs a pipeline spec, built from `--op` arguments or a named profile, over
//! a single file or a whole directory.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};
use walkdir::WalkDir;

use fastpipe::config::{self, ChromaSubsampling, NamingConfig};
use fastpipe::parallel::{plan_jobs, BatchResult, ParallelRunner, ProgressUpdate, RunSummary};
use fastpipe::processing::formats::{detect_format_from_path, is_supported_input_format};
use fastpipe::processing::{quick_filter, InputValidator};
use fastpipe::{
    init_with_config, Config, FastPipeError, ImageFormat, Operation, Pipeline, PipelineSpec,
    RunMode,
};

/// FastPipe - deterministic image transform pipeline
#[derive(Parser)]
#[command(
    name = "fastpipe",
    version,
    about = "Decode, resize, filter and re-encode images",
    long_about = "FastPipe decodes JPEG, PNG, WebP, GIF and TIFF inputs, applies an ordered list of \
                  geometric and filter operations, and encodes JPEG, PNG or WebP. Identical input \
                  and operations always produce identical bytes."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to ./fastpipe.toml or ./fastpipe.yaml if present)
    #[arg(short, long, global = true, value_name = "FILE", env = "FASTPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum concurrent runs (default: auto-detect)
    #[arg(short, long, global = true, value_name = "COUNT", env = "FASTPIPE_THREADS")]
    threads: Option<usize>,

    /// Pixel ceiling for decoded and produced images
    #[arg(long, global = true, value_name = "PIXELS", env = "FASTPIPE_MAX_PIXELS")]
    max_pixels: Option<u64>,

    /// Disable the decode cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Disable the lane-chunked filter paths
    #[arg(long, global = true)]
    no_simd: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short = 'Q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

/// Available subcommands
#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline on one file
    Run {
        /// Input image
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Output image; its extension picks the format unless --format is given
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        #[command(flatten)]
        spec: SpecArgs,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the pipeline on every image in a directory
    Batch {
        /// Input directory (or a single file)
        #[arg(short, long, value_name = "PATH")]
        input: PathBuf,

        /// Output directory
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,

        #[command(flatten)]
        spec: SpecArgs,

        /// Process directories recursively
        #[arg(short = 'R', long)]
        recursive: bool,

        /// Show what would be processed without processing
        #[arg(long)]
        dry_run: bool,

        /// Keep going after errors that would repeat for every input
        #[arg(long)]
        keep_going: bool,

        /// Print the batch summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List available profiles
    Profiles {
        /// Show the operations of each profile
        #[arg(long)]
        detailed: bool,
    },
    /// Validate a configuration file
    Config {
        /// Configuration file to validate
        file: PathBuf,
    },
    /// Generate an example configuration file
    ExampleConfig {
        /// Output file path
        #[arg(short, long, default_value = "fastpipe.toml")]
        output: PathBuf,
        /// Use YAML format instead of TOML
        #[arg(long)]
        yaml: bool,
    },
    /// Show system information and capabilities
    Info,
}

/// Options that make up a pipeline spec
#[derive(Args, Debug, Clone)]
struct SpecArgs {
    /// Operation in compact form, repeatable and applied in order
    /// (e.g. resize=640x392:cover:attention, rotate=90, sharpen, gamma=2.2)
    #[arg(long = "op", value_name = "OP", value_parser = parse_operation)]
    ops: Vec<Operation>,

    /// Start from a named profile; --op arguments are appended to its operations
    #[arg(short, long, value_name = "NAME")]
    profile: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, value_name = "FORMAT")]
    format: Option<CliImageFormat>,

    /// JPEG quality (1-100)
    #[arg(
        short,
        long,
        value_name = "QUALITY",
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    quality: Option<u8>,

    /// Progressive JPEG
    #[arg(long)]
    progressive: bool,

    /// JPEG chroma subsampling (420, 422, 444)
    #[arg(long, value_name = "MODE", value_parser = parse_chroma)]
    chroma: Option<ChromaSubsampling>,

    /// PNG adaptive row filtering
    #[arg(long)]
    adaptive_filtering: bool,

    /// PNG compression level (0-9)
    #[arg(long, value_name = "LEVEL", value_parser = clap::value_parser!(u8).range(0..=9))]
    compression_level: Option<u8>,

    /// Read inputs front to back in one pass, bypassing the decode cache
    #[arg(long)]
    sequential_read: bool,
}

/// CLI-compatible output format enum
#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliImageFormat {
    Jpeg,
    Png,
    Webp,
}

impl From<CliImageFormat> for ImageFormat {
    fn from(format: CliImageFormat) -> Self {
        match format {
            CliImageFormat::Jpeg => ImageFormat::Jpeg,
            CliImageFormat::Png => ImageFormat::Png,
            CliImageFormat::Webp => ImageFormat::WebP,
        }
    }
}

fn parse_operation(s: &str) -> Result<Operation, String> {
    s.parse::<Operation>().map_err(|e| e.to_string())
}

fn parse_chroma(s: &str) -> Result<ChromaSubsampling, String> {
    s.parse::<ChromaSubsampling>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli).await {
        let message = match e.downcast_ref::<FastPipeError>() {
            Some(error) => error.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", style("Error").red().bold(), message);
        process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            ref input,
            ref output,
            ref spec,
            json,
        } => {
            init_with_config(&config)?;
            run_single(&config, input, output, spec, json)
        }
        Commands::Batch {
            ref input,
            ref output,
            ref spec,
            recursive,
            dry_run,
            keep_going,
            json,
        } => {
            init_with_config(&config)?;
            let options = BatchOptions {
                recursive,
                dry_run,
                keep_going,
                json,
                quiet: cli.quiet,
            };
            run_batch(&config, input, output, spec, &options).await
        }
        Commands::Profiles { detailed } => {
            show_profiles(&config, detailed);
            Ok(())
        }
        Commands::Config { ref file } => validate_config_file(file),
        Commands::ExampleConfig { ref output, yaml } => generate_example_config(output, yaml),
        Commands::Info => {
            show_system_info(&config);
            Ok(())
        }
    }
}

/// Load the config file, then apply command line overrides
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = cli.config.clone().or_else(config::default_config_path);
    let mut config = match path {
        Some(path) => {
            let loaded = Config::from_file(&path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            // Built-in profiles stay available unless the file overrides them
            Config::default().merge(loaded)
        }
        None => Config::default(),
    };

    if cli.quiet {
        config.logging.level = "error".to_string();
    } else if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(threads) = cli.threads {
        config.runtime.concurrency = Some(threads);
    }
    if let Some(max_pixels) = cli.max_pixels {
        config.runtime.max_pixels = max_pixels;
    }
    if cli.no_cache {
        config.runtime.cache = false;
    }
    if cli.no_simd {
        config.runtime.simd = false;
    }

    config.runtime.validate()?;
    Ok(config)
}

/// Build the spec from a profile and/or operations; returns output naming too
fn build_spec(
    config: &Config,
    args: &SpecArgs,
    fallback: ImageFormat,
) -> anyhow::Result<(PipelineSpec, NamingConfig)> {
    let (mut spec, naming) = match &args.profile {
        Some(name) => {
            let profile = config.get_profile(name)?;
            (profile.spec.clone(), profile.naming.clone())
        }
        None => (PipelineSpec::new(fallback), NamingConfig::default()),
    };

    spec.operations.extend(args.ops.iter().cloned());
    if let Some(format) = args.format {
        spec.format = format.into();
    }
    if let Some(quality) = args.quality {
        spec = spec.quality(quality);
    }
    if args.progressive {
        spec = spec.progressive(true);
    }
    if let Some(chroma) = args.chroma {
        spec = spec.chroma_subsampling(chroma);
    }
    if args.adaptive_filtering {
        spec = spec.adaptive_filtering(true);
    }
    if let Some(level) = args.compression_level {
        spec = spec.compression_level(level);
    }
    if args.sequential_read {
        spec = spec.sequential_read(true);
    }

    spec.validate()?;
    debug!("Pipeline spec: {:?}", spec);
    Ok((spec, naming))
}

/// Run one file through the pipeline
fn run_single(
    config: &Config,
    input: &Path,
    output: &Path,
    args: &SpecArgs,
    json: bool,
) -> anyhow::Result<()> {
    let fallback = detect_format_from_path(output)
        .ok()
        .filter(|format| format.can_encode())
        .unwrap_or(ImageFormat::Jpeg);
    let (spec, _) = build_spec(config, args, fallback)?;

    info!("Running {} operation(s) on {}", spec.operations.len(), input.display());
    let pipeline = Pipeline::new();
    let result = pipeline.execute(&input.into(), &spec, &RunMode::File(output.to_path_buf()))?;
    let summary = RunSummary::from(&result);

    if json {
        let report = serde_json::json!({
            "input": input,
            "output": output,
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} {} ({}x{} {}) -> {} ({}x{} {}, {:.1} KB) in {:.1}ms",
            style("✓").green().bold(),
            input.display(),
            summary.input_dimensions.0,
            summary.input_dimensions.1,
            summary.input_format,
            output.display(),
            summary.output_dimensions.0,
            summary.output_dimensions.1,
            summary.output_format,
            summary.output_bytes as f64 / 1024.0,
            summary.timings.total().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

struct BatchOptions {
    recursive: bool,
    dry_run: bool,
    keep_going: bool,
    json: bool,
    quiet: bool,
}

/// Run every image under `input` through the pipeline
async fn run_batch(
    config: &Config,
    input: &Path,
    output: &Path,
    args: &SpecArgs,
    options: &BatchOptions,
) -> anyhow::Result<()> {
    let (spec, naming) = build_spec(config, args, ImageFormat::Jpeg)?;

    let files = discover_files(input, options.recursive)?;
    let files = quick_filter(&InputValidator::new(), files).await;
    if files.is_empty() {
        bail!("No processable image files found in {}", input.display());
    }
    info!("Found {} files to process", files.len());

    let input_root = if input.is_dir() {
        input
    } else {
        input.parent().unwrap_or_else(|| Path::new(""))
    };
    let jobs = plan_jobs(&files, input_root, output, &naming, spec.format);

    if options.dry_run {
        println!("{} files would be processed:", style(jobs.len()).bold());
        for job in &jobs {
            if let RunMode::File(target) = &job.mode {
                println!("  {} -> {}", job.input.display(), target.display());
            }
        }
        return Ok(());
    }

    let runner = ParallelRunner::new(Pipeline::new()).stop_on_fatal(!options.keep_going);

    // Drive the progress bar from the tracker's broadcast channel
    let reporter = (!options.json && !options.quiet).then(|| {
        let bar = ProgressBar::new(jobs.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}, {eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        let mut updates = runner.progress().subscribe();
        tokio::spawn(async move {
            while let Ok(update) = updates.recv().await {
                match update {
                    ProgressUpdate::RunStarted { name, .. } => bar.set_message(name),
                    ProgressUpdate::RunCompleted { .. } => bar.inc(1),
                    ProgressUpdate::RunFailed { name, error, .. } => {
                        bar.println(format!("{} {}: {}", style("✗").red().bold(), name, error));
                        bar.inc(1);
                    }
                    ProgressUpdate::BatchCompleted { .. } => break,
                    ProgressUpdate::Started { .. } => {}
                }
            }
            bar.finish_with_message("done");
        })
    });

    let result = runner.run_batch(jobs, &spec).await;
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    if options.json {
        println!("{}", serde_json::to_string_pretty(&batch_json(&result))?);
    } else if !options.quiet {
        print_summary(&result, &runner);
    }

    if result.failed > 0 {
        bail!("{} of {} runs failed", result.failed, result.reports.len());
    }
    Ok(())
}

/// Find supported images under `input`, sorted for a stable run order
fn discover_files(input: &Path, recursive: bool) -> anyhow::Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        bail!("Input path does not exist: {}", input.display());
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    for entry in WalkDir::new(input).max_depth(max_depth) {
        let entry = entry.with_context(|| format!("Failed to read {}", input.display()))?;
        let path = entry.path();
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(is_supported_input_format)
            .unwrap_or(false);
        if entry.file_type().is_file() && supported {
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

fn batch_json(result: &BatchResult) -> serde_json::Value {
    let runs: Vec<serde_json::Value> = result
        .reports
        .iter()
        .map(|report| {
            let output = match &report.mode {
                RunMode::File(path) => Some(path.clone()),
                RunMode::Buffer => None,
            };
            match &report.outcome {
                Ok(summary) => serde_json::json!({
                    "input": report.input,
                    "output": output,
                    "ok": true,
                    "summary": summary,
                }),
                Err(error) => serde_json::json!({
                    "input": report.input,
                    "output": output,
                    "ok": false,
                    "stage": error.stage(),
                    "error": error.user_message(),
                }),
            }
        })
        .collect();

    serde_json::json!({
        "succeeded": result.succeeded,
        "failed": result.failed,
        "elapsed_secs": result.elapsed.as_secs_f64(),
        "runs_per_second": result.runs_per_second(),
        "pixels_per_second": result.pixels_per_second(),
        "total_output_bytes": result.total_output_bytes,
        "runs": runs,
    })
}

fn print_summary(result: &BatchResult, runner: &ParallelRunner) {
    println!();
    println!("{}", style("Batch Summary:").bold());
    println!("  {}: {}", style("Succeeded").green(), result.succeeded);
    if result.failed > 0 {
        println!("  {}: {}", style("Failed").red(), result.failed);
    }
    println!("  {}: {:.2}s", style("Duration").blue(), result.elapsed.as_secs_f64());

    if result.succeeded > 0 {
        let metrics = runner.progress().get_metrics();
        println!(
            "  {}: {:.1} runs/sec, {}",
            style("Speed").cyan(),
            result.runs_per_second(),
            metrics.throughput_text()
        );
        println!(
            "  {}: {:.2} MB written, {} average",
            style("Output").cyan(),
            result.total_output_bytes as f64 / 1024.0 / 1024.0,
            metrics.average_size_text()
        );
        if let Some(cache) = runner.pipeline().cache() {
            let stats = cache.stats();
            println!("  {}: {} hits, {} misses", style("Cache").cyan(), stats.hits, stats.misses);
        }
    }

    if result.failed > 0 {
        println!();
        println!("{}", style("Errors:").bold());
        for (path, error) in result.errors() {
            println!("  {}: {}", path.display(), error.user_message());
        }
    }
}

fn show_profiles(config: &Config, detailed: bool) {
    println!("{}", style("Available Profiles:").bold());
    println!();

    let mut names: Vec<_> = config.profiles.keys().collect();
    names.sort();
    for name in names {
        let profile = &config.profiles[name];
        println!("{} ({})", style(name).cyan().bold(), profile.spec.format);
        if detailed {
            for operation in &profile.spec.operations {
                println!("  --op {}", operation);
            }
            if let Some(quality) = profile.spec.encode.quality {
                println!("  quality: {}", quality);
            }
            println!(
                "  output name: {}",
                profile.naming.generate_filename("image.jpg", profile.spec.format)
            );
            println!();
        }
    }

    if !detailed {
        println!();
        println!("Use {} for detailed information", style("--detailed").dim());
    }
}

fn validate_config_file(file: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(file)?;
    config.validate()?;

    println!("{}: Configuration file is valid", style("Success").green().bold());
    println!("Profiles: {}", config.profiles.len());
    Ok(())
}

fn generate_example_config(output: &Path, yaml: bool) -> anyhow::Result<()> {
    let output = if yaml && output.extension().map_or(true, |ext| ext == "toml") {
        output.with_extension("yaml")
    } else {
        output.to_path_buf()
    };

    Config::default().to_file(&output)?;

    let format = if yaml { "YAML" } else { "TOML" };
    println!(
        "{}: Generated example {} configuration: {}",
        style("Success").green().bold(),
        format,
        output.display()
    );
    Ok(())
}

fn show_system_info(config: &Config) {
    use sysinfo::{CpuExt, System, SystemExt};

    println!("{}", style("FastPipe System Information").bold());
    println!();
    println!("{}: {}", style("Version").bold(), fastpipe::VERSION);
    println!();

    let mut system = System::new_all();
    system.refresh_all();

    println!("{}", style("System:").bold());
    if let Some(name) = system.name() {
        println!("  OS: {}", name);
    }
    if let Some(version) = system.os_version() {
        println!("  Version: {}", version);
    }
    println!("  CPUs: {}", system.cpus().len());
    if let Some(cpu) = system.cpus().first() {
        println!("  CPU: {} ({:.2} GHz)", cpu.brand(), cpu.frequency() as f64 / 1000.0);
    }
    println!(
        "  Memory: {:.2} GB total, {:.2} GB available",
        system.total_memory() as f64 / 1024.0 / 1024.0 / 1024.0,
        system.available_memory() as f64 / 1024.0 / 1024.0 / 1024.0
    );
    println!();

    println!("{}", style("Formats:").bold());
    println!("  Input: JPEG, PNG, WebP, GIF, TIFF");
    println!("  Output: JPEG, PNG, WebP");
    println!();

    let runtime = &config.runtime;
    println!("{}", style("Runtime:").bold());
    println!("  Concurrency: {}", runtime.effective_concurrency());
    println!(
        "  Decode cache: {}",
        if runtime.cache {
            format!("on ({} items, {} MB)", runtime.cache_items, runtime.cache_memory / 1024 / 1024)
        } else {
            "off".to_string()
        }
    );
    println!("  Lane-chunked filters: {}", if runtime.simd { "on" } else { "off" });
    println!("  Pixel ceiling: {} pixels", runtime.max_pixels);
}
