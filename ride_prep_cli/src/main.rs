use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use ride_prep::ledger::{ClassCount, Ledger};
use ride_prep::pipeline::count_labels;
use ride_prep::store::open_store;
use ride_prep::{GaussianBackend, Pipeline, PrepConfig, RunReport, Split, StoreMode};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ride telemetry bucket preprocessing CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full preprocessing pipeline over a data directory
    Run(RunArgs),
    /// Summarize the bucket archives and class counts of a data directory
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Data directory holding `<split>/<region>/` ride files
    #[arg(value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// Base configuration JSON; flags override its values
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Region subdirectory to process
    #[arg(long)]
    region: Option<String>,

    /// Ride file name prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Resampling strategy (linear|equidistant)
    #[arg(long)]
    interpolation: Option<String>,

    /// Equidistant grid interval (milliseconds)
    #[arg(long)]
    time_interval: Option<i64>,

    /// Largest tolerated gap between rows (milliseconds)
    #[arg(long)]
    max_gap: Option<f64>,

    /// Rows per window
    #[arg(long)]
    window_size: Option<usize>,

    /// Windows per bucket
    #[arg(long)]
    slices: Option<usize>,

    /// Rows discarded at each end of a ride before bucketing
    #[arg(long)]
    edge_trim: Option<usize>,

    /// Include linear acceleration channels
    #[arg(long, action = ArgAction::SetTrue)]
    lin_acc: bool,

    /// Archive layout
    #[arg(long, value_enum)]
    store_mode: Option<StoreModeOpt>,

    /// Skip the Fourier transform stage
    #[arg(long, action = ArgAction::SetTrue)]
    no_fourier: bool,

    /// Add rotated copies of positive train buckets
    #[arg(long, action = ArgAction::SetTrue)]
    rotation: bool,

    /// Skip generative augmentation
    #[arg(long, action = ArgAction::SetTrue)]
    no_generative: bool,

    /// Generator training epochs
    #[arg(long)]
    gan_epochs: Option<usize>,

    /// Generator training batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Generator noise dimension
    #[arg(long)]
    latent_dim: Option<usize>,

    /// Share of the class gap filled with synthetic positives
    #[arg(long)]
    synthetic_ratio: Option<f64>,

    /// Class-count ledger file name (inside the data directory)
    #[arg(long)]
    class_counts_file: Option<String>,

    /// Generator checkpoint directory
    #[arg(long, value_hint = ValueHint::DirPath)]
    gan_checkpoint_dir: Option<PathBuf>,

    /// Worker threads (defaults to all cores)
    #[arg(long)]
    workers: Option<usize>,

    /// Seed for generation and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Write the JSON run report here instead of stdout
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Data directory holding `<split>/<region>.npz` archives
    #[arg(value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// Region whose archives to summarize
    #[arg(long, default_value = "Berlin")]
    region: String,

    /// Archive layout
    #[arg(long, value_enum, default_value_t = StoreModeOpt::InMemory)]
    store_mode: StoreModeOpt,

    /// Class-count ledger file name (inside the data directory)
    #[arg(long, default_value = "class_counts.csv")]
    class_counts_file: String,

    /// Output CSV path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StoreModeOpt {
    InMemory,
    Keyed,
}

impl From<StoreModeOpt> for StoreMode {
    fn from(value: StoreModeOpt) -> Self {
        match value {
            StoreModeOpt::InMemory => StoreMode::InMemory,
            StoreModeOpt::Keyed => StoreMode::Keyed,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Run(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn build_config(args: &RunArgs) -> Result<PrepConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => PrepConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PrepConfig::default(),
    };
    config.data_dir = args.data_dir.clone();
    if let Some(region) = &args.region {
        config.region = region.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.file_prefix = prefix.clone();
    }
    if let Some(interpolation) = &args.interpolation {
        config.interpolation = interpolation.clone();
    }
    if let Some(v) = args.time_interval {
        config.time_interval_ms = v;
    }
    if let Some(v) = args.max_gap {
        config.max_gap_ms = v;
    }
    if let Some(v) = args.window_size {
        config.window_size = v;
    }
    if let Some(v) = args.slices {
        config.slices = v;
    }
    if let Some(v) = args.edge_trim {
        config.edge_trim_rows = v;
    }
    if let Some(mode) = args.store_mode {
        config.store_mode = mode.into();
    }
    if let Some(v) = args.gan_epochs {
        config.gan_epochs = v;
    }
    if let Some(v) = args.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = args.latent_dim {
        config.latent_dim = v;
    }
    if let Some(v) = args.synthetic_ratio {
        config.synthetic_ratio = v;
    }
    if let Some(name) = &args.class_counts_file {
        config.class_counts_file = name.clone();
    }
    if let Some(dir) = &args.gan_checkpoint_dir {
        config.gan_checkpoint_dir = dir.clone();
    }
    if args.workers.is_some() {
        config.workers = args.workers;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.lin_acc |= args.lin_acc;
    config.rotation |= args.rotation;
    if args.no_fourier {
        config.fourier = false;
    }
    if args.no_generative {
        config.generative = false;
    }
    config.validate()?;
    Ok(config)
}

fn handle_run(args: RunArgs) -> Result<()> {
    if !args.data_dir.is_dir() {
        return Err(anyhow!("{} is not a directory", args.data_dir.display()));
    }
    let config = build_config(&args)?;
    info!(
        "preprocessing {} (region {}, {} interpolation, {:?} store)",
        config.data_dir.display(),
        config.region,
        config.interpolation,
        config.store_mode
    );

    let t_run = Instant::now();
    let backend = GaussianBackend;
    let report = Pipeline::new(config)
        .with_backend(&backend)
        .run()
        .context("pipeline failed")?;
    if let Some(stage) = report.halted_after {
        warn!("pipeline halted at stage {}", stage.name());
    }
    info!("done in {:.2} s", t_run.elapsed().as_secs_f64());

    match args.output.as_ref() {
        Some(path) => write_report_file(&report, path),
        None => write_report(&report, io::stdout().lock()),
    }
}

fn write_report<W: Write>(report: &RunReport, mut writer: W) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    Ok(())
}

fn write_report_file(report: &RunReport, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    write_report(report, file)?;
    info!("Wrote run report: {}", path.display());
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let config = PrepConfig {
        data_dir: args.data_dir.clone(),
        region: args.region.clone(),
        store_mode: args.store_mode.into(),
        class_counts_file: args.class_counts_file.clone(),
        ..PrepConfig::default()
    };
    let ledger = Ledger::load(&config.ledger_path())
        .with_context(|| format!("failed to read {}", config.ledger_path().display()))?;

    let mut rows = Vec::new();
    for split in Split::ALL {
        let path = config.archive_path(split);
        if !path.exists() {
            warn!("no archive at {}", path.display());
            continue;
        }
        let archive = open_store(config.store_mode, &path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let shape = archive
            .iter()
            .next()
            .map(|(_, b)| format!("{:?}", b.dim()))
            .unwrap_or_default();
        let counts: ClassCount = ledger
            .get(&Ledger::key(split, &config.region))
            .unwrap_or_else(|| count_labels(archive.as_ref()));
        rows.push([
            split.to_string(),
            config.region.clone(),
            format!("{:?}", config.store_mode),
            archive.len().to_string(),
            shape,
            counts.positive.to_string(),
            counts.negative.to_string(),
        ]);
    }

    if args.output.as_os_str() == "-" {
        let mut writer = csv::Writer::from_writer(io::stdout().lock());
        write_inspect_rows(&rows, &mut writer)
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("failed to create {}", args.output.display()))?;
        let mut writer = csv::Writer::from_writer(file);
        write_inspect_rows(&rows, &mut writer)?;
        info!("Wrote archive summary: {}", args.output.display());
        Ok(())
    }
}

fn write_inspect_rows<W: Write>(rows: &[[String; 7]], writer: &mut csv::Writer<W>) -> Result<()> {
    writer.write_record([
        "split",
        "region",
        "mode",
        "buckets",
        "shape",
        "positives",
        "negatives",
    ])?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "ride-prep",
            "run",
            "data",
            "--region",
            "Leipzig",
            "--interpolation",
            "linear",
            "--store-mode",
            "keyed",
            "--rotation",
            "--no-generative",
            "--workers",
            "2",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = build_config(&args).unwrap();
        assert_eq!(config.region, "Leipzig");
        assert_eq!(config.interpolation, "linear");
        assert_eq!(config.store_mode, StoreMode::Keyed);
        assert!(config.rotation);
        assert!(!config.generative);
        assert!(config.fourier);
        assert_eq!(config.workers, Some(2));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cli = Cli::parse_from(["ride-prep", "run", "data", "--window-size", "0"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(build_config(&args).is_err());
    }
}
