//! MESHLOC: cooperative localization of ranging nodes from anchors and peers.
//!
//! - `run`: play a scenario file (TOML/JSON/YAML) and write per-round convergence records to CSV.
//! - `sweep`: repeat a scenario for several particle counts.
//! - `template`: write the default scenario so it can be edited.

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use meshloc::mesh::RoundMode;
use meshloc::sim::{
    ConvergenceRecord, ScenarioConfig, final_error_by_particle_count, particle_count_sweep,
    run_scenario,
};
use std::error::Error;
use std::path::{Path, PathBuf};

const LONG_ABOUT: &str = "MESHLOC: cooperative particle-filter localization of ranging nodes.

Anchor nodes have known positions. Unknown nodes are first localized from ranges to the anchors,
then refined from ranges to the other unknown nodes. Scenarios are described in a configuration
file (TOML/JSON/YAML); use the `template` command to generate one.";

#[derive(Parser)]
#[command(author, version, about = "Cooperative particle-filter localization of ranging nodes.", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(about = "Run a scenario and write convergence records")]
    Run(RunArgs),
    #[command(about = "Run a scenario once per particle count")]
    Sweep(SweepArgs),
    #[command(about = "Write the default scenario configuration")]
    Template(TemplateArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Scenario configuration file
    #[arg(short, long)]
    config: PathBuf,
    /// Output CSV file
    #[arg(short, long)]
    output: PathBuf,
    /// Override the round mode from the configuration
    #[arg(long, value_enum)]
    mode: Option<RoundMode>,
    /// Override the RNG seed from the configuration
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Clone, Debug)]
struct SweepArgs {
    /// Scenario configuration file (defaults to the built-in scenario)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Comma-separated particle counts
    #[arg(long, value_delimiter = ',', default_value = "10,100,1000")]
    counts: Vec<usize>,
    /// Output CSV file
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct TemplateArgs {
    /// Output configuration file (.toml, .json, .yaml)
    #[arg(short, long)]
    output: PathBuf,
}

/// Route `log` records to stderr, or append them to `log_file` when given.
fn init_logger(log_level: &str, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let level: log::LevelFilter = log_level
        .parse()
        .map_err(|_| format!("unknown log level '{log_level}'"))?;
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| {
        use std::io::Write;
        writeln!(
            buf,
            "{} {:<5} {}: {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    if let Some(path) = log_file {
        ensure_parent(path)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = ScenarioConfig::from_file(&args.config)?;
    if let Some(mode) = args.mode {
        config.round_mode = mode;
    }
    if args.seed.is_some() {
        config.mesh.seed = args.seed;
    }
    info!(
        "running {} with {} nodes ({:?} rounds)",
        args.config.display(),
        config.nodes.len(),
        config.round_mode
    );
    let records = run_scenario(&config)?;
    if let Some(last_round) = records.iter().map(|r| r.round).max() {
        for record in records.iter().filter(|r| r.round == last_round) {
            info!(
                "node {}: ({:.3}, {:.3}, {:.3}) error {:.3}",
                record.id, record.x, record.y, record.z, record.distance
            );
        }
    }
    ensure_parent(&args.output)?;
    ConvergenceRecord::to_csv(&records, &args.output)?;
    info!("wrote {} records to {}", records.len(), args.output.display());
    Ok(())
}

fn sweep(args: &SweepArgs) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => ScenarioConfig::from_file(path)?,
        None => ScenarioConfig::default(),
    };
    let records = particle_count_sweep(&config, &args.counts)?;
    for (n, error) in final_error_by_particle_count(&records) {
        info!("N = {n}: mean final position error {error:.4}");
    }
    ensure_parent(&args.output)?;
    ConvergenceRecord::to_csv(&records, &args.output)?;
    info!("wrote {} records to {}", records.len(), args.output.display());
    Ok(())
}

fn template(args: &TemplateArgs) -> Result<(), Box<dyn Error>> {
    ensure_parent(&args.output)?;
    ScenarioConfig::default().to_file(&args.output)?;
    println!("Configuration written to {}", args.output.display());
    println!("Run it with:\n  meshloc run --config {} --output results.csv", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_deref())?;

    let result = match &cli.command {
        Command::Run(args) => run(args),
        Command::Sweep(args) => sweep(args),
        Command::Template(args) => template(args),
    };
    if let Err(e) = &result {
        error!("{e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sweep_counts() {
        let cli = Cli::try_parse_from([
            "meshloc", "sweep", "--counts", "10,200,3000", "--output", "out.csv",
        ])
        .unwrap();
        match cli.command {
            Command::Sweep(args) => {
                assert_eq!(args.counts, vec![10, 200, 3000]);
                assert!(args.config.is_none());
            }
            _ => panic!("expected sweep"),
        }
    }

    #[test]
    fn parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "meshloc",
            "--log-level",
            "debug",
            "run",
            "--config",
            "scenario.toml",
            "--output",
            "out.csv",
            "--mode",
            "snapshot",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.mode, Some(RoundMode::Snapshot));
                assert_eq!(args.config, PathBuf::from("scenario.toml"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn rejects_unknown_log_level() {
        let err = init_logger("loud", None).unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn template_then_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("nested/scenario.yaml");
        template(&TemplateArgs {
            output: config.clone(),
        })
        .unwrap();
        let output = dir.path().join("out/records.csv");
        let mut scenario = ScenarioConfig::from_file(&config).unwrap();
        scenario.mesh.default_particles = 100;
        scenario.mesh_rounds = 1;
        scenario.to_file(&config).unwrap();
        run(&RunArgs {
            config,
            output: output.clone(),
            mode: None,
            seed: Some(3),
        })
        .unwrap();
        assert_eq!(ConvergenceRecord::from_csv(&output).unwrap().len(), 6);
    }
}
