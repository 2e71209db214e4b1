use clap::{Args, Parser, Subcommand};
use karta_core::config::{load_karta_config, ConfigError, KartaConfig};
use karta_core::results::RunReport;
use karta_core::types::{RunName, RunTarget, RunTargetKind, TestCatalog};
use karta_minion::server::MinionServer;
use karta_minion::MinionError;
use karta_plugins::builtin::ECHO_STEP_RUNNER;
use kartad::{init_logging, KartaRuntime, RuntimeError};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "karta", about = "Distributed test orchestration runtime")]
struct Cli {
    /// Runtime configuration file (TOML).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a feature file, a catalog test, or every catalog test carrying a tag.
    Run(RunArgs),
    /// Serve this process as a remote minion.
    Minion(MinionArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, value_name = "PATH", conflicts_with_all = ["tags", "test"])]
    feature_file: Option<PathBuf>,
    /// Comma separated tags; runs every catalog test carrying any of them.
    #[arg(long, value_delimiter = ',', conflicts_with = "test")]
    tags: Vec<String>,
    #[arg(long)]
    test: Option<String>,
    /// JSON test catalog used by `--tags` and `--test`.
    #[arg(long, value_name = "PATH")]
    catalog: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    iterations: u64,
    #[arg(long, default_value_t = 1)]
    parallel: usize,
    #[arg(long)]
    chance_based: bool,
    #[arg(long)]
    exclusive: bool,
    #[arg(long)]
    run_name: Option<String>,
    /// Print the run report as JSON instead of a summary line.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct MinionArgs {
    #[arg(long, default_value = "127.0.0.1:9700")]
    bind: String,
    #[arg(long, default_value = "karta-minion")]
    name: String,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("failed to load config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to read catalog at {path}: {source}")]
    ReadCatalog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog json at {path}: {source}")]
    ParseCatalog {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("nothing to run: pass --feature-file, --tags or --test")]
    NoTarget,
    #[error("failed to serialize run report: {0}")]
    Report(#[source] serde_json::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Minion(#[from] MinionError),
    #[error("run {run_name} failed")]
    RunFailed { run_name: String },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("karta: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), MainError> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => load_karta_config(path)?,
        None => KartaConfig::default(),
    };
    init_logging(config.log_filter.as_deref());
    default_to_echo(&mut config);

    match cli.command {
        Command::Run(args) => run_tests(config, args),
        Command::Minion(args) => serve_minion(config, args),
    }
}

/// Without a configured step runner the stock binary dry-runs through `echo`.
fn default_to_echo(config: &mut KartaConfig) {
    let echo_enabled = config.enabled_plugins.is_empty()
        || config.enabled_plugins.iter().any(|name| name == ECHO_STEP_RUNNER);
    if config.default_step_runner_plugin.is_none() && echo_enabled {
        tracing::info!("no default step runner configured; using {ECHO_STEP_RUNNER}");
        config.default_step_runner_plugin = Some(ECHO_STEP_RUNNER.to_string());
    }
}

fn run_tests(config: KartaConfig, args: RunArgs) -> Result<(), MainError> {
    let target = run_target(&args)?;
    let catalog = match &args.catalog {
        Some(path) => load_catalog(path)?,
        None => TestCatalog::default(),
    };

    let runtime = KartaRuntime::builder(config).catalog(catalog).build()?;
    let report = runtime.run(args.run_name.clone().map(RunName::new), &target);
    runtime.shutdown();
    let report = report?;

    if args.json {
        let rendered = serde_json::to_string_pretty(&report).map_err(MainError::Report)?;
        println!("{rendered}");
    } else {
        print_summary(&report);
    }
    if report.passed {
        Ok(())
    } else {
        Err(MainError::RunFailed {
            run_name: report.run_name,
        })
    }
}

fn run_target(args: &RunArgs) -> Result<RunTarget, MainError> {
    let what = if let Some(path) = &args.feature_file {
        RunTargetKind::FeatureFile(path.clone())
    } else if let Some(test) = &args.test {
        RunTargetKind::TestReference(test.clone())
    } else if !args.tags.is_empty() {
        let tags: BTreeSet<String> = args
            .tags
            .iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        RunTargetKind::Tags(tags)
    } else {
        return Err(MainError::NoTarget);
    };

    let mut target = RunTarget::new(what).with_iterations(args.iterations, args.parallel);
    target.chance_based = args.chance_based;
    target.exclusive_per_iteration = args.exclusive;
    Ok(target)
}

fn load_catalog(path: &Path) -> Result<TestCatalog, MainError> {
    let contents = fs::read_to_string(path).map_err(|source| MainError::ReadCatalog {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| MainError::ParseCatalog {
        path: path.to_path_buf(),
        source,
    })
}

fn print_summary(report: &RunReport) {
    let scenarios: Vec<_> = report
        .features
        .iter()
        .flat_map(|feature| feature.scenario_results())
        .collect();
    let failed = scenarios.iter().filter(|s| !s.passed).count();
    println!(
        "run {} {}: features={} scenarios={} failed={}",
        report.run_name,
        if report.passed { "passed" } else { "failed" },
        report.features.len(),
        scenarios.len(),
        failed
    );
    for incident in report.all_incidents().into_iter().filter(|i| i.failure) {
        println!("  - {}", incident.message);
    }
}

fn serve_minion(config: KartaConfig, args: MinionArgs) -> Result<(), MainError> {
    let runtime = KartaRuntime::builder(config).name(args.name.clone()).build()?;
    let server = MinionServer::bind(&args.bind, runtime.clone())?;
    let shutdown = server.shutdown_flag();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(MainError::Signal)?;
    }

    tracing::info!(minion = %args.name, address = %server.local_addr()?, "minion listening");
    let served = server.serve();
    runtime.shutdown();
    served?;
    tracing::info!(minion = %args.name, "minion stopped");
    Ok(())
}
