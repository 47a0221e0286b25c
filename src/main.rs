use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{LimiterRegistry, Sweeper};
use turnstile::simulate::{self, SimulationPlan, SimulationReport, UserProfile};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Per-user request admission control")]
struct Cli {
    /// YAML configuration file; built-in policies are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the configuration, then list its policies
    Check,
    /// Drive simulated users through a policy and report their outcomes
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Policy to simulate against
    #[arg(short, long, default_value = "standard")]
    policy: String,

    /// Requests per user; without it a regular, a power and a suspicious user are simulated
    #[arg(long)]
    requests: Option<u32>,

    /// Number of users when --requests is given
    #[arg(long, default_value_t = 1)]
    users: u32,

    /// Shortest pause between a user's requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    min_delay_ms: u64,

    /// Longest pause between a user's requests, in milliseconds
    #[arg(long, default_value_t = 100)]
    max_delay_ms: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => TurnstileConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TurnstileConfig::default(),
    };
    info!(policies = config.policies.len(), "Configuration loaded");

    match cli.command {
        Command::Check => check(&config),
        Command::Simulate(args) => run_simulation(&config, args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn check(config: &TurnstileConfig) -> anyhow::Result<()> {
    let registry = LimiterRegistry::from_config(config)?;

    for (name, policy) in &config.policies {
        println!("{:<16} {:?}", name, policy);
    }
    println!(
        "{} policies ok, eviction {}",
        registry.len(),
        if config.eviction.enabled { "on" } else { "off" }
    );
    Ok(())
}

async fn run_simulation(config: &TurnstileConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let registry = Arc::new(LimiterRegistry::from_config(config)?);

    let plan = match args.requests {
        Some(requests) => SimulationPlan {
            policy: args.policy.clone(),
            users: (1..=args.users)
                .map(|i| {
                    UserProfile::new(format!("user-{}", i), requests, args.min_delay_ms, args.max_delay_ms)
                })
                .collect(),
        },
        None => SimulationPlan::mixed_traffic(args.policy.clone()),
    };

    let sweeper = config
        .eviction
        .enabled
        .then(|| Sweeper::spawn(registry.clone(), &config.eviction))
        .transpose()?;

    let outcome = tokio::select! {
        report = simulate::run(&registry, &plan) => Some(report),
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl+C, abandoning simulation");
            None
        }
    };

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await?;
    }

    let Some(report) = outcome else {
        return Ok(());
    };
    let report = report?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!(
        "policy {} ({}) finished in {} ms",
        report.policy, report.algorithm, report.elapsed_ms
    );
    for user in &report.users {
        println!(
            "  {:<16} allowed {:>4}  blocked {:>4}  success {:>5.1}%",
            user.name,
            user.allowed,
            user.blocked,
            user.success_rate()
        );
    }
    println!(
        "  total            allowed {:>4}  blocked {:>4}",
        report.total_allowed(),
        report.total_blocked()
    );
}
