//! httpload: command-line front end for the load-generation engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use httpload::config::LoadTestPlan;
use httpload::engine::LoadTestEngine;
use httpload::report::write_summary;
use httpload::summary::{format_tick_line, render_summary};

/// HTTP load generator with load-shape policies and weighted scenarios
#[derive(Parser)]
#[command(name = "httpload")]
#[command(about = "Generate HTTP load and report latency, throughput and errors", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test
    ///
    /// Loads a plan file (TOML, or JSON when the extension is `.json`),
    /// applies command-line overrides, prints one line per second and a
    /// summary at the end. Ctrl+C cancels the run and prints a partial summary.
    Run {
        /// Path to the plan file
        plan: PathBuf,

        /// Target URL (overrides config.url)
        #[arg(long, env = "HTTPLOAD_URL")]
        url: Option<String>,

        /// Number of virtual users (overrides config)
        #[arg(long)]
        vus: Option<u32>,

        /// Test duration in seconds (overrides config)
        #[arg(long)]
        duration: Option<u64>,

        /// Write the run summary as JSON to this file
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,
    },

    /// Check a plan file without sending any requests
    Validate {
        /// Path to the plan file
        plan: PathBuf,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            plan,
            url,
            vus,
            duration,
            output,
            no_color,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(execute_run(RunArgs {
                plan,
                url,
                vus,
                duration,
                output,
                no_color,
            }))
        },
        Commands::Validate { plan } => execute_validate(&plan),
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

struct RunArgs {
    plan: PathBuf,
    url: Option<String>,
    vus: Option<u32>,
    duration: Option<u64>,
    output: Option<PathBuf>,
    no_color: bool,
}

fn load_plan(path: &Path) -> Result<LoadTestPlan> {
    if !path.exists() {
        anyhow::bail!("Plan file not found: {}", path.display());
    }
    LoadTestPlan::read(path)
        .with_context(|| format!("Failed to load plan '{}'", path.display()))
}

async fn execute_run(args: RunArgs) -> Result<()> {
    eprintln!("Loading plan from: {}", args.plan.display());
    let mut plan = load_plan(&args.plan)?;
    apply_overrides(&mut plan, args.url, args.vus, args.duration);
    plan.validate().context("Invalid plan")?;

    if args.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let engine = LoadTestEngine::new(plan.config, plan.steps);
    let config = engine.config().clone();
    let mut handle = engine.spawn();

    let control = handle.control();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && control.cancel() {
            eprintln!();
            eprintln!("Cancelling run, waiting for in-flight requests...");
        }
    });

    while let Some(snapshot) = handle.next_snapshot().await {
        println!("{}", format_tick_line(&snapshot, &config));
    }
    let result = handle.finish().await;
    ctrl_c.abort();
    let summary = result.context("Load test failed")?;

    println!("{}", render_summary(&summary));

    if let Some(path) = args.output {
        write_summary(&summary, &path)
            .with_context(|| format!("Failed to write summary to '{}'", path.display()))?;
        eprintln!();
        eprintln!("Summary written to: {}", path.display());
    }

    Ok(())
}

fn execute_validate(path: &Path) -> Result<()> {
    let plan = load_plan(path)?;
    plan.validate().context("Invalid plan")?;
    let target = if plan.steps.is_empty() {
        plan.config.url.clone()
    } else {
        format!("{} steps", plan.steps.len())
    };
    println!(
        "OK: {}, {} vus, {}s, {target}",
        plan.config.test_type, plan.config.virtual_users, plan.config.duration
    );
    Ok(())
}

/// Apply command-line overrides to a loaded plan. Runs before validation so
/// overridden values are checked too.
fn apply_overrides(
    plan: &mut LoadTestPlan,
    url: Option<String>,
    vus: Option<u32>,
    duration: Option<u64>,
) {
    if let Some(u) = url {
        plan.config.url = u;
    }
    if let Some(v) = vus {
        plan.config.virtual_users = v;
    }
    if let Some(d) = duration {
        plan.config.duration = d;
    }
}
