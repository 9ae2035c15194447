use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing::level_filters::LevelFilter;

use museloop::brief::Brief;
use museloop::capability::CapabilityRegistry;
use museloop::cli::{Cli, Commands, ProfileCommands, TelemetryCommands, command_label};
use museloop::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use museloop::error::{categorize_error, format_cli_error};
use museloop::events::{ConsoleSink, Emitter, EventSink, FanoutSink};
use museloop::llm::{LlmBackend, ScriptedBackend};
use museloop::pipeline::{LoopOutcome, Pipeline, run_loop};
use museloop::profiles::{run_profiles_list, run_profiles_show};
use museloop::server::run_server;
use museloop::telemetry::{TelemetrySink, run_telemetry_report};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };
    let telemetry = TelemetrySink::new(&cfg, command_label(&command));
    tracing::debug!(profile = %cfg.profile, command = %command_label(&command), "resolved configuration");

    match command {
        Commands::Run {
            brief,
            replay,
            dry_run,
        } => {
            if dry_run {
                return run_dry(&cfg, &brief);
            }
            let llm = load_backend(replay.as_deref())?;
            let sink = FanoutSink::new()
                .with(Arc::new(ConsoleSink))
                .with(Arc::new(telemetry.clone()) as Arc<dyn EventSink>);
            let pipeline =
                Pipeline::from_config(&cfg, llm).with_events(Emitter::new(Arc::new(sink)));
            tracing::info!(
                max_iterations = pipeline.settings().max_iterations,
                iteration_timeout_secs = pipeline.settings().iteration_timeout.as_secs(),
                capabilities = pipeline.registry().len(),
                "pipeline ready"
            );
            let outcome = run_loop(&brief, &pipeline).await?;
            print_outcome(&outcome);
        }
        Commands::Brief { path } => {
            let brief = Brief::from_file(&path)?;
            println!("{}", brief.summary());
        }
        Commands::Capabilities { name } => {
            let registry = CapabilityRegistry::from_config(&cfg.capabilities, cfg.retry_policy());
            run_capabilities(&registry, name.as_deref())?;
        }
        Commands::Serve { host, port, replay } => {
            let llm = load_backend(replay.as_deref())?;
            run_server(cfg, llm, host, port, &telemetry).await?;
        }
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg)?,
            ProfileCommands::Show => run_profiles_show(&cfg)?,
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                run_telemetry_report(&cfg, path, limit)?;
            }
        },
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn load_backend(replay: Option<&Path>) -> Result<Arc<dyn LlmBackend>> {
    let Some(path) = replay else {
        return Err(anyhow::anyhow!(
            "no language-model backend configured. Pass --replay <file.json> or set MUSELOOP_REPLAY."
        ));
    };
    let backend = ScriptedBackend::from_file(path)?;
    tracing::info!(backend = backend.name(), path = %path.display(), "language-model backend loaded");
    Ok(Arc::new(backend))
}

fn run_dry(cfg: &RuntimeConfig, brief_path: &Path) -> Result<()> {
    let brief = Brief::from_file(brief_path)?;
    let registry = CapabilityRegistry::from_config(&cfg.capabilities, cfg.retry_policy());

    println!("{}", brief.summary());
    println!("Capabilities: {}", registry.names().join(", "));
    let missing = brief
        .capabilities_required
        .iter()
        .filter(|name| !registry.has(name))
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        println!("Missing capabilities: {}", missing.join(", "));
    }
    println!(
        "Loop: max_iterations={} quality_threshold={:.2} iteration_timeout={}s max_concurrent_tasks={}",
        cfg.max_iterations,
        cfg.quality_threshold,
        cfg.iteration_timeout_secs,
        cfg.max_concurrent_tasks
    );
    println!(
        "Output: {} (versioning {})",
        cfg.output_dir.display(),
        if cfg.versioning_enabled { "on" } else { "off" }
    );
    Ok(())
}

fn run_capabilities(registry: &CapabilityRegistry, name: Option<&str>) -> Result<()> {
    if let Some(name) = name {
        let capability = registry.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "capability '{}' is not configured. Available: {}",
                name,
                registry.names().join(", ")
            )
        })?;
        println!("{} ({})", capability.name(), capability.kind().label());
        println!("{}", capability.description());
        return Ok(());
    }

    if registry.is_empty() {
        println!("No capabilities configured.");
        return Ok(());
    }
    for detail in registry.details() {
        println!(
            "- {} [{}]: {}",
            detail["name"].as_str().unwrap_or_default(),
            detail["kind"].as_str().unwrap_or_default(),
            detail["description"].as_str().unwrap_or_default()
        );
    }
    Ok(())
}

fn print_outcome(outcome: &LoopOutcome) {
    println!();
    println!(
        "Loop finished after {} iteration(s): {}",
        outcome.iterations_run,
        if outcome.passed {
            "quality threshold met"
        } else {
            "quality threshold not met"
        }
    );
    println!(
        "Best score: {:.2} (iteration {})",
        outcome.best_score(),
        outcome.best_iteration()
    );
    println!("Assets: {}", outcome.final_state.assets.len());
    for asset in &outcome.final_state.assets {
        println!(
            "  [{}] step {} {}: {}",
            asset.iteration.unwrap_or(0),
            asset.step,
            asset.kind,
            asset.path
        );
    }
    println!("Output: {}", outcome.output_dir.display());
}
