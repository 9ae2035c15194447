use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize pipeline events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  museloop run briefs/trailer.json --replay fixtures/trailer-replay.json\n\
  museloop run briefs/trailer.json --dry-run\n\
  museloop --max-iterations 3 --quality-threshold 0.8 run briefs/poster.json --replay replay.json\n\
  museloop brief briefs/trailer.json\n\
  museloop capabilities\n\
  museloop capabilities video_gen\n\
  museloop --profile studio profiles show\n\
  museloop serve --host 127.0.0.1 --port 8788 --replay replay.json\n\
  museloop telemetry report --limit 2000\n\
\n\
Language model:\n\
  - Only the deterministic replay backend ships; pass --replay <file.json> mapping agent\n\
    names (memory, research, script, critic) to a response or a list of responses.";

#[derive(Debug, Parser)]
#[command(name = "museloop")]
#[command(about = "Autonomous multi-agent creative pipeline: plan, generate, critique, repeat")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "MUSELOOP_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "MUSELOOP_CONFIG", default_value = ".museloop/config.toml")]
    pub config_path: String,

    #[arg(long, env = "MUSELOOP_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, env = "MUSELOOP_PROMPTS_DIR")]
    pub prompts_dir: Option<PathBuf>,

    #[arg(long, env = "MUSELOOP_MAX_ITERATIONS")]
    pub max_iterations: Option<u32>,

    #[arg(long, env = "MUSELOOP_QUALITY_THRESHOLD")]
    pub quality_threshold: Option<f64>,

    #[arg(long, env = "MUSELOOP_ITERATION_TIMEOUT_SECS")]
    pub iteration_timeout_secs: Option<u64>,

    #[arg(long, env = "MUSELOOP_MAX_CONCURRENT_TASKS")]
    pub max_concurrent_tasks: Option<usize>,

    #[arg(long, env = "MUSELOOP_LLM_MAX_TOKENS")]
    pub llm_max_tokens: Option<u32>,

    #[arg(long, env = "MUSELOOP_LLM_TEMPERATURE")]
    pub llm_temperature: Option<f32>,

    #[arg(long = "capability", env = "MUSELOOP_CAPABILITIES", value_delimiter = ',')]
    pub capabilities: Vec<String>,

    #[arg(long, env = "MUSELOOP_CAPABILITY_RETRY_ATTEMPTS")]
    pub capability_retry_attempts: Option<u32>,

    #[arg(long, env = "MUSELOOP_CAPABILITY_RETRY_DELAY_MS")]
    pub capability_retry_delay_ms: Option<u64>,

    #[arg(long, env = "MUSELOOP_VERSIONING_ENABLED", action = clap::ArgAction::Set)]
    pub versioning_enabled: Option<bool>,

    #[arg(long, env = "MUSELOOP_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "MUSELOOP_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "MUSELOOP_SERVER_TOKEN")]
    pub server_auth_token: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run the iterate-generate-critique loop for a brief")]
    Run {
        brief: PathBuf,
        #[arg(long, env = "MUSELOOP_REPLAY")]
        replay: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    #[command(about = "Validate a brief file and print its summary")]
    Brief { path: PathBuf },
    #[command(about = "List configured generation capabilities, or describe one")]
    Capabilities { name: Option<String> },
    #[command(about = "Run the HTTP job server")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8788)]
        port: u16,
        #[arg(long, env = "MUSELOOP_REPLAY")]
        replay: Option<PathBuf>,
    },
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Run { dry_run: true, .. } => "run.dry-run".to_string(),
        Commands::Run { .. } => "run".to_string(),
        Commands::Brief { .. } => "brief".to_string(),
        Commands::Capabilities { .. } => "capabilities".to_string(),
        Commands::Serve { .. } => "serve".to_string(),
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
