use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::GenerationSettings;
use crate::capability::{DEFAULT_CAPABILITIES, RetryPolicy};
use crate::cli::Cli;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub output_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub max_iterations: u32,
    pub quality_threshold: f64,
    pub iteration_timeout_secs: u64,
    pub max_concurrent_tasks: usize,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    pub capabilities: Vec<String>,
    pub capability_retry_attempts: u32,
    pub capability_retry_delay_ms: u64,
    pub versioning_enabled: bool,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub server_auth_token: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            config_path: ".museloop/config.toml".to_string(),
            output_dir: PathBuf::from("./output"),
            prompts_dir: PathBuf::from("./prompts"),
            max_iterations: 5,
            quality_threshold: 0.7,
            iteration_timeout_secs: 600,
            max_concurrent_tasks: 4,
            llm_max_tokens: 4096,
            llm_temperature: 0.7,
            capabilities: DEFAULT_CAPABILITIES.iter().map(ToString::to_string).collect(),
            capability_retry_attempts: 3,
            capability_retry_delay_ms: 2000,
            versioning_enabled: true,
            telemetry_enabled: false,
            telemetry_path: ".museloop/telemetry/events.jsonl".to_string(),
            server_auth_token: None,
        }
    }
}

impl RuntimeConfig {
    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.capability_retry_attempts,
            base_delay: Duration::from_millis(self.capability_retry_delay_ms),
            max_delay: MAX_RETRY_DELAY,
        }
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            max_tokens: self.llm_max_tokens,
            temperature: self.llm_temperature,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub output_dir: Option<PathBuf>,
    pub prompts_dir: Option<PathBuf>,
    pub max_iterations: Option<u32>,
    pub quality_threshold: Option<f64>,
    pub iteration_timeout_secs: Option<u64>,
    pub max_concurrent_tasks: Option<usize>,
    pub llm_max_tokens: Option<u32>,
    pub llm_temperature: Option<f32>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub capability_retry_attempts: Option<u32>,
    pub capability_retry_delay_ms: Option<u64>,
    pub versioning_enabled: Option<bool>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check field names and value types.",
            path.display()
        )
    })
}

fn clean_names(names: &[String]) -> Vec<String> {
    let mut cleaned = Vec::<String>::new();
    for name in names {
        let trimmed = name.trim();
        if !trimmed.is_empty() && !cleaned.iter().any(|existing| existing == trimmed) {
            cleaned.push(trimmed.to_string());
        }
    }
    cleaned
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    if let Some(threshold) = cli.quality_threshold.or(profile.quality_threshold)
        && !threshold.is_finite()
    {
        return Err(anyhow::anyhow!(
            "invalid value for quality_threshold: expected a number between 0.0 and 1.0"
        ));
    }

    let defaults = RuntimeConfig::default();
    let capabilities = {
        let from_cli = clean_names(&cli.capabilities);
        let from_profile = clean_names(&profile.capabilities);
        if !from_cli.is_empty() {
            from_cli
        } else if !from_profile.is_empty() {
            from_profile
        } else {
            defaults.capabilities.clone()
        }
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        output_dir: cli
            .output_dir
            .clone()
            .or(profile.output_dir)
            .unwrap_or(defaults.output_dir),
        prompts_dir: cli
            .prompts_dir
            .clone()
            .or(profile.prompts_dir)
            .unwrap_or(defaults.prompts_dir),
        max_iterations: cli
            .max_iterations
            .or(profile.max_iterations)
            .unwrap_or(defaults.max_iterations)
            .max(1),
        quality_threshold: cli
            .quality_threshold
            .or(profile.quality_threshold)
            .unwrap_or(defaults.quality_threshold)
            .clamp(0.0, 1.0),
        iteration_timeout_secs: cli
            .iteration_timeout_secs
            .or(profile.iteration_timeout_secs)
            .unwrap_or(defaults.iteration_timeout_secs)
            .max(1),
        max_concurrent_tasks: cli
            .max_concurrent_tasks
            .or(profile.max_concurrent_tasks)
            .unwrap_or(defaults.max_concurrent_tasks)
            .max(1),
        llm_max_tokens: cli
            .llm_max_tokens
            .or(profile.llm_max_tokens)
            .unwrap_or(defaults.llm_max_tokens)
            .max(1),
        llm_temperature: cli
            .llm_temperature
            .or(profile.llm_temperature)
            .unwrap_or(defaults.llm_temperature),
        capabilities,
        capability_retry_attempts: cli
            .capability_retry_attempts
            .or(profile.capability_retry_attempts)
            .unwrap_or(defaults.capability_retry_attempts)
            .max(1),
        capability_retry_delay_ms: cli
            .capability_retry_delay_ms
            .or(profile.capability_retry_delay_ms)
            .unwrap_or(defaults.capability_retry_delay_ms),
        versioning_enabled: cli
            .versioning_enabled
            .or(profile.versioning_enabled)
            .unwrap_or(defaults.versioning_enabled),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(defaults.telemetry_enabled),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or(defaults.telemetry_path),
        server_auth_token: cli
            .server_auth_token
            .clone()
            .filter(|token| !token.trim().is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["museloop"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn profiles(toml: &str) -> ProfilesFile {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn defaults_apply_without_profile_file() {
        let cfg = resolve_runtime_config(&cli(&[]), &ProfilesFile::default()).unwrap();
        assert_eq!(cfg.max_iterations, 5);
        assert_eq!(cfg.quality_threshold, 0.7);
        assert_eq!(cfg.iteration_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.max_concurrent_tasks, 4);
        assert_eq!(cfg.capabilities, vec!["image_gen", "audio_gen", "video_gen"]);
        assert!(cfg.versioning_enabled);
        assert!(!cfg.telemetry_enabled);
    }

    #[test]
    fn cli_overrides_profile_which_overrides_defaults() {
        let file = profiles(
            r#"
            [profiles.studio]
            max_iterations = 8
            quality_threshold = 0.85
            capabilities = ["image_gen", "tts"]
            "#,
        );
        let cfg = resolve_runtime_config(
            &cli(&["--profile", "studio", "--max-iterations", "2"]),
            &file,
        )
        .unwrap();

        assert_eq!(cfg.max_iterations, 2);
        assert_eq!(cfg.quality_threshold, 0.85);
        assert_eq!(cfg.capabilities, vec!["image_gen", "tts"]);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cfg = resolve_runtime_config(
            &cli(&[
                "--quality-threshold",
                "1.7",
                "--max-iterations",
                "0",
                "--max-concurrent-tasks",
                "0",
            ]),
            &ProfilesFile::default(),
        )
        .unwrap();
        assert_eq!(cfg.quality_threshold, 1.0);
        assert_eq!(cfg.max_iterations, 1);
        assert_eq!(cfg.max_concurrent_tasks, 1);
    }

    #[test]
    fn missing_profile_lists_available_names() {
        let file = profiles("[profiles.alpha]\n[profiles.beta]\n");
        let err = resolve_runtime_config(&cli(&["--profile", "gamma"]), &file).unwrap_err();
        assert!(err.to_string().contains("Available profiles: alpha, beta"));
    }

    #[test]
    fn unknown_profile_fields_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[profiles.default]\nmax_iteration = 3\n").unwrap();
        assert!(load_profiles(path.to_str().unwrap()).is_err());
        assert!(
            load_profiles(dir.path().join("absent.toml").to_str().unwrap())
                .unwrap()
                .profiles
                .is_empty()
        );
    }

    #[test]
    fn retry_policy_follows_configuration() {
        let cfg = resolve_runtime_config(
            &cli(&["--capability-retry-attempts", "5", "--capability-retry-delay-ms", "100"]),
            &ProfilesFile::default(),
        )
        .unwrap();
        let policy = cfg.retry_policy();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    }
}
