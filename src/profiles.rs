use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Output dir: {}", cfg.output_dir.display());
    println!("Prompts dir: {}", cfg.prompts_dir.display());
    println!("Max iterations: {}", cfg.max_iterations);
    println!("Quality threshold: {:.2}", cfg.quality_threshold);
    println!("Iteration timeout (secs): {}", cfg.iteration_timeout_secs);
    println!("Max concurrent tasks: {}", cfg.max_concurrent_tasks);
    println!(
        "Generation: max_tokens={} temperature={:.2}",
        cfg.llm_max_tokens, cfg.llm_temperature
    );
    println!(
        "Capabilities: {}",
        if cfg.capabilities.is_empty() {
            "<none>".to_string()
        } else {
            cfg.capabilities.join(", ")
        }
    );
    println!(
        "Capability retries: attempts={} delay_ms={}",
        cfg.capability_retry_attempts, cfg.capability_retry_delay_ms
    );
    println!("Versioning enabled: {}", cfg.versioning_enabled);
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    println!(
        "Server auth: {}",
        if cfg.server_auth_token.is_some() {
            "bearer token (redacted)"
        } else {
            "disabled"
        }
    );
    Ok(())
}
