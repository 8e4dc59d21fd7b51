use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use cachegate::{cli::Cli, logging, policy::compile_policy, settings::Settings};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (settings, source) = Settings::load_with_policy(&cli)?;
    logging::init_logger(settings.log, settings.recent_log_lines)?;
    let compiled = compile_policy(&source)
        .with_context(|| format!("failed to compile policy {}", settings.policy.display()))?;

    let capacity = compiled
        .configuration
        .lru_max_items
        .unwrap_or(settings.cache_max_entries);
    let summary = json!({
        "policy": settings.policy.display().to_string(),
        "request_rules": compiled.request_rules.len(),
        "response_rules": compiled.response_rules.len(),
        "cache_max_entries": capacity,
        "remote_servers": compiled.configuration.remote_servers,
        "negative_ttl_secs": settings.negative_ttl,
        "refresh_low_water_secs": settings.refresh_low_water,
        "reload_debounce_ms": settings.reload_debounce_ms,
        "policy_poll_interval_ms": settings.policy_poll_interval_ms,
        "preferred_encodings": settings.preferred_encodings,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    tracing::info!("configuration OK");
    Ok(())
}
