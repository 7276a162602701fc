// CLI Command Implementations
// Handles execution of each CLI command with colored output

use super::{error, info, print_banner, success, warning, Commands};
use crate::config::{LogFormat, LoggingConfig, MedicConfig};
use crate::discovery::IntegrationDirectory;
use crate::network::HomeAssistantClient;
use crate::observability;
use crate::signals;
use crate::store::Store;
use crate::supervisor::Supervisor;
use anyhow::Context;
use colored::*;
use std::sync::Arc;

/// Execute a CLI command
pub async fn execute(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Start { config, verbose } => start_command(config, verbose).await,
        Commands::Validate { file } => {
            init_quiet_logging()?;
            validate_command(file)
        }
        Commands::Discover { config, instance } => {
            init_quiet_logging()?;
            discover_command(config, instance).await
        }
        Commands::History {
            config,
            instance,
            limit,
        } => {
            init_quiet_logging()?;
            history_command(config, instance, limit)
        }
    }
}

fn init_quiet_logging() -> anyhow::Result<()> {
    observability::init(&LoggingConfig {
        level: "home_medic=warn".into(),
        format: LogFormat::Plain,
    })
}

/// Run the control loop until SIGINT/SIGTERM
async fn start_command(config_path: String, verbose: bool) -> anyhow::Result<()> {
    let mut config = MedicConfig::load(&config_path)?;
    if verbose {
        config.logging.level = "home_medic=debug".into();
    }
    observability::init(&config.logging)?;
    config.validate_for_start()?;

    print_banner();

    let shutdown_signal = signals::create_shutdown_listener()?;
    tracing::info!("Signal handlers installed (SIGTERM, SIGINT)");

    let supervisor = Arc::new(Supervisor::from_config(config).context("Failed to open the store")?);
    let started = supervisor.start_all().await?;

    println!();
    success(&format!("Monitoring {} instance(s)", started.to_string().green()));
    for status in supervisor.statuses() {
        println!(
            "  {} {} entities, {} integrations",
            format!("{}:", status.instance_id).bright_white(),
            status.entities.to_string().cyan(),
            status.integrations.to_string().cyan()
        );
    }
    println!();
    info("Press Ctrl+C for graceful shutdown");

    shutdown_signal.await;

    tracing::info!("Shutdown signal received - draining instances");
    supervisor.shutdown().await;
    success("Graceful shutdown complete");
    Ok(())
}

fn validate_command(file: String) -> anyhow::Result<()> {
    info(&format!("Validating {}", file.bright_white()));

    if !std::path::Path::new(&file).exists() {
        error(&format!("{} does not exist", file));
        anyhow::bail!("configuration file not found");
    }

    let config = MedicConfig::load(&file)?;
    config.validate_for_start()?;

    success("Configuration file is valid");
    for instance in &config.instances {
        let realtime = if instance.realtime { "realtime".green() } else { "polling".yellow() };
        println!("  {} {} ({})", instance.id.cyan(), instance.url, realtime);
    }
    if config.healing.dry_run {
        warning("Healing runs in dry-run mode; no remediation will be sent");
    }
    Ok(())
}

async fn discover_command(config_path: String, instance_id: String) -> anyhow::Result<()> {
    let config = MedicConfig::load(&config_path)?;
    let instance = config
        .instances
        .iter()
        .find(|i| i.id == instance_id)
        .with_context(|| format!("Instance '{}' is not configured", instance_id))?;

    let store = Store::open(&config.database.path)?;
    let client = HomeAssistantClient::new(&instance.url, &instance.token, &config.rest)?;
    let directory = IntegrationDirectory::new(
        instance.id.clone(),
        instance.registry_path.clone(),
        Some(store),
    );
    directory.load_persisted().await?;
    let result = directory.discover_all(&client).await?;

    success(&format!(
        "Discovered {} integrations from {}",
        result.integrations.len().to_string().green(),
        result.source.as_str().cyan()
    ));
    println!();
    for record in directory.integrations() {
        println!(
            "  {:<40} {:<16} {:>4} entities  [{}]",
            record.entry_id.bright_white(),
            record.domain,
            record.entity_ids.len(),
            record.source
        );
    }
    println!();
    Ok(())
}

fn history_command(config_path: String, instance_id: String, limit: usize) -> anyhow::Result<()> {
    let config = MedicConfig::load(&config_path)?;
    let store = Store::open(&config.database.path)?;

    let actions = store.healing_actions(&instance_id, limit)?;
    println!();
    println!("{}", format!("Healing actions for {}", instance_id).bright_cyan().bold());
    if actions.is_empty() {
        info("No healing actions recorded");
    }
    for action in actions {
        let result = if action.success { "ok".green() } else { "failed".red() };
        println!(
            "  {} {:<32} #{:<3} {:<20} {} {}",
            action.timestamp.format("%Y-%m-%d %H:%M:%S"),
            action.entry_id,
            action.attempt_number,
            action.action,
            result,
            action.error.unwrap_or_default().bright_black()
        );
    }

    let cascades = store.cascades(&instance_id, limit)?;
    println!();
    println!("{}", format!("Cascades for {}", instance_id).bright_cyan().bold());
    if cascades.is_empty() {
        info("No cascades recorded");
    }
    for cascade in cascades {
        let result = if cascade.final_success { "healed".green() } else { "exhausted".red() };
        println!(
            "  {} {} {:<32} {} ({} ms)",
            cascade.started_at.format("%Y-%m-%d %H:%M:%S"),
            cascade.id.to_string().bright_black(),
            cascade.entity_id,
            result,
            cascade.total_duration_ms
        );
    }
    println!();
    Ok(())
}
