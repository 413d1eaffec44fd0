//! # Reelflow Configuration Validator
//!
//! Command-line tool for validating orchestrator configuration files across
//! environments before an orchestrator is started with them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use reelflow_core::config::{ConfigManager, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate reelflow orchestrator configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the merged configuration
    All,

    /// Print one section of the merged configuration
    Component {
        /// Section name (resources, analyzer, workflow, ...)
        name: String,
    },

    /// List environments that have an override file
    Environments,

    /// Print the default configuration as TOML-equivalent JSON
    Structure,

    /// Show sections that differ between two environments
    Compare {
        #[arg(short, long, default_value = "development")]
        base: String,

        #[arg(short, long)]
        target: String,
    },
}

const SECTIONS: &[&str] = &[
    "resources",
    "analyzer",
    "load_balancer",
    "circuit_breakers",
    "retry",
    "workflow",
    "health",
    "analytics",
    "telemetry",
];

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all(&cli),
        Some(Commands::Component { name }) => show_component(&cli, name),
        Some(Commands::Environments) => list_environments(&cli),
        Some(Commands::Structure) => show_structure(),
        Some(Commands::Compare { base, target }) => compare(&cli, base, target),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli, environment: &str) -> Result<serde_json::Value> {
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)
        .with_context(|| format!("loading configuration for '{environment}'"))?;
    Ok(manager.debug_config())
}

fn validate_all(cli: &Cli) -> Result<()> {
    println!("🔧 Validating reelflow configuration");
    println!("Environment: {}", cli.environment);
    if let Some(dir) = &cli.config_dir {
        println!("Config Directory: {}", dir.display());
    }
    println!();

    let manager =
        ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &cli.environment)
            .context("configuration failed to load or validate")?;
    let config = manager.config();

    println!("✅ Configuration loaded and validated");
    println!(
        "   pool: {} cpu, {} GB memory, {} GB storage, {} Mbps, {} gpu",
        config.resources.cpu_cores,
        config.resources.memory_gb,
        config.resources.storage_gb,
        config.resources.network_mbps,
        config.resources.gpu_units
    );
    println!("   load balancing: {:?}", config.load_balancer.strategy);
    println!(
        "   breakers: threshold {} / recovery {}ms / call timeout {}ms",
        config.circuit_breakers.failure_threshold,
        config.circuit_breakers.recovery_timeout_ms,
        config.circuit_breakers.call_timeout_ms
    );
    println!("   required services: {}", config.required_services().join(", "));
    println!("\n🎉 All configuration checks passed!");
    Ok(())
}

fn show_component(cli: &Cli, name: &str) -> Result<()> {
    let section = name.to_lowercase().replace('-', "_");
    if !SECTIONS.contains(&section.as_str()) {
        bail!("unknown component '{name}', expected one of: {}", SECTIONS.join(", "));
    }
    let merged = load(cli, &cli.environment)?;
    let value = merged.get(&section).cloned().unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn list_environments(cli: &Cli) -> Result<()> {
    let dir = cli.config_dir.clone().unwrap_or_else(|| PathBuf::from("config"));
    if !dir.exists() {
        bail!("configuration directory not found: {}", dir.display());
    }

    let mut environments: Vec<String> = std::fs::read_dir(&dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_prefix("reelflow.")
                .and_then(|rest| rest.strip_suffix(".toml"))
                .map(str::to_string)
        })
        .collect();
    environments.sort();

    println!("📋 Environments in {}:", dir.display());
    if environments.is_empty() {
        println!("   (none, only defaults and the base file apply)");
    }
    for environment in environments {
        println!("   • {environment}");
    }
    Ok(())
}

fn show_structure() -> Result<()> {
    let defaults = serde_json::to_value(OrchestratorConfig::default())?;
    println!("{}", serde_json::to_string_pretty(&defaults)?);
    Ok(())
}

fn compare(cli: &Cli, base: &str, target: &str) -> Result<()> {
    let left = load(cli, base)?;
    let right = load(cli, target)?;

    println!("🔍 Comparing {base} → {target}");
    let mut differences = 0;
    for section in SECTIONS {
        let (a, b) = (left.get(section), right.get(section));
        if a != b {
            differences += 1;
            println!("\n[{section}]");
            println!("  {base}: {}", a.map(ToString::to_string).unwrap_or_default());
            println!("  {target}: {}", b.map(ToString::to_string).unwrap_or_default());
        }
    }
    if differences == 0 {
        println!("No differences");
    }
    Ok(())
}
