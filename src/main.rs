use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use vrouter::config;
use vrouter::daemon::{Daemon, Host};
use vrouter::dataplane::SystemClock;
use vrouter::telemetry::init_logging;

#[derive(Parser)]
#[command(name = "vrouter")]
#[command(about = "Virtual router forwarding engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Build the routers and print their state
    Snapshot {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run the router daemon
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate config.toml
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print the effective configuration with defaults filled in
    Show {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Validate { config } => cmd_config_validate(&config),
            ConfigAction::Show { config } => cmd_config_show(&config),
        },
        Commands::Snapshot { config } => cmd_snapshot(&config),
        Commands::Run { config } => cmd_run(&config),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

/// Load and validate, printing diagnostics. Errors abort.
fn load_valid(config_path: &PathBuf) -> Result<config::Config, String> {
    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed".to_string());
    }
    Ok(cfg)
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());
    load_valid(config_path)?;
    println!("[INFO] Configuration is valid");
    Ok(())
}

fn cmd_config_show(config_path: &PathBuf) -> Result<(), String> {
    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;
    let rendered =
        config::render(&cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    print!("{}", rendered);
    Ok(())
}

fn cmd_snapshot(config_path: &PathBuf) -> Result<(), String> {
    let cfg = load_valid(config_path)?;

    let host = Host::from_config(&cfg, Arc::new(SystemClock))
        .map_err(|e| format!("Failed to build routers: {}", e))?;
    let output = toml::to_string_pretty(&host.snapshot())
        .map_err(|e| format!("Failed to serialize snapshot: {}", e))?;
    print!("{}", output);
    Ok(())
}

fn cmd_run(config_path: &PathBuf) -> Result<(), String> {
    use tokio::runtime::Runtime;

    let cfg = load_valid(config_path)?;

    // RUST_LOG takes priority over [log]
    init_logging(Some(&cfg.log));
    info!("Loaded {}", config_path.display());

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let host = Host::from_config(&cfg, Arc::new(SystemClock))
            .map_err(|e| format!("Failed to build routers: {}", e))?;
        for router in &cfg.routers {
            info!(
                "  router {} configured with {} ports",
                router.id,
                router.ports.len()
            );
        }

        Daemon::new(host)
            .run()
            .await
            .map_err(|e| format!("Daemon failed: {}", e))
    })
}
