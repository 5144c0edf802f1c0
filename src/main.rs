use clap::{Parser, Subcommand};
use log::info;
use portero::config::{Config, ConfigError};
use portero::Portero;
use std::path::PathBuf;

// Pingora framework imports
use pingora_core::server::configuration::Opt;

#[derive(Parser)]
#[command(name = "portero")]
#[command(about = "A connection-pooling, load-balancing failover proxy for PostgreSQL clusters")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the portero proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/portero.toml")]
        config: PathBuf,
        /// Daemonize after startup
        #[arg(short, long)]
        daemon: bool,
    },
    /// Generate example configuration files
    Config {
        /// Configuration mode (single or cluster)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, daemon } => {
            run_portero(config, daemon)?;
        }
        Commands::Config { mode, output } => {
            generate_config(mode, output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn run_portero(config_path: PathBuf, daemon: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config)?;

    info!("Starting portero v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!("Listening on: {}", config.server.listen_addr);
    info!("Backend nodes: {}", config.backend.len());
    if config.watchdog.enabled {
        info!(
            "Watchdog enabled on port {} with {} peer(s)",
            config.watchdog.wd_port,
            config.watchdog.peers.len()
        );
    }

    let mut portero = Portero::new(config);

    let opt = Opt {
        daemon,
        ..Opt::default()
    };
    portero
        .initialize(Some(opt))
        .map_err(|e| format!("Failed to initialize portero: {}", e))?;

    if let Err(e) = portero.run() {
        return Err(format!("Failed to run portero: {}", e).into());
    }

    Ok(())
}

fn generate_config(mode: String, output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode)
        .map_err(|e| format!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  portero run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            println!("  Max children: {}", config.server.max_children);
            println!("  Backend nodes: {}", config.backend.len());
            for (i, backend) in config.backend.iter().enumerate() {
                println!(
                    "    {}: {}:{} ({})",
                    i, backend.host, backend.port, backend.role
                );
            }
            if config.watchdog.enabled {
                println!(
                    "  Watchdog: enabled, port {}, {} peer(s), priority {}",
                    config.watchdog.wd_port,
                    config.watchdog.peers.len(),
                    config.watchdog.priority
                );
            } else {
                println!("  Watchdog: disabled");
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(Box::new(e));
        }
    }

    Ok(())
}

fn show_version() {
    println!("portero v{}", env!("CARGO_PKG_VERSION"));
    println!("A connection-pooling, load-balancing failover proxy for PostgreSQL clusters");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • PostgreSQL wire protocol v2/v3 with pooled backend connections");
    println!("  • Weighted load balancing with database and application redirects");
    println!("  • Quorum-based watchdog with split-brain arbitration");
    println!("  • Failover consensus across proxy instances");
}

fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = match config.logging.level.as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    info!("Logging initialized at level: {:?}", log_level);
    Ok(())
}
