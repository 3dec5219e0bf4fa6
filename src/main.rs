//! `telemetryd`: the telemetry agent daemon and its maintenance commands.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use telemetry_agent::events::{Event, EventSink};
use telemetry_agent::logging::init_logging;
use telemetry_agent::sources::{
    DirectoryProfileStore, FileLogScanner, HttpTransport, InMemoryParameterSource, ProfileStore,
};
use telemetry_agent::{
    AgentConfig, Collaborators, EventReceiver, Profile, ProfileRegistry, RegistryLimits,
    AGENT_FULL_NAME, AGENT_VERSION,
};

// ============================================================================
// CLI
// ============================================================================

/// Telemetry agent daemon
#[derive(Parser, Debug)]
#[command(
    name = "telemetryd",
    author = "AIOps Team",
    version,
    about = "On-device telemetry agent",
    long_about = "Runs reporting profiles on their schedules, collects device parameters, \
                  log-derived counters and component events, and uploads the reports, \
                  caching the ones that fail."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "telemetry.toml", env = "TELEMETRY_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "TELEMETRY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "TELEMETRY_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show agent version
    Version,

    /// Manage persisted profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// List persisted profiles
    List,
    /// Validate a profile definition and persist it
    Import {
        /// JSON profile definition
        file: PathBuf,
    },
    /// Remove a persisted profile
    Remove {
        /// Profile name
        name: String,
    },
}

// ----------------------------------------------------------------------------
// Command Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = AgentConfig::load(config_path)?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config)?);
    }

    println!("  instance name:      {}", config.agent.instance_name);
    println!("  profile store:      {}", config.agent.profile_store_dir.display());
    println!("  max profiles:       {}", config.agent.max_profiles);
    println!("  cached reports:     {}", config.agent.max_cached_reports);
    println!("  device parameters:  {}", config.device_parameters.len());
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = AgentConfig::generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, &config)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to {}", path.display());
        }
        None => println!("{config}"),
    }
    Ok(())
}

fn handle_version() {
    println!("{AGENT_FULL_NAME} v{AGENT_VERSION}");
}

fn handle_profiles(config: &AgentConfig, action: ProfileCommands) -> AnyhowResult<()> {
    let store = DirectoryProfileStore::new(&config.agent.profile_store_dir);

    match action {
        ProfileCommands::List => {
            let configs = store.fetch_stored_configs()?;
            if configs.is_empty() {
                println!("No profiles in {}", store.dir().display());
            }
            for stored in configs {
                match Profile::from_json(&stored.raw) {
                    Ok(profile) => println!(
                        "  {} (hash: {}, interval: {}s, encoding: {})",
                        profile.name,
                        profile.hash,
                        profile.reporting_interval.as_secs(),
                        profile.encoding
                    ),
                    Err(e) => println!("  {} (invalid: {})", stored.name, e),
                }
            }
        }
        ProfileCommands::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let profile = Profile::from_json(&raw)?;
            let path = store.save(&profile.name, &raw)?;
            println!("Profile {} stored at {}", profile.name, path.display());
        }
        ProfileCommands::Remove { name } => {
            if store.remove(&name)? {
                println!("Profile {name} removed");
            } else {
                println!("Profile {name} not found");
            }
        }
    }
    Ok(())
}

// ============================================================================
// Agent
// ============================================================================

async fn run_agent(config: AgentConfig) -> AnyhowResult<()> {
    let started = Instant::now();
    info!(
        target: "telemetry::init",
        instance = %config.agent.instance_name,
        store = %config.agent.profile_store_dir.display(),
        "Starting telemetry agent"
    );

    let transport = HttpTransport::new(&config.http, tokio::runtime::Handle::current())
        .context("Failed to initialise report transport")?;
    let receiver = Arc::new(EventReceiver::new(config.agent.event_queue_capacity));
    let collaborators = Collaborators {
        params: Arc::new(InMemoryParameterSource::new(config.device_parameters.clone())),
        log_scan: Arc::new(FileLogScanner::new(&config.log_scan.log_dir)),
        store: Arc::new(DirectoryProfileStore::new(&config.agent.profile_store_dir)),
        transport: Arc::new(transport),
        events: receiver.clone(),
    };

    let registry =
        ProfileRegistry::with_timer_scheduler(collaborators, RegistryLimits::from(&config.agent));
    let sink: Arc<dyn EventSink> = registry.clone();
    receiver.connect(Arc::downgrade(&sink));

    let loader = registry.clone();
    let loaded = tokio::task::spawn_blocking(move || loader.load_from_store()).await?;
    info!(
        target: "telemetry::init",
        loaded,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Agent initialized"
    );

    let listener = bind_event_socket(&config.agent.event_socket)?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(read_events(stream, receiver.clone()));
                }
                Err(e) => warn!(target: "telemetry::events", error = %e, "Event socket accept failed"),
            },
            _ = sigusr1.recv() => {
                let target = registry.clone();
                let interrupted = tokio::task::spawn_blocking(move || target.send_log_upload_interrupt()).await?;
                info!(target: "telemetry::init", interrupted, "Log upload requested");
            }
            _ = sigterm.recv() => {
                info!(target: "telemetry::init", "Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!(target: "telemetry::init", "Received SIGINT");
                break;
            }
        }
    }

    info!(target: "telemetry::init", "Starting graceful shutdown");
    let shutdown_start = Instant::now();

    let target = registry.clone();
    tokio::task::spawn_blocking(move || target.shutdown()).await?;
    receiver.stop();
    if let Err(e) = std::fs::remove_file(&config.agent.event_socket) {
        debug!(target: "telemetry::init", error = %e, "Event socket not removed");
    }

    info!(
        target: "telemetry::init",
        duration_ms = shutdown_start.elapsed().as_millis() as u64,
        "Agent shutdown complete"
    );
    Ok(())
}

fn bind_event_socket(path: &Path) -> AnyhowResult<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind event socket {}", path.display()))?;
    info!(target: "telemetry::events", socket = %path.display(), "Listening for events");
    Ok(listener)
}

async fn read_events(stream: UnixStream, receiver: Arc<EventReceiver>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match Event::parse_line(&line) {
                Some(event) => {
                    receiver.publish(event);
                }
                None if line.trim().is_empty() => {}
                None => debug!(target: "telemetry::events", line = %line, "Malformed event line"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(target: "telemetry::events", error = %e, "Event stream read failed");
                break;
            }
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Commands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output.as_deref());
        }
        Some(Commands::Validate { verbose }) => {
            return handle_validate(&cli.config, *verbose);
        }
        _ => {}
    }

    let config_missing = !cli.config.exists();
    let config = if config_missing {
        AgentConfig::default()
    } else {
        AgentConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if config_missing {
        warn!(
            target: "telemetry::init",
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }
    info!(target: "telemetry::init", "{} v{}", AGENT_FULL_NAME, AGENT_VERSION);

    match cli.command {
        Some(Commands::Profiles { action }) => handle_profiles(&config, action)?,
        Some(Commands::Run) | None => {
            if let Err(e) = run_agent(config).await {
                error!(target: "telemetry::init", error = %e, "Agent failed");
                return Err(e);
            }
        }
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    std::io::stdout().flush()?;
    Ok(())
}
