// Wingman command line interface
// Tracking loop, bench tools and console settings for the pan/tilt mount

mod tools;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wingman_bus::{BusClient, SerialTransport, SimulatedBus, Transport};
use wingman_control::{ControlLoop, JsonLinesSource, PerceptionSource};
use wingman_core::{ConsoleSettings, SessionConfig};

#[derive(Parser)]
#[command(name = "wingman")]
#[command(about = "Pan/tilt target tracker", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session configuration (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Operator console settings (flat JSON)
    #[arg(long, default_value = "settings.json", global = true)]
    settings: PathBuf,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Args)]
struct BusArgs {
    /// Serial device, overrides the configuration
    #[arg(long)]
    port: Option<String>,

    /// Baud rate, overrides the configuration
    #[arg(long)]
    baudrate: Option<u32>,

    /// Use the simulated bus instead of a serial port
    #[arg(long)]
    simulate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracking control loop
    Track {
        #[command(flatten)]
        bus: BusArgs,

        /// Frame source: "-" for JSON lines on stdin, or tcp://host:port
        #[arg(long, default_value = "-")]
        source: String,

        /// Print every cycle report as a JSON line on stdout
        #[arg(long)]
        print_status: bool,
    },

    /// Release the axes and read back positions set by hand
    Positions {
        #[command(flatten)]
        bus: BusArgs,

        /// Read immediately instead of waiting for Enter
        #[arg(long)]
        no_wait: bool,
    },

    /// Drive both axes around a square path
    Sweep {
        #[command(flatten)]
        bus: BusArgs,

        #[arg(long, default_value = "1000", allow_hyphen_values = true)]
        pan_offset: i32,

        #[arg(long, default_value = "200", allow_hyphen_values = true)]
        tilt_offset: i32,

        /// Time at each corner in milliseconds
        #[arg(long, default_value = "1000")]
        dwell_ms: u64,

        #[arg(long, default_value = "1")]
        rounds: u32,
    },

    /// Operator console settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Print the effective settings
    Show,

    /// Change one setting and save
    Set {
        key: String,
        value: String,
    },

    /// List recognized keys
    Keys,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_session(cli: &Cli, bus: &BusArgs) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };
    config.console = config.console.load_over(&cli.settings);

    if let Some(port) = &bus.port {
        config.bus.port = port.clone();
    }
    if let Some(baudrate) = bus.baudrate {
        config.bus.baudrate = baudrate;
    }
    config.validate()?;
    Ok(config)
}

fn open_transport(config: &SessionConfig, simulate: bool) -> Result<Box<dyn Transport>> {
    if simulate {
        info!("Using simulated bus");
        return Ok(Box::new(SimulatedBus::with_servos(&config.axis_ids())));
    }
    let transport = SerialTransport::open(&config.bus.port, config.bus.baudrate)
        .with_context(|| format!("opening {}", config.bus.port))?;
    Ok(Box::new(transport))
}

async fn open_source(source: &str) -> Result<Box<dyn PerceptionSource>> {
    if source == "-" {
        return Ok(Box::new(JsonLinesSource::stdin()));
    }
    if let Some(addr) = source.strip_prefix("tcp://") {
        return Ok(Box::new(JsonLinesSource::connect(addr).await?));
    }
    bail!("unsupported frame source '{}', expected '-' or tcp://host:port", source)
}

async fn track(config: SessionConfig, simulate: bool, source: &str, print_status: bool) -> Result<()> {
    let transport = open_transport(&config, simulate)?;
    let mut control = ControlLoop::new(config, transport)?;

    let failures = control.initialize();
    if !failures.is_empty() {
        warn!("{} axis setup writes failed, continuing", failures.len());
    }

    let handle = control.handle();
    let stop_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            let _ = stop_handle.stop().await;
        }
    });

    if print_status {
        let mut status = handle.subscribe();
        tokio::spawn(async move {
            while let Ok(report) = status.recv().await {
                match serde_json::to_string(&report) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode cycle report: {}", e),
                }
            }
        });
    }

    let mut source = open_source(source).await?;
    control.run(&mut source).await?;
    info!("Control loop stopped");
    Ok(())
}

fn show_settings(settings: &ConsoleSettings) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match &cli.command {
        Commands::Track { bus, source, print_status } => {
            let config = load_session(&cli, bus)?;
            track(config, bus.simulate, source, *print_status).await?;
        }

        Commands::Positions { bus, no_wait } => {
            let config = load_session(&cli, bus)?;
            let transport = open_transport(&config, bus.simulate)?;
            let mut client = BusClient::new(transport, config.bus.timeout());
            tools::positions(&mut client, &config, !no_wait && !bus.simulate).await?;
        }

        Commands::Sweep { bus, pan_offset, tilt_offset, dwell_ms, rounds } => {
            let config = load_session(&cli, bus)?;
            let transport = open_transport(&config, bus.simulate)?;
            let mut client = BusClient::new(transport, config.bus.timeout());
            let result = tools::sweep(
                &mut client,
                &config,
                *pan_offset,
                *tilt_offset,
                Duration::from_millis(*dwell_ms),
                *rounds,
            )
            .await;
            for id in config.axis_ids() {
                if let Err(e) = client.set_torque(id, false) {
                    warn!(id, "Failed to disable torque: {}", e);
                }
            }
            result?;
        }

        Commands::Settings(SettingsCommands::Show) => {
            show_settings(&ConsoleSettings::load_or_default(&cli.settings))?;
        }

        Commands::Settings(SettingsCommands::Set { key, value }) => {
            let mut settings = ConsoleSettings::load_or_default(&cli.settings);
            settings.set(key, value)?;
            settings.save(&cli.settings)?;
            info!("Saved {} = {} to {}", key, value, cli.settings.display());
            show_settings(&settings)?;
        }

        Commands::Settings(SettingsCommands::Keys) => {
            for key in ConsoleSettings::KEYS {
                println!("{}", key);
            }
        }
    }

    Ok(())
}
