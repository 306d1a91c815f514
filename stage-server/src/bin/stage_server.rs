//! Stage control server.
//!
//! Runs next to the stages (on the Raspberry Pi holding the serial adapter and
//! the trigger line) and accepts control requests over TCP.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hardware::mock::{SimulatedBus, SimulatedTrigger};
#[cfg(all(target_os = "linux", feature = "gpio"))]
use hardware::trigger::GpioTrigger;
use hardware::trigger::TriggerInput;
use hardware::zaber::SerialLink;
use stage_server::config::StageConfig;
#[cfg(all(target_os = "linux", feature = "gpio"))]
use stage_server::config::TriggerConfig;
use stage_server::server::{serve, Connector, Controller};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Remote mirror/lens stage control server")]
struct Args {
    /// JSON config file; fields not given keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Serial device the stages are attached to (overrides config)
    #[arg(long)]
    serial_port: Option<String>,

    /// Run against simulated stages and a trigger line that never fires
    #[arg(long)]
    simulate: bool,
}

#[cfg(all(target_os = "linux", feature = "gpio"))]
fn open_trigger(config: &StageConfig) -> Result<Box<dyn TriggerInput>> {
    let TriggerConfig { chip, line } = &config.trigger;
    let trigger = GpioTrigger::open(chip, *line)
        .with_context(|| format!("Failed to open trigger line {line} on {chip}"))?;
    Ok(Box::new(trigger))
}

#[cfg(not(all(target_os = "linux", feature = "gpio")))]
fn open_trigger(_config: &StageConfig) -> Result<Box<dyn TriggerInput>> {
    anyhow::bail!("GPIO trigger support requires the `gpio` feature on Linux; use --simulate")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StageConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StageConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(serial_port) = args.serial_port {
        config.serial_port = serial_port;
    }

    let connector: Connector;
    let trigger: Box<dyn TriggerInput>;
    if args.simulate {
        warn!("Running against simulated stages");
        let bus = SimulatedBus::new();
        connector = Box::new(move || Ok(SerialLink::new(bus.clone())));
        trigger = Box::new(SimulatedTrigger::new());
    } else {
        let port = config.serial_port.clone();
        connector = Box::new(move || SerialLink::open(&port));
        trigger = open_trigger(&config)?;
    }

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!("Stage server listening on {}", config.listen);

    let controller = Controller::new(config, connector, trigger);

    tokio::select! {
        result = serve(listener, controller) => result.context("Control listener failed")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
