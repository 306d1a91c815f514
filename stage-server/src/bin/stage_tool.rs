//! Bench tool for the mirror/lens stages.
//!
//! Talks to the stages directly over the serial port, or to a running stage
//! server over TCP:
//! - `position`: Read axis positions
//! - `move`: Move one axis and wait until it arrives
//! - `home`: Home axes that are not yet homed
//! - `setting`: Read a device setting (device mode by default)
//! - `rest` / `imaging`: Run the interlocked two-axis sequences
//! - `config`: Write the default configuration to a file
//! - `remote`: Send one request to a stage server

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::zaber::{Axis, SerialLink, DEVICE_MODE};
use stage_server::client::StageClient;
use stage_server::config::{StageConfig, MAX_FOCUS};
use stage_server::homing::is_homed;
use stage_server::Stage;
use strum::IntoEnumIterator;
use tracing::info;

/// Mirror/lens stage bench tool
#[derive(Parser, Debug)]
#[command(name = "stage_tool")]
#[command(about = "Direct and remote control of the mirror/lens stages")]
#[command(version)]
struct Args {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial device (overrides config)
    #[arg(long, global = true)]
    serial_port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read current positions
    Position {
        /// Axis to read (reads both if not specified)
        #[arg(short, long)]
        axis: Option<Axis>,
    },

    /// Move one axis to an absolute position
    ///
    /// Does not interlock against the other axis.
    Move {
        #[arg(short, long)]
        axis: Axis,

        /// Target position in microsteps
        #[arg(short, long)]
        position: i32,
    },

    /// Home axes whose device mode reports them un-homed
    Home,

    /// Read a device setting
    Setting {
        #[arg(short, long)]
        axis: Axis,

        /// Setting number
        #[arg(short, long, default_value_t = DEVICE_MODE)]
        setting: i32,
    },

    /// Lens out, then mirror in
    Rest,

    /// Mirror out, then lens in
    Imaging {
        /// Lens position (0 to 76346)
        #[arg(short, long)]
        focus: Option<i32>,
    },

    /// Home if needed and park at rest
    Init,

    /// Write the default configuration as JSON
    Config {
        /// Output file
        #[arg(short, long, default_value = "stage_config.json")]
        output: PathBuf,
    },

    /// Send one request line to a stage server and print the response
    Remote {
        /// Server address, host:port
        addr: String,

        /// Request tokens, e.g. `transition_to_buffered 40000`
        #[arg(required = true, num_args = 1..)]
        request: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => StageConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StageConfig::default(),
    };
    if let Some(serial_port) = args.serial_port {
        config.serial_port = serial_port;
    }

    match args.command {
        Command::Config { output } => cmd_config(&config, &output),
        Command::Remote { addr, request } => cmd_remote(&addr, &request.join(" ")),
        command => run_direct(&config, command),
    }
}

fn run_direct(config: &StageConfig, command: Command) -> Result<()> {
    let stage = connect(config)?;
    match command {
        Command::Position { axis } => cmd_position(&stage, axis),
        Command::Move { axis, position } => cmd_move(&stage, axis, position),
        Command::Home => cmd_home(&stage),
        Command::Setting { axis, setting } => {
            cmd_setting(&stage, axis, setting, config.homing.homed_bit)
        }
        Command::Rest => cmd_rest(&stage),
        Command::Imaging { focus } => {
            cmd_imaging(&stage, focus.unwrap_or(config.positions.lens_imaging))
        }
        Command::Init => cmd_init(&stage),
        Command::Config { .. } | Command::Remote { .. } => bail!("Not a serial command"),
    }
}

fn connect(config: &StageConfig) -> Result<Stage> {
    info!("Opening {}...", config.serial_port);
    let link = SerialLink::open(&config.serial_port)
        .with_context(|| format!("Failed to open {}", config.serial_port))?;
    Ok(Stage::new(link, config))
}

// ==================== Direct Commands ====================

fn cmd_position(stage: &Stage, axis: Option<Axis>) -> Result<()> {
    let axes: Vec<Axis> = match axis {
        Some(axis) => vec![axis],
        None => Axis::iter().collect(),
    };
    for axis in axes {
        let position = stage.check_position(axis)?;
        info!("{}: {}", axis, position);
    }
    Ok(())
}

fn cmd_move(stage: &Stage, axis: Axis, position: i32) -> Result<()> {
    if !(0..=MAX_FOCUS).contains(&position) {
        bail!("Position {} out of range 0 to {}", position, MAX_FOCUS);
    }
    info!("Moving {} to {}...", axis, position);
    stage.move_axis(axis, position, std::time::Duration::ZERO)?;
    info!("{} at {}", axis, stage.check_position(axis)?);
    Ok(())
}

fn cmd_home(stage: &Stage) -> Result<()> {
    for axis in [Axis::Lens, Axis::Mirror] {
        if stage.home_if_needed(axis)? {
            info!("{}: home command sent", axis);
        } else {
            info!("{}: already homed", axis);
        }
    }
    Ok(())
}

fn cmd_setting(stage: &Stage, axis: Axis, setting: i32, homed_bit: u32) -> Result<()> {
    let value = stage.query_setting(axis.device(), setting)?;
    if setting == DEVICE_MODE {
        info!(
            "{}: device mode {:#b} (homed={})",
            axis,
            value,
            is_homed(value, homed_bit)
        );
    } else {
        info!("{}: setting {} = {}", axis, setting, value);
    }
    Ok(())
}

fn cmd_rest(stage: &Stage) -> Result<()> {
    stage.move_to_rest()?;
    info!("At rest");
    Ok(())
}

fn cmd_imaging(stage: &Stage, focus: i32) -> Result<()> {
    if !(0..=MAX_FOCUS).contains(&focus) {
        bail!("Focus {} out of range 0 to {}", focus, MAX_FOCUS);
    }
    stage.move_to_imaging(focus)?;
    info!("At imaging position, focus {}", focus);
    Ok(())
}

fn cmd_init(stage: &Stage) -> Result<()> {
    stage.initialise()?;
    info!("Initialised");
    Ok(())
}

// ==================== Other Commands ====================

fn cmd_config(config: &StageConfig, output: &std::path::Path) -> Result<()> {
    config
        .save_to_file(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Wrote {}", output.display());
    Ok(())
}

fn cmd_remote(addr: &str, request: &str) -> Result<()> {
    let client = StageClient::new(addr);
    let response = client.request(request)?;
    println!("{response}");
    Ok(())
}
