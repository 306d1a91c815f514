//! Remote controller for the MOT mirror and imaging lens stages.
//!
//! Two Zaber stages share the space in front of the vacuum cell: a fold mirror
//! that sits in the MOT beam path while idle, and an objective lens that
//! advances to a per-shot focus for imaging. This crate sequences them
//! without collision, follows the experiment's trigger line, and exposes the
//! whole thing over a line-based TCP control channel.
//!
//! # Modules
//! - [`config`] - Positions, settle times and device paths
//! - [`stage`] - Shared link handle and position monitoring
//! - [`motion`] - Collision-free rest and imaging moves
//! - [`homing`] - Homing check and initialization
//! - [`runner`] - Trigger-synchronized, abortable experiment cycle
//! - [`server`] - Control channel state machine and listener
//! - [`client`] - Blocking client for the control channel

pub mod client;
pub mod config;
pub mod homing;
pub mod motion;
pub mod runner;
pub mod server;
pub mod stage;

pub use config::StageConfig;
pub use runner::{AbortFlag, ExperimentRunner, RunOutcome};
pub use server::{serve, Controller, ServerState};
pub use stage::{Stage, StageError, StageResult};
