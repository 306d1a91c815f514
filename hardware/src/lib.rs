//! Hardware drivers for the remote mirror/lens stage.
//!
//! This crate provides the device-level pieces the stage controller is built
//! on. Each driver is kept free of controller policy so it can be exercised
//! on its own.
//!
//! # Modules
//! - [`zaber`] - Zaber binary protocol packets and serial link
//! - [`trigger`] - Digital trigger input (GPIO character device with `gpio`, Linux only)
//! - [`mock`] - Simulated stage bus and trigger line for tests and dry runs
//!
//! # Features
//! - `gpio` - Linux GPIO trigger input via `gpiod`

pub mod mock;
pub mod trigger;
pub mod zaber;
